//! Index health probe.
//!
//! Checks the structural integrity of an on-disk index artifact and
//! memoizes the report per path for a short TTL. Artifacts are JSON
//! documents; the element count comes from a `files` array (the
//! full-text manifest) or an `element_count` field.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub valid: bool,
    pub file_exists: bool,
    pub readable: bool,
    pub loadable: bool,
    pub element_count: Option<u64>,
    pub errors: Vec<String>,
}

pub struct IndexHealthProbe {
    ttl: Duration,
    cache: Mutex<HashMap<PathBuf, (Instant, HealthReport)>>,
}

impl IndexHealthProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Report for `index_path`, from the cache unless `force_refresh` or
    /// the cached report is older than the TTL.
    pub fn check(&self, index_path: &Path, force_refresh: bool) -> HealthReport {
        if !force_refresh {
            let cache = self.cache.lock();
            if let Some((at, report)) = cache.get(index_path) {
                if at.elapsed() < self.ttl {
                    return report.clone();
                }
            }
        }

        let report = inspect(index_path);
        self.cache
            .lock()
            .insert(index_path.to_path_buf(), (Instant::now(), report.clone()));
        report
    }

    /// Drop cached reports at or below `prefix` (a removed snapshot or workspace).
    pub fn invalidate_prefix(&self, prefix: &Path) {
        self.cache.lock().retain(|path, _| !path.starts_with(prefix));
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

fn inspect(path: &Path) -> HealthReport {
    let mut report = HealthReport {
        file_exists: path.is_file(),
        ..Default::default()
    };
    if !report.file_exists {
        report
            .errors
            .push(format!("index artifact missing: {}", path.display()));
        return report;
    }

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            report.errors.push(format!("cannot read artifact: {}", e));
            return report;
        }
    };
    report.readable = true;

    let doc: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(doc) => doc,
        Err(e) => {
            report.errors.push(format!("artifact does not parse: {}", e));
            return report;
        }
    };

    report.element_count = doc
        .get("files")
        .and_then(|f| f.as_array())
        .map(|files| files.len() as u64)
        .or_else(|| doc.get("element_count").and_then(|c| c.as_u64()));
    if report.element_count.is_none() {
        report
            .errors
            .push("artifact has neither 'files' nor 'element_count'".to_string());
        return report;
    }

    report.loadable = true;
    report.valid = true;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_artifact_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let probe = IndexHealthProbe::new(Duration::from_secs(300));
        let report = probe.check(&tmp.path().join("manifest.json"), false);
        assert!(!report.valid);
        assert!(!report.file_exists);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn counts_manifest_files() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        std::fs::write(&path, r#"{"files":[{"path":"a"},{"path":"b"}]}"#).unwrap();

        let report = IndexHealthProbe::new(Duration::from_secs(300)).check(&path, false);
        assert!(report.valid);
        assert!(report.readable && report.loadable);
        assert_eq!(report.element_count, Some(2));
    }

    #[test]
    fn garbage_is_readable_but_not_loadable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json");
        std::fs::write(&path, "not json").unwrap();

        let report = IndexHealthProbe::new(Duration::from_secs(300)).check(&path, false);
        assert!(report.readable);
        assert!(!report.loadable);
        assert!(!report.valid);
    }

    #[test]
    fn cached_until_forced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("artifact.json");
        std::fs::write(&path, r#"{"element_count":3}"#).unwrap();

        let probe = IndexHealthProbe::new(Duration::from_secs(300));
        assert_eq!(probe.check(&path, false).element_count, Some(3));

        std::fs::remove_file(&path).unwrap();
        assert!(probe.check(&path, false).valid);
        assert!(!probe.check(&path, true).valid);
    }

    #[test]
    fn zero_ttl_always_rechecks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("artifact.json");
        std::fs::write(&path, r#"{"element_count":1}"#).unwrap();

        let probe = IndexHealthProbe::new(Duration::ZERO);
        assert!(probe.check(&path, false).valid);
        std::fs::remove_file(&path).unwrap();
        assert!(!probe.check(&path, false).valid);
    }
}
