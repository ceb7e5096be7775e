//! Copy-on-write snapshots of golden repositories.
//!
//! A snapshot is an immutable directory `<golden>/<alias>/snapshots/v<gen>`
//! holding a repository tree plus its index artifacts. The store keeps the
//! current snapshot of each alias behind an [`Arc`]; readers pin it by
//! cloning that `Arc` and keep a consistent view for as long as they hold
//! it, regardless of refreshes in between.
//!
//! Installing a new snapshot replaces the store's `Arc` and marks the old
//! snapshot retired. A retired snapshot deletes its directory when the
//! last `Arc` to it drops, so storage is reclaimed exactly when the swap
//! has happened and no reader is pinned to the old version.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::files::{copy_tree, remove_dir_and_empty_parents};
use crate::models::SnapshotPointer;

const SNAPSHOTS_DIR: &str = "snapshots";
const MIRROR_DIR: &str = "mirror";

pub struct Snapshot {
    alias: String,
    generation: u64,
    path: PathBuf,
    reclaim_stop: PathBuf,
    retired: AtomicBool,
}

impl Snapshot {
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pointer(&self) -> SnapshotPointer {
        SnapshotPointer {
            generation: self.generation,
            path: self.path.clone(),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if !self.is_retired() {
            return;
        }
        match remove_dir_and_empty_parents(&self.path, &self.reclaim_stop) {
            Ok(()) => debug!(
                alias = %self.alias,
                generation = self.generation,
                "reclaimed retired snapshot"
            ),
            Err(e) => warn!(
                alias = %self.alias,
                path = %self.path.display(),
                error = %e,
                "failed to reclaim retired snapshot"
            ),
        }
    }
}

#[derive(Default)]
struct StoreState {
    current: HashMap<String, Arc<Snapshot>>,
    retired: Vec<Weak<Snapshot>>,
}

pub struct SnapshotStore {
    root: PathBuf,
    state: Mutex<StoreState>,
}

impl SnapshotStore {
    /// `root` is the golden storage directory (`<storage>/golden`).
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn alias_dir(&self, alias: &str) -> PathBuf {
        self.root.join(alias)
    }

    /// Working copy that fetches land in before being materialized.
    pub fn mirror_dir(&self, alias: &str) -> PathBuf {
        mirror_path(&self.root, alias)
    }

    pub fn snapshots_dir(&self, alias: &str) -> PathBuf {
        self.alias_dir(alias).join(SNAPSHOTS_DIR)
    }

    fn generation_path(&self, alias: &str, generation: u64) -> PathBuf {
        self.snapshots_dir(alias).join(format!("v{}", generation))
    }

    /// One past the highest generation on disk or in memory.
    pub fn next_generation(&self, alias: &str) -> u64 {
        let mut highest = self
            .state
            .lock()
            .current
            .get(alias)
            .map(|s| s.generation)
            .unwrap_or(0);

        if let Ok(entries) = std::fs::read_dir(self.snapshots_dir(alias)) {
            for entry in entries.flatten() {
                if let Some(generation) = parse_generation(&entry.file_name().to_string_lossy()) {
                    highest = highest.max(generation);
                }
            }
        }
        highest + 1
    }

    /// Copy `source` into a fresh generation directory, leaving out the
    /// top-level entries named in `skip`. The result is not served until
    /// [`install`](Self::install)ed.
    pub fn materialize(&self, alias: &str, source: &Path, skip: &[&str]) -> Result<SnapshotPointer> {
        let generation = self.next_generation(alias);
        let path = self.generation_path(alias, generation);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        let copied = copy_tree(source, &path, skip)?;
        debug!(alias, generation, files = copied, "materialized snapshot");
        Ok(SnapshotPointer { generation, path })
    }

    /// Serve `pointer` as the current snapshot of `alias`. The previous
    /// snapshot, if any, is retired.
    pub fn install(&self, alias: &str, pointer: &SnapshotPointer) {
        let snapshot = Arc::new(Snapshot {
            alias: alias.to_string(),
            generation: pointer.generation,
            path: pointer.path.clone(),
            reclaim_stop: self.root.clone(),
            retired: AtomicBool::new(false),
        });

        let previous = {
            let mut state = self.state.lock();
            if let Some(existing) = state.current.get(alias) {
                if existing.path == pointer.path {
                    return;
                }
            }
            let previous = state.current.insert(alias.to_string(), snapshot);
            if let Some(old) = &previous {
                old.retire();
                state.retired.retain(|w| w.strong_count() > 0);
                state.retired.push(Arc::downgrade(old));
            }
            previous
        };

        if let Some(old) = previous {
            info!(
                alias,
                from = old.generation,
                to = pointer.generation,
                readers = Arc::strong_count(&old) - 1,
                "snapshot swapped"
            );
        }
    }

    /// Pin the current snapshot of `alias` for reading.
    pub fn pin(&self, alias: &str) -> Option<Arc<Snapshot>> {
        self.state.lock().current.get(alias).cloned()
    }

    /// Delete a materialized snapshot that was never installed.
    pub fn discard(&self, pointer: &SnapshotPointer) {
        if let Err(e) = remove_dir_and_empty_parents(&pointer.path, &self.root) {
            warn!(path = %pointer.path.display(), error = %e, "failed to discard snapshot");
        }
    }

    /// Stop serving `alias`. Its snapshot is reclaimed once unpinned.
    pub fn remove_alias(&self, alias: &str) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.current.remove(alias);
            if let Some(old) = &removed {
                old.retire();
                state.retired.retain(|w| w.strong_count() > 0);
                state.retired.push(Arc::downgrade(old));
            }
            removed
        };
        drop(removed);
    }

    /// Retired snapshots still held by readers.
    pub fn pinned_retired(&self) -> usize {
        let mut state = self.state.lock();
        state.retired.retain(|w| w.strong_count() > 0);
        state.retired.len()
    }

    /// Delete snapshot directories of `alias` that are neither current nor
    /// pinned by a reader. Returns how many were removed.
    pub fn reclaim_orphans(&self, alias: &str) -> Result<u64> {
        let live: HashSet<PathBuf> = {
            let state = self.state.lock();
            state
                .current
                .get(alias)
                .map(|s| s.path.clone())
                .into_iter()
                .chain(
                    state
                        .retired
                        .iter()
                        .filter_map(|w| w.upgrade())
                        .map(|s| s.path.clone()),
                )
                .collect()
        };

        let dir = self.snapshots_dir(alias);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            if live.contains(&path) {
                continue;
            }
            std::fs::remove_dir_all(&path)?;
            removed += 1;
            info!(alias, path = %path.display(), "reclaimed orphaned snapshot");
        }
        Ok(removed)
    }
}

/// Mirror working copy of `alias` under the golden storage root.
pub fn mirror_path(golden_root: &Path, alias: &str) -> PathBuf {
    golden_root.join(alias).join(MIRROR_DIR)
}

fn parse_generation(name: &str) -> Option<u64> {
    name.strip_prefix('v')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn source_tree(tmp: &TempDir, body: &str) -> PathBuf {
        let src = tmp.path().join(format!("src-{}", body));
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("file.txt"), body).unwrap();
        src
    }

    #[test]
    fn generations_increase() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("golden"));
        let src = source_tree(&tmp, "one");

        let first = store.materialize("alpha", &src, &[]).unwrap();
        let second = store.materialize("alpha", &src, &[]).unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert!(second.path.ends_with("alpha/snapshots/v2"));
    }

    #[test]
    fn pinned_reader_keeps_old_snapshot_until_released() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("golden"));

        let v1 = store
            .materialize("alpha", &source_tree(&tmp, "old"), &[])
            .unwrap();
        store.install("alpha", &v1);
        let reader = store.pin("alpha").unwrap();

        let v2 = store
            .materialize("alpha", &source_tree(&tmp, "new"), &[])
            .unwrap();
        store.install("alpha", &v2);

        assert!(reader.is_retired());
        assert_eq!(
            std::fs::read_to_string(reader.path().join("file.txt")).unwrap(),
            "old"
        );
        let fresh = store.pin("alpha").unwrap();
        assert_eq!(
            std::fs::read_to_string(fresh.path().join("file.txt")).unwrap(),
            "new"
        );
        assert_eq!(store.pinned_retired(), 1);

        drop(reader);
        assert!(!v1.path.exists());
        assert!(v2.path.exists());
        assert_eq!(store.pinned_retired(), 0);
    }

    #[test]
    fn unpinned_old_snapshot_is_reclaimed_on_swap() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("golden"));
        let src = source_tree(&tmp, "x");

        let v1 = store.materialize("alpha", &src, &[]).unwrap();
        store.install("alpha", &v1);
        let v2 = store.materialize("alpha", &src, &[]).unwrap();
        store.install("alpha", &v2);

        assert!(!v1.path.exists());
        assert!(v2.path.exists());
    }

    #[test]
    fn reclaims_orphans_but_not_current() {
        let tmp = TempDir::new().unwrap();
        let store = SnapshotStore::new(tmp.path().join("golden"));
        let src = source_tree(&tmp, "x");

        let v1 = store.materialize("alpha", &src, &[]).unwrap();
        store.install("alpha", &v1);
        let stray = store.materialize("alpha", &src, &[]).unwrap();

        assert_eq!(store.reclaim_orphans("alpha").unwrap(), 1);
        assert!(!stray.path.exists());
        assert!(v1.path.exists());
    }

    #[test]
    fn removed_alias_is_reclaimed_after_last_reader() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("golden");
        let store = SnapshotStore::new(root.clone());
        let v1 = store
            .materialize("alpha", &source_tree(&tmp, "x"), &[])
            .unwrap();
        store.install("alpha", &v1);

        let reader = store.pin("alpha").unwrap();
        store.remove_alias("alpha");
        assert!(store.pin("alpha").is_none());
        assert!(v1.path.exists());

        drop(reader);
        assert!(!root.join("alpha").exists());
    }
}
