//! Filesystem helpers shared by snapshots, workspaces, and the built-in
//! index backend: glob sets, tree walking, tree copying, content hashing.

use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::Result;

/// Directory (inside a snapshot or workspace root) holding index artifacts.
pub const INDEX_DIR_NAME: &str = ".fleet-index";

/// Directories never treated as repository content.
pub const METADATA_DIRS: &[&str] = &[".git", INDEX_DIR_NAME];

pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Built-in content excludes plus any extra patterns from config.
pub fn content_excludes(extra: &[String]) -> Result<GlobSet> {
    let mut patterns: Vec<String> = METADATA_DIRS
        .iter()
        .map(|d| format!("**/{}/**", d))
        .collect();
    patterns.extend(extra.iter().cloned());
    build_globset(&patterns)
}

/// Regular files under `root` as `(absolute, relative)` pairs, sorted by
/// relative path, skipping metadata directories and `excludes`.
pub fn walk_files(root: &Path, excludes: &GlobSet) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| !is_metadata_dir(e.file_name().to_str()));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if excludes.is_match(&rel_str) {
            continue;
        }
        files.push((path.to_path_buf(), rel_str));
    }

    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn is_metadata_dir(name: Option<&str>) -> bool {
    name.is_some_and(|n| METADATA_DIRS.contains(&n))
}

/// Copy the tree at `src` into `dst`, skipping top-level entries named in
/// `skip`. `dst` is created if missing.
pub fn copy_tree(src: &Path, dst: &Path, skip: &[&str]) -> Result<u64> {
    std::fs::create_dir_all(dst)?;
    let mut copied = 0u64;

    let walker = WalkDir::new(src).min_depth(1).into_iter().filter_entry(|e| {
        !(e.depth() == 1 && e.file_name().to_str().is_some_and(|n| skip.contains(&n)))
    });
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = std::fs::read_link(src)?;
    if dst.symlink_metadata().is_ok() {
        std::fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(link, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Remove `dir` and then any parents up to (not including) `stop` that are
/// left empty.
pub fn remove_dir_and_empty_parents(dir: &Path, stop: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    let mut current = dir.parent();
    while let Some(parent) = current {
        if parent == stop || !parent.starts_with(stop) {
            break;
        }
        // Fails when not empty, which ends the climb.
        if std::fs::remove_dir(parent).is_err() {
            break;
        }
        current = parent.parent();
    }
    Ok(())
}

/// Hidden sibling of `path` tagged with `tag`, e.g. `.name.staging`.
pub fn hidden_sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, tag))
}

/// Swap `staged` into place at `live` by rename.
///
/// `live` is restored if the second rename fails. The tree it held before
/// is deleted once the swap is done.
pub fn replace_dir(live: &Path, staged: &Path) -> std::io::Result<()> {
    let retired = hidden_sibling(live, "retired");
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    std::fs::rename(live, &retired)?;
    if let Err(e) = std::fs::rename(staged, live) {
        std::fs::rename(&retired, live)?;
        return Err(e);
    }
    std::fs::remove_dir_all(&retired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walk_skips_metadata_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::create_dir_all(root.join(INDEX_DIR_NAME).join("full_text")).unwrap();
        std::fs::write(root.join("src/lib.rs"), "fn main() {}").unwrap();
        std::fs::write(root.join("README.md"), "# hi").unwrap();
        std::fs::write(root.join("build.log"), "noise").unwrap();
        std::fs::write(root.join(".git/objects/ab"), "blob").unwrap();
        std::fs::write(
            root.join(INDEX_DIR_NAME).join("full_text/manifest.json"),
            "{}",
        )
        .unwrap();

        let excludes = content_excludes(&["*.log".to_string()]).unwrap();
        let files: Vec<String> = walk_files(root, &excludes)
            .unwrap()
            .into_iter()
            .map(|(_, rel)| rel)
            .collect();
        assert_eq!(files, vec!["README.md", "src/lib.rs"]);
    }

    #[test]
    fn copy_tree_skips_named_entries() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::create_dir_all(src.join(INDEX_DIR_NAME)).unwrap();
        std::fs::write(src.join("a/b/c.txt"), "c").unwrap();
        std::fs::write(src.join(INDEX_DIR_NAME).join("x"), "x").unwrap();

        let copied = copy_tree(&src, &dst, &[INDEX_DIR_NAME]).unwrap();
        assert_eq!(copied, 1);
        assert_eq!(std::fs::read_to_string(dst.join("a/b/c.txt")).unwrap(), "c");
        assert!(!dst.join(INDEX_DIR_NAME).exists());
    }

    #[test]
    fn replace_dir_swaps_in_staged_tree() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("ws");
        let staged = hidden_sibling(&live, "staging");
        assert_eq!(staged, tmp.path().join(".ws.staging"));
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("old.txt"), "old").unwrap();
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("new.txt"), "new").unwrap();

        replace_dir(&live, &staged).unwrap();
        assert!(live.join("new.txt").exists());
        assert!(!live.join("old.txt").exists());
        assert!(!staged.exists());
        assert!(!hidden_sibling(&live, "retired").exists());
    }

    #[test]
    fn replace_dir_keeps_live_tree_when_staged_is_missing() {
        let tmp = TempDir::new().unwrap();
        let live = tmp.path().join("ws");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::write(live.join("old.txt"), "old").unwrap();

        assert!(replace_dir(&live, &tmp.path().join(".ws.staging")).is_err());
        assert_eq!(std::fs::read_to_string(live.join("old.txt")).unwrap(), "old");
    }

    #[test]
    fn removes_empty_parents_only() {
        let tmp = TempDir::new().unwrap();
        let stop = tmp.path().join("golden");
        let snap = stop.join("alpha/snapshots/v1");
        std::fs::create_dir_all(&snap).unwrap();
        std::fs::write(snap.join("f"), "x").unwrap();
        std::fs::create_dir_all(stop.join("beta")).unwrap();

        remove_dir_and_empty_parents(&snap, &stop).unwrap();
        assert!(!stop.join("alpha").exists());
        assert!(stop.join("beta").exists());
        assert!(stop.exists());
    }
}
