//! Existence probes for layered paths

use super::mapper::strip_box_prefix;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::trace;

/// Answers whether an object exists at a virtual path.
///
/// Absence is the normal answer, never an error.
pub trait ExistenceProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// Probe that resolves virtual paths below a box prefix to a host directory.
///
/// Segments are matched case-insensitively, one directory level at a time.
/// Only plain names are followed; `.`, `..` and anything that would not be a
/// single path component never match, and a result that canonicalizes to a
/// location outside the root (through a symlink) is discarded.
#[derive(Debug, Clone)]
pub struct FsProbe {
    prefix: String,
    root: PathBuf,
}

impl FsProbe {
    pub fn new(prefix: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.trim_end_matches('\\').to_string(),
            root: root.into(),
        }
    }

    /// Resolve `path` to an existing host path
    pub fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rest = strip_box_prefix(path, &self.prefix)?;
        let mut current = self.root.clone();
        if !current.exists() {
            return None;
        }

        for segment in rest.split('\\').filter(|s| !s.is_empty()) {
            if !is_plain_segment(segment) {
                trace!("Rejecting segment {:?} in {}", segment, path);
                return None;
            }
            current = find_entry(&current, segment)?;
        }

        let root = fs::canonicalize(&self.root).ok()?;
        let real = fs::canonicalize(&current).ok()?;
        if !real.starts_with(&root) {
            trace!("{} escapes the box root", path);
            return None;
        }
        Some(current)
    }
}

/// True if `segment` is exactly one normal path component on the host
fn is_plain_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn find_entry(dir: &Path, segment: &str) -> Option<PathBuf> {
    let direct = dir.join(segment);
    if direct.exists() {
        return Some(direct);
    }

    let wanted = segment.to_lowercase();
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().to_lowercase() == wanted)
        .map(|e| e.path())
}

impl ExistenceProbe for FsProbe {
    fn exists(&self, path: &str) -> bool {
        let found = self.resolve(path).is_some();
        trace!("probe {} -> {}", path, found);
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_case_insensitive_probe() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("snapshot-A").join("drive").join("C")).unwrap();
        fs::write(dir.path().join("snapshot-A/drive/C/Notes.TXT"), b"x").unwrap();

        let probe = FsProbe::new(r"\box", dir.path());
        assert!(probe.exists(r"\box\snapshot-a\DRIVE\c\notes.txt"));
        assert!(probe.exists(r"\BOX\snapshot-A"));
        assert!(!probe.exists(r"\box\snapshot-A\drive\C\missing.txt"));
        assert!(!probe.exists(r"\other\snapshot-A"));
    }

    #[test]
    fn test_probe_stays_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("box");
        fs::create_dir_all(root.join("drive").join("C")).unwrap();
        fs::write(dir.path().join("outside.txt"), b"x").unwrap();

        let probe = FsProbe::new(r"\box", &root);
        assert!(!probe.exists(r"\box\..\outside.txt"));
        assert!(!probe.exists(r"\box\drive\C\..\..\..\outside.txt"));
        assert!(!probe.exists(r"\box\.\drive"));
        assert!(!probe.exists(r"\box\drive/C"));
        assert_eq!(probe.resolve(r"\box\..\outside.txt"), None);
        assert!(probe.exists(r"\box\drive\C"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_is_ignored() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("box");
        fs::create_dir_all(&root).unwrap();
        fs::write(dir.path().join("outside.txt"), b"x").unwrap();
        std::os::unix::fs::symlink(dir.path(), root.join("link")).unwrap();

        let probe = FsProbe::new(r"\box", &root);
        assert!(!probe.exists(r"\box\link\outside.txt"));
    }
}
