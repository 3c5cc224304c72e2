//! Line-oriented persistence of a path tree
//!
//! Each line is `<flags>|<path>[|<relocation>]` with the flags in decimal.
//! Lines are written depth-first so that replaying them in order rebuilds
//! the same tree. A `|` inside a path is written as `%7C` and a `%` as
//! `%25`; any other `%` sequence is read back literally.

use super::flags::PathFlags;
use super::node::PathNode;
use crate::error::{Error, Result};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Size and modification time of the store, used to detect foreign writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSignature {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// One parsed store line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub flags: PathFlags,
    pub path: String,
    pub relocation: Option<String>,
}

impl StoreEntry {
    /// Parse a single line; `None` for malformed input
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, '|');

        let bits: u32 = parts.next()?.trim().parse().ok()?;
        let flags = PathFlags::from_bits(bits).persisted();
        let path = unescape_field(parts.next()?);
        let relocation = parts.next().filter(|s| !s.is_empty()).map(unescape_field);

        if path.is_empty() || flags.is_empty() {
            return None;
        }
        if flags.contains(PathFlags::RELOCATED) && relocation.is_none() {
            return None;
        }

        Some(Self {
            flags,
            path,
            relocation,
        })
    }

    /// Apply this entry to a tree
    pub fn apply(&self, root: &mut PathNode) {
        if self.flags.contains(PathFlags::DELETED) {
            root.mark_deleted(&self.path);
        }
        if let Some(target) = &self.relocation {
            if self.flags.contains(PathFlags::RELOCATED) {
                root.set_relocation(&self.path, target);
            }
        }
    }
}

/// Format a store line (without terminator)
pub fn format_line(path: &str, flags: PathFlags, relocation: Option<&str>) -> String {
    let bits = flags.persisted().bits();
    match relocation {
        Some(target) => format!("{}|{}|{}", bits, escape_field(path), escape_field(target)),
        None => format!("{}|{}", bits, escape_field(path)),
    }
}

fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains(['|', '%']) {
        Cow::Owned(field.replace('%', "%25").replace('|', "%7C"))
    } else {
        Cow::Borrowed(field)
    }
}

fn unescape_field(field: &str) -> String {
    if !field.contains('%') {
        return field.to_string();
    }

    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(at) = rest.find('%') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        match tail.get(1..3) {
            Some("25") => out.push('%'),
            Some(code) if code.eq_ignore_ascii_case("7c") => out.push('|'),
            _ => {
                out.push('%');
                rest = &tail[1..];
                continue;
            }
        }
        rest = &tail[3..];
    }
    out.push_str(rest);
    out
}

/// A store file on disk
#[derive(Debug, Clone)]
pub struct PathStore {
    path: PathBuf,
}

impl PathStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current signature, `None` if the file does not exist
    pub fn signature(&self) -> Option<StoreSignature> {
        let meta = fs::metadata(&self.path).ok()?;
        Some(StoreSignature {
            size: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    /// Parse the store into a fresh tree.
    ///
    /// A missing file yields an empty tree. Malformed lines are skipped.
    pub fn read_tree(&self) -> Result<PathNode> {
        let mut root = PathNode::root();

        let text = match fs::read(&self.path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Store {:?} does not exist, starting empty", self.path);
                return Ok(root);
            }
            Err(e) => return Err(Error::Io(e)),
        };

        for (number, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match StoreEntry::parse(line) {
                Some(entry) => entry.apply(&mut root),
                None => warn!("Skipping malformed line {} in {:?}", number + 1, self.path),
            }
        }

        Ok(root)
    }

    /// Rewrite the whole store from `root`
    pub fn write_tree(&self, root: &PathNode) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(&self.path)?);
        let mut result = Ok(());
        root.walk_persisted(|path, flags, relocation| {
            if result.is_ok() {
                result = writeln!(writer, "{}", format_line(path, flags, relocation));
            }
        });
        result?;
        writer.flush()?;
        Ok(())
    }

    /// Append a single entry
    pub fn append(&self, path: &str, flags: PathFlags, relocation: Option<&str>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", format_line(path, flags, relocation))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_parse_lines() {
        let entry = StoreEntry::parse("1|\\a\\b\r\n").unwrap();
        assert_eq!(entry.flags, PathFlags::DELETED);
        assert_eq!(entry.path, r"\a\b");
        assert_eq!(entry.relocation, None);

        let entry = StoreEntry::parse(r"2|\a|\c\d").unwrap();
        assert_eq!(entry.relocation.as_deref(), Some(r"\c\d"));

        assert!(StoreEntry::parse("x|\\a").is_none());
        assert!(StoreEntry::parse("1|").is_none());
        assert!(StoreEntry::parse("2|\\a").is_none());
        assert!(StoreEntry::parse("65536|\\a").is_none());
    }

    #[test]
    fn test_write_read_rebuilds_tree() {
        let dir = TempDir::new().unwrap();
        let store = PathStore::new(dir.path().join("FilePaths.dat"));

        let mut root = PathNode::root();
        root.mark_deleted(r"\drive\C\Temp");
        root.set_relocation(r"\drive\C\Users\Old", r"\drive\C\Users\New");
        root.mark_deleted(r"\drive\C\Temp");

        store.write_tree(&root).unwrap();
        let loaded = store.read_tree().unwrap();
        assert_eq!(loaded, root);
    }

    #[test]
    fn test_missing_store_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = PathStore::new(dir.path().join("none.dat"));
        assert!(store.signature().is_none());
        assert!(store.read_tree().unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("RegPaths.dat");
        fs::write(&file, "garbage\n1|\\a\n\n7|\n1|\\b\\c\r\n").unwrap();

        let tree = PathStore::new(&file).read_tree().unwrap();
        assert_eq!(tree.lookup(r"\a", false, false).flags, PathFlags::DELETED);
        assert_eq!(tree.lookup(r"\b\c", false, false).flags, PathFlags::DELETED);
        assert_eq!(tree.descendant_count(), 3);
    }

    #[test]
    fn test_append_line() {
        let dir = TempDir::new().unwrap();
        let store = PathStore::new(dir.path().join("s.dat"));
        store.append(r"\x", PathFlags::DELETED | PathFlags::PATH_DELETED, None).unwrap();
        store.append(r"\y", PathFlags::RELOCATED, Some(r"\z")).unwrap();

        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "1|\\x\n2|\\y|\\z\n");
    }

    #[test]
    fn test_separator_in_names_survives_reload() {
        let dir = TempDir::new().unwrap();
        let store = PathStore::new(dir.path().join("RegPaths.dat"));

        store.append(r"HKCU\Soft|ware\$a|b", PathFlags::DELETED, None).unwrap();
        store
            .append(r"HKCU\Old", PathFlags::RELOCATED, Some(r"HKCU\N|ew\100%"))
            .unwrap();
        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(
            text,
            "1|HKCU\\Soft%7Cware\\$a%7Cb\n2|HKCU\\Old|HKCU\\N%7Cew\\100%25\n"
        );

        let tree = store.read_tree().unwrap();
        assert_eq!(tree.lookup(r"HKCU\Soft|ware\$a|b", false, false).flags, PathFlags::DELETED);
        assert_eq!(
            tree.lookup(r"HKCU\Old", true, false).relocation.as_deref(),
            Some(r"HKCU\N|ew\100%")
        );
    }

    #[test]
    fn test_plain_percent_is_literal() {
        let entry = StoreEntry::parse(r"1|\%SystemRoot%\x%7").unwrap();
        assert_eq!(entry.path, r"\%SystemRoot%\x%7");
    }
}
