//! Snapshot chain and layered path resolution

use super::mapper::{strip_box_prefix, CopyPathMapper};
use super::probe::ExistenceProbe;
use crate::overlay::{PathFlags, PathLookup, PathStore, PathTree};
use crate::settings::SettingsSource;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Longest accepted snapshot identifier
pub const MAX_SNAPSHOT_ID: usize = 16;

/// Directory name prefix of a snapshot layer inside the box
pub const SNAPSHOT_DIR_PREFIX: &str = "snapshot-";

/// Checksum used to derive a snapshot's scramble key
pub type Checksum = fn(&[u8]) -> u32;

/// First four bytes of the blake3 digest, little-endian
pub fn default_checksum(bytes: &[u8]) -> u32 {
    let hash = blake3::hash(bytes);
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Scramble key for a snapshot identifier (checksum over its UTF-16LE bytes)
pub fn scramble_key(id: &str, checksum: Checksum) -> u32 {
    let bytes: Vec<u8> = id.encode_utf16().flat_map(u16::to_le_bytes).collect();
    checksum(&bytes)
}

/// One read-only layer of the box
pub struct Snapshot {
    id: String,
    name: Option<String>,
    scramble_key: u32,
    tree: PathTree,
}

impl Snapshot {
    pub fn new(id: &str, tree: PathTree, checksum: Checksum) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            scramble_key: scramble_key(id, checksum),
            tree,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Display name from the metadata, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn scramble_key(&self) -> u32 {
        self.scramble_key
    }

    pub fn tree(&self) -> &PathTree {
        &self.tree
    }
}

/// Ordered snapshot layers, newest first
pub struct SnapshotChain {
    box_prefix: String,
    snapshots: Vec<Snapshot>,
    probe: Box<dyn ExistenceProbe>,
    mapper: Box<dyn CopyPathMapper>,
}

impl SnapshotChain {
    pub fn new(
        box_prefix: &str,
        snapshots: Vec<Snapshot>,
        probe: Box<dyn ExistenceProbe>,
        mapper: Box<dyn CopyPathMapper>,
    ) -> Self {
        Self {
            box_prefix: box_prefix.trim_end_matches('\\').to_string(),
            snapshots,
            probe,
            mapper,
        }
    }

    /// Build the chain from snapshot metadata.
    ///
    /// Starts at `[Current] Snapshot=` and follows `[Snapshot_<id>] Parent=`.
    /// The walk stops at a missing parent, an invalid identifier or an
    /// identifier seen before. Each layer's tree is read from
    /// `<box_dir>/snapshot-<id>/<store_name>`.
    pub fn load(
        box_dir: &Path,
        box_prefix: &str,
        metadata: &dyn SettingsSource,
        store_name: &str,
        probe: Box<dyn ExistenceProbe>,
        mapper: Box<dyn CopyPathMapper>,
        checksum: Checksum,
    ) -> Self {
        let mut snapshots = Vec::new();
        let mut seen = HashSet::new();
        let mut next = metadata
            .get("Current", "Snapshot", 0)
            .map(str::to_string);

        while let Some(id) = next.take().filter(|id| !id.is_empty()) {
            if id.chars().count() > MAX_SNAPSHOT_ID || id.contains(['\\', '/']) {
                warn!("Ignoring invalid snapshot id {:?}", id);
                break;
            }
            if !seen.insert(id.to_lowercase()) {
                warn!("Snapshot chain loops back to {:?}", id);
                break;
            }

            let section = format!("Snapshot_{id}");
            let store = PathStore::new(
                box_dir
                    .join(format!("{SNAPSHOT_DIR_PREFIX}{id}"))
                    .join(store_name),
            );
            let name = metadata.get(&section, "Name", 0).map(str::to_string);
            next = metadata.get(&section, "Parent", 0).map(str::to_string);

            debug!("Snapshot {} parent {:?}", id, next);
            snapshots.push(Snapshot::new(&id, PathTree::from_store(&store), checksum).with_name(name));
        }

        if !snapshots.is_empty() {
            info!("Loaded {} snapshot layers", snapshots.len());
        }
        Self::new(box_prefix, snapshots, probe, mapper)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn box_prefix(&self) -> &str {
        &self.box_prefix
    }

    /// Insert `\snapshot-<id>` after the box prefix of `path`
    pub fn make_snapshot_path(&self, index: usize, path: &str) -> Option<String> {
        let snapshot = self.snapshots.get(index)?;
        let rest = strip_box_prefix(path, &self.box_prefix)?;
        let head = &path[..path.len() - rest.len()];
        Some(format!(
            "{}\\{}{}{}",
            head, SNAPSHOT_DIR_PREFIX, snapshot.id, rest
        ))
    }

    /// Layer index and layered path of the newest snapshot holding `copy_path`
    pub fn find_snapshot_layer(&self, copy_path: &str) -> Option<(usize, String)> {
        if self.probe.exists(copy_path) {
            return None;
        }

        for index in 0..self.snapshots.len() {
            let layered = self.make_snapshot_path(index, copy_path)?;
            if self.probe.exists(&layered) {
                return Some((index, layered));
            }
        }
        None
    }

    /// Layered path of the newest snapshot holding `copy_path`.
    ///
    /// `None` if the object exists in the active layer or in no snapshot.
    pub fn find_snapshot_path(&self, copy_path: &str) -> Option<String> {
        self.find_snapshot_layer(copy_path).map(|(_, path)| path)
    }

    /// Resolve flags and relocation across the active tree and the snapshot
    /// layers newer than `stop_at` (all layers when `None`).
    pub fn resolve_path_flags(
        &self,
        active: &PathTree,
        true_path: &str,
        copy_path: Option<&str>,
        stop_at: Option<usize>,
    ) -> PathLookup {
        let mut result = active.get_path_flags(true_path, true, true);
        if self.snapshots.is_empty() || result.flags.is_deleted() {
            return result;
        }

        let stop = stop_at.unwrap_or(self.snapshots.len()).min(self.snapshots.len());
        let mut pending = result.relocation.clone();
        let mut true_path = true_path.to_string();
        let mut copy_path = copy_path.map(str::to_string);

        for (index, snapshot) in self.snapshots[..stop].iter().enumerate() {
            if let Some(target) = pending.take() {
                if copy_path.is_some() {
                    copy_path = self.mapper.copy_path(&target);
                }
                true_path = target;
            }

            if let Some(copy) = &copy_path {
                let Some(layered) = self.make_snapshot_path(index, copy) else {
                    break;
                };
                if self.probe.exists(&layered) {
                    debug!("{} found in snapshot {}", true_path, snapshot.id);
                    result.flags |= PathFlags::IN_SNAPSHOT;
                    result.relocation = Some(layered);
                    return result;
                }
            }

            let layer = snapshot.tree.get_path_flags(&true_path, true, true);
            result.flags |= layer.flags;
            if let Some(target) = layer.relocation {
                result.relocation = Some(target.clone());
                pending = Some(target);
            }
            if layer.flags.is_deleted() {
                break;
            }
        }

        result
    }

    /// True if the path was deleted in the active layer or in a snapshot
    /// newer than `stop_at`
    pub fn is_deleted_above(
        &self,
        active: &PathTree,
        true_path: &str,
        copy_path: Option<&str>,
        stop_at: usize,
    ) -> bool {
        self.resolve_path_flags(active, true_path, copy_path, Some(stop_at))
            .flags
            .is_deleted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::IniSettings;
    use crate::snapshot::BoxPathMapper;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use std::fs;
    use tempfile::TempDir;

    const PREFIX: &str = r"\box";

    /// Probe over a fixed set of lower-cased paths
    struct SetProbe(HashSet<String>);

    impl SetProbe {
        fn new(paths: &[&str]) -> Box<Self> {
            Box::new(Self(paths.iter().map(|p| p.to_lowercase()).collect()))
        }
    }

    impl ExistenceProbe for SetProbe {
        fn exists(&self, path: &str) -> bool {
            self.0.contains(&path.to_lowercase())
        }
    }

    fn chain(ids: &[&str], trees: Vec<PathTree>, present: &[&str]) -> SnapshotChain {
        let snapshots = ids
            .iter()
            .zip(trees)
            .map(|(id, tree)| Snapshot::new(id, tree, default_checksum))
            .collect();
        SnapshotChain::new(PREFIX, snapshots, SetProbe::new(present), Box::new(BoxPathMapper::new(PREFIX)))
    }

    #[test]
    fn test_make_snapshot_path() {
        let c = chain(&["A1"], vec![PathTree::new()], &[]);
        assert_eq!(
            c.make_snapshot_path(0, r"\BOX\drive\C\x.txt").as_deref(),
            Some(r"\BOX\snapshot-A1\drive\C\x.txt")
        );
        assert_eq!(c.make_snapshot_path(0, r"\boxy\drive"), None);
        assert_eq!(c.make_snapshot_path(1, r"\box\drive"), None);
    }

    #[test]
    fn test_found_in_middle_snapshot() {
        let c = chain(
            &["S3", "S2", "S1"],
            vec![PathTree::new(), PathTree::new(), PathTree::new()],
            &[r"\box\snapshot-S2\drive\C\f.txt", r"\box\snapshot-S1\drive\C\f.txt"],
        );
        let active = PathTree::new();

        let lookup = c.resolve_path_flags(&active, r"C:\f.txt", Some(r"\box\drive\C\f.txt"), None);
        assert_eq!(lookup.flags, PathFlags::IN_SNAPSHOT);
        assert_eq!(lookup.relocation.as_deref(), Some(r"\box\snapshot-S2\drive\C\f.txt"));

        assert_eq!(
            c.find_snapshot_layer(r"\box\drive\C\f.txt"),
            Some((1, r"\box\snapshot-S2\drive\C\f.txt".to_string()))
        );
    }

    #[test]
    fn test_found_only_in_root_snapshot() {
        let c = chain(
            &["S2", "S1"],
            vec![PathTree::new(), PathTree::new()],
            &[r"\box\snapshot-S1\drive\C\f.txt"],
        );
        let active = PathTree::new();

        let lookup = c.resolve_path_flags(&active, r"C:\f.txt", Some(r"\box\drive\C\f.txt"), None);
        assert_eq!(lookup.flags, PathFlags::IN_SNAPSHOT);
        assert_eq!(lookup.relocation.as_deref(), Some(r"\box\snapshot-S1\drive\C\f.txt"));
        assert_eq!(
            c.find_snapshot_path(r"\box\drive\C\f.txt").as_deref(),
            Some(r"\box\snapshot-S1\drive\C\f.txt")
        );
    }

    #[test]
    fn test_active_deletion_masks_snapshots() {
        let c = chain(&["S1"], vec![PathTree::new()], &[r"\box\snapshot-S1\drive\C\f.txt"]);
        let active = PathTree::new();
        active.mark_deleted(r"C:\f.txt");

        let lookup = c.resolve_path_flags(&active, r"C:\f.txt", Some(r"\box\drive\C\f.txt"), None);
        assert_eq!(lookup.flags, PathFlags::DELETED);
        assert_eq!(lookup.relocation, None);
    }

    #[test]
    fn test_active_relocation_followed_first() {
        let c = chain(&["S1"], vec![PathTree::new()], &[r"\box\snapshot-S1\drive\D\new.txt"]);
        let active = PathTree::new();
        active.set_relocation(r"C:\old.txt", r"D:\new.txt");

        let lookup = c.resolve_path_flags(&active, r"C:\old.txt", Some(r"\box\drive\C\old.txt"), None);
        assert!(lookup.flags.contains(PathFlags::IN_SNAPSHOT | PathFlags::RELOCATED));
        assert_eq!(lookup.relocation.as_deref(), Some(r"\box\snapshot-S1\drive\D\new.txt"));
    }

    #[test]
    fn test_snapshot_deletion_stops_walk() {
        let newer = PathTree::new();
        newer.mark_deleted(r"C:\dir");
        let c = chain(
            &["S2", "S1"],
            vec![newer, PathTree::new()],
            &[r"\box\snapshot-S1\drive\C\dir\f"],
        );
        let active = PathTree::new();

        let lookup = c.resolve_path_flags(&active, r"C:\dir\f", Some(r"\box\drive\C\dir\f"), None);
        assert_eq!(lookup.flags, PathFlags::PATH_DELETED);
        assert!(c.is_deleted_above(&active, r"C:\dir\f", Some(r"\box\drive\C\dir\f"), 1));
        assert!(!c.is_deleted_above(&active, r"C:\dir\f", Some(r"\box\drive\C\dir\f"), 0));
    }

    #[test]
    fn test_stop_at_skips_older_layers() {
        let c = chain(
            &["S2", "S1"],
            vec![PathTree::new(), PathTree::new()],
            &[r"\box\snapshot-S1\drive\C\f"],
        );
        let active = PathTree::new();
        let lookup = c.resolve_path_flags(&active, r"C:\f", Some(r"\box\drive\C\f"), Some(1));
        assert!(lookup.flags.is_empty());
    }

    #[test]
    fn test_empty_chain_is_passthrough() {
        let c = chain(&[], vec![], &[]);
        let active = PathTree::new();
        active.set_relocation(r"C:\a", r"C:\b");
        let lookup = c.resolve_path_flags(&active, r"C:\a", Some(r"\box\drive\C\a"), None);
        assert_eq!(lookup, active.get_path_flags(r"C:\a", true, true));
    }

    #[test]
    fn test_find_snapshot_path_prefers_active() {
        let c = chain(
            &["S1"],
            vec![PathTree::new()],
            &[r"\box\drive\C\f", r"\box\snapshot-S1\drive\C\f"],
        );
        assert_eq!(c.find_snapshot_path(r"\box\drive\C\f"), None);
    }

    #[test]
    fn test_load_from_metadata() {
        let dir = TempDir::new().unwrap();
        let layer = dir.path().join("snapshot-B");
        fs::create_dir_all(&layer).unwrap();
        fs::write(layer.join("FilePaths.dat"), "1|C:\\gone\n").unwrap();

        let meta = IniSettings::parse(
            "[Current]\nSnapshot=C\n[Snapshot_C]\nParent=B\nName=third\n\
             [Snapshot_B]\nParent=A\n[Snapshot_A]\nParent=C\n",
        );
        let c = SnapshotChain::load(
            dir.path(),
            PREFIX,
            &meta,
            "FilePaths.dat",
            SetProbe::new(&[]),
            Box::new(BoxPathMapper::new(PREFIX)),
            default_checksum,
        );

        let ids: Vec<&str> = c.snapshots().iter().map(Snapshot::id).collect();
        assert_eq!(ids, vec!["C", "B", "A"]);
        assert_eq!(c.snapshots()[0].name(), Some("third"));
        assert_eq!(c.snapshots()[1].scramble_key(), scramble_key("B", default_checksum));
        assert_eq!(
            c.snapshots()[1].tree().get_path_flags(r"C:\gone", false, false).flags,
            PathFlags::DELETED
        );

        let active = PathTree::new();
        let lookup = c.resolve_path_flags(&active, r"C:\gone\x", None, None);
        assert_eq!(lookup.flags, PathFlags::PATH_DELETED);
    }

    #[test]
    fn test_load_rejects_long_id() {
        let dir = TempDir::new().unwrap();
        let meta = IniSettings::parse("[Current]\nSnapshot=ABCDEFGHIJKLMNOPQ\n");
        let c = SnapshotChain::load(
            dir.path(),
            PREFIX,
            &meta,
            "FilePaths.dat",
            SetProbe::new(&[]),
            Box::new(BoxPathMapper::new(PREFIX)),
            default_checksum,
        );
        assert!(c.is_empty());
    }
}
