//! Shared, versioned overlay tree
//!
//! All structural access goes through one mutex. The version counter is
//! bumped on every reload and mutation and can be read without the lock to
//! decide whether cached answers are stale.

use super::flags::PathFlags;
use super::node::{MarkOutcome, PathLookup, PathNode};
use super::store::{PathStore, StoreSignature};
use crate::lock::NamedLock;
use crate::watch::{ChangeSignal, StoreKind};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

struct TreeState {
    root: PathNode,
    signature: Option<StoreSignature>,
}

/// Deleted/relocated path overlay for one resource kind
pub struct PathTree {
    state: Mutex<TreeState>,
    version: AtomicU64,
}

impl Default for PathTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PathTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TreeState {
                root: PathNode::root(),
                signature: None,
            }),
            version: AtomicU64::new(0),
        }
    }

    /// Build a tree from a store, without locking
    pub fn from_store(store: &PathStore) -> Self {
        let tree = Self::new();
        tree.load(store, None);
        tree
    }

    /// Staleness hint, readable without the lock
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Run `f` against a consistent view of the tree
    pub fn with_root<R>(&self, f: impl FnOnce(&PathNode) -> R) -> R {
        let state = self.state.lock();
        f(&state.root)
    }

    pub fn get_path_flags(&self, path: &str, want_relocation: bool, check_children: bool) -> PathLookup {
        let state = self.state.lock();
        state.root.lookup(path, want_relocation, check_children)
    }

    /// Mark `path` deleted in memory only
    pub fn mark_deleted(&self, path: &str) -> MarkOutcome {
        let outcome = self.state.lock().root.mark_deleted(path);
        if outcome.newly_set {
            self.bump();
        }
        outcome
    }

    /// Record a relocation in memory only
    pub fn set_relocation(&self, old_path: &str, new_path: &str) {
        self.state.lock().root.set_relocation(old_path, new_path);
        self.bump();
    }

    /// Drop `path` and everything below it in memory only
    pub fn clear_branch(&self, path: &str) -> bool {
        let removed = self.state.lock().root.clear_branch(path);
        if removed {
            self.bump();
        }
        removed
    }

    /// Replace the tree with the contents of `store`.
    ///
    /// The store is parsed before the tree lock is taken, so readers are
    /// only blocked for the swap.
    pub fn load(&self, store: &PathStore, lock: Option<&NamedLock>) {
        let _guard = lock.and_then(NamedLock::acquire);

        let signature = store.signature();
        let root = match store.read_tree() {
            Ok(root) => root,
            Err(e) => {
                warn!("Cannot read {:?}, using empty tree: {}", store.path(), e);
                PathNode::root()
            }
        };

        let count = root.descendant_count();
        {
            let mut state = self.state.lock();
            state.root = root;
            state.signature = signature;
        }
        self.bump();
        info!("Loaded {} path entries from {:?}", count, store.path());
    }

    /// Rewrite `store` from the in-memory tree
    pub fn save(&self, store: &PathStore) {
        let mut state = self.state.lock();
        self.save_locked(&mut state, store);
        drop(state);
        self.bump();
    }

    fn save_locked(&self, state: &mut TreeState, store: &PathStore) {
        match store.write_tree(&state.root) {
            Ok(()) => {
                state.signature = store.signature();
                debug!("Saved {:?}", store.path());
            }
            Err(e) => warn!("Cannot save {:?}: {}", store.path(), e),
        }
    }

    /// Append one entry if the store has not been written by anyone else.
    ///
    /// Returns `false` when the cached signature no longer matches and the
    /// caller must rewrite instead.
    pub fn append_entry(
        &self,
        store: &PathStore,
        path: &str,
        flags: PathFlags,
        relocation: Option<&str>,
    ) -> bool {
        let mut state = self.state.lock();
        self.append_locked(&mut state, store, path, flags, relocation)
    }

    fn append_locked(
        &self,
        state: &mut TreeState,
        store: &PathStore,
        path: &str,
        flags: PathFlags,
        relocation: Option<&str>,
    ) -> bool {
        if state.signature.is_none() || state.signature != store.signature() {
            return false;
        }
        match store.append(path, flags, relocation) {
            Ok(()) => {
                state.signature = store.signature();
                self.bump();
                true
            }
            Err(e) => {
                warn!("Cannot append to {:?}: {}", store.path(), e);
                false
            }
        }
    }

    /// Reload if another writer changed the store.
    ///
    /// The signal is tested first; the store is only stat'ed when it fired.
    /// Returns `true` if the tree was reloaded.
    pub fn refresh(&self, store: &PathStore, signal: &ChangeSignal, kind: StoreKind, lock: Option<&NamedLock>) -> bool {
        if !signal.take(kind) {
            return false;
        }

        let current = store.signature();
        if current == self.state.lock().signature {
            return false;
        }

        debug!("Store {:?} changed, reloading", store.path());
        self.load(store, lock);
        true
    }

    /// Reload the tree if another writer changed the store since we last
    /// read or wrote it. Called with the named lock held, so the reloaded
    /// tree is current until the lock is released.
    fn sync_locked(&self, state: &mut TreeState, store: &PathStore) -> bool {
        let current = store.signature();
        if current == state.signature {
            return false;
        }

        match store.read_tree() {
            Ok(root) => {
                debug!("Store {:?} changed by another writer, merging", store.path());
                state.root = root;
                state.signature = current;
                true
            }
            Err(e) => {
                warn!("Cannot reread {:?}, keeping cached tree: {}", store.path(), e);
                false
            }
        }
    }

    /// Mark `path` deleted and persist the change.
    ///
    /// The named lock is held across reload, mutation and write. A fresh
    /// mark that did not truncate anything is appended; otherwise the store
    /// is rewritten.
    pub fn mark_deleted_persisted(&self, path: &str, store: &PathStore, lock: Option<&NamedLock>) -> MarkOutcome {
        let _guard = lock.and_then(NamedLock::acquire);

        let mut state = self.state.lock();
        let synced = self.sync_locked(&mut state, store);
        let outcome = state.root.mark_deleted(path);
        if !outcome.newly_set {
            drop(state);
            if synced {
                self.bump();
            }
            return outcome;
        }

        let appended = !outcome.truncated
            && self.append_locked(&mut state, store, path, PathFlags::DELETED, None);
        if !appended {
            self.save_locked(&mut state, store);
        }
        drop(state);
        self.bump();
        outcome
    }

    /// Record a relocation and rewrite the store
    pub fn set_relocation_persisted(&self, old_path: &str, new_path: &str, store: &PathStore, lock: Option<&NamedLock>) {
        let _guard = lock.and_then(NamedLock::acquire);

        let mut state = self.state.lock();
        self.sync_locked(&mut state, store);
        state.root.set_relocation(old_path, new_path);
        self.save_locked(&mut state, store);
        drop(state);
        self.bump();
    }

    /// Remove a branch and rewrite the store if anything changed
    pub fn clear_branch_persisted(&self, path: &str, store: &PathStore, lock: Option<&NamedLock>) -> bool {
        let _guard = lock.and_then(NamedLock::acquire);

        let mut state = self.state.lock();
        let synced = self.sync_locked(&mut state, store);
        let removed = state.root.clear_branch(path);
        if removed {
            self.save_locked(&mut state, store);
        }
        drop(state);
        if removed || synced {
            self.bump();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, PathStore, NamedLock) {
        let dir = TempDir::new().unwrap();
        let store = PathStore::new(dir.path().join("FilePaths.dat"));
        let lock = NamedLock::new(dir.path(), "test");
        (dir, store, lock)
    }

    #[test]
    fn test_persisted_mark_appends() {
        let (_dir, store, lock) = setup();
        let tree = PathTree::new();
        tree.load(&store, Some(&lock));

        // nothing on disk yet, so the first write is a full rewrite
        tree.mark_deleted_persisted(r"\a", &store, Some(&lock));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "1|\\a\n");

        tree.mark_deleted_persisted(r"\b\c", &store, Some(&lock));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "1|\\a\n1|\\b\\c\n");
    }

    #[test]
    fn test_truncating_mark_rewrites() {
        let (_dir, store, lock) = setup();
        let tree = PathTree::new();
        tree.mark_deleted(r"\d\one");
        tree.mark_deleted(r"\d\two");
        tree.save(&store);

        let outcome = tree.mark_deleted_persisted(r"\d", &store, Some(&lock));
        assert!(outcome.truncated);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "1|\\d\n");
    }

    #[test]
    fn test_foreign_write_is_kept() {
        let (_dir, store, lock) = setup();
        let tree = PathTree::new();
        tree.mark_deleted(r"\a");
        tree.save(&store);

        // another writer rewrote the store behind our back
        fs::write(store.path(), "1|\\a\n1|\\zz\\foreign\n").unwrap();

        tree.mark_deleted_persisted(r"\b", &store, Some(&lock));
        let text = fs::read_to_string(store.path()).unwrap();
        assert_eq!(text, "1|\\a\n1|\\zz\\foreign\n1|\\b\n");
        assert!(tree.get_path_flags(r"\zz\foreign", false, false).flags.is_deleted());
    }

    #[test]
    fn test_interleaved_writers_keep_each_other() {
        let (_dir, store, lock) = setup();
        let first = PathTree::from_store(&store);
        let second = PathTree::from_store(&store);

        first.mark_deleted_persisted(r"\x\one", &store, Some(&lock));
        second.mark_deleted_persisted(r"\x\two", &store, Some(&lock));
        first.mark_deleted_persisted(r"\x\three", &store, Some(&lock));
        second.set_relocation_persisted(r"\y", r"\z", &store, Some(&lock));
        assert!(first.clear_branch_persisted(r"\x\one", &store, Some(&lock)));

        let fresh = PathTree::from_store(&store);
        assert!(!fresh.get_path_flags(r"\x\one", false, false).flags.is_deleted());
        assert!(fresh.get_path_flags(r"\x\two", false, false).flags.is_deleted());
        assert!(fresh.get_path_flags(r"\x\three", false, false).flags.is_deleted());
        assert_eq!(fresh.get_path_flags(r"\y", false, false).flags, PathFlags::RELOCATED);
    }

    #[test]
    fn test_idempotent_mark_leaves_store_and_version() {
        let (_dir, store, lock) = setup();
        let tree = PathTree::new();
        tree.mark_deleted_persisted(r"\a", &store, Some(&lock));
        let version = tree.version();
        let text = fs::read_to_string(store.path()).unwrap();

        let outcome = tree.mark_deleted_persisted(r"\a\b", &store, Some(&lock));
        assert!(!outcome.newly_set);
        assert_eq!(tree.version(), version);
        assert_eq!(fs::read_to_string(store.path()).unwrap(), text);
    }

    #[test]
    fn test_refresh_only_after_signal() {
        let (_dir, store, lock) = setup();
        let signal = ChangeSignal::new();
        let tree = PathTree::new();

        assert!(!tree.refresh(&store, &signal, StoreKind::Files, Some(&lock)));

        fs::write(store.path(), "1|\\gone\n").unwrap();
        // signal was consumed by the first refresh
        assert!(!tree.refresh(&store, &signal, StoreKind::Files, Some(&lock)));
        assert!(tree.get_path_flags(r"\gone", false, false).flags.is_empty());

        signal.raise(StoreKind::Files);
        assert!(tree.refresh(&store, &signal, StoreKind::Files, Some(&lock)));
        assert_eq!(tree.get_path_flags(r"\gone", false, false).flags, PathFlags::DELETED);

        // signal fired but store unchanged
        signal.raise(StoreKind::Files);
        assert!(!tree.refresh(&store, &signal, StoreKind::Files, Some(&lock)));
    }

    #[test]
    fn test_relocation_persisted_round_trip() {
        let (_dir, store, lock) = setup();
        let tree = PathTree::new();
        tree.set_relocation_persisted(r"\x\Old", r"\x\New", &store, Some(&lock));

        let reloaded = PathTree::from_store(&store);
        let lookup = reloaded.get_path_flags(r"\x\old\f", true, false);
        assert_eq!(lookup.flags, PathFlags::PATH_RELOCATED);
        assert_eq!(lookup.relocation.as_deref(), Some(r"\x\New\f"));
    }

    #[test]
    fn test_version_bumps() {
        let tree = PathTree::new();
        let v0 = tree.version();
        tree.mark_deleted(r"\a");
        assert!(tree.version() > v0);
        let v1 = tree.version();
        tree.mark_deleted(r"\a");
        assert_eq!(tree.version(), v1);
        assert!(tree.clear_branch(r"\a"));
        assert!(tree.version() > v1);
    }
}
