//! Box engine
//!
//! Ties one box together: the file and key overlay trees with their stores,
//! the snapshot chains below them, the cross-process lock, change
//! notification and the policy settings. Every query refreshes the affected
//! tree first so writes by other processes become visible.

use crate::config::Config;
use crate::error::Result;
use crate::lock::NamedLock;
use crate::overlay::{MarkOutcome, PathFlags, PathLookup, PathStore, PathTree};
use crate::policy::{
    AccessClass, Expander, PathMapping, PolicyContext, ProcessIdentity, ProcessPolicy,
    ResourceKind,
};
use crate::settings::{IniSettings, SettingsSource};
use crate::snapshot::{default_checksum, BoxPathMapper, CopyPathMapper, FsProbe, SnapshotChain};
use crate::watch::{ChangeSignal, StoreKind, StoreWatcher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path of a registry value below `key`
pub fn value_path(key: &str, value: &str) -> String {
    format!("{}\\${}", key.trim_end_matches('\\'), value)
}

/// Outcome of [`BoxEngine::decide`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub access: AccessClass,
    pub mapping: PathMapping,
    /// Overlay flags; empty when the overlay was not consulted
    pub flags: PathFlags,
    pub relocation: Option<String>,
    /// Source text of the deciding rule
    pub rule: Option<String>,
}

/// One box: overlays, snapshots, lock and policy
pub struct BoxEngine {
    config: Config,
    settings: Arc<dyn SettingsSource>,
    expander: Expander,
    mapper: BoxPathMapper,
    file_store: PathStore,
    key_store: PathStore,
    files: PathTree,
    keys: PathTree,
    file_chain: SnapshotChain,
    key_chain: SnapshotChain,
    lock: NamedLock,
    signal: Arc<ChangeSignal>,
    watcher: Option<StoreWatcher>,
}

impl BoxEngine {
    /// Open the box described by `config`, reading policy settings from the
    /// configured settings file
    pub fn open(config: Config) -> Result<Self> {
        let settings = match &config.policy.settings_file {
            Some(path) => IniSettings::load(path)?,
            None => IniSettings::new(),
        };
        Self::with_settings(config, Arc::new(settings))
    }

    /// Open the box with an explicit settings source
    pub fn with_settings(config: Config, settings: Arc<dyn SettingsSource>) -> Result<Self> {
        config.validate()?;
        config.ensure_directories()?;

        let dir = config.sandbox.dir.clone();
        let prefix = config.sandbox.prefix.clone();

        let mut expander = Expander::from_map(&config.policy.variables);
        if expander.get("BoxName").is_none() {
            expander.set("BoxName", config.sandbox.name.clone());
        }

        let lock = NamedLock::new(&dir, &config.qualified_lock_name());
        let file_store = PathStore::new(config.file_store_path());
        let key_store = PathStore::new(config.key_store_path());

        let files = PathTree::new();
        files.load(&file_store, Some(&lock));
        let keys = PathTree::new();
        keys.load(&key_store, Some(&lock));

        let metadata = IniSettings::load(&config.snapshot_metadata_path())?;
        let chain = |store_name: &str| {
            SnapshotChain::load(
                &dir,
                &prefix,
                &metadata,
                store_name,
                Box::new(FsProbe::new(&prefix, &dir)),
                Box::new(BoxPathMapper::new(&prefix)),
                default_checksum,
            )
        };
        let file_chain = chain(&config.stores.file_paths);
        let key_chain = chain(&config.stores.key_paths);

        let signal = Arc::new(ChangeSignal::new());
        let watcher = if config.watch.enabled {
            match StoreWatcher::start(
                &dir,
                &config.stores.file_paths,
                &config.stores.key_paths,
                signal.clone(),
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!("Cannot watch {:?}, changes by other processes need a manual refresh: {}", dir, e);
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Opened box {} at {:?} ({} snapshots)",
            config.sandbox.name,
            dir,
            file_chain.len()
        );

        Ok(Self {
            mapper: BoxPathMapper::new(&prefix),
            config,
            settings,
            expander,
            file_store,
            key_store,
            files,
            keys,
            file_chain,
            key_chain,
            lock,
            signal,
            watcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &dyn SettingsSource {
        self.settings.as_ref()
    }

    pub fn expander(&self) -> &Expander {
        &self.expander
    }

    pub fn files(&self) -> &PathTree {
        &self.files
    }

    pub fn keys(&self) -> &PathTree {
        &self.keys
    }

    pub fn file_chain(&self) -> &SnapshotChain {
        &self.file_chain
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Report a change to one store, as the watcher does
    pub fn notify_changed(&self, kind: StoreKind) {
        self.signal.raise(kind);
    }

    /// Reload whichever trees were signalled and changed on disk
    pub fn refresh(&self) {
        self.refresh_files();
        self.refresh_keys();
    }

    fn refresh_files(&self) {
        self.files
            .refresh(&self.file_store, &self.signal, StoreKind::Files, Some(&self.lock));
    }

    fn refresh_keys(&self) {
        self.keys
            .refresh(&self.key_store, &self.signal, StoreKind::Keys, Some(&self.lock));
    }

    /// Copy path of `true_path` inside this box
    pub fn copy_path(&self, true_path: &str) -> Option<String> {
        self.mapper.copy_path(true_path)
    }

    /// Build the identity of a process, flagging the box's own images
    pub fn identify(&self, image_name: &str, from_box: bool) -> ProcessIdentity {
        let mut process = ProcessIdentity::new(image_name);
        process.image_from_box = from_box;
        process.image_sbie = self
            .config
            .policy
            .sandbox_images
            .iter()
            .any(|i| i.eq_ignore_ascii_case(image_name));
        process
    }

    // File overlay

    /// Flags of a file across the active layer and all snapshots
    pub fn file_flags(&self, true_path: &str, copy_path: Option<&str>) -> PathFlags {
        self.resolve_file(true_path, copy_path).flags
    }

    /// Flags and effective location of a file.
    ///
    /// The relocation is either a relocation target or, with
    /// [`PathFlags::IN_SNAPSHOT`], the copy inside a snapshot layer.
    pub fn resolve_file(&self, true_path: &str, copy_path: Option<&str>) -> PathLookup {
        self.refresh_files();
        self.file_chain
            .resolve_path_flags(&self.files, true_path, copy_path, None)
    }

    /// Newest snapshot copy of a file missing from the active layer
    pub fn snapshot_file_path(&self, copy_path: &str) -> Option<String> {
        self.file_chain.find_snapshot_path(copy_path)
    }

    pub fn mark_file_deleted(&self, path: &str) -> MarkOutcome {
        self.refresh_files();
        let outcome = self
            .files
            .mark_deleted_persisted(path, &self.file_store, Some(&self.lock));
        debug!("Deleted {}: {:?}", path, outcome);
        outcome
    }

    pub fn set_file_relocation(&self, old_path: &str, new_path: &str) {
        self.refresh_files();
        self.files
            .set_relocation_persisted(old_path, new_path, &self.file_store, Some(&self.lock));
    }

    /// Forget every mark on `path` and below; `false` if there was none
    pub fn undelete_file(&self, path: &str) -> bool {
        self.refresh_files();
        self.files
            .clear_branch_persisted(path, &self.file_store, Some(&self.lock))
    }

    // Key overlay

    fn key_target(key: &str, value: Option<&str>) -> String {
        match value {
            Some(value) => value_path(key, value),
            None => key.to_string(),
        }
    }

    /// Mark a key, or one of its values, deleted
    pub fn mark_key_deleted(&self, key: &str, value: Option<&str>) -> MarkOutcome {
        self.refresh_keys();
        let path = Self::key_target(key, value);
        self.keys
            .mark_deleted_persisted(&path, &self.key_store, Some(&self.lock))
    }

    /// True if `key`, the entry `name` below it, or any ancestor was
    /// deleted. `name` is a value name when `is_value` is set and a subkey
    /// name otherwise.
    pub fn is_key_deleted(&self, key: &str, name: Option<&str>, is_value: bool) -> bool {
        let path = match name {
            Some(name) if is_value => value_path(key, name),
            Some(name) => format!("{}\\{}", key.trim_end_matches('\\'), name),
            None => key.to_string(),
        };
        self.resolve_key_target(&path).flags.is_deleted()
    }

    /// True if something below `key` was deleted
    pub fn key_has_deleted_children(&self, key: &str) -> bool {
        self.resolve_key(key)
            .flags
            .contains(PathFlags::CHILDREN_DELETED)
    }

    /// Relocation target recorded for `key` itself; a relocated ancestor
    /// does not count
    pub fn key_relocation(&self, key: &str) -> Option<String> {
        let lookup = self.resolve_key(key);
        if lookup.flags.contains(PathFlags::RELOCATED) {
            lookup.relocation
        } else {
            None
        }
    }

    pub fn resolve_key(&self, key: &str) -> PathLookup {
        self.resolve_key_target(key)
    }

    fn resolve_key_target(&self, path: &str) -> PathLookup {
        self.refresh_keys();
        self.key_chain
            .resolve_path_flags(&self.keys, path, None, None)
    }

    pub fn set_key_relocation(&self, old_key: &str, new_key: &str) {
        self.refresh_keys();
        self.keys
            .set_relocation_persisted(old_key, new_key, &self.key_store, Some(&self.lock));
    }

    pub fn undelete_key(&self, key: &str, value: Option<&str>) -> bool {
        self.refresh_keys();
        let path = Self::key_target(key, value);
        self.keys
            .clear_branch_persisted(&path, &self.key_store, Some(&self.lock))
    }

    // Policy

    /// Rule lists of `process` for `kind`, built from the current settings
    pub fn policy(&self, process: &ProcessIdentity, kind: ResourceKind) -> ProcessPolicy {
        let ctx = PolicyContext {
            settings: self.settings.as_ref(),
            section: &self.config.sandbox.name,
            expander: &self.expander,
            reparse: None,
            default_specificity: self.config.policy.use_rule_specificity,
        };
        ProcessPolicy::build(&ctx, process, kind)
    }

    /// Decide how `process` may access `true_path`.
    ///
    /// Policy is evaluated first. A closed path never reaches the overlay;
    /// an open path is not virtualized and has no overlay state either.
    pub fn decide(
        &self,
        process: &ProcessIdentity,
        kind: ResourceKind,
        true_path: &str,
        copy_path: Option<&str>,
    ) -> Decision {
        let ranked = self.policy(process, kind).classify(true_path);
        let mapping = ranked.mapping();
        let mut decision = Decision {
            access: ranked.class,
            mapping,
            flags: PathFlags::NONE,
            relocation: None,
            rule: ranked.source,
        };

        if decision.access == AccessClass::Closed || mapping.copy_path.is_none() {
            return decision;
        }

        let lookup = match kind {
            ResourceKind::File => {
                let copy = copy_path
                    .map(str::to_string)
                    .or_else(|| self.copy_path(true_path));
                self.resolve_file(true_path, copy.as_deref())
            }
            ResourceKind::Key => self.resolve_key(true_path),
            _ => return decision,
        };
        decision.flags = lookup.flags;
        decision.relocation = lookup.relocation;
        decision
    }
}
