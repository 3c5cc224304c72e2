//! Box-root change signal
//!
//! A cheap bit set consulted before every lookup. Writers in this process
//! raise the bits directly; an optional filesystem watcher raises them when
//! another process touches a store file.

use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which store may have changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Files,
    Keys,
}

impl StoreKind {
    fn bit(self) -> u32 {
        match self {
            StoreKind::Files => 0x1,
            StoreKind::Keys => 0x2,
        }
    }
}

/// Shared change bits
#[derive(Debug, Default)]
pub struct ChangeSignal {
    bits: AtomicU32,
}

impl ChangeSignal {
    /// A signal with every bit raised, so the first lookup stats the store
    pub fn new() -> Self {
        Self {
            bits: AtomicU32::new(StoreKind::Files.bit() | StoreKind::Keys.bit()),
        }
    }

    pub fn raise(&self, kind: StoreKind) {
        self.bits.fetch_or(kind.bit(), Ordering::AcqRel);
    }

    /// Consume the bit for `kind`, returning whether it was raised
    pub fn take(&self, kind: StoreKind) -> bool {
        self.bits.fetch_and(!kind.bit(), Ordering::AcqRel) & kind.bit() != 0
    }

    pub fn is_raised(&self, kind: StoreKind) -> bool {
        self.bits.load(Ordering::Acquire) & kind.bit() != 0
    }
}

/// Filesystem watcher that raises a [`ChangeSignal`] for store files
pub struct StoreWatcher {
    _watcher: RecommendedWatcher,
    box_dir: PathBuf,
}

impl StoreWatcher {
    /// Watch `box_dir` non-recursively for changes to the two store files
    pub fn start(
        box_dir: &Path,
        file_store: &str,
        key_store: &str,
        signal: Arc<ChangeSignal>,
    ) -> Result<Self> {
        let file_store = file_store.to_lowercase();
        let key_store = key_store.to_lowercase();

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in &event.paths {
                        let name = path
                            .file_name()
                            .map(|n| n.to_string_lossy().to_lowercase())
                            .unwrap_or_default();
                        if name == file_store {
                            debug!("File store changed: {:?}", event.kind);
                            signal.raise(StoreKind::Files);
                        } else if name == key_store {
                            debug!("Key store changed: {:?}", event.kind);
                            signal.raise(StoreKind::Keys);
                        }
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            notify::Config::default(),
        )?;

        watcher.watch(box_dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            _watcher: watcher,
            box_dir: box_dir.to_path_buf(),
        })
    }

    pub fn box_dir(&self) -> &Path {
        &self.box_dir
    }
}
