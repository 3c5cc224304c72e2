//! Snapshot layers
//!
//! A box may carry a chain of read-only snapshots below its active layer.
//! Each snapshot has its own copy directory (`snapshot-<id>`) and its own
//! overlay tree. Lookups that miss in the active layer walk the chain from
//! newest to oldest.

mod chain;
mod mapper;
mod probe;

pub use chain::{
    default_checksum, scramble_key, Checksum, Snapshot, SnapshotChain, MAX_SNAPSHOT_ID,
    SNAPSHOT_DIR_PREFIX,
};
pub use mapper::{strip_box_prefix, BoxPathMapper, CopyPathMapper};
pub use probe::{ExistenceProbe, FsProbe};
