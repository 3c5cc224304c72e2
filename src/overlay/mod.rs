//! Path overlay
//!
//! Records which paths inside a box were deleted or relocated. The tree is
//! kept in memory, persisted as a line-oriented store file and reloaded
//! when another process changes that file.

mod flags;
mod node;
mod store;
mod tree;

pub use flags::PathFlags;
pub use node::{split_path, MarkOutcome, PathLookup, PathNode};
pub use store::{format_line, PathStore, StoreEntry, StoreSignature};
pub use tree::PathTree;
