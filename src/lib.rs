//! sandpath - path virtualization for application sandboxes
//!
//! This library keeps track of what a sandboxed process has deleted or
//! relocated, resolves paths through read-only snapshot layers, decides
//! which access rules apply to a path and scrambles short names generated
//! inside a box.

pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod overlay;
pub mod policy;
pub mod settings;
pub mod shortname;
pub mod snapshot;
pub mod watch;

pub use config::Config;
pub use engine::{BoxEngine, Decision};
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::engine::{BoxEngine, Decision};
    pub use crate::error::{Error, Result};
    pub use crate::overlay::{PathFlags, PathLookup};
    pub use crate::policy::{AccessClass, ProcessIdentity, ResourceKind};
    pub use crate::settings::{IniSettings, SettingsSource};
}
