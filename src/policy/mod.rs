//! Access policy
//!
//! Turns `<Class><Kind>Path` settings into per-process rule lists and
//! classifies paths against them. The access class of a path decides how
//! its true location and its copy inside the box may be used.

mod expand;
mod image;
mod matcher;
mod paths;
mod pattern;

pub use expand::Expander;
pub use image::{ImageMatcher, MAX_GROUP_DEPTH};
pub use matcher::{
    match_path, match_path_ranked, match_process_name, prune_closed, PathAccess, PathMapping,
    PathMatch, PolicyContext, ProcessPolicy, RankedMatch, RuleLists,
};
pub use paths::{
    remove_duplicate_backslashes, setting_name, AccessClass, PathListBuilder, ProcessIdentity,
    ReparseResolver, ResourceKind, SettingTraits,
};
pub use pattern::{MatchLevel, Pattern, Rank};
