//! In-memory path tree nodes
//!
//! Each node owns its children, keyed by the lower-cased segment name so
//! that lookups are case-insensitive while the original spelling is kept
//! for the store.

use super::flags::PathFlags;
use std::collections::BTreeMap;

/// Split a backslash-separated path into its non-empty segments
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('\\').filter(|s| !s.is_empty())
}

/// Result of a path lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathLookup {
    pub flags: PathFlags,
    /// Relocation target, only filled in when requested
    pub relocation: Option<String>,
}

/// Result of marking a path deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkOutcome {
    /// The Deleted flag was not set before, exactly or through an ancestor
    pub newly_set: bool,
    /// Existing children were discarded
    pub truncated: bool,
}

/// A single path segment in the overlay tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathNode {
    name: String,
    flags: PathFlags,
    relocation: Option<String>,
    has_deleted_children: bool,
    children: BTreeMap<String, PathNode>,
}

impl PathNode {
    /// Create an empty root node
    pub fn root() -> Self {
        Self::default()
    }

    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persisted flags of this node
    pub fn flags(&self) -> PathFlags {
        self.flags
    }

    pub fn relocation(&self) -> Option<&str> {
        self.relocation.as_deref()
    }

    pub fn has_deleted_children(&self) -> bool {
        self.has_deleted_children
    }

    pub fn children(&self) -> impl Iterator<Item = &PathNode> {
        self.children.values()
    }

    pub fn child(&self, name: &str) -> Option<&PathNode> {
        self.children.get(&name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Number of nodes below this one
    pub fn descendant_count(&self) -> usize {
        self.children
            .values()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }

    /// Look up `path` starting at this node
    pub fn lookup(&self, path: &str, want_relocation: bool, check_children: bool) -> PathLookup {
        let segments: Vec<&str> = split_path(path).collect();
        let mut flags = PathFlags::NONE;
        // deepest relocation target and the number of segments it covers
        let mut relocation: Option<(&str, usize)> = None;
        let mut node = self;
        let mut reached = true;

        for (i, segment) in segments.iter().enumerate() {
            match node.children.get(&segment.to_lowercase()) {
                Some(child) => node = child,
                None => {
                    reached = false;
                    break;
                }
            }

            let terminal = i + 1 == segments.len();
            if node.flags.contains(PathFlags::DELETED) {
                flags |= if terminal {
                    PathFlags::DELETED
                } else {
                    PathFlags::PATH_DELETED
                };
            }
            if let Some(target) = node.relocation.as_deref() {
                relocation = Some((target, i + 1));
            }
        }

        let mut result = PathLookup::default();

        if let Some((target, covered)) = relocation {
            if covered == segments.len() {
                flags |= PathFlags::RELOCATED;
            } else {
                flags |= PathFlags::PATH_RELOCATED;
            }
            if want_relocation {
                let mut full = target.trim_end_matches('\\').to_string();
                for segment in &segments[covered..] {
                    full.push('\\');
                    full.push_str(segment);
                }
                if full.is_empty() {
                    full.push('\\');
                }
                result.relocation = Some(full);
            }
        }

        if reached && check_children && !flags.is_deleted() && node.has_deleted_children {
            flags |= PathFlags::CHILDREN_DELETED;
        }

        result.flags = flags;
        result
    }

    /// Mark `path` (relative to this node) deleted
    pub fn mark_deleted(&mut self, path: &str) -> MarkOutcome {
        let segments: Vec<&str> = split_path(path).collect();
        if segments.is_empty() {
            return MarkOutcome::default();
        }
        self.mark_deleted_at(&segments)
    }

    fn mark_deleted_at(&mut self, segments: &[&str]) -> MarkOutcome {
        let Some((first, rest)) = segments.split_first() else {
            return MarkOutcome::default();
        };

        let child = self
            .children
            .entry(first.to_lowercase())
            .or_insert_with(|| PathNode::new(first));

        if child.flags.contains(PathFlags::DELETED) {
            return MarkOutcome::default();
        }

        let outcome = if rest.is_empty() {
            child.flags.insert(PathFlags::DELETED);
            child.flags.remove(PathFlags::RELOCATED);
            child.relocation = None;
            let truncated = !child.children.is_empty();
            child.children.clear();
            child.has_deleted_children = false;
            MarkOutcome {
                newly_set: true,
                truncated,
            }
        } else {
            child.mark_deleted_at(rest)
        };

        if outcome.newly_set {
            self.update_summary();
        }
        outcome
    }

    /// Record that `path` (relative to this node) now lives at `target`
    pub fn set_relocation(&mut self, path: &str, target: &str) {
        let segments: Vec<&str> = split_path(path).collect();
        if segments.is_empty() {
            return;
        }
        self.set_relocation_at(&segments, target);
    }

    fn set_relocation_at(&mut self, segments: &[&str], target: &str) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };

        let child = self
            .children
            .entry(first.to_lowercase())
            .or_insert_with(|| PathNode::new(first));

        if rest.is_empty() {
            child.relocation = Some(target.to_string());
            child.flags.insert(PathFlags::RELOCATED);
            child.flags.remove(PathFlags::DELETED);
        } else {
            child.set_relocation_at(rest, target);
        }

        self.update_summary();
    }

    /// Remove the node for `path` and its subtree
    pub fn clear_branch(&mut self, path: &str) -> bool {
        let segments: Vec<&str> = split_path(path).collect();
        self.clear_branch_at(&segments)
    }

    fn clear_branch_at(&mut self, segments: &[&str]) -> bool {
        let Some((first, rest)) = segments.split_first() else {
            return false;
        };
        let key = first.to_lowercase();

        let removed = if rest.is_empty() {
            self.children.remove(&key).is_some()
        } else {
            match self.children.get_mut(&key) {
                Some(child) => child.clear_branch_at(rest),
                None => false,
            }
        };

        if removed {
            self.update_summary();
        }
        removed
    }

    fn update_summary(&mut self) {
        self.has_deleted_children = self.children.values().any(|c| {
            c.has_deleted_children || c.flags.intersects(PathFlags::PERSISTED)
        });
    }

    /// Visit every node carrying persisted flags, parents before children.
    ///
    /// The callback receives the full path (with a leading `\`), the node's
    /// persisted flags and its relocation target.
    pub fn walk_persisted<F>(&self, mut visit: F)
    where
        F: FnMut(&str, PathFlags, Option<&str>),
    {
        let mut path = String::new();
        self.walk_inner(&mut path, &mut visit);
    }

    fn walk_inner<F>(&self, path: &mut String, visit: &mut F)
    where
        F: FnMut(&str, PathFlags, Option<&str>),
    {
        for child in self.children.values() {
            let restore = path.len();
            path.push('\\');
            path.push_str(&child.name);

            let flags = child.flags.persisted();
            if !flags.is_empty() {
                visit(path, flags, child.relocation.as_deref());
            }
            child.walk_inner(path, visit);

            path.truncate(restore);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ancestor_deletion_inherited() {
        let mut root = PathNode::root();
        let outcome = root.mark_deleted(r"\a\b");
        assert!(outcome.newly_set);

        assert_eq!(root.lookup(r"\a\b", false, false).flags, PathFlags::DELETED);
        assert_eq!(root.lookup(r"\A\B\c\d", false, false).flags, PathFlags::PATH_DELETED);
        assert!(root.lookup(r"\a", false, false).flags.is_empty());
    }

    #[test]
    fn test_mark_deleted_idempotent() {
        let mut root = PathNode::root();
        root.mark_deleted(r"\a\b");
        let before = root.clone();

        assert_eq!(root.mark_deleted(r"\a\b"), MarkOutcome::default());
        assert_eq!(root.mark_deleted(r"\a\b\c"), MarkOutcome::default());
        assert_eq!(root, before);
    }

    #[test]
    fn test_mark_deleted_truncates_subtree() {
        let mut root = PathNode::root();
        root.mark_deleted(r"\dir\one");
        root.set_relocation(r"\dir\two", r"\other\two");

        let outcome = root.mark_deleted(r"\dir");
        assert!(outcome.newly_set);
        assert!(outcome.truncated);
        assert!(root.child("dir").unwrap().is_empty());
        assert_eq!(root.descendant_count(), 1);
    }

    #[test]
    fn test_has_deleted_children_summary() {
        let mut root = PathNode::root();
        root.mark_deleted(r"\a\b\c");

        assert!(root.has_deleted_children());
        let a = root.child("a").unwrap();
        assert!(a.has_deleted_children());
        let b = a.child("b").unwrap();
        assert!(b.has_deleted_children());
        assert!(!b.child("c").unwrap().has_deleted_children());

        let lookup = root.lookup(r"\a", false, true);
        assert_eq!(lookup.flags, PathFlags::CHILDREN_DELETED);
        // not reported without check_children
        assert!(root.lookup(r"\a", false, false).flags.is_empty());
        // not reported for a path that was never reached
        assert!(root.lookup(r"\a\x", false, true).flags.is_empty());

        assert!(root.clear_branch(r"\a\b\c"));
        assert!(!root.has_deleted_children());
        assert!(!root.child("a").unwrap().has_deleted_children());
    }

    #[test]
    fn test_relocation_exact_and_inherited() {
        let mut root = PathNode::root();
        root.set_relocation(r"\data\old", r"\data\new");

        let exact = root.lookup(r"\data\OLD", true, false);
        assert_eq!(exact.flags, PathFlags::RELOCATED);
        assert_eq!(exact.relocation.as_deref(), Some(r"\data\new"));

        let inherited = root.lookup(r"\data\old\sub\File.txt", true, false);
        assert_eq!(inherited.flags, PathFlags::PATH_RELOCATED);
        assert_eq!(inherited.relocation.as_deref(), Some(r"\data\new\sub\File.txt"));

        let no_target = root.lookup(r"\data\old\sub", false, false);
        assert_eq!(no_target.flags, PathFlags::PATH_RELOCATED);
        assert_eq!(no_target.relocation, None);
    }

    #[test]
    fn test_deepest_relocation_wins() {
        let mut root = PathNode::root();
        root.set_relocation(r"\a", r"\x");
        root.set_relocation(r"\a\b", r"\y");

        let lookup = root.lookup(r"\a\b\c", true, false);
        assert_eq!(lookup.relocation.as_deref(), Some(r"\y\c"));
    }

    #[test]
    fn test_relocation_clears_deleted() {
        let mut root = PathNode::root();
        root.mark_deleted(r"\a\b");
        root.set_relocation(r"\a\b", r"\c");

        let lookup = root.lookup(r"\a\b", true, false);
        assert!(!lookup.flags.is_deleted());
        assert_eq!(lookup.flags, PathFlags::RELOCATED);

        // deleting again drops the relocation
        root.mark_deleted(r"\a\b");
        let lookup = root.lookup(r"\a\b", true, false);
        assert_eq!(lookup.flags, PathFlags::DELETED);
        assert_eq!(lookup.relocation, None);
    }

    #[test]
    fn test_walk_persisted_depth_first() {
        let mut root = PathNode::root();
        root.mark_deleted(r"\b\gone");
        root.set_relocation(r"\a\Moved", r"\z");

        let mut lines = Vec::new();
        root.walk_persisted(|path, flags, reloc| {
            lines.push(format!("{}|{}|{}", flags.bits(), path, reloc.unwrap_or("")));
        });
        assert_eq!(lines, vec![r"2|\a\Moved|\z", r"1|\b\gone|"]);
    }
}
