//! Path classification against rule lists

use super::expand::Expander;
use super::image::ImageMatcher;
use super::paths::{setting_name, AccessClass, PathListBuilder, ProcessIdentity, ReparseResolver, ResourceKind};
use super::pattern::{Pattern, Rank};
use crate::settings::SettingsSource;
use serde::Serialize;
use tracing::debug;

/// Access allowed on one side of the virtualization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PathAccess {
    Closed,
    Read,
    Open,
}

/// What an access class means for the true path and the copy path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PathMapping {
    pub true_path: PathAccess,
    /// `None` when the object is not virtualized at all
    pub copy_path: Option<PathAccess>,
}

impl AccessClass {
    pub fn mapping(&self) -> PathMapping {
        let (true_path, copy_path) = match self {
            AccessClass::Closed => (PathAccess::Closed, Some(PathAccess::Closed)),
            AccessClass::Write => (PathAccess::Read, Some(PathAccess::Open)),
            AccessClass::Read => (PathAccess::Read, Some(PathAccess::Read)),
            AccessClass::Normal => (PathAccess::Read, Some(PathAccess::Open)),
            AccessClass::Open => (PathAccess::Open, None),
        };
        PathMapping {
            true_path,
            copy_path,
        }
    }
}

/// Result of the simple open/closed match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMatch {
    pub open: bool,
    pub closed: bool,
    pub source: Option<String>,
}

/// Check `path` against the closed list, then the open list; first match wins
pub fn match_path(path: &str, open: &[Pattern], closed: &[Pattern]) -> PathMatch {
    if path.is_empty() {
        return PathMatch::default();
    }

    if let Some(p) = closed.iter().find(|p| p.matches_path(path)) {
        return PathMatch {
            open: false,
            closed: true,
            source: Some(p.source().to_string()),
        };
    }
    if let Some(p) = open.iter().find(|p| p.matches_path(path)) {
        return PathMatch {
            open: true,
            closed: false,
            source: Some(p.source().to_string()),
        };
    }
    PathMatch::default()
}

/// The five rule lists for one process and resource kind
#[derive(Debug, Clone, Default)]
pub struct RuleLists {
    pub closed: Vec<Pattern>,
    pub write: Vec<Pattern>,
    pub read: Vec<Pattern>,
    pub normal: Vec<Pattern>,
    pub open: Vec<Pattern>,
}

impl RuleLists {
    pub fn get(&self, class: AccessClass) -> &[Pattern] {
        match class {
            AccessClass::Closed => &self.closed,
            AccessClass::Write => &self.write,
            AccessClass::Read => &self.read,
            AccessClass::Normal => &self.normal,
            AccessClass::Open => &self.open,
        }
    }

    fn get_mut(&mut self, class: AccessClass) -> &mut Vec<Pattern> {
        match class {
            AccessClass::Closed => &mut self.closed,
            AccessClass::Write => &mut self.write,
            AccessClass::Read => &mut self.read,
            AccessClass::Normal => &mut self.normal,
            AccessClass::Open => &mut self.open,
        }
    }

    pub fn len(&self) -> usize {
        AccessClass::ALL.iter().map(|c| self.get(*c).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of ranked classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedMatch {
    pub class: AccessClass,
    /// Source text of the deciding rule
    pub source: Option<String>,
}

impl RankedMatch {
    pub fn mapping(&self) -> PathMapping {
        self.class.mapping()
    }
}

/// Classify `path` against all five lists.
///
/// With `use_specificity` the best ranked matching rule over all lists
/// decides; an equally ranked later rule never replaces an earlier one, so
/// list order (closed, write, read, normal, open) breaks exact ties. Without
/// it the first closed, write or read match decides immediately, a normal
/// match can still be overridden by any open match.
pub fn match_path_ranked(path: &str, lists: &RuleLists, use_specificity: bool) -> RankedMatch {
    if path.is_empty() {
        return RankedMatch {
            class: AccessClass::Closed,
            source: None,
        };
    }

    let mut result = RankedMatch {
        class: AccessClass::Normal,
        source: None,
    };

    if use_specificity {
        let mut best: Option<Rank> = None;
        for class in AccessClass::ALL {
            for pattern in lists.get(class).iter().filter(|p| p.matches_path(path)) {
                let rank = pattern.rank();
                if best.map_or(true, |b| rank > b) {
                    best = Some(rank);
                    result.class = class;
                    result.source = Some(pattern.source().to_string());
                }
            }
        }
        return result;
    }

    for class in AccessClass::ALL {
        let Some(pattern) = lists.get(class).iter().find(|p| p.matches_path(path)) else {
            continue;
        };
        result.class = class;
        result.source = Some(pattern.source().to_string());
        if matches!(class, AccessClass::Closed | AccessClass::Write | AccessClass::Read) {
            break;
        }
    }
    result
}

/// Drop rules that a closed rule already covers.
///
/// A rule is compared by its source with trailing `*` removed; a rule that
/// is nothing but wildcards is always dropped.
pub fn prune_closed(list: Vec<Pattern>, closed: &[Pattern]) -> Vec<Pattern> {
    list.into_iter()
        .filter(|p| {
            let stem = p.source().trim_end_matches('*');
            !stem.is_empty() && !match_path(stem, &[], closed).closed
        })
        .collect()
}

/// Find a `$:<name>` or `$:*` rule granting access to process `name`
pub fn match_process_name<'p>(open: &'p [Pattern], name: &str) -> Option<&'p str> {
    open.iter().map(Pattern::source).find(|src| {
        src.len() >= 3
            && src
                .strip_prefix("$:")
                .is_some_and(|n| n == "*" || n.eq_ignore_ascii_case(name))
    })
}

/// Inputs shared by every policy built for one box
pub struct PolicyContext<'a> {
    pub settings: &'a dyn SettingsSource,
    pub section: &'a str,
    pub expander: &'a Expander,
    pub reparse: Option<&'a dyn ReparseResolver>,
    /// `UseRuleSpecificity` when the settings do not say
    pub default_specificity: bool,
}

/// Rule lists of one process for one resource kind
#[derive(Debug, Clone)]
pub struct ProcessPolicy {
    kind: ResourceKind,
    lists: RuleLists,
    use_specificity: bool,
}

impl ProcessPolicy {
    pub fn build(ctx: &PolicyContext<'_>, process: &ProcessIdentity, kind: ResourceKind) -> Self {
        let images = ImageMatcher::new(ctx.settings, ctx.section, ctx.expander);
        let image = process.image_name.as_str();

        let use_specificity =
            images.get_config_bool_for_image("UseRuleSpecificity", image, ctx.default_specificity);
        let process = ProcessIdentity {
            always_close_for_boxed: images.get_config_bool_for_image(
                "AlwaysCloseForBoxed",
                image,
                process.always_close_for_boxed,
            ),
            ..process.clone()
        };

        let builder = PathListBuilder::new(&images, &process, ctx.reparse);
        let mut lists = RuleLists::default();
        for class in AccessClass::ALL {
            let setting = setting_name(class, kind);
            builder.extend_path_list(lists.get_mut(class), &setting, kind.adds_star(), false);
        }

        if !use_specificity {
            let write = std::mem::take(&mut lists.write);
            lists.write = prune_closed(write, &lists.closed);
        }

        debug!(
            "{} policy for {}: {} rules, specificity {}",
            kind,
            image,
            lists.len(),
            use_specificity
        );
        Self {
            kind,
            lists,
            use_specificity,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn lists(&self) -> &RuleLists {
        &self.lists
    }

    pub fn use_specificity(&self) -> bool {
        self.use_specificity
    }

    pub fn classify(&self, path: &str) -> RankedMatch {
        match_path_ranked(path, &self.lists, self.use_specificity)
    }
}
