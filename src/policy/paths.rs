//! Building rule lists from configuration
//!
//! Rule settings are named `<Class><Kind>Path`, for example `OpenFilePath`
//! or `ClosedKeyPath`. Each value becomes one or more patterns after image
//! matching, variable expansion and kind-specific normalization.

use super::image::ImageMatcher;
use super::pattern::{MatchLevel, Pattern};
use crate::error::Result;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Access class granted by a rule list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessClass {
    Normal,
    Open,
    Closed,
    Read,
    Write,
}

impl AccessClass {
    pub const ALL: [AccessClass; 5] = [
        AccessClass::Closed,
        AccessClass::Write,
        AccessClass::Read,
        AccessClass::Normal,
        AccessClass::Open,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessClass::Normal => "Normal",
            AccessClass::Open => "Open",
            AccessClass::Closed => "Closed",
            AccessClass::Read => "Read",
            AccessClass::Write => "Write",
        }
    }
}

impl fmt::Display for AccessClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of resource a rule list applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    File,
    Pipe,
    Key,
    Conf,
    Ipc,
    Wnd,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::File => "File",
            ResourceKind::Pipe => "Pipe",
            ResourceKind::Key => "Key",
            ResourceKind::Conf => "Conf",
            ResourceKind::Ipc => "Ipc",
            ResourceKind::Wnd => "Wnd",
        }
    }

    /// Path-like kinds get a `*` suffix so a rule covers the whole subtree
    pub fn adds_star(&self) -> bool {
        matches!(
            self,
            ResourceKind::File | ResourceKind::Pipe | ResourceKind::Key | ResourceKind::Conf
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        [
            ResourceKind::File,
            ResourceKind::Pipe,
            ResourceKind::Key,
            ResourceKind::Conf,
            ResourceKind::Ipc,
            ResourceKind::Wnd,
        ]
        .into_iter()
        .find(|k| k.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

/// Setting name of the rule list for `class` and `kind`
pub fn setting_name(class: AccessClass, kind: ResourceKind) -> String {
    format!("{}{}Path", class.as_str(), kind.as_str())
}

/// Normalization implied by a rule setting name
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingTraits {
    pub closed: bool,
    pub closed_ipc: bool,
    pub remove_backslashes: bool,
    pub check_reparse: bool,
    pub add_drives: bool,
}

impl SettingTraits {
    /// Derive the traits from a setting name such as `WriteFilePath`
    pub fn parse(setting: &str, add_star: bool) -> Self {
        let starts = |prefix: &str| {
            setting
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        };

        let closed = starts("Closed");
        let rest = if starts("Normal") || closed {
            Some(&setting[6..])
        } else if starts("Write") {
            Some(&setting[5..])
        } else if starts("Read") || starts("Open") {
            Some(&setting[4..])
        } else {
            None
        };

        let mut traits = SettingTraits {
            closed,
            ..Default::default()
        };
        let Some(rest) = rest else {
            return traits;
        };
        let kind = |k: &str| rest.get(..k.len()).is_some_and(|head| head.eq_ignore_ascii_case(k));

        traits.closed_ipc = closed && kind("Ipc");
        if kind("Key") || kind("Conf") {
            traits.remove_backslashes = add_star;
        } else if kind("File") || kind("Pipe") {
            traits.remove_backslashes = add_star;
            traits.check_reparse = add_star;
            traits.add_drives = true;
        }
        traits
    }
}

/// Identity of the requesting process as far as rule building cares
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessIdentity {
    /// Image file name, for example `firefox.exe`
    pub image_name: String,
    /// The image is a component of the sandbox itself
    pub image_sbie: bool,
    /// The image was started from inside the box
    pub image_from_box: bool,
    /// `!image,...` closed rules apply to every boxed image
    pub always_close_for_boxed: bool,
}

impl ProcessIdentity {
    pub fn new(image_name: &str) -> Self {
        Self {
            image_name: image_name.to_string(),
            always_close_for_boxed: true,
            ..Default::default()
        }
    }
}

/// Resolves reparse points (junctions, mount points) in a path pattern
pub trait ReparseResolver: Send + Sync {
    /// Physical form of `path`, or `None` when nothing was translated
    fn resolve(&self, path: &str) -> Option<String>;
}

/// Builds rule lists for one process
pub struct PathListBuilder<'a> {
    images: &'a ImageMatcher<'a>,
    process: &'a ProcessIdentity,
    reparse: Option<&'a dyn ReparseResolver>,
}

impl<'a> PathListBuilder<'a> {
    pub fn new(
        images: &'a ImageMatcher<'a>,
        process: &'a ProcessIdentity,
        reparse: Option<&'a dyn ReparseResolver>,
    ) -> Self {
        Self {
            images,
            process,
            reparse,
        }
    }

    /// Build the rule list of `setting`.
    ///
    /// With `insert_first` every new pattern is put in front of the list,
    /// reversing configuration order. A rule that fails to expand or
    /// compile is skipped.
    pub fn build_path_list(&self, setting: &str, add_star: bool, insert_first: bool) -> Vec<Pattern> {
        let mut list = Vec::new();
        self.extend_path_list(&mut list, setting, add_star, insert_first);
        list
    }

    /// Add the rules of `setting` to an existing list
    pub fn extend_path_list(&self, list: &mut Vec<Pattern>, setting: &str, add_star: bool, insert_first: bool) {
        let traits = SettingTraits::parse(setting, add_star);
        let settings = self.images.settings();
        let section = self.images.section();

        let mut index = 0;
        while let Some(value) = settings.get(section, setting, index) {
            index += 1;

            let mut value = value;
            if traits.closed && value.starts_with('!') {
                if traits.closed_ipc && self.process.image_sbie {
                    continue;
                }
                if self.process.image_from_box && self.process.always_close_for_boxed {
                    match value.split_once(',') {
                        Some((_, rest)) => value = rest,
                        None => continue,
                    }
                }
            }

            if let Err(e) = self.add_path(list, &traits, value, add_star, insert_first) {
                warn!("Skipping {} rule {:?}: {}", setting, value, e);
            }
        }
        debug!("{} rules for {}: {}", setting, self.process.image_name, list.len());
    }

    fn add_path(
        &self,
        list: &mut Vec<Pattern>,
        traits: &SettingTraits,
        value: &str,
        add_star: bool,
        insert_first: bool,
    ) -> Result<()> {
        let Some((mut value, level)) = self
            .images
            .match_image_and_extract_value(value, &self.process.image_name)
        else {
            return Ok(());
        };

        let mut add_star = add_star;
        if traits.remove_backslashes {
            if let Some(rest) = value.strip_prefix('|') {
                value = rest;
                add_star = false;
            }
        }

        self.add_with_reparse(list, traits, value, add_star, level, insert_first)?;

        let bytes = value.as_bytes();
        if traits.add_drives && bytes.len() >= 2 && matches!(bytes[0], b'?' | b'*') && bytes[1] == b':' {
            for letter in 'A'..='Z' {
                let drive = format!("{}{}", letter, &value[1..]);
                self.add_with_reparse(list, traits, &drive, add_star, level, insert_first)?;
            }
        }
        Ok(())
    }

    fn add_with_reparse(
        &self,
        list: &mut Vec<Pattern>,
        traits: &SettingTraits,
        value: &str,
        add_star: bool,
        level: MatchLevel,
        insert_first: bool,
    ) -> Result<()> {
        let reparsed = self.add_single(list, traits, value, add_star, traits.check_reparse, level, insert_first)?;
        if reparsed {
            // keep the logical form alongside the physical one
            self.add_single(list, traits, value, add_star, false, level, insert_first)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_single(
        &self,
        list: &mut Vec<Pattern>,
        traits: &SettingTraits,
        value: &str,
        add_star: bool,
        check_reparse: bool,
        level: MatchLevel,
        insert_first: bool,
    ) -> Result<bool> {
        let expanded = self.images.expander().expand(value)?;
        let add_star = add_star && !expanded.contains('*');

        let mut text = if traits.remove_backslashes {
            remove_duplicate_backslashes(&expanded)
        } else {
            expanded
        };
        if add_star {
            text.push('*');
        }

        let mut reparsed = false;
        if check_reparse {
            if let Some(physical) = self.reparse.and_then(|r| r.resolve(&text)) {
                reparsed = !physical.eq_ignore_ascii_case(&text);
                text = physical;
            }
        }

        let pattern = Pattern::new(&text, level)?;
        if insert_first {
            list.insert(0, pattern);
        } else {
            list.push(pattern);
        }
        Ok(reparsed)
    }
}

/// Collapse every run of backslashes to a single one
pub fn remove_duplicate_backslashes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous = '\0';
    for c in text.chars() {
        if c == '\\' && previous == '\\' {
            continue;
        }
        out.push(c);
        previous = c;
    }
    out
}
