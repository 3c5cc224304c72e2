//! Process image matching and per-image setting lookup
//!
//! Rule values may start with an image matcher: `image.exe,value`,
//! `!image.exe,value` (every image except), `*,value` or a process group
//! `<group>,value`. Groups are declared as `ProcessGroup=<group>,a.exe,b.exe`
//! and may nest other groups.

use super::expand::Expander;
use super::pattern::{MatchLevel, Pattern};
use crate::settings::SettingsSource;
use tracing::{debug, trace};

/// Deepest group nesting that is still followed
pub const MAX_GROUP_DEPTH: u32 = 6;

/// Image matching against one configuration section
pub struct ImageMatcher<'a> {
    settings: &'a dyn SettingsSource,
    section: &'a str,
    expander: &'a Expander,
}

impl<'a> ImageMatcher<'a> {
    pub fn new(settings: &'a dyn SettingsSource, section: &'a str, expander: &'a Expander) -> Self {
        Self {
            settings,
            section,
            expander,
        }
    }

    pub fn settings(&self) -> &'a dyn SettingsSource {
        self.settings
    }

    pub fn section(&self) -> &'a str {
        self.section
    }

    pub fn expander(&self) -> &'a Expander {
        self.expander
    }

    /// Match `pattern` (an image wildcard or a `<group>`) against `image`
    pub fn match_image(&self, pattern: &str, image: &str, depth: u32) -> bool {
        let expanded = match self.expander.expand(pattern) {
            Ok(expanded) => expanded,
            Err(e) => {
                debug!("Cannot expand image pattern {:?}: {}", pattern, e);
                return false;
            }
        };

        if pattern.starts_with('<') {
            return self.match_image_group(&expanded, image, depth + 1);
        }

        match Pattern::new(&expanded, MatchLevel::Exact) {
            Ok(p) => p.is_match(image),
            Err(e) => {
                debug!("Bad image pattern {:?}: {}", expanded, e);
                false
            }
        }
    }

    /// Match `image` against the members of process group `group`
    pub fn match_image_group(&self, group: &str, image: &str, depth: u32) -> bool {
        let mut index = 0;
        while let Some(value) = self.settings.get(self.section, "ProcessGroup", index) {
            index += 1;

            let Some((name, members)) = value.split_once(',') else {
                continue;
            };
            if !name.trim().eq_ignore_ascii_case(group) {
                continue;
            }

            for member in members.split(',').map(str::trim).filter(|m| !m.is_empty()) {
                let matched = if !member.starts_with('<') {
                    self.match_image(member, image, depth + 1)
                } else if depth < MAX_GROUP_DEPTH {
                    self.match_image_group(member, image, depth + 1)
                } else {
                    trace!("Group {} nested too deep", member);
                    false
                };
                if matched {
                    return true;
                }
            }
        }
        false
    }

    /// Split an optional image matcher off `value`.
    ///
    /// Returns the remainder and the match level, or `None` when the matcher
    /// rejects `image` or nothing is left after it.
    pub fn match_image_and_extract_value<'v>(
        &self,
        value: &'v str,
        image: &str,
    ) -> Option<(&'v str, MatchLevel)> {
        let Some((matcher, rest)) = value.split_once(',') else {
            return (!value.is_empty()).then_some((value, MatchLevel::Global));
        };

        let (negated, matcher) = match matcher.strip_prefix('!') {
            Some(m) => (true, m),
            None => (false, matcher),
        };

        let level = if matcher.is_empty() {
            MatchLevel::Global
        } else {
            let matched = self.match_image(matcher, image, 1) != negated;
            if !matched {
                return None;
            }
            if matcher == "*" {
                MatchLevel::All
            } else if negated {
                MatchLevel::Negated
            } else {
                MatchLevel::Exact
            }
        };

        (!rest.is_empty()).then_some((rest, level))
    }

    /// Most specific value of `setting` for `image`; the first value wins a
    /// tie between equally specific ones.
    pub fn get_config_value_for_image(&self, setting: &str, image: &str) -> Option<&'a str> {
        let mut found: Option<(&'a str, MatchLevel)> = None;
        let mut index = 0;

        while let Some(value) = self.settings.get(self.section, setting, index) {
            index += 1;
            let Some((rest, level)) = self.match_image_and_extract_value(value, image) else {
                continue;
            };
            if found.map_or(true, |(_, best)| level < best) {
                found = Some((rest, level));
            }
        }
        found.map(|(value, _)| value)
    }

    /// Boolean form of [`ImageMatcher::get_config_value_for_image`]: a value
    /// starting with `y` or `n` decides, anything else yields `default`.
    pub fn get_config_bool_for_image(&self, setting: &str, image: &str, default: bool) -> bool {
        match self
            .get_config_value_for_image(setting, image)
            .and_then(|v| v.chars().next())
        {
            Some('y' | 'Y') => true,
            Some('n' | 'N') => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::IniSettings;

    fn settings() -> IniSettings {
        IniSettings::parse(
            "[DefaultBox]\n\
             ProcessGroup=<browsers>,firefox.exe,<chromium>\n\
             ProcessGroup=<chromium>,chrome.exe,msedge.exe\n\
             ProcessGroup=<loop1>,<loop2>\n\
             ProcessGroup=<loop2>,<loop1>,deep.exe\n\
             ProcessGroup=<d1>,<d2>\n\
             ProcessGroup=<d2>,<d3>\n\
             ProcessGroup=<d3>,<d4>\n\
             ProcessGroup=<d4>,<d5>\n\
             ProcessGroup=<d5>,<d6>\n\
             ProcessGroup=<d6>,<d7>\n\
             ProcessGroup=<d7>,bottom.exe\n\
             ProcessGroup=<tools>,%Tool%\n\
             UseRuleSpecificity=y\n\
             UseRuleSpecificity=app.exe,n\n\
             BlockNetwork=*,y\n\
             BlockNetwork=*,n\n\
             BlockNetwork=!app.exe,y\n",
        )
    }

    #[test]
    fn test_nested_groups() {
        let ini = settings();
        let expander = Expander::from_map([("Tool", "tool?.exe")]);
        let m = ImageMatcher::new(&ini, "DefaultBox", &expander);

        assert!(m.match_image("<browsers>", "MSEDGE.EXE", 0));
        assert!(m.match_image("<Browsers>", "firefox.exe", 0));
        assert!(!m.match_image("<browsers>", "notepad.exe", 0));
        assert!(m.match_image("<tools>", "tool1.exe", 0));
        assert!(m.match_image("fire*.exe", "Firefox.exe", 0));
    }

    #[test]
    fn test_group_recursion_bound() {
        let ini = settings();
        let expander = Expander::new();
        let m = ImageMatcher::new(&ini, "DefaultBox", &expander);

        // cyclic groups terminate and still find direct members
        assert!(m.match_image("<loop1>", "deep.exe", 0));
        assert!(!m.match_image("<loop1>", "other.exe", 0));
        // seven levels of nesting exceed the bound
        assert!(!m.match_image("<d1>", "bottom.exe", 0));
        assert!(m.match_image("<d4>", "bottom.exe", 0));
    }

    #[test]
    fn test_extract_value_levels() {
        let ini = settings();
        let expander = Expander::new();
        let m = ImageMatcher::new(&ini, "DefaultBox", &expander);

        assert_eq!(m.match_image_and_extract_value(r"C:\x", "a.exe"), Some((r"C:\x", MatchLevel::Global)));
        assert_eq!(m.match_image_and_extract_value(r"a.exe,C:\x", "A.EXE"), Some((r"C:\x", MatchLevel::Exact)));
        assert_eq!(m.match_image_and_extract_value(r"!b.exe,C:\x", "a.exe"), Some((r"C:\x", MatchLevel::Negated)));
        assert_eq!(m.match_image_and_extract_value(r"*,C:\x", "a.exe"), Some((r"C:\x", MatchLevel::All)));
        assert_eq!(m.match_image_and_extract_value(r"b.exe,C:\x", "a.exe"), None);
        assert_eq!(m.match_image_and_extract_value(r"!a.exe,C:\x", "a.exe"), None);
        assert_eq!(m.match_image_and_extract_value("a.exe,", "a.exe"), None);
    }

    #[test]
    fn test_config_value_lowest_level_first_seen() {
        let ini = settings();
        let expander = Expander::new();
        let m = ImageMatcher::new(&ini, "DefaultBox", &expander);

        assert!(!m.get_config_bool_for_image("UseRuleSpecificity", "app.exe", true));
        assert!(m.get_config_bool_for_image("UseRuleSpecificity", "other.exe", false));
        // two level-2 values: the first one wins
        assert_eq!(m.get_config_value_for_image("BlockNetwork", "app.exe"), Some("y"));
        // negated beats match-all
        assert_eq!(m.get_config_value_for_image("BlockNetwork", "x.exe"), Some("y"));
        assert!(m.get_config_bool_for_image("Missing", "x.exe", true));
    }
}
