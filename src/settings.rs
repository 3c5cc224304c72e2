//! Settings access
//!
//! The engine reads configuration through [`SettingsSource`], an indexed
//! multi-value lookup by section and setting name. [`IniSettings`] is the
//! bundled implementation for `[Section]` / `Key=Value` text, which is also
//! the format of the snapshot metadata file.

use crate::error::Result;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Section whose values apply to every box
pub const GLOBAL_SECTION: &str = "GlobalSettings";

/// Read-only source of configuration values
pub trait SettingsSource: Send + Sync {
    /// The `index`-th value of `setting` in `section`, in configuration order
    fn get(&self, section: &str, setting: &str, index: usize) -> Option<&str>;

    /// All values of `setting` in `section`
    fn values<'a>(&'a self, section: &'a str, setting: &'a str) -> SettingValues<'a>
    where
        Self: Sized,
    {
        setting_values(self, section, setting)
    }
}

/// Iterate all values of `setting` in `section`
pub fn setting_values<'a>(
    source: &'a dyn SettingsSource,
    section: &'a str,
    setting: &'a str,
) -> SettingValues<'a> {
    SettingValues {
        source,
        section,
        setting,
        index: 0,
    }
}

/// Iterator over the values of one setting
pub struct SettingValues<'a> {
    source: &'a dyn SettingsSource,
    section: &'a str,
    setting: &'a str,
    index: usize,
}

impl<'a> Iterator for SettingValues<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let value = self.source.get(self.section, self.setting, self.index)?;
        self.index += 1;
        Some(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// INI-style settings with repeated keys kept in order.
///
/// Section and key names are case-insensitive. A lookup in a box section
/// continues into `[GlobalSettings]` once the box's own values run out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSettings {
    sections: Vec<Section>,
}

impl IniSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse settings text. Lines that are neither a section header nor a
    /// `key=value` pair are ignored.
    pub fn parse(text: &str) -> Self {
        let mut settings = Self::new();
        let mut current: Option<usize> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(settings.section_index_or_insert(name.trim()));
                continue;
            }

            match (line.split_once('='), current) {
                (Some((key, value)), Some(index)) => {
                    settings.sections[index]
                        .entries
                        .push((key.trim().to_string(), value.trim().to_string()));
                }
                (Some(_), None) => debug!("Ignoring setting outside any section on line {}", number + 1),
                (None, _) => debug!("Ignoring line {}: {:?}", number + 1, line),
            }
        }

        settings
    }

    /// Load from a file; a missing file yields empty settings
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(Self::parse(&String::from_utf8_lossy(&bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Settings file {:?} not found, using empty settings", path);
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())?;
        Ok(())
    }

    /// Append a value to `setting` in `section`
    pub fn push(&mut self, section: &str, setting: &str, value: &str) {
        let index = self.section_index_or_insert(section);
        self.sections[index]
            .entries
            .push((setting.to_string(), value.to_string()));
    }

    /// Replace every value of `setting` in `section` with a single value
    pub fn set(&mut self, section: &str, setting: &str, value: &str) {
        let index = self.section_index_or_insert(section);
        let entries = &mut self.sections[index].entries;
        entries.retain(|(k, _)| !k.eq_ignore_ascii_case(setting));
        entries.push((setting.to_string(), value.to_string()));
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.section(section).is_some()
    }

    /// Names of all sections in file order
    pub fn section_names(&self) -> impl Iterator<Item = &str> {
        self.sections.iter().map(|s| s.name.as_str())
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        match self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        }
    }
}

impl SettingsSource for IniSettings {
    fn get(&self, section: &str, setting: &str, index: usize) -> Option<&str> {
        let global = (!section.eq_ignore_ascii_case(GLOBAL_SECTION)).then_some(GLOBAL_SECTION);
        let mut remaining = index;

        for name in std::iter::once(section).chain(global) {
            let Some(found) = self.section(name) else {
                continue;
            };
            for (key, value) in &found.entries {
                if key.eq_ignore_ascii_case(setting) {
                    if remaining == 0 {
                        return Some(value.as_str());
                    }
                    remaining -= 1;
                }
            }
        }
        None
    }
}

impl fmt::Display for IniSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", section.name)?;
            for (key, value) in &section.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}
