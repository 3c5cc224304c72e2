//! Configuration management for sandpath

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default box name
pub const DEFAULT_BOX_NAME: &str = "DefaultBox";

/// Store of deleted/relocated file paths
pub const DEFAULT_FILE_STORE: &str = "FilePaths.dat";

/// Store of deleted/relocated registry paths
pub const DEFAULT_KEY_STORE: &str = "RegPaths.dat";

/// Snapshot metadata inside the box directory
pub const DEFAULT_SNAPSHOT_METADATA: &str = "Snapshots.ini";

/// Longest accepted box name
pub const MAX_BOX_NAME: usize = 32;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Box identity and location
    pub sandbox: BoxConfig,

    /// Store file names inside the box directory
    pub stores: StoreConfig,

    /// Policy configuration
    pub policy: PolicyConfig,

    /// Change notification
    pub watch: WatchConfig,
}

/// Box identity and location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxConfig {
    /// Box name, also the settings section of the box
    pub name: String,

    /// Host directory holding the box contents
    pub dir: PathBuf,

    /// Virtual path under which the box contents appear
    pub prefix: String,
}

/// Store file names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// File path overlay store
    pub file_paths: String,

    /// Registry path overlay store
    pub key_paths: String,

    /// Name of the cross-process lock guarding both stores
    pub lock_name: String,

    /// Snapshot metadata file
    pub snapshot_metadata: String,
}

/// Policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Settings file with the rule lists (INI format)
    pub settings_file: Option<PathBuf>,

    /// Rank rules by specificity unless `UseRuleSpecificity` says otherwise
    pub use_rule_specificity: bool,

    /// Values for `%name%` references in rules
    pub variables: BTreeMap<String, String>,

    /// Images treated as sandbox components
    pub sandbox_images: Vec<String>,
}

/// Change notification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Watch the box directory for store changes made by other processes
    pub enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sandbox: BoxConfig::default(),
            stores: StoreConfig::default(),
            policy: PolicyConfig::default(),
            watch: WatchConfig::default(),
        }
    }
}

impl Default for BoxConfig {
    fn default() -> Self {
        let dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sandpath")
            .join(DEFAULT_BOX_NAME);

        BoxConfig {
            name: DEFAULT_BOX_NAME.to_string(),
            dir,
            prefix: format!(r"C:\Sandbox\{}", DEFAULT_BOX_NAME),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            file_paths: DEFAULT_FILE_STORE.to_string(),
            key_paths: DEFAULT_KEY_STORE.to_string(),
            lock_name: "PathsMutex".to_string(),
            snapshot_metadata: DEFAULT_SNAPSHOT_METADATA.to_string(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig {
            settings_file: None,
            use_rule_specificity: true,
            variables: BTreeMap::new(),
            sandbox_images: vec![
                "SandboxieRpcSs.exe".to_string(),
                "SandboxieDcomLaunch.exe".to_string(),
            ],
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig { enabled: true }
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        // Override with environment variables if set
        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("SANDPATH_BOX_DIR") {
            let dir = dir.trim();
            if !dir.is_empty() {
                self.sandbox.dir = PathBuf::from(dir);
            }
        }

        if let Ok(name) = std::env::var("SANDPATH_BOX_NAME") {
            let name = name.trim().to_string();
            if !name.is_empty() {
                self.sandbox.name = name;
            }
        }

        if let Ok(settings) = std::env::var("SANDPATH_SETTINGS") {
            let settings = settings.trim();
            if !settings.is_empty() {
                self.policy.settings_file = Some(PathBuf::from(settings));
            }
        }
    }

    /// Create a new config from defaults and environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let name = &self.sandbox.name;
        if name.is_empty() || name.len() > MAX_BOX_NAME {
            return Err(Error::InvalidConfig(format!(
                "Box name must be 1 to {} characters",
                MAX_BOX_NAME
            )));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidConfig(format!(
                "Box name {:?} may only contain letters, digits and '_'",
                name
            )));
        }

        if self.sandbox.prefix.trim_end_matches('\\').is_empty() {
            return Err(Error::InvalidConfig("Box prefix is required".to_string()));
        }

        for (what, file) in [
            ("file path store", &self.stores.file_paths),
            ("key path store", &self.stores.key_paths),
            ("lock name", &self.stores.lock_name),
            ("snapshot metadata", &self.stores.snapshot_metadata),
        ] {
            if file.is_empty() || file.contains(['/', '\\']) {
                return Err(Error::InvalidConfig(format!(
                    "Invalid {}: {:?}",
                    what, file
                )));
            }
        }

        if self.stores.file_paths.eq_ignore_ascii_case(&self.stores.key_paths) {
            return Err(Error::InvalidConfig(
                "File and key stores must be different files".to_string(),
            ));
        }

        Ok(())
    }

    /// Ensure the box directory exists
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.sandbox.dir)?;
        Ok(())
    }

    pub fn file_store_path(&self) -> PathBuf {
        self.sandbox.dir.join(&self.stores.file_paths)
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.sandbox.dir.join(&self.stores.key_paths)
    }

    pub fn snapshot_metadata_path(&self) -> PathBuf {
        self.sandbox.dir.join(&self.stores.snapshot_metadata)
    }

    /// Lock name qualified by the box name
    pub fn qualified_lock_name(&self) -> String {
        format!("{}_{}", self.sandbox.name, self.stores.lock_name)
    }
}
