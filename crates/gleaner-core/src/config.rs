//! Configuration types for Gleaner components.
//!
//! Three layers:
//! - process-level settings ([`DbConfig`], [`FetchConfig`], [`SyncConfig`]),
//! - the `sources.toml` file listing harvest sources ([`SourcesConfig`]),
//! - the per-source JSON configuration ([`SourceConfig`]), parsed once per
//!   run and carried in an immutable [`RunConfig`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::models::{HarvestRun, HarvestSource, NewHarvestSource};

/// Database connection pool configuration.
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

/// Content fetch limits and HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Largest body accepted, declared or streamed.
    pub max_file_size: u64,
    /// Granularity of the cumulative size check while streaming.
    pub chunk_size: usize,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024,
            chunk_size: 1024,
            timeout: Duration::from_secs(60),
            user_agent: "Gleaner/0.1 (catalog-harvester)".to_string(),
        }
    }
}

/// Batch harvest configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Number of sources harvested concurrently in a batch.
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

/// Per-source harvest configuration (the JSON object stored on the source).
///
/// Recognized keys: `api_version`, `default_tags`, `default_groups`,
/// `default_extras`, `override_extras`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceConfig {
    pub api_version: Option<i64>,
    pub default_tags: Vec<String>,
    pub default_groups: Vec<String>,
    /// Values are usually strings, possibly with `{placeholder}` templates.
    pub default_extras: BTreeMap<String, Value>,
    pub override_extras: bool,
}

impl SourceConfig {
    /// Parses and structurally validates a raw JSON configuration.
    ///
    /// An empty or missing string yields the default configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use gleaner_core::SourceConfig;
    ///
    /// let config = SourceConfig::parse(r#"{"default_tags": ["open-data"], "api_version": "3"}"#).unwrap();
    /// assert_eq!(config.default_tags, vec!["open-data"]);
    /// assert_eq!(config.api_version, Some(3));
    ///
    /// assert!(SourceConfig::parse(r#"{"default_tags": "open-data"}"#).is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("invalid JSON: {}", e)))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let obj = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(obj) => obj,
            _ => {
                return Err(AppError::ConfigError(
                    "configuration must be a JSON object".to_string(),
                ))
            }
        };

        let api_version = match obj.get("api_version") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.as_i64().ok_or_else(api_version_error)?),
            Some(Value::String(s)) => Some(s.trim().parse::<i64>().map_err(|_| api_version_error())?),
            Some(_) => return Err(api_version_error()),
        };

        let default_tags = string_list(obj.get("default_tags"), "default_tags")?;
        let default_groups = string_list(obj.get("default_groups"), "default_groups")?;

        let default_extras = match obj.get("default_extras") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(_) => {
                return Err(AppError::ConfigError(
                    "default_extras must be a dictionary".to_string(),
                ))
            }
        };

        let override_extras = match obj.get("override_extras") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(AppError::ConfigError(
                    "override_extras must be a boolean".to_string(),
                ))
            }
        };

        Ok(Self {
            api_version,
            default_tags,
            default_groups,
            default_extras,
            override_extras,
        })
    }
}

fn api_version_error() -> AppError {
    AppError::ConfigError("api_version must be an integer".to_string())
}

fn string_list(value: Option<&Value>, key: &str) -> Result<Vec<String>, AppError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                _ => Err(AppError::ConfigError(format!(
                    "{} must be a list of strings",
                    key
                ))),
            })
            .collect(),
        Some(_) => Err(AppError::ConfigError(format!("{} must be a list", key))),
    }
}

/// Everything a single run needs, passed explicitly through every stage.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub source: HarvestSource,
    pub run: HarvestRun,
    pub settings: SourceConfig,
    /// Re-import every record as an update, skipping supersession.
    pub force_import: bool,
}

impl RunConfig {
    pub fn new(source: HarvestSource, run: HarvestRun, settings: SourceConfig) -> Self {
        Self {
            source,
            run,
            settings,
            force_import: false,
        }
    }

    pub fn with_force_import(mut self, force_import: bool) -> Self {
        self.force_import = force_import;
        self
    }
}

// =============================================================================
// Sources file (sources.toml)
// =============================================================================

/// Root of `sources.toml`.
///
/// ```toml
/// [[sources]]
/// name = "city-data"
/// url = "https://data.example.org/data.json"
/// owner_org = "city"
///
/// [sources.config]
/// default_tags = ["city"]
/// override_extras = false
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl SourcesConfig {
    pub fn enabled_sources(&self) -> Vec<&SourceEntry> {
        self.sources.iter().filter(|s| s.enabled).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SourceEntry> {
        self.sources
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }
}

/// One source in `sources.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub owner_org: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Inline source configuration, same keys as the JSON object.
    #[serde(default)]
    pub config: Option<Value>,
}

fn default_enabled() -> bool {
    true
}

impl SourceEntry {
    /// Ad-hoc entry for a URL given on the command line.
    pub fn from_url(url: &str) -> Self {
        Self {
            name: url.to_string(),
            url: url.to_string(),
            title: None,
            owner_org: None,
            enabled: true,
            config: None,
        }
    }

    pub fn to_new_source(&self) -> Result<NewHarvestSource, AppError> {
        let config = match &self.config {
            Some(value) => {
                SourceConfig::from_value(value)?;
                Some(serde_json::to_string(value)?)
            }
            None => None,
        };
        Ok(NewHarvestSource {
            name: self.name.clone(),
            url: self.url.clone(),
            title: self.title.clone().unwrap_or_else(|| self.name.clone()),
            owner_org: self.owner_org.clone(),
            config,
        })
    }
}

/// Default location of `sources.toml` (`~/.config/gleaner/sources.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("gleaner").join("sources.toml"))
}

/// Loads `sources.toml` from `path`, or from the default location.
pub fn load_sources_config(path: Option<&Path>) -> Result<SourcesConfig, AppError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().ok_or_else(|| {
            AppError::ConfigError("cannot determine configuration directory".to_string())
        })?,
    };

    let raw = std::fs::read_to_string(&path).map_err(|e| {
        AppError::ConfigError(format!("cannot read {}: {}", path.display(), e))
    })?;

    let config: SourcesConfig = toml::from_str(&raw).map_err(|e| {
        AppError::ConfigError(format!("invalid {}: {}", path.display(), e))
    })?;

    for entry in &config.sources {
        if let Some(value) = &entry.config {
            SourceConfig::from_value(value).map_err(|e| {
                AppError::ConfigError(format!("source '{}': {}", entry.name, e))
            })?;
        }
    }

    tracing::debug!(path = %path.display(), sources = config.sources.len(), "Loaded sources config");
    Ok(config)
}
