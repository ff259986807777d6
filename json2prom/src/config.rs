//! Configuration for the JSON exporter.
//!
//! Everything is read from the environment at startup:
//!
//! - `SOURCES`: JSON array of [`Source`] descriptors (required unless
//!   `SOURCES_FILE` points at a file holding the same array).
//! - `HTTP_ADDR`: listen address, `host:port` or `:port` (default `:8080`).
//! - `LOG_LEVEL` / `LOG_FORMAT`: see [`LoggingConfig`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::sanitize_label_name;

/// Environment variable holding the source list.
pub const SOURCES_VAR: &str = "SOURCES";
/// Environment variable naming a file that holds the source list.
pub const SOURCES_FILE_VAR: &str = "SOURCES_FILE";
/// Environment variable holding the listen address.
pub const HTTP_ADDR_VAR: &str = "HTTP_ADDR";
/// Environment variable holding the log level.
pub const LOG_LEVEL_VAR: &str = "LOG_LEVEL";
/// Environment variable holding the log format.
pub const LOG_FORMAT_VAR: &str = "LOG_FORMAT";

/// Listen address used when `HTTP_ADDR` is unset.
pub const DEFAULT_LISTEN: &str = ":8080";

/// Key under which the action for the document root is configured.
pub const ROOT_KEY: &str = "^";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable SOURCES is required")]
    MissingSources,
    #[error("Failed to read sources file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse sources: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

/// Rewriting rule applied when traversal meets a given JSON key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Ignore the whole subtree under this key.
    #[serde(rename = "Skip", alias = "skip", default)]
    pub skip: bool,

    /// Replace a string value with the number it maps to.
    #[serde(
        rename = "MapValue",
        alias = "map_value",
        alias = "mapValue",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub map_value: Option<HashMap<String, f64>>,

    /// Turn each child of an object into a label value of this name.
    #[serde(
        rename = "MakeLabel",
        alias = "make_label",
        alias = "makeLabel",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub make_label: Option<String>,

    /// Take the label value from this key of each child instead of the
    /// child's own key. Only meaningful together with `make_label`.
    #[serde(
        rename = "LabelKey",
        alias = "label_key",
        alias = "labelKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub label_key: Option<String>,
}

/// The action used for keys without an entry in [`Source::keys`].
pub static NO_ACTION: Action = Action {
    skip: false,
    map_value: None,
    make_label: None,
    label_key: None,
};

impl Action {
    /// Label introduced by this action, if any. Empty names count as unset.
    pub fn make_label_name(&self) -> Option<&str> {
        self.make_label.as_deref().filter(|name| !name.is_empty())
    }

    /// Inner key supplying the label value, if any.
    pub fn label_key_name(&self) -> Option<&str> {
        self.label_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// One upstream JSON endpoint and the rules for projecting it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// HTTP(S) endpoint returning a JSON document.
    #[serde(rename = "URL", alias = "url", alias = "Url", default)]
    pub url: String,

    /// Metric name prefix.
    #[serde(rename = "Namespace", alias = "namespace", default)]
    pub namespace: String,

    /// Metric name prefix placed after the namespace.
    #[serde(rename = "Subsystem", alias = "subsystem", default)]
    pub subsystem: String,

    /// Static labels attached to every sample of this source.
    #[serde(rename = "Labels", alias = "labels", default)]
    pub labels: BTreeMap<String, String>,

    /// Root key whose presence marks the document as an error response.
    #[serde(
        rename = "ErrorKey",
        alias = "error_key",
        alias = "errorKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_key: Option<String>,

    /// Per-key actions; [`ROOT_KEY`] addresses the document root.
    #[serde(rename = "Keys", alias = "keys", default)]
    pub keys: HashMap<String, Action>,
}

impl Source {
    /// Action configured for a raw (untrimmed) JSON key.
    pub fn action_for(&self, key: &str) -> &Action {
        self.keys.get(key).unwrap_or(&NO_ACTION)
    }

    /// Action applied to the document root.
    pub fn root_action(&self) -> &Action {
        self.action_for(ROOT_KEY)
    }

    /// Error sentinel key, if configured. Empty keys count as unset.
    pub fn error_key(&self) -> Option<&str> {
        self.error_key.as_deref().filter(|key| !key.is_empty())
    }

    /// Validate one source. `index` is its position in the list.
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "source #{index}: URL is required"
            )));
        }

        let url = reqwest::Url::parse(&self.url).map_err(|e| {
            ConfigError::Validation(format!("source #{index}: invalid URL {}: {e}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "source #{index}: unsupported URL scheme {}",
                url.scheme()
            )));
        }

        if self.labels.keys().any(|name| name.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "source #{index}: label names must not be empty"
            )));
        }

        // Names must stay distinct once sanitized for exposition
        let mut static_labels = HashSet::new();
        for name in self.labels.keys() {
            if !static_labels.insert(sanitize_label_name(name)) {
                return Err(ConfigError::Validation(format!(
                    "source #{index}: static label {name:?} duplicates another static label"
                )));
            }
        }

        for (key, action) in &self.keys {
            if action.label_key_name().is_some() && action.make_label_name().is_none() {
                return Err(ConfigError::Validation(format!(
                    "source #{index}: key {key:?} sets LabelKey without MakeLabel"
                )));
            }

            if let Some(label) = action.make_label_name()
                && static_labels.contains(&sanitize_label_name(label))
            {
                return Err(ConfigError::Validation(format!(
                    "source #{index}: key {key:?} makes label {label:?} which is already a static label"
                )));
            }
        }

        Ok(())
    }
}

/// Parse and validate a source list (JSON, or JSON5).
pub fn parse_sources(content: &str) -> Result<Vec<Arc<Source>>, ConfigError> {
    let sources: Vec<Source> = json5::from_str(content)?;
    for (index, source) in sources.iter().enumerate() {
        source.validate(index)?;
    }
    Ok(sources.into_iter().map(Arc::new).collect())
}

/// Load and validate a source list from a file.
pub fn load_sources_file<P: AsRef<Path>>(path: P) -> Result<Vec<Arc<Source>>, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_sources(&content)
}

/// Log output format.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Read `LOG_LEVEL` and `LOG_FORMAT`; unknown formats fall back to text.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup(LOG_LEVEL_VAR)
            .filter(|level| !level.is_empty())
            .unwrap_or_else(default_log_level);
        let format = lookup(LOG_FORMAT_VAR)
            .and_then(|format| <LogFormat as clap::ValueEnum>::from_str(&format, true).ok())
            .unwrap_or_default();

        Self { level, format }
    }
}

/// Complete exporter configuration.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Upstream sources, immutable after startup.
    pub sources: Vec<Arc<Source>>,

    /// Listen address as configured (`host:port` or `:port`).
    pub listen: String,
}

impl ExporterConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// `SOURCES_FILE` takes precedence over `SOURCES` when both are set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let sources = match lookup(SOURCES_FILE_VAR).filter(|path| !path.is_empty()) {
            Some(path) => load_sources_file(path)?,
            None => {
                let content = lookup(SOURCES_VAR)
                    .filter(|content| !content.trim().is_empty())
                    .ok_or(ConfigError::MissingSources)?;
                parse_sources(&content)?
            }
        };

        let listen = lookup(HTTP_ADDR_VAR)
            .filter(|addr| !addr.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let config = Self { sources, listen };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        Ok(())
    }

    /// Bindable form of the listen address; `:port` listens on every interface.
    pub fn listen_addr(&self) -> Result<String, ConfigError> {
        normalize_listen_addr(&self.listen)
    }
}

/// Turn `:port` into `0.0.0.0:port` and check that a port is present.
pub fn normalize_listen_addr(addr: &str) -> Result<String, ConfigError> {
    let invalid = || ConfigError::Validation(format!("Invalid listen address: {addr}"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    port.parse::<u16>().map_err(|_| invalid())?;

    if host.is_empty() {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(addr.to_string())
    }
}
