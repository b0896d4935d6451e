//! File-based configuration for tidemark.
//!
//! A `tidemark.toml` has two optional sections:
//!
//! ```toml
//! [memory]
//! max_memory = "2G"
//! safe_zone_lower = 20
//! safe_zone_upper = 40
//!
//! [memory.max_idle_secs]
//! lowest = 300
//!
//! [logging]
//! level = "tidemark.cache=debug,info"
//! json = true
//! ```
//!
//! Memory values go through the same validation as [`ManagerSettings`]
//! properties, and `TIDEMARK_*` environment variables override the file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use thiserror::Error;
use tidemark_memory::{Cost, ManagerSettings};

pub const CONFIG_FILE_NAME: &str = "tidemark.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "TIDEMARK_CONFIG";

/// A byte size which accepts either a raw byte count or a human-friendly
/// string such as `"512M"` or `"1.5GiB"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => tidemark_memory::parse_byte_size(&value)
                .map(ByteSize)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// The `[memory]` section. Unset fields keep the [`ManagerSettings`] default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_memory: Option<ByteSize>,
    pub tenured_percent: Option<u8>,
    pub tenured_size: Option<ByteSize>,
    pub reserve_percent: Option<u8>,
    pub safe_zone_lower: Option<u8>,
    pub safe_zone_upper: Option<u8>,
    pub min_free_percent: Option<u8>,
    pub panic_free_percent: Option<u8>,
    pub min_incremental_clear_time_ms: Option<u64>,
    pub padding_margin: Option<u8>,
    pub padding_max_growth_percent: Option<u8>,
    pub idle_tidy_interval_ms: Option<u64>,
    /// Idle window per cost tier, in seconds.
    pub max_idle_secs: BTreeMap<Cost, u64>,
}

impl MemoryConfig {
    /// The section as `ManagerSettings` property pairs.
    pub fn properties(&self) -> Vec<(String, String)> {
        fn push<T: ToString>(out: &mut Vec<(String, String)>, key: &str, value: Option<T>) {
            if let Some(value) = value {
                out.push((key.to_string(), value.to_string()));
            }
        }

        let mut out = Vec::new();
        push(&mut out, "MAX_MEMORY", self.max_memory.map(|size| size.0));
        push(&mut out, "TENURED_PERCENT", self.tenured_percent);
        push(&mut out, "TENURED_SIZE", self.tenured_size.map(|size| size.0));
        push(&mut out, "RESERVE_PERCENT", self.reserve_percent);
        push(&mut out, "SAFE_ZONE_LOWER", self.safe_zone_lower);
        push(&mut out, "SAFE_ZONE_UPPER", self.safe_zone_upper);
        push(&mut out, "MIN_FREE_PERCENT", self.min_free_percent);
        push(&mut out, "PANIC_FREE_PERCENT", self.panic_free_percent);
        push(
            &mut out,
            "MIN_INCREMENTAL_CLEAR_TIME",
            self.min_incremental_clear_time_ms,
        );
        push(&mut out, "PADDING_MARGIN", self.padding_margin);
        push(
            &mut out,
            "PADDING_MAX_GROWTH_PERCENT",
            self.padding_max_growth_percent,
        );
        push(&mut out, "IDLE_TIDY_INTERVAL", self.idle_tidy_interval_ms);
        for (cost, secs) in &self.max_idle_secs {
            let key = format!("MAX_IDLE_{}", cost.as_str().to_ascii_uppercase());
            out.push((key, secs.to_string()));
        }
        out
    }

    /// Validated settings for this section alone, without environment overrides.
    pub fn to_manager_settings(&self) -> ManagerSettings {
        ManagerSettings::from_properties(self.properties())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to this file as well. If it cannot be opened, file logging
    /// is skipped and the other sinks stay active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    fn level_directive(&self) -> String {
        match self.level.trim() {
            "" => Self::default_level(),
            level if level.eq_ignore_ascii_case("warning") => "warn".to_owned(),
            level => level.to_owned(),
        }
    }

    /// The configured level with `RUST_LOG` directives appended. Anything that
    /// fails to parse falls back to `info`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let mut directives = self.level_directive();
        if let Ok(env) = std::env::var("RUST_LOG") {
            if !env.trim().is_empty() {
                directives = format!("{directives},{}", env.trim());
            }
        }
        tracing_subscriber::EnvFilter::try_new(directives)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TidemarkConfig {
    pub memory: MemoryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` quotes the offending source line; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl TidemarkConfig {
    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Self::load_from_str_with_diagnostics(text).map(|(config, _)| config)
    }

    /// Parse `text`, also returning the dotted paths of keys that were ignored.
    pub fn load_from_str_with_diagnostics(text: &str) -> Result<(Self, Vec<String>), ConfigError> {
        let mut ignored = Vec::new();
        let deserializer = toml::Deserializer::new(text);
        let config: TidemarkConfig = serde_ignored::deserialize(deserializer, |path| {
            ignored.push(path.to_string());
        })?;
        for key in &ignored {
            tracing::warn!(target: "tidemark.config", key = %key, "unknown configuration key");
        }
        Ok((config, ignored))
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    /// Validated memory settings with `TIDEMARK_*` environment overrides applied.
    pub fn manager_settings(&self) -> ManagerSettings {
        let mut settings = self.memory.to_manager_settings();
        settings.apply_env();
        settings
    }
}

/// Where the config for `dir` lives: an explicit path (relative paths resolve
/// against `dir`), else `dir/tidemark.toml` when it exists.
pub fn resolve_config_path(dir: &Path, explicit: Option<PathBuf>) -> Option<PathBuf> {
    match explicit {
        Some(path) if path.is_absolute() => Some(path),
        Some(path) => Some(dir.join(path)),
        None => {
            let candidate = dir.join(CONFIG_FILE_NAME);
            candidate.is_file().then_some(candidate)
        }
    }
}

/// Load the config for `dir`, honouring `TIDEMARK_CONFIG`.
///
/// A missing default file yields the default config; a missing explicit file
/// is an error.
pub fn load_for_dir(dir: &Path) -> Result<(TidemarkConfig, Option<PathBuf>), ConfigError> {
    let explicit = std::env::var_os(CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);
    match resolve_config_path(dir, explicit) {
        Some(path) => {
            let config = TidemarkConfig::load_from_path(&path)?;
            tracing::debug!(target: "tidemark.config", path = %path.display(), "loaded config");
            Ok((config, Some(path)))
        }
        None => Ok((TidemarkConfig::default(), None)),
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber described by `logging`.
///
/// Only the first call in a process installs anything; it returns `true` if
/// that call's subscriber became the global default.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Layer;

    let mut installed = false;
    TRACING_INIT.call_once(|| {
        let filter = logging.env_filter();

        let mut make_writer = if !logging.stderr {
            BoxMakeWriter::new(std::io::sink)
        } else if cfg!(debug_assertions) {
            // Keeps test output captured.
            BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
        } else {
            BoxMakeWriter::new(std::io::stderr)
        };

        let mut file_open_failed = false;
        if let Some(path) = &logging.file {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    make_writer = BoxMakeWriter::new(make_writer.and(Arc::new(file)));
                }
                Err(_) => file_open_failed = true,
            }
        }

        let layer: Box<dyn Layer<_> + Send + Sync> = if logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        installed = tracing::subscriber::set_global_default(subscriber).is_ok();
        if installed && file_open_failed {
            if let Some(path) = &logging.file {
                tracing::warn!(
                    target: "tidemark.config",
                    path = %path.display(),
                    "failed to open log file; logging to the remaining sinks"
                );
            }
        }
    });
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_directives_are_forgiving() {
        let level = |level: &str| LoggingConfig {
            level: level.to_owned(),
            ..LoggingConfig::default()
        };
        assert_eq!(level("").level_directive(), "info");
        assert_eq!(level(" WARNING ").level_directive(), "warn");
        assert_eq!(
            level("tidemark.cache=trace").level_directive(),
            "tidemark.cache=trace"
        );

        // Unparseable levels still yield a usable filter.
        let _ = level("=[not a directive").env_filter();
    }

    #[test]
    fn max_idle_keys_use_upper_case_tier_names() {
        let mut memory = MemoryConfig::default();
        memory.max_idle_secs.insert(Cost::MediumLow, 30);
        assert_eq!(
            memory.properties(),
            vec![("MAX_IDLE_MEDIUM_LOW".to_string(), "30".to_string())]
        );
        assert_eq!(
            memory.to_manager_settings().max_idle_for(Cost::MediumLow),
            Some(std::time::Duration::from_secs(30))
        );
    }

    #[test]
    fn explicit_paths_resolve_against_the_directory() {
        let dir = Path::new("/srv/app");
        assert_eq!(
            resolve_config_path(dir, Some(PathBuf::from("conf/tidemark.toml"))),
            Some(PathBuf::from("/srv/app/conf/tidemark.toml"))
        );
        assert_eq!(
            resolve_config_path(dir, Some(PathBuf::from("/etc/tidemark.toml"))),
            Some(PathBuf::from("/etc/tidemark.toml"))
        );
    }
}
