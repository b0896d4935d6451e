use crate::cost::Cost;
use crate::error::MemoryError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;
pub const GB: u64 = 1024 * MB;
pub const TB: u64 = 1024 * GB;

/// Prefix applied to every property name when read from the environment.
pub const ENV_PREFIX: &str = "TIDEMARK_";

/// Tunables for [`crate::MemoryManager`].
///
/// Every field has a documented default. Values read through
/// [`ManagerSettings::from_properties`] are validated; anything unparsable or
/// out of range is logged and the default is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Upper bound on the memory the process may use. `None` asks the host.
    pub max_memory: Option<u64>,
    /// Percentage of the tenured pool at which the usage threshold is placed.
    pub tenured_percent: u8,
    /// Override for the tenured pool maximum. `None` asks the host.
    pub tenured_size: Option<u64>,
    /// Collector reserve subtracted from the tenured threshold. `None` uses
    /// the host's convention.
    pub reserve_percent: Option<u8>,
    pub safe_zone_lower: u8,
    pub safe_zone_upper: u8,
    /// Percentage of max memory the panic path tries to get back to.
    pub min_free_percent: u8,
    /// Free percentage below which the panic path runs.
    pub panic_free_percent: u8,
    /// Minimum gap between two incremental clears with no collection in between.
    pub min_incremental_clear_time: Duration,
    /// Padding reserve as a percentage of max memory. Zero disables padding.
    pub padding_margin: u8,
    /// Maximum share of padding segments pinned or released per cycle.
    pub padding_max_growth_percent: u8,
    pub idle_tidy_interval: Duration,
    /// Per-tier idle windows, indexed by [`Cost::level`].
    pub max_idle: [Option<Duration>; Cost::COUNT],
    /// How long a check cycle waits for the clearing lock.
    pub lock_timeout: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_memory: None,
            tenured_percent: 80,
            tenured_size: None,
            reserve_percent: None,
            safe_zone_lower: 20,
            safe_zone_upper: 40,
            min_free_percent: 20,
            panic_free_percent: 10,
            min_incremental_clear_time: Duration::from_millis(60_000),
            padding_margin: 2,
            padding_max_growth_percent: 10,
            idle_tidy_interval: Duration::from_millis(60_000),
            max_idle: [None; Cost::COUNT],
            lock_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerSettings {
    /// Read settings from `TIDEMARK_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Apply `TIDEMARK_*` environment variables on top of `self`.
    pub fn apply_env(&mut self) {
        let vars = std::env::vars().filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|key| (key.to_string(), value))
        });
        self.apply_properties(vars);
    }

    pub fn from_properties<I, K, V>(properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut settings = Self::default();
        settings.apply_properties(properties);
        settings
    }

    /// Apply key/value properties on top of `self`, keeping the current value
    /// for anything invalid. Unknown keys are ignored.
    pub fn apply_properties<I, K, V>(&mut self, properties: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in properties {
            let key = key.as_ref().trim();
            let value = value.as_ref().trim();
            if let Err(err) = self.apply_one(key, value) {
                tracing::warn!(
                    target: "tidemark.memory",
                    key,
                    value,
                    error = %err,
                    "ignoring invalid memory setting; keeping default"
                );
            }
        }

        if self.safe_zone_upper < self.safe_zone_lower {
            tracing::warn!(
                target: "tidemark.memory",
                lower = self.safe_zone_lower,
                upper = self.safe_zone_upper,
                "SAFE_ZONE_UPPER below SAFE_ZONE_LOWER; resetting both to defaults"
            );
            let defaults = Self::default();
            self.safe_zone_lower = defaults.safe_zone_lower;
            self.safe_zone_upper = defaults.safe_zone_upper;
        }
    }

    fn apply_one(&mut self, key: &str, value: &str) -> Result<(), MemoryError> {
        match key {
            "MAX_MEMORY" => self.max_memory = Some(parse_size_setting(key, value)?),
            "TENURED_PERCENT" => self.tenured_percent = parse_percent(key, value, 5, 95)?,
            "TENURED_SIZE" => self.tenured_size = Some(parse_size_setting(key, value)?),
            "RESERVE_PERCENT" => self.reserve_percent = Some(parse_percent(key, value, 0, 50)?),
            "SAFE_ZONE_LOWER" => self.safe_zone_lower = parse_percent(key, value, 0, 90)?,
            "SAFE_ZONE_UPPER" => self.safe_zone_upper = parse_percent(key, value, 0, 90)?,
            "MIN_FREE_PERCENT" => self.min_free_percent = parse_percent(key, value, 0, 90)?,
            "PANIC_FREE_PERCENT" => self.panic_free_percent = parse_percent(key, value, 1, 50)?,
            "MIN_INCREMENTAL_CLEAR_TIME" => {
                self.min_incremental_clear_time = parse_millis(key, value, 0, 3_600_000)?
            }
            "PADDING_MARGIN" => self.padding_margin = parse_percent(key, value, 0, 20)?,
            "PADDING_MAX_GROWTH_PERCENT" => {
                self.padding_max_growth_percent = parse_percent(key, value, 1, 100)?
            }
            "IDLE_TIDY_INTERVAL" => {
                self.idle_tidy_interval = parse_millis(key, value, 1_000, 3_600_000)?
            }
            _ => {
                if let Some(tier) = key.strip_prefix("MAX_IDLE_") {
                    let cost = tier.parse::<Cost>().map_err(|message| invalid(key, message))?;
                    let secs = value
                        .parse::<u64>()
                        .map_err(|err| invalid(key, err.to_string()))?;
                    self.max_idle[cost.level()] = Some(Duration::from_secs(secs));
                }
            }
        }
        Ok(())
    }

    pub fn max_idle_for(&self, cost: Cost) -> Option<Duration> {
        self.max_idle[cost.level()]
    }
}

fn invalid(key: &str, message: impl Into<String>) -> MemoryError {
    MemoryError::InvalidSetting {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_size_setting(key: &str, value: &str) -> Result<u64, MemoryError> {
    parse_byte_size(value).map_err(|message| invalid(key, message))
}

fn parse_percent(key: &str, value: &str, min: u8, max: u8) -> Result<u8, MemoryError> {
    let parsed = value
        .trim_end_matches('%')
        .parse::<u8>()
        .map_err(|err| invalid(key, err.to_string()))?;
    if parsed < min || parsed > max {
        return Err(invalid(key, format!("{parsed} is outside {min}..={max}")));
    }
    Ok(parsed)
}

fn parse_millis(key: &str, value: &str, min: u64, max: u64) -> Result<Duration, MemoryError> {
    let parsed = value
        .parse::<u64>()
        .map_err(|err| invalid(key, err.to_string()))?;
    if parsed < min || parsed > max {
        return Err(invalid(key, format!("{parsed}ms is outside {min}..={max}")));
    }
    Ok(Duration::from_millis(parsed))
}

/// Parse a byte size such as `512`, `64k`, `1.5G`, `256MiB`.
///
/// Suffixes are binary (`1K == 1024`) and case-insensitive.
pub fn parse_byte_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty byte size".to_string());
    }

    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let multiplier = match suffix.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => KB,
        "m" | "mb" | "mib" => MB,
        "g" | "gb" | "gib" => GB,
        "t" | "tb" | "tib" => TB,
        other => return Err(format!("unknown byte size suffix `{other}`")),
    };

    if number.contains('.') {
        let value: f64 = number
            .parse()
            .map_err(|err| format!("invalid byte size `{raw}`: {err}"))?;
        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(format!("byte size `{raw}` is out of range"));
        }
        return Ok(bytes as u64);
    }

    let value: u64 = number
        .parse()
        .map_err(|err| format!("invalid byte size `{raw}`: {err}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size `{raw}` overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_sizes() {
        assert_eq!(parse_byte_size("512"), Ok(512));
        assert_eq!(parse_byte_size("64k"), Ok(64 * KB));
        assert_eq!(parse_byte_size("256MiB"), Ok(256 * MB));
        assert_eq!(parse_byte_size("2G"), Ok(2 * GB));
        assert_eq!(parse_byte_size("1.5g"), Ok(GB + GB / 2));
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("12 parsecs").is_err());
        assert!(parse_byte_size("99999999999T").is_err());
    }

    #[test]
    fn out_of_range_values_keep_defaults() {
        let settings = ManagerSettings::from_properties([
            ("TENURED_PERCENT", "99"),
            ("SAFE_ZONE_LOWER", "abc"),
            ("PADDING_MARGIN", "5"),
            ("MAX_MEMORY", "4G"),
        ]);
        let defaults = ManagerSettings::default();
        assert_eq!(settings.tenured_percent, defaults.tenured_percent);
        assert_eq!(settings.safe_zone_lower, defaults.safe_zone_lower);
        assert_eq!(settings.padding_margin, 5);
        assert_eq!(settings.max_memory, Some(4 * GB));
    }

    #[test]
    fn inverted_safe_zone_falls_back() {
        let settings =
            ManagerSettings::from_properties([("SAFE_ZONE_LOWER", "60"), ("SAFE_ZONE_UPPER", "30")]);
        assert_eq!(settings.safe_zone_lower, 20);
        assert_eq!(settings.safe_zone_upper, 40);
    }

    #[test]
    fn per_tier_idle_windows() {
        let settings = ManagerSettings::from_properties([
            ("MAX_IDLE_LOW", "300"),
            ("MAX_IDLE_NOT_A_TIER", "5"),
        ]);
        assert_eq!(settings.max_idle_for(Cost::Low), Some(Duration::from_secs(300)));
        assert_eq!(settings.max_idle_for(Cost::Medium), None);
        assert_eq!(
            settings.min_incremental_clear_time,
            Duration::from_millis(60_000)
        );
    }
}
