use serde::{Deserialize, Serialize};

/// Where current free memory sits relative to the configured safe zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    /// More than `SAFE_ZONE_UPPER` percent free.
    Safe,
    /// Between the upper and lower safe zone bounds.
    Caution,
    /// Below `SAFE_ZONE_LOWER` percent free.
    Danger,
    /// Below `PANIC_FREE_PERCENT` percent free.
    Panic,
}

/// Free-memory percentages separating the zones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneBounds {
    pub upper: f64,
    pub lower: f64,
    pub panic: f64,
}

impl ZoneBounds {
    pub fn zone_for_free_percent(self, free_percent: f64) -> Zone {
        if free_percent < self.panic {
            Zone::Panic
        } else if free_percent < self.lower {
            Zone::Danger
        } else if free_percent < self.upper {
            Zone::Caution
        } else {
            Zone::Safe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_free_percentages() {
        let bounds = ZoneBounds {
            upper: 40.0,
            lower: 20.0,
            panic: 10.0,
        };
        assert_eq!(bounds.zone_for_free_percent(75.0), Zone::Safe);
        assert_eq!(bounds.zone_for_free_percent(40.0), Zone::Safe);
        assert_eq!(bounds.zone_for_free_percent(30.0), Zone::Caution);
        assert_eq!(bounds.zone_for_free_percent(12.5), Zone::Danger);
        assert_eq!(bounds.zone_for_free_percent(5.0), Zone::Panic);
    }
}
