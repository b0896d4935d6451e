use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How expensive cached data is to recompute.
///
/// Eviction always walks tiers from [`Cost::Lowest`] upwards, so the higher the
/// cost the later a handler is asked to give memory back. [`Cost::Panic`] is
/// only touched once every other tier has been drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    Lowest,
    Low,
    MediumLow,
    Medium,
    MediumHigh,
    High,
    VeryHigh,
    Highest,
    Essential,
    Panic,
}

impl Cost {
    pub const COUNT: usize = 10;

    pub const ALL: [Cost; Cost::COUNT] = [
        Cost::Lowest,
        Cost::Low,
        Cost::MediumLow,
        Cost::Medium,
        Cost::MediumHigh,
        Cost::High,
        Cost::VeryHigh,
        Cost::Highest,
        Cost::Essential,
        Cost::Panic,
    ];

    pub fn level(self) -> usize {
        self as usize
    }

    pub fn from_level(level: usize) -> Option<Cost> {
        Cost::ALL.get(level).copied()
    }

    /// Tiers from `self` up to and including [`Cost::Panic`].
    pub fn and_above(self) -> impl Iterator<Item = Cost> {
        Cost::ALL[self.level()..].iter().copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Cost::Lowest => "lowest",
            Cost::Low => "low",
            Cost::MediumLow => "medium_low",
            Cost::Medium => "medium",
            Cost::MediumHigh => "medium_high",
            Cost::High => "high",
            Cost::VeryHigh => "very_high",
            Cost::Highest => "highest",
            Cost::Essential => "essential",
            Cost::Panic => "panic",
        }
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cost {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Cost::ALL
            .into_iter()
            .find(|cost| cost.as_str() == normalized)
            .ok_or_else(|| format!("unknown cost level `{s}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_dense_and_ordered() {
        for (idx, cost) in Cost::ALL.iter().enumerate() {
            assert_eq!(cost.level(), idx);
            assert_eq!(Cost::from_level(idx), Some(*cost));
        }
        assert_eq!(Cost::Panic.level(), 9);
        assert!(Cost::Lowest < Cost::Panic);
        assert_eq!(Cost::from_level(Cost::COUNT), None);
    }

    #[test]
    fn parses_config_spellings() {
        assert_eq!("MEDIUM_LOW".parse::<Cost>(), Ok(Cost::MediumLow));
        assert_eq!("very-high".parse::<Cost>(), Ok(Cost::VeryHigh));
        assert!("cheap".parse::<Cost>().is_err());
    }

    #[test]
    fn and_above_includes_panic() {
        let tiers: Vec<_> = Cost::Highest.and_above().collect();
        assert_eq!(tiers, vec![Cost::Highest, Cost::Essential, Cost::Panic]);
    }
}
