// =============================================================================
// Shared types used across the exit decision core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Milliseconds in one minute, used for every hold-time comparison.
pub const MS_PER_MINUTE: i64 = 60_000;

/// Milliseconds in one hour.
pub const MS_PER_HOUR: i64 = 3_600_000;

/// How invariant violations are surfaced.
///
/// `Strict` turns every violation into a hard error returned to the caller.
/// `Permissive` quarantines the offending record, flags it invalid and keeps
/// the cycle running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrictnessMode {
    Strict,
    Permissive,
}

impl Default for StrictnessMode {
    fn default() -> Self {
        Self::Permissive
    }
}

impl StrictnessMode {
    pub fn is_strict(&self) -> bool {
        matches!(self, Self::Strict)
    }
}

impl std::fmt::Display for StrictnessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "Strict"),
            Self::Permissive => write!(f, "Permissive"),
        }
    }
}

/// Coarse pool category used to select differentiated thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityClass {
    ClassA,
    ClassB,
    Unclassified,
}

impl Default for EntityClass {
    fn default() -> Self {
        Self::Unclassified
    }
}

impl std::fmt::Display for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClassA => write!(f, "A"),
            Self::ClassB => write!(f, "B"),
            Self::Unclassified => write!(f, "default"),
        }
    }
}

/// Point-in-time view of one live position, as handed to the consistency
/// checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionNotional {
    pub address: String,
    #[serde(default)]
    pub name: String,
    pub notional_usd: f64,
}

impl PositionNotional {
    pub fn new(address: impl Into<String>, name: impl Into<String>, notional_usd: f64) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            notional_usd,
        }
    }
}

/// Elapsed minutes between two millisecond timestamps, never negative.
pub fn minutes_between(from_ms: i64, to_ms: i64) -> f64 {
    (to_ms - from_ms).max(0) as f64 / MS_PER_MINUTE as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minutes_between_clamps_clock_skew() {
        assert_eq!(minutes_between(10 * MS_PER_MINUTE, 0), 0.0);
        assert!((minutes_between(0, 90 * MS_PER_MINUTE) - 90.0).abs() < 1e-9);
    }

    #[test]
    fn defaults_are_the_safe_choices() {
        assert_eq!(StrictnessMode::default(), StrictnessMode::Permissive);
        assert_eq!(EntityClass::default(), EntityClass::Unclassified);
        assert!(StrictnessMode::Strict.is_strict());
    }
}
