// =============================================================================
// Runtime Configuration: every threshold of the exit decision core
// =============================================================================
//
// Central configuration hub. Each component receives its own section at
// construction time; nothing reads configuration from ambient state.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::StrictnessMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

// --- pnl ---------------------------------------------------------------------

fn default_min_entry_notional_usd() -> f64 {
    1.0
}

fn default_pct_tolerance() -> f64 {
    0.001
}

fn default_ledger_tolerance_usd() -> f64 {
    0.01
}

fn default_quarantine_capacity() -> usize {
    100
}

// --- cooldown ----------------------------------------------------------------

fn default_extended_cooldown_minutes() -> u32 {
    30
}

fn default_health_cooldown_minutes() -> u32 {
    10
}

fn default_velocity_cooldown_minutes() -> u32 {
    5
}

fn default_default_cooldown_minutes() -> u32 {
    2
}

fn default_log_every_n_suppressions() -> u32 {
    10
}

// --- hold policy -------------------------------------------------------------

fn default_class_a_min_hold_minutes() -> u32 {
    90
}

fn default_class_b_min_hold_minutes() -> u32 {
    60
}

fn default_min_hold_minutes() -> u32 {
    60
}

fn default_target_payback_hours() -> f64 {
    4.0
}

fn default_min_low_velocity_windows() -> u32 {
    3
}

fn default_tvl_floor_usd() -> f64 {
    1_000.0
}

fn default_tvl_drop_pct() -> f64 {
    0.5
}

// --- decay -------------------------------------------------------------------

fn default_decay_min_floor_usd() -> f64 {
    0.05
}

fn default_decay_floor_bps() -> f64 {
    5.0
}

fn default_min_decay_age_minutes() -> u32 {
    60
}

fn default_half_life_minutes() -> u32 {
    120
}

fn default_slow_half_life_minutes() -> u32 {
    240
}

fn default_min_base_target_pct() -> f64 {
    0.15
}

fn default_health_threshold() -> f64 {
    40.0
}

fn default_bad_samples_required() -> u32 {
    3
}

fn default_velocity_ratio_threshold() -> f64 {
    0.5
}

fn default_entropy_ratio_threshold() -> f64 {
    0.6
}

fn default_mtm_drift_threshold_pct() -> f64 {
    -0.02
}

// --- exit gate ---------------------------------------------------------------

fn default_volume_collapse_drop_pct() -> f64 {
    0.8
}

fn default_override_min_hold_minutes() -> u32 {
    10
}

fn default_override_velocity_ratio() -> f64 {
    0.1
}

fn default_override_zero_activity_minutes() -> u32 {
    30
}

fn default_override_health_floor() -> f64 {
    20.0
}

fn default_rotation_min_hold_minutes() -> u32 {
    30
}

fn default_rotation_max_fee_yield_pct_per_hour() -> f64 {
    0.0001
}

fn default_rotation_min_score_improvement() -> f64 {
    0.25
}

// --- consistency -------------------------------------------------------------

fn default_abs_tolerance_usd() -> f64 {
    1.0
}

fn default_rel_tolerance_pct() -> f64 {
    0.0001
}

fn default_history_capacity() -> usize {
    100
}

// =============================================================================
// PnlParams
// =============================================================================

/// Canonical PnL ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlParams {
    /// Entry notionals below this are rejected (division guard).
    #[serde(default = "default_min_entry_notional_usd")]
    pub min_entry_notional_usd: f64,

    /// Maximum tolerated gap between the stored and the cross-checked net
    /// PnL fraction (0.001 = 0.1 %).
    #[serde(default = "default_pct_tolerance")]
    pub pct_tolerance: f64,

    /// Maximum tolerated gap between canonical net PnL and an independently
    /// observed balance delta, in USD.
    #[serde(default = "default_ledger_tolerance_usd")]
    pub ledger_tolerance_usd: f64,

    /// Size of the quarantine ring; oldest entries are evicted first.
    #[serde(default = "default_quarantine_capacity")]
    pub quarantine_capacity: usize,
}

impl Default for PnlParams {
    fn default() -> Self {
        Self {
            min_entry_notional_usd: default_min_entry_notional_usd(),
            pct_tolerance: default_pct_tolerance(),
            ledger_tolerance_usd: default_ledger_tolerance_usd(),
            quarantine_capacity: default_quarantine_capacity(),
        }
    }
}

// =============================================================================
// CooldownParams
// =============================================================================

/// Suppression window lengths per reason bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownParams {
    /// "Cost not amortized" and "min hold not met" style denials.
    #[serde(default = "default_extended_cooldown_minutes")]
    pub extended_minutes: u32,

    /// Score / health drops.
    #[serde(default = "default_health_cooldown_minutes")]
    pub health_minutes: u32,

    /// Velocity dips.
    #[serde(default = "default_velocity_cooldown_minutes")]
    pub velocity_minutes: u32,

    #[serde(default = "default_default_cooldown_minutes")]
    pub default_minutes: u32,

    /// While suppressed, force one log line every N suppressions.
    #[serde(default = "default_log_every_n_suppressions")]
    pub log_every_n_suppressions: u32,
}

impl Default for CooldownParams {
    fn default() -> Self {
        Self {
            extended_minutes: default_extended_cooldown_minutes(),
            health_minutes: default_health_cooldown_minutes(),
            velocity_minutes: default_velocity_cooldown_minutes(),
            default_minutes: default_default_cooldown_minutes(),
            log_every_n_suppressions: default_log_every_n_suppressions(),
        }
    }
}

// =============================================================================
// HoldPolicyParams
// =============================================================================

/// Minimum-hold table and the fee / TVL thresholds of the hold policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldPolicyParams {
    #[serde(default = "default_class_a_min_hold_minutes")]
    pub class_a_min_hold_minutes: u32,

    #[serde(default = "default_class_b_min_hold_minutes")]
    pub class_b_min_hold_minutes: u32,

    /// Applied to unclassified entities.
    #[serde(default = "default_min_hold_minutes")]
    pub default_min_hold_minutes: u32,

    /// Hours in which accrued fees are expected to repay the entry cost.
    #[serde(default = "default_target_payback_hours")]
    pub target_payback_hours: f64,

    /// Consecutive low-velocity windows required before the fee gate opens.
    #[serde(default = "default_min_low_velocity_windows")]
    pub min_low_velocity_windows: u32,

    /// TVL below this absolute value is a collapse regardless of entry TVL.
    #[serde(default = "default_tvl_floor_usd")]
    pub tvl_floor_usd: f64,

    /// Fractional TVL drop from entry that counts as a collapse (0.5 = 50 %).
    #[serde(default = "default_tvl_drop_pct")]
    pub tvl_drop_pct: f64,
}

impl Default for HoldPolicyParams {
    fn default() -> Self {
        Self {
            class_a_min_hold_minutes: default_class_a_min_hold_minutes(),
            class_b_min_hold_minutes: default_class_b_min_hold_minutes(),
            default_min_hold_minutes: default_min_hold_minutes(),
            target_payback_hours: default_target_payback_hours(),
            min_low_velocity_windows: default_min_low_velocity_windows(),
            tvl_floor_usd: default_tvl_floor_usd(),
            tvl_drop_pct: default_tvl_drop_pct(),
        }
    }
}

// =============================================================================
// DecayParams
// =============================================================================

/// Amortization decay gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayParams {
    /// Master kill switch. When off the undecayed base target applies.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_decay_min_floor_usd")]
    pub min_floor_usd: f64,

    /// Floor as basis points of position notional.
    #[serde(default = "default_decay_floor_bps")]
    pub floor_bps: f64,

    #[serde(default = "default_min_decay_age_minutes")]
    pub min_decay_age_minutes: u32,

    #[serde(default = "default_half_life_minutes")]
    pub half_life_minutes: u32,

    /// Half-life used when no live telemetry confirms the weakness.
    #[serde(default = "default_slow_half_life_minutes")]
    pub slow_half_life_minutes: u32,

    /// Decay never reduces the target below this fraction of the base.
    #[serde(default = "default_min_base_target_pct")]
    pub min_base_target_pct: f64,

    #[serde(default = "default_health_threshold")]
    pub health_threshold: f64,

    #[serde(default = "default_bad_samples_required")]
    pub bad_samples_required: u32,

    /// current / entry fee velocity at or below this is degraded.
    #[serde(default = "default_velocity_ratio_threshold")]
    pub velocity_ratio_threshold: f64,

    /// current / entry entropy at or below this is degraded.
    #[serde(default = "default_entropy_ratio_threshold")]
    pub entropy_ratio_threshold: f64,

    /// Mark-to-market drift (fraction) at or below this is degraded.
    #[serde(default = "default_mtm_drift_threshold_pct")]
    pub mtm_drift_threshold_pct: f64,
}

impl Default for DecayParams {
    fn default() -> Self {
        Self {
            enabled: true,
            min_floor_usd: default_decay_min_floor_usd(),
            floor_bps: default_decay_floor_bps(),
            min_decay_age_minutes: default_min_decay_age_minutes(),
            half_life_minutes: default_half_life_minutes(),
            slow_half_life_minutes: default_slow_half_life_minutes(),
            min_base_target_pct: default_min_base_target_pct(),
            health_threshold: default_health_threshold(),
            bad_samples_required: default_bad_samples_required(),
            velocity_ratio_threshold: default_velocity_ratio_threshold(),
            entropy_ratio_threshold: default_entropy_ratio_threshold(),
            mtm_drift_threshold_pct: default_mtm_drift_threshold_pct(),
        }
    }
}

// =============================================================================
// ExitGateParams
// =============================================================================

/// Thresholds for the direct signals of the exit gate pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitGateParams {
    /// Fractional 24h volume drop from entry treated as a collapse.
    #[serde(default = "default_volume_collapse_drop_pct")]
    pub volume_collapse_drop_pct: f64,

    #[serde(default = "default_override_min_hold_minutes")]
    pub override_min_hold_minutes: u32,

    /// current / expected fee velocity below this is "far below expected".
    #[serde(default = "default_override_velocity_ratio")]
    pub override_velocity_ratio: f64,

    #[serde(default = "default_override_zero_activity_minutes")]
    pub override_zero_activity_minutes: u32,

    #[serde(default = "default_override_health_floor")]
    pub override_health_floor: f64,

    #[serde(default = "default_rotation_min_hold_minutes")]
    pub rotation_min_hold_minutes: u32,

    /// Fee yield (fraction of notional per hour) at or below this is
    /// negligible.
    #[serde(default = "default_rotation_max_fee_yield_pct_per_hour")]
    pub rotation_max_fee_yield_pct_per_hour: f64,

    /// Relative score improvement an alternative pool must offer.
    #[serde(default = "default_rotation_min_score_improvement")]
    pub rotation_min_score_improvement: f64,
}

impl Default for ExitGateParams {
    fn default() -> Self {
        Self {
            volume_collapse_drop_pct: default_volume_collapse_drop_pct(),
            override_min_hold_minutes: default_override_min_hold_minutes(),
            override_velocity_ratio: default_override_velocity_ratio(),
            override_zero_activity_minutes: default_override_zero_activity_minutes(),
            override_health_floor: default_override_health_floor(),
            rotation_min_hold_minutes: default_rotation_min_hold_minutes(),
            rotation_max_fee_yield_pct_per_hour: default_rotation_max_fee_yield_pct_per_hour(),
            rotation_min_score_improvement: default_rotation_min_score_improvement(),
        }
    }
}

// =============================================================================
// ConsistencyParams
// =============================================================================

/// Portfolio consistency tolerances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyParams {
    #[serde(default = "default_abs_tolerance_usd")]
    pub abs_tolerance_usd: f64,

    /// Fraction of reported capital (0.0001 = 0.01 %).
    #[serde(default = "default_rel_tolerance_pct")]
    pub rel_tolerance_pct: f64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for ConsistencyParams {
    fn default() -> Self {
        Self {
            abs_tolerance_usd: default_abs_tolerance_usd(),
            rel_tolerance_pct: default_rel_tolerance_pct(),
            history_capacity: default_history_capacity(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the exit decision core.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Strict surfaces invariant violations as errors; permissive quarantines.
    #[serde(default)]
    pub strictness: StrictnessMode,

    #[serde(default)]
    pub pnl: PnlParams,

    #[serde(default)]
    pub cooldown: CooldownParams,

    #[serde(default)]
    pub hold_policy: HoldPolicyParams,

    #[serde(default)]
    pub decay: DecayParams,

    #[serde(default)]
    pub exit_gate: ExitGateParams,

    #[serde(default)]
    pub consistency: ConsistencyParams,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            strictness = %config.strictness,
            decay_enabled = config.decay.enabled,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.strictness, StrictnessMode::Permissive);
        assert!(cfg.decay.enabled);
        assert_eq!(cfg.hold_policy.class_a_min_hold_minutes, 90);
        assert_eq!(cfg.hold_policy.class_b_min_hold_minutes, 60);
        assert_eq!(cfg.hold_policy.default_min_hold_minutes, 60);
        assert_eq!(cfg.pnl.quarantine_capacity, 100);
        assert_eq!(cfg.consistency.history_capacity, 100);
        assert!((cfg.pnl.pct_tolerance - 0.001).abs() < f64::EPSILON);
        assert!((cfg.decay.min_base_target_pct - 0.15).abs() < f64::EPSILON);
        assert!((cfg.consistency.abs_tolerance_usd - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.strictness, StrictnessMode::Permissive);
        assert_eq!(cfg.cooldown.log_every_n_suppressions, 10);
        assert_eq!(cfg.decay.half_life_minutes, 120);
    }

    #[test]
    fn deserialise_partial_section_fills_defaults() {
        let json = r#"{ "strictness": "Strict", "decay": { "enabled": false } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.strictness, StrictnessMode::Strict);
        assert!(!cfg.decay.enabled);
        assert_eq!(cfg.decay.min_decay_age_minutes, 60);
        assert_eq!(cfg.exit_gate.override_min_hold_minutes, 10);
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = std::env::temp_dir().join(format!("lp-exit-core-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.strictness = StrictnessMode::Strict;
        cfg.hold_policy.class_a_min_hold_minutes = 120;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.strictness, StrictnessMode::Strict);
        assert_eq!(loaded.hold_policy.class_a_min_hold_minutes, 120);
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/nonexistent/lp-exit-core.json").is_err());
    }
}
