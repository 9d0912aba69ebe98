// =============================================================================
// Emergency / Minimum-Hold Policy
// =============================================================================
//
// Decides whether an exit reason is an existential threat that bypasses every
// other rule, and otherwise enforces a minimum hold per entity class plus a
// fee-amortization gate that refuses to react to a single noisy low sample.
//
// Combined evaluation order (first decisive step wins):
//   1. TVL collapse        -> allow
//   2. True emergency      -> allow
//   3. Minimum hold        -> deny if not met
//   4. Fee amortization    -> deny if fees still clear the payback target
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::reason::ExitReasonKind;
use crate::runtime_config::HoldPolicyParams;
use crate::types::{minutes_between, EntityClass};

// ---------------------------------------------------------------------------
// Check results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinHoldCheck {
    pub allowed: bool,
    pub hold_time_minutes: f64,
    pub min_hold_minutes: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeAmortizationCheck {
    pub allowed: bool,
    pub required_fees_per_hour: f64,
    pub current_fees_per_hour: f64,
    pub windows_observed: u32,
    pub windows_required: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TvlCollapseCheck {
    pub is_collapse: bool,
    /// Fractional drop from entry TVL (0.6 = 60 %), never negative.
    pub drop_pct: f64,
    pub reason: String,
}

/// Which step of the combined evaluation produced the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyCategory {
    TvlCollapse,
    TrueEmergency,
    MinHold,
    FeeAmortization,
    Passed,
}

/// Inputs of the combined policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    pub reason: ExitReasonKind,
    pub entity_class: EntityClass,
    pub entry_time_ms: i64,
    pub now_ms: i64,
    pub entry_cost_usd: f64,
    pub current_fees_per_hour: f64,
    pub low_velocity_windows: u32,
    pub current_tvl_usd: f64,
    pub entry_tvl_usd: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub allowed: bool,
    pub category: PolicyCategory,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HoldPolicy {
    params: HoldPolicyParams,
}

impl HoldPolicy {
    pub fn new(params: HoldPolicyParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &HoldPolicyParams {
        &self.params
    }

    pub fn is_true_emergency(reason: ExitReasonKind) -> bool {
        reason.is_true_emergency()
    }

    pub fn is_not_emergency(reason: ExitReasonKind) -> bool {
        reason.is_not_emergency()
    }

    /// Minimum hold in minutes for an entity class.
    pub fn min_hold_minutes(&self, class: EntityClass) -> f64 {
        let minutes = match class {
            EntityClass::ClassA => self.params.class_a_min_hold_minutes,
            EntityClass::ClassB => self.params.class_b_min_hold_minutes,
            EntityClass::Unclassified => self.params.default_min_hold_minutes,
        };
        minutes as f64
    }

    /// True emergencies bypass unconditionally; everything else must have
    /// been held for the class minimum.
    pub fn check_min_hold(
        &self,
        entry_time_ms: i64,
        now_ms: i64,
        reason: ExitReasonKind,
        class: EntityClass,
    ) -> MinHoldCheck {
        let hold = minutes_between(entry_time_ms, now_ms);
        let min_hold = self.min_hold_minutes(class);

        if reason.is_true_emergency() {
            return MinHoldCheck {
                allowed: true,
                hold_time_minutes: hold,
                min_hold_minutes: min_hold,
                reason: format!("true emergency ({reason}) bypasses min hold"),
            };
        }

        if hold < min_hold {
            MinHoldCheck {
                allowed: false,
                hold_time_minutes: hold,
                min_hold_minutes: min_hold,
                reason: format!(
                    "min hold not met: {:.1}m < {:.0}m (class {class})",
                    hold, min_hold
                ),
            }
        } else {
            MinHoldCheck {
                allowed: true,
                hold_time_minutes: hold,
                min_hold_minutes: min_hold,
                reason: format!("min hold met: {:.1}m >= {:.0}m", hold, min_hold),
            }
        }
    }

    /// Open only once fee velocity has stayed below the payback requirement
    /// for enough consecutive observation windows.
    pub fn check_fee_amortization_gate(
        &self,
        entry_cost_usd: f64,
        current_fees_per_hour: f64,
        windows_observed: u32,
    ) -> FeeAmortizationCheck {
        let required = if self.params.target_payback_hours > 0.0 {
            entry_cost_usd.max(0.0) / self.params.target_payback_hours
        } else {
            f64::INFINITY
        };
        let windows_required = self.params.min_low_velocity_windows;
        let below = current_fees_per_hour < required;

        let (allowed, reason) = if !below {
            (
                false,
                format!(
                    "fees still amortizing: ${:.4}/h >= ${:.4}/h required",
                    current_fees_per_hour, required
                ),
            )
        } else if windows_observed < windows_required {
            (
                false,
                format!(
                    "low fee velocity not sustained: {windows_observed}/{windows_required} windows"
                ),
            )
        } else {
            (
                true,
                format!(
                    "fee velocity ${:.4}/h below ${:.4}/h for {windows_observed} windows",
                    current_fees_per_hour, required
                ),
            )
        };

        FeeAmortizationCheck {
            allowed,
            required_fees_per_hour: required,
            current_fees_per_hour,
            windows_observed,
            windows_required,
            reason,
        }
    }

    /// Collapse if TVL is under the absolute floor or dropped more than the
    /// configured fraction since entry.
    pub fn check_tvl_collapse(&self, current_tvl_usd: f64, entry_tvl_usd: f64) -> TvlCollapseCheck {
        let drop_pct = if entry_tvl_usd > 0.0 {
            ((entry_tvl_usd - current_tvl_usd) / entry_tvl_usd).max(0.0)
        } else {
            0.0
        };

        if current_tvl_usd < self.params.tvl_floor_usd {
            TvlCollapseCheck {
                is_collapse: true,
                drop_pct,
                reason: format!(
                    "TVL ${:.0} below floor ${:.0}",
                    current_tvl_usd, self.params.tvl_floor_usd
                ),
            }
        } else if drop_pct > self.params.tvl_drop_pct {
            TvlCollapseCheck {
                is_collapse: true,
                drop_pct,
                reason: format!(
                    "TVL dropped {:.1}% from entry (limit {:.1}%)",
                    drop_pct * 100.0,
                    self.params.tvl_drop_pct * 100.0
                ),
            }
        } else {
            TvlCollapseCheck {
                is_collapse: false,
                drop_pct,
                reason: format!("TVL drop {:.1}% within limits", drop_pct * 100.0),
            }
        }
    }

    /// Run every policy step in order and report which one decided.
    pub fn evaluate(&self, input: &PolicyInput) -> PolicyOutcome {
        let tvl = self.check_tvl_collapse(input.current_tvl_usd, input.entry_tvl_usd);
        if tvl.is_collapse {
            return PolicyOutcome {
                allowed: true,
                category: PolicyCategory::TvlCollapse,
                reason: tvl.reason,
            };
        }

        if input.reason.is_true_emergency() {
            return PolicyOutcome {
                allowed: true,
                category: PolicyCategory::TrueEmergency,
                reason: format!("true emergency: {}", input.reason),
            };
        }

        let hold = self.check_min_hold(
            input.entry_time_ms,
            input.now_ms,
            input.reason,
            input.entity_class,
        );
        if !hold.allowed {
            return PolicyOutcome {
                allowed: false,
                category: PolicyCategory::MinHold,
                reason: hold.reason,
            };
        }

        let fees = self.check_fee_amortization_gate(
            input.entry_cost_usd,
            input.current_fees_per_hour,
            input.low_velocity_windows,
        );
        if !fees.allowed {
            return PolicyOutcome {
                allowed: false,
                category: PolicyCategory::FeeAmortization,
                reason: fees.reason,
            };
        }

        PolicyOutcome {
            allowed: true,
            category: PolicyCategory::Passed,
            reason: "all hold policy checks passed".to_string(),
        }
    }
}

impl Default for HoldPolicy {
    fn default() -> Self {
        Self::new(HoldPolicyParams::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MS_PER_MINUTE;

    fn input(reason: ExitReasonKind, held_minutes: i64) -> PolicyInput {
        PolicyInput {
            reason,
            entity_class: EntityClass::ClassB,
            entry_time_ms: 0,
            now_ms: held_minutes * MS_PER_MINUTE,
            entry_cost_usd: 2.0,
            current_fees_per_hour: 0.1,
            low_velocity_windows: 5,
            current_tvl_usd: 50_000.0,
            entry_tvl_usd: 50_000.0,
        }
    }

    #[test]
    fn tvl_collapse_example() {
        let policy = HoldPolicy::default();
        let check = policy.check_tvl_collapse(4_000.0, 10_000.0);
        assert!(check.is_collapse);
        assert!((check.drop_pct - 0.6).abs() < 1e-9);
        assert_eq!(
            ExitReasonKind::classify("TVL_COLLAPSE_50PCT"),
            ExitReasonKind::LiquidityCollapse
        );
    }

    #[test]
    fn tvl_floor_triggers_without_drop() {
        let policy = HoldPolicy::default();
        let check = policy.check_tvl_collapse(500.0, 500.0);
        assert!(check.is_collapse);
        assert_eq!(check.drop_pct, 0.0);
    }

    #[test]
    fn tvl_growth_is_not_a_negative_drop() {
        let policy = HoldPolicy::default();
        let check = policy.check_tvl_collapse(20_000.0, 10_000.0);
        assert!(!check.is_collapse);
        assert_eq!(check.drop_pct, 0.0);
    }

    #[test]
    fn min_hold_tiers_by_class() {
        let policy = HoldPolicy::default();
        let at_75 = |class| {
            policy.check_min_hold(0, 75 * MS_PER_MINUTE, ExitReasonKind::ScoreDrop, class)
        };
        let a = at_75(EntityClass::ClassA);
        let b = at_75(EntityClass::ClassB);
        assert!(!a.allowed, "class A needs 90 minutes");
        assert!(b.allowed, "class B needs 60 minutes");
        assert_eq!(a.min_hold_minutes, 90.0);
        assert!((a.hold_time_minutes - 75.0).abs() < 1e-9);
    }

    #[test]
    fn emergency_bypasses_min_hold() {
        let policy = HoldPolicy::default();
        let check =
            policy.check_min_hold(0, MS_PER_MINUTE, ExitReasonKind::RugSignal, EntityClass::ClassA);
        assert!(check.allowed);
    }

    #[test]
    fn noise_never_bypasses_min_hold() {
        let policy = HoldPolicy::default();
        for kind in [
            ExitReasonKind::ScoreDrop,
            ExitReasonKind::RegimeFlip,
            ExitReasonKind::VelocityDrop,
            ExitReasonKind::FeeBleed,
            ExitReasonKind::HealthExit,
            ExitReasonKind::RankingKill,
        ] {
            assert!(HoldPolicy::is_not_emergency(kind));
            assert!(!HoldPolicy::is_true_emergency(kind));
            let check =
                policy.check_min_hold(0, 5 * MS_PER_MINUTE, kind, EntityClass::Unclassified);
            assert!(!check.allowed, "{kind} bypassed min hold");
        }
    }

    #[test]
    fn fee_gate_requires_sustained_low_velocity() {
        let policy = HoldPolicy::default();
        // $2 entry cost over 4h payback -> $0.50/h required.
        let one_sample = policy.check_fee_amortization_gate(2.0, 0.1, 1);
        assert!(!one_sample.allowed);
        assert!((one_sample.required_fees_per_hour - 0.5).abs() < 1e-12);

        let sustained = policy.check_fee_amortization_gate(2.0, 0.1, 3);
        assert!(sustained.allowed);

        let healthy = policy.check_fee_amortization_gate(2.0, 0.8, 10);
        assert!(!healthy.allowed);
    }

    #[test]
    fn combined_order_short_circuits() {
        let policy = HoldPolicy::default();

        let mut collapsed = input(ExitReasonKind::ScoreDrop, 1);
        collapsed.current_tvl_usd = 100.0;
        assert_eq!(policy.evaluate(&collapsed).category, PolicyCategory::TvlCollapse);

        let emergency = input(ExitReasonKind::PoolMigration, 1);
        assert_eq!(policy.evaluate(&emergency).category, PolicyCategory::TrueEmergency);

        let early = input(ExitReasonKind::ScoreDrop, 10);
        let outcome = policy.evaluate(&early);
        assert!(!outcome.allowed);
        assert_eq!(outcome.category, PolicyCategory::MinHold);

        let mut amortizing = input(ExitReasonKind::ScoreDrop, 120);
        amortizing.current_fees_per_hour = 5.0;
        assert_eq!(policy.evaluate(&amortizing).category, PolicyCategory::FeeAmortization);

        let passed = policy.evaluate(&input(ExitReasonKind::ScoreDrop, 120));
        assert!(passed.allowed);
        assert_eq!(passed.category, PolicyCategory::Passed);
    }
}
