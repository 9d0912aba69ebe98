// =============================================================================
// Exit Gate Pipeline: priority-ordered allow / deny for one exit signal
// =============================================================================
//
// Evaluated fresh every cycle for every open position. First match wins:
//
//    1. True emergency reason             -> allow  TRUE_EMERGENCY
//    2. TVL / liquidity collapse          -> allow  TRUE_EMERGENCY
//    3. Volume collapse                   -> allow  TRUE_EMERGENCY
//    4. Emergency override                -> allow  EMERGENCY_OVERRIDE
//    5. Rotation to a better pool         -> allow  ROTATION
//    6. Health exit with min hold met     -> allow  HARMONIC
//    7. Non-actionable noise              -> deny   SUPPRESSED_NOISE
//    8. Bootstrap probe period            -> deny   SUPPRESSED_BOOTSTRAP
//    9. Min hold not met                  -> deny   SUPPRESSED_MIN_HOLD
//   10. Cost amortization                 -> informational only
//   11. Reason not a curated valid exit   -> deny   BLOCKED
//   12. Otherwise                         -> allow  ALLOWED / COST_AMORTIZED
//
// Every repeating deny path registers with the cooldown tracker. The gate
// itself never logs: callers log from the returned decision.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::amortization_decay::{AmortizationDecayGate, DecayInput};
use crate::cooldown::CooldownTracker;
use crate::exit::decision::{DecisionDetails, ExitGateCategory, ExitGateDecision};
use crate::hold_policy::HoldPolicy;
use crate::reason::{CooldownBucket, ExitReason, ExitReasonKind};
use crate::runtime_config::ExitGateParams;
use crate::types::{minutes_between, EntityClass};

/// A ranked alternative pool offered by the discovery collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationCandidate {
    pub pool_address: String,
    /// Relative score improvement over the current pool (0.25 = 25 % better).
    pub score_improvement: f64,
}

/// Everything the pipeline consumes for one position in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitGateInput {
    pub entity_id: String,
    #[serde(default)]
    pub entity_class: EntityClass,
    pub reason: ExitReason,
    pub entry_time_ms: i64,
    pub notional_usd: f64,
    /// Fees + slippage paid to open; the base amortization target.
    #[serde(default)]
    pub entry_cost_usd: f64,
    #[serde(default)]
    pub fees_accrued_usd: f64,

    #[serde(default)]
    pub current_tvl_usd: Option<f64>,
    #[serde(default)]
    pub entry_tvl_usd: Option<f64>,
    #[serde(default)]
    pub current_volume_usd: Option<f64>,
    #[serde(default)]
    pub entry_volume_usd: Option<f64>,

    #[serde(default)]
    pub fees_per_hour: f64,
    #[serde(default)]
    pub expected_fees_per_hour: f64,
    /// Minutes since the last swap / fee event in the pool.
    #[serde(default)]
    pub zero_activity_minutes: f64,
    #[serde(default)]
    pub health_score: Option<f64>,
    #[serde(default)]
    pub bad_sample_count: u32,
    /// Forced / health-based exit signal raised by the health monitor.
    #[serde(default)]
    pub forced_exit_signal: bool,
    #[serde(default)]
    pub velocity_ratio: Option<f64>,
    #[serde(default)]
    pub entropy_ratio: Option<f64>,
    #[serde(default)]
    pub mtm_drift_pct: Option<f64>,

    #[serde(default)]
    pub volatility_collapsed: bool,
    #[serde(default)]
    pub best_alternative: Option<RotationCandidate>,
    /// Entity is still inside its initial probe period.
    #[serde(default)]
    pub probe_active: bool,
}

impl ExitGateInput {
    /// Minimal input: everything optional left unset.
    pub fn new(
        entity_id: impl Into<String>,
        reason: impl Into<String>,
        entry_time_ms: i64,
        notional_usd: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_class: EntityClass::Unclassified,
            reason: ExitReason::parse(reason),
            entry_time_ms,
            notional_usd,
            entry_cost_usd: 0.0,
            fees_accrued_usd: 0.0,
            current_tvl_usd: None,
            entry_tvl_usd: None,
            current_volume_usd: None,
            entry_volume_usd: None,
            fees_per_hour: 0.0,
            expected_fees_per_hour: 0.0,
            zero_activity_minutes: 0.0,
            health_score: None,
            bad_sample_count: 0,
            forced_exit_signal: false,
            velocity_ratio: None,
            entropy_ratio: None,
            mtm_drift_pct: None,
            volatility_collapsed: false,
            best_alternative: None,
            probe_active: false,
        }
    }

    fn decay_input(&self, now_ms: i64) -> DecayInput {
        DecayInput {
            base_cost_target_usd: self.entry_cost_usd,
            notional_usd: self.notional_usd,
            fees_accrued_usd: self.fees_accrued_usd,
            hold_time_ms: (now_ms - self.entry_time_ms).max(0),
            forced_exit_signal: self.forced_exit_signal,
            health_score: self.health_score,
            bad_sample_count: self.bad_sample_count,
            velocity_ratio: self.velocity_ratio,
            entropy_ratio: self.entropy_ratio,
            mtm_drift_pct: self.mtm_drift_pct,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitGate {
    policy: HoldPolicy,
    decay: AmortizationDecayGate,
    params: ExitGateParams,
}

impl ExitGate {
    pub fn new(policy: HoldPolicy, decay: AmortizationDecayGate, params: ExitGateParams) -> Self {
        Self {
            policy,
            decay,
            params,
        }
    }

    pub fn policy(&self) -> &HoldPolicy {
        &self.policy
    }

    pub fn decay(&self) -> &AmortizationDecayGate {
        &self.decay
    }

    /// Run the pipeline. Deny paths record a suppression in `cooldowns`.
    pub fn evaluate(
        &self,
        input: &ExitGateInput,
        cooldowns: &CooldownTracker,
        now_ms: i64,
    ) -> ExitGateDecision {
        let kind = input.reason.kind;
        let hold_minutes = minutes_between(input.entry_time_ms, now_ms);
        let min_hold_minutes = self.policy.min_hold_minutes(input.entity_class);

        let mut details = DecisionDetails {
            hold_time_minutes: hold_minutes,
            min_hold_minutes,
            tier: input.entity_class,
            entry_cost_usd: input.entry_cost_usd,
            fees_accrued_usd: input.fees_accrued_usd,
            ..DecisionDetails::default()
        };

        let allow = |category, reason: String, details| {
            ExitGateDecision::allow(
                &input.entity_id,
                kind,
                &input.reason.raw,
                category,
                reason,
                details,
                now_ms,
            )
        };

        // ── 1. True emergency ───────────────────────────────────────────
        if kind.is_true_emergency() {
            details.flags_used.push(format!("emergency={kind}"));
            return allow(
                ExitGateCategory::TrueEmergency,
                format!("true emergency: {kind}"),
                details,
            );
        }

        // ── 2. TVL collapse ─────────────────────────────────────────────
        if let Some(current_tvl) = input.current_tvl_usd {
            let tvl = self
                .policy
                .check_tvl_collapse(current_tvl, input.entry_tvl_usd.unwrap_or(0.0));
            if tvl.is_collapse {
                details.flags_used.push(format!("tvl_drop={:.3}", tvl.drop_pct));
                return allow(
                    ExitGateCategory::TrueEmergency,
                    format!("liquidity collapse: {}", tvl.reason),
                    details,
                );
            }
        }

        // ── 3. Volume collapse ──────────────────────────────────────────
        if let (Some(current), Some(entry)) = (input.current_volume_usd, input.entry_volume_usd) {
            if entry > 0.0 {
                let drop = ((entry - current) / entry).max(0.0);
                if drop > self.params.volume_collapse_drop_pct {
                    details.flags_used.push(format!("volume_drop={drop:.3}"));
                    return allow(
                        ExitGateCategory::TrueEmergency,
                        format!(
                            "volume collapse: {:.1}% drop (limit {:.1}%)",
                            drop * 100.0,
                            self.params.volume_collapse_drop_pct * 100.0
                        ),
                        details,
                    );
                }
            }
        }

        // ── 4. Emergency override ───────────────────────────────────────
        if let Some(flags) = self.emergency_override(input, hold_minutes) {
            details.flags_used.extend(flags);
            return allow(
                ExitGateCategory::EmergencyOverride,
                format!(
                    "emergency override after {:.1}m: dead pool, health {:.1}",
                    hold_minutes,
                    input.health_score.unwrap_or_default()
                ),
                details,
            );
        }

        // ── 5. Rotation ─────────────────────────────────────────────────
        if let Some(candidate) = self.rotation_target(input, hold_minutes) {
            details
                .flags_used
                .push(format!("rotation_improvement={:.3}", candidate.score_improvement));
            return allow(
                ExitGateCategory::Rotation,
                format!(
                    "rotating to {} ({:.0}% better)",
                    candidate.pool_address,
                    candidate.score_improvement * 100.0
                ),
                details,
            );
        }

        // ── 6. Health-triggered exit ────────────────────────────────────
        let health_exit = kind.is_health_triggered();
        if health_exit && hold_minutes >= min_hold_minutes {
            details.flags_used.push("health_exit".to_string());
            return allow(
                ExitGateCategory::Harmonic,
                format!(
                    "health exit after min hold ({:.1}m >= {:.0}m)",
                    hold_minutes, min_hold_minutes
                ),
                details,
            );
        }

        // ── 7. Noise suppression ────────────────────────────────────────
        if kind.is_not_emergency() && !health_exit {
            return self.suppress(
                input,
                cooldowns,
                ExitGateCategory::SuppressedNoise,
                kind.cooldown_bucket(),
                format!("non-actionable signal {kind} suppressed"),
                details,
                now_ms,
            );
        }

        // ── 8. Bootstrap suppression ────────────────────────────────────
        if input.probe_active {
            return self.suppress(
                input,
                cooldowns,
                ExitGateCategory::SuppressedBootstrap,
                CooldownBucket::Bootstrap,
                "entity in bootstrap probe period".to_string(),
                details,
                now_ms,
            );
        }

        // ── 9. Minimum hold ─────────────────────────────────────────────
        let hold = self
            .policy
            .check_min_hold(input.entry_time_ms, now_ms, kind, input.entity_class);
        if !hold.allowed {
            return self.suppress(
                input,
                cooldowns,
                ExitGateCategory::SuppressedMinHold,
                CooldownBucket::MinHoldNotMet,
                hold.reason,
                details,
                now_ms,
            );
        }

        // ── 10. Cost amortization (informational) ───────────────────────
        let cost = self.decay.compute(&input.decay_input(now_ms));
        details.effective_cost_target_usd = Some(cost.effective_cost_target_usd);
        details.cost_verdict = Some(cost.reason);

        // ── 11. Final validity ──────────────────────────────────────────
        if !kind.is_valid_exit() && !health_exit {
            return self.suppress(
                input,
                cooldowns,
                ExitGateCategory::Blocked,
                CooldownBucket::Other(format!("BLOCKED_{}", kind.label())),
                format!("reason '{}' is not a valid exit", input.reason.raw),
                details,
                now_ms,
            );
        }

        // ── 12. Allowed ─────────────────────────────────────────────────
        let category = if kind == ExitReasonKind::CostAmortized {
            ExitGateCategory::CostAmortized
        } else {
            ExitGateCategory::Allowed
        };
        allow(category, format!("exit allowed: {kind}"), details)
    }

    /// Dead pool with a failing health score, after a short minimum hold.
    /// Returns the flags that fired, or `None` if the override does not apply.
    fn emergency_override(&self, input: &ExitGateInput, hold_minutes: f64) -> Option<Vec<String>> {
        let p = &self.params;
        if hold_minutes < p.override_min_hold_minutes as f64
            || input.expected_fees_per_hour <= 0.0
        {
            return None;
        }
        let velocity_ratio = input.fees_per_hour / input.expected_fees_per_hour;
        let health = input.health_score?;

        let fired = velocity_ratio < p.override_velocity_ratio
            && input.zero_activity_minutes >= p.override_zero_activity_minutes as f64
            && health < p.override_health_floor;
        fired.then(|| {
            vec![
                format!("fee_velocity_ratio={velocity_ratio:.3}"),
                format!("zero_activity_minutes={:.0}", input.zero_activity_minutes),
                format!("health={health:.1}"),
            ]
        })
    }

    /// Negligible yield, collapsed volatility and a clearly better pool.
    fn rotation_target<'a>(
        &self,
        input: &'a ExitGateInput,
        hold_minutes: f64,
    ) -> Option<&'a RotationCandidate> {
        let p = &self.params;
        if hold_minutes < p.rotation_min_hold_minutes as f64 || !input.volatility_collapsed {
            return None;
        }
        let fee_yield = if input.notional_usd > 0.0 {
            input.fees_per_hour / input.notional_usd
        } else {
            0.0
        };
        if fee_yield > p.rotation_max_fee_yield_pct_per_hour {
            return None;
        }
        input
            .best_alternative
            .as_ref()
            .filter(|c| c.score_improvement >= p.rotation_min_score_improvement)
    }

    #[allow(clippy::too_many_arguments)]
    fn suppress(
        &self,
        input: &ExitGateInput,
        cooldowns: &CooldownTracker,
        category: ExitGateCategory,
        bucket: CooldownBucket,
        reason: String,
        mut details: DecisionDetails,
        now_ms: i64,
    ) -> ExitGateDecision {
        let status = cooldowns.record(&input.entity_id, &bucket, &reason, now_ms);
        details.cooldown = Some(status);
        ExitGateDecision::deny(
            &input.entity_id,
            input.reason.kind,
            &input.reason.raw,
            category,
            reason,
            details,
            now_ms,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
