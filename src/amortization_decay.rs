// =============================================================================
// Amortization Decay Gate: time-decayed cost target under sustained weakness
// =============================================================================
//
// A position must accrue fees worth its entry cost before a "cost not
// amortized" block lifts. When the position is demonstrably weak, that target
// relaxes with a half-life so capital is never trapped behind a number it can
// no longer reach:
//
//   floor      = max(min_floor_usd, floor_bps * notional)
//   factor     = 1.0                                    (young or not weak)
//              = max(min_pct, 0.5 ^ ((hold - min_age) / half_life))
//   effective  = max(floor, base * factor)
//   allow_exit = fees_accrued >= effective
//
// Weakness needs a forced/health exit signal, a health condition (score at or
// below threshold, or enough consecutive bad samples) and at least one live
// telemetry signal past its own threshold. With no live telemetry at all the
// gate still passes but decays on the slow half-life.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_config::DecayParams;
use crate::types::MS_PER_MINUTE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecayInput {
    pub base_cost_target_usd: f64,
    pub notional_usd: f64,
    pub fees_accrued_usd: f64,
    pub hold_time_ms: i64,
    /// A forced / health-based exit signal is already raised.
    pub forced_exit_signal: bool,
    #[serde(default)]
    pub health_score: Option<f64>,
    #[serde(default)]
    pub bad_sample_count: u32,
    /// current / entry fee velocity.
    #[serde(default)]
    pub velocity_ratio: Option<f64>,
    /// current / entry price entropy.
    #[serde(default)]
    pub entropy_ratio: Option<f64>,
    /// Mark-to-market drift since entry, as a fraction.
    #[serde(default)]
    pub mtm_drift_pct: Option<f64>,
}

/// Outcome of the weakness evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Weakness {
    NotWeak,
    /// Live telemetry confirms the degradation.
    Confirmed,
    /// Health condition holds but no live telemetry is available.
    Unconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecayReason {
    /// Fees clear the undecayed base target.
    AmortizedExit,
    /// Fees clear only the decayed target.
    DecayOverride,
    CostNotAmortized,
}

impl std::fmt::Display for DecayReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AmortizedExit => write!(f, "AMORTIZED_EXIT"),
            Self::DecayOverride => write!(f, "DECAY_OVERRIDE"),
            Self::CostNotAmortized => write!(f, "COST_NOT_AMORTIZED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayDebug {
    pub enabled: bool,
    pub floor_usd: f64,
    pub decay_factor: f64,
    pub half_life_ms: i64,
    pub weakness: Weakness,
    pub degraded_signals: Vec<String>,
    pub decay_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayResult {
    pub allow_exit: bool,
    pub effective_cost_target_usd: f64,
    pub reason: DecayReason,
    pub debug: DecayDebug,
}

#[derive(Debug, Clone)]
pub struct AmortizationDecayGate {
    params: DecayParams,
}

impl AmortizationDecayGate {
    pub fn new(params: DecayParams) -> Self {
        Self { params }
    }

    pub fn floor_usd(&self, notional_usd: f64) -> f64 {
        self.params
            .min_floor_usd
            .max(self.params.floor_bps / 10_000.0 * notional_usd.max(0.0))
    }

    /// Classify the weakness condition and list the degraded live signals.
    pub fn weakness(&self, input: &DecayInput) -> (Weakness, Vec<String>) {
        let p = &self.params;
        if !input.forced_exit_signal {
            return (Weakness::NotWeak, Vec::new());
        }

        let health_weak = input
            .health_score
            .map(|h| h <= p.health_threshold)
            .unwrap_or(false)
            || input.bad_sample_count >= p.bad_samples_required;
        if !health_weak {
            return (Weakness::NotWeak, Vec::new());
        }

        let mut degraded = Vec::new();
        if let Some(v) = input.velocity_ratio {
            if v <= p.velocity_ratio_threshold {
                degraded.push(format!("velocity_ratio={v:.3}"));
            }
        }
        if let Some(e) = input.entropy_ratio {
            if e <= p.entropy_ratio_threshold {
                degraded.push(format!("entropy_ratio={e:.3}"));
            }
        }
        if let Some(d) = input.mtm_drift_pct {
            if d <= p.mtm_drift_threshold_pct {
                degraded.push(format!("mtm_drift={:.2}%", d * 100.0));
            }
        }

        let any_live = input.velocity_ratio.is_some()
            || input.entropy_ratio.is_some()
            || input.mtm_drift_pct.is_some();

        if !degraded.is_empty() {
            (Weakness::Confirmed, degraded)
        } else if !any_live {
            (Weakness::Unconfirmed, degraded)
        } else {
            (Weakness::NotWeak, degraded)
        }
    }

    pub fn compute(&self, input: &DecayInput) -> DecayResult {
        let p = &self.params;
        let base = input.base_cost_target_usd.max(0.0);
        let fees = input.fees_accrued_usd;
        let floor = self.floor_usd(input.notional_usd);
        let min_age_ms = p.min_decay_age_minutes as i64 * MS_PER_MINUTE;

        if !p.enabled {
            let allow = fees >= base;
            return DecayResult {
                allow_exit: allow,
                effective_cost_target_usd: base,
                reason: if allow {
                    DecayReason::AmortizedExit
                } else {
                    DecayReason::CostNotAmortized
                },
                debug: DecayDebug {
                    enabled: false,
                    floor_usd: floor,
                    decay_factor: 1.0,
                    half_life_ms: 0,
                    weakness: Weakness::NotWeak,
                    degraded_signals: Vec::new(),
                    decay_active: false,
                },
            };
        }

        let (weakness, degraded) = self.weakness(input);
        let half_life_minutes = match weakness {
            Weakness::Unconfirmed => p.slow_half_life_minutes,
            _ => p.half_life_minutes,
        };
        let half_life_ms = half_life_minutes as i64 * MS_PER_MINUTE;

        let decay_active = input.hold_time_ms >= min_age_ms && weakness != Weakness::NotWeak;
        let decay_factor = if decay_active && half_life_ms > 0 {
            let t = (input.hold_time_ms - min_age_ms) as f64;
            0.5_f64
                .powf(t / half_life_ms as f64)
                .max(p.min_base_target_pct)
                .min(1.0)
        } else {
            1.0
        };

        let effective = floor.max(base * decay_factor);
        let allow_exit = fees >= effective;
        let reason = if fees >= base.max(floor) {
            DecayReason::AmortizedExit
        } else if allow_exit {
            DecayReason::DecayOverride
        } else {
            DecayReason::CostNotAmortized
        };

        DecayResult {
            allow_exit,
            effective_cost_target_usd: effective,
            reason,
            debug: DecayDebug {
                enabled: true,
                floor_usd: floor,
                decay_factor,
                half_life_ms,
                weakness,
                degraded_signals: degraded,
                decay_active,
            },
        }
    }
}

impl Default for AmortizationDecayGate {
    fn default() -> Self {
        Self::new(DecayParams::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn weak_input(held_minutes: i64) -> DecayInput {
        DecayInput {
            base_cost_target_usd: 2.0,
            notional_usd: 1_000.0,
            fees_accrued_usd: 0.0,
            hold_time_ms: held_minutes * MS_PER_MINUTE,
            forced_exit_signal: true,
            health_score: Some(30.0),
            bad_sample_count: 0,
            velocity_ratio: Some(0.3),
            entropy_ratio: None,
            mtm_drift_pct: None,
        }
    }

    #[test]
    fn one_half_life_halves_the_target() {
        let gate = AmortizationDecayGate::default();
        let result = gate.compute(&weak_input(180));
        assert!((result.debug.decay_factor - 0.5).abs() < 1e-12);
        // floor = max(0.05, 5bps * 1000 = 0.5) = 0.5
        assert!((result.effective_cost_target_usd - 1.0).abs() < 1e-12);
        assert_eq!(result.debug.weakness, Weakness::Confirmed);
    }

    #[test]
    fn no_decay_before_min_age() {
        let gate = AmortizationDecayGate::default();
        for minutes in [0, 30, 59] {
            let result = gate.compute(&weak_input(minutes));
            assert_eq!(result.debug.decay_factor, 1.0, "decayed at {minutes}m");
            assert!(!result.debug.decay_active);
            assert_eq!(result.effective_cost_target_usd, 2.0);
        }
    }

    #[test]
    fn decay_is_bounded_by_min_pct_and_floor() {
        let gate = AmortizationDecayGate::default();

        // Small notional: floor = max(0.05, 5bps * 100) = 0.05, so the
        // decayed target is held at 15 % of base.
        let mut small = weak_input(60 + 1_000);
        small.notional_usd = 100.0;
        let result = gate.compute(&small);
        assert!((result.debug.floor_usd - 0.05).abs() < 1e-12);
        assert!((result.debug.decay_factor - 0.15).abs() < 1e-12);
        assert!((result.effective_cost_target_usd - 0.30).abs() < 1e-12);

        // Large notional: the bps floor dominates the decayed target.
        let mut big = weak_input(60 * 24 * 30);
        big.notional_usd = 10_000.0;
        let result = gate.compute(&big);
        assert!((result.effective_cost_target_usd - 5.0).abs() < 1e-12);
    }

    #[test]
    fn healthy_position_never_decays() {
        let gate = AmortizationDecayGate::default();
        let mut input = weak_input(600);
        input.health_score = Some(85.0);
        let result = gate.compute(&input);
        assert_eq!(result.debug.weakness, Weakness::NotWeak);
        assert_eq!(result.debug.decay_factor, 1.0);

        let mut no_signal = weak_input(600);
        no_signal.forced_exit_signal = false;
        assert_eq!(gate.compute(&no_signal).debug.decay_factor, 1.0);
    }

    #[test]
    fn live_telemetry_that_looks_fine_blocks_decay() {
        let gate = AmortizationDecayGate::default();
        let mut input = weak_input(600);
        input.velocity_ratio = Some(0.95);
        assert_eq!(gate.weakness(&input).0, Weakness::NotWeak);
    }

    #[test]
    fn missing_telemetry_decays_slower() {
        let gate = AmortizationDecayGate::default();
        let mut blind = weak_input(180);
        blind.velocity_ratio = None;
        blind.health_score = None;
        blind.bad_sample_count = 3;

        let slow = gate.compute(&blind);
        let fast = gate.compute(&weak_input(180));
        assert_eq!(slow.debug.weakness, Weakness::Unconfirmed);
        assert!(slow.debug.decay_factor > fast.debug.decay_factor);
        assert!((slow.debug.decay_factor - 0.5_f64.powf(0.5)).abs() < 1e-12);
    }

    #[test]
    fn reason_tags_distinguish_override_from_normal() {
        let gate = AmortizationDecayGate::default();

        let mut input = weak_input(180);
        input.fees_accrued_usd = 1.2;
        let result = gate.compute(&input);
        assert!(result.allow_exit);
        assert_eq!(result.reason, DecayReason::DecayOverride);

        input.fees_accrued_usd = 2.5;
        assert_eq!(gate.compute(&input).reason, DecayReason::AmortizedExit);

        input.fees_accrued_usd = 0.4;
        let blocked = gate.compute(&input);
        assert!(!blocked.allow_exit);
        assert_eq!(blocked.reason, DecayReason::CostNotAmortized);
    }

    #[test]
    fn kill_switch_restores_base_target() {
        let mut params = DecayParams::default();
        params.enabled = false;
        let gate = AmortizationDecayGate::new(params);

        let mut input = weak_input(60 * 24);
        input.fees_accrued_usd = 1.9;
        let result = gate.compute(&input);
        assert!(!result.allow_exit);
        assert_eq!(result.effective_cost_target_usd, 2.0);
        assert!(!result.debug.enabled);
    }
}
