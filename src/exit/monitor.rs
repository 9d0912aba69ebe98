// =============================================================================
// Exit Monitor: one decision cycle across every open position
// =============================================================================
//
// For each position in the snapshot, in order:
//   1. Hydrate fee fields from the fee-state store (if the trade is tracked).
//   2. Evaluate the exit gate and log the decision (cooldown-throttled).
//   3. On allow with an exit fill: compute the canonical PnL exactly once,
//      then close the allocation and fee state from that record.
//
// After the position pass, the portfolio consistency check runs once against
// a stable snapshot of the positions still open, and expired cooldowns are
// pruned.
//
// The monitor is driven by the caller's scan loop:
//
//   let report = engine.run_cycle(&snapshot);
//
// =============================================================================

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capital::CapitalState;
use crate::engine::DecisionEngine;
use crate::error::CoreError;
use crate::exit::decision::ExitGateDecision;
use crate::exit::gate::ExitGateInput;
use crate::pnl_ledger::{CanonicalPnlRecord, CapitalAdjustment, DbFields, PnlInput};
use crate::reconcile::PortfolioConsistencyResult;
use crate::types::PositionNotional;

// ---------------------------------------------------------------------------
// Cycle input
// ---------------------------------------------------------------------------

/// Execution figures for an exit that has been (or will be) filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitFill {
    pub exit_notional_usd: f64,
    /// Entry notional for trades the capital ledger does not track. Ignored
    /// when an allocation exists.
    #[serde(default)]
    pub entry_notional_usd: Option<f64>,
    #[serde(default)]
    pub entry_fees_usd: f64,
    #[serde(default)]
    pub exit_fees_usd: f64,
    #[serde(default)]
    pub entry_slippage_usd: f64,
    #[serde(default)]
    pub exit_slippage_usd: f64,
    #[serde(default)]
    pub observed_net_pnl_usd: Option<f64>,
}

/// One open position as seen by the caller this cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CyclePosition {
    pub trade_id: String,
    pub address: String,
    #[serde(default)]
    pub name: String,
    pub signal: ExitGateInput,
    /// Present when the caller can quote or has executed the exit.
    #[serde(default)]
    pub fill: Option<ExitFill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub now_ms: i64,
    #[serde(default)]
    pub positions: Vec<CyclePosition>,
    /// Marked-to-market position list. Defaults to the positions left open
    /// after this cycle at their signal notional.
    #[serde(default)]
    pub live_positions: Option<Vec<PositionNotional>>,
    /// Overrides the capital ledger's deployed figure.
    #[serde(default)]
    pub reported_deployed_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub trade_id: String,
    pub entity_id: String,
    pub record: CanonicalPnlRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_fields: Option<DbFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<CapitalAdjustment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleError {
    pub trade_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub now_ms: i64,
    pub decisions: Vec<ExitGateDecision>,
    pub closed: Vec<ClosedTrade>,
    pub errors: Vec<CycleError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub portfolio: Option<PortfolioConsistencyResult>,
    pub capital: CapitalState,
    pub pruned_cooldowns: usize,
}

impl CycleReport {
    pub fn allowed_count(&self) -> usize {
        self.decisions.iter().filter(|d| d.allowed).count()
    }

    pub fn denied_count(&self) -> usize {
        self.decisions.len() - self.allowed_count()
    }
}

// ---------------------------------------------------------------------------
// Decision logging
// ---------------------------------------------------------------------------

/// Emit the log line for a decision, unless cooldown throttling holds it back.
pub fn log_decision(decision: &ExitGateDecision) {
    if !decision.should_log() {
        debug!(
            entity = %decision.entity_id,
            category = %decision.category,
            suppressions = decision.details.cooldown.map(|c| c.suppression_count).unwrap_or(0),
            "exit suppression (throttled)"
        );
        return;
    }

    let d = &decision.details;
    if decision.allowed {
        info!(
            entity = %decision.entity_id,
            category = %decision.category,
            reason_kind = %decision.reason_kind,
            raw_reason = %decision.raw_reason,
            hold_minutes = format!("{:.1}", d.hold_time_minutes),
            min_hold_minutes = d.min_hold_minutes,
            tier = %d.tier,
            entry_cost_usd = d.entry_cost_usd,
            fees_accrued_usd = d.fees_accrued_usd,
            cost_target_usd = d.effective_cost_target_usd.unwrap_or(d.entry_cost_usd),
            flags = ?d.flags_used,
            reason = %decision.reason,
            "EXIT ALLOWED"
        );
    } else {
        let (suppressions, remaining_ms) = d
            .cooldown
            .map(|c| (c.suppression_count, c.remaining_ms))
            .unwrap_or((0, 0));
        info!(
            entity = %decision.entity_id,
            category = %decision.category,
            reason_kind = %decision.reason_kind,
            raw_reason = %decision.raw_reason,
            hold_minutes = format!("{:.1}", d.hold_time_minutes),
            min_hold_minutes = d.min_hold_minutes,
            tier = %d.tier,
            suppressions,
            cooldown_remaining_ms = remaining_ms,
            reason = %decision.reason,
            "exit denied"
        );
    }
}

// ---------------------------------------------------------------------------
// Cycle driver
// ---------------------------------------------------------------------------

/// Run one full decision cycle.
///
/// Strict-mode failures are collected into `errors`; the remaining positions
/// are still evaluated.
pub fn run_cycle(engine: &DecisionEngine, snapshot: &CycleSnapshot) -> CycleReport {
    let now_ms = snapshot.now_ms;
    let mut decisions = Vec::with_capacity(snapshot.positions.len());
    let mut closed = Vec::new();
    let mut errors = Vec::new();
    let mut priced: HashSet<String> = HashSet::new();

    debug!(count = snapshot.positions.len(), now_ms, "decision cycle started");

    for position in &snapshot.positions {
        let mut signal = position.signal.clone();
        engine.hydrate_from_fee_state(&position.trade_id, &mut signal, now_ms);

        let decision = engine.evaluate_exit_gate(&signal, now_ms);
        let allowed = decision.allowed;
        decisions.push(decision);

        if !allowed {
            continue;
        }
        let Some(fill) = &position.fill else {
            continue;
        };

        // The ledger is called at most once per trade.
        if !priced.insert(position.trade_id.clone())
            || engine.pnl_ledger().exists(&position.trade_id)
        {
            warn!(
                trade_id = %position.trade_id,
                "canonical PnL already computed, duplicate exit skipped"
            );
            continue;
        }

        // The signal notional is marked-to-market and never stands in for entry.
        let entry_notional_usd = match engine
            .capital()
            .allocation(&position.trade_id)
            .map(|a| a.notional_usd)
            .or(fill.entry_notional_usd)
        {
            Some(n) => n,
            None => {
                warn!(
                    trade_id = %position.trade_id,
                    entity = %signal.entity_id,
                    "no entry notional for allowed exit, trade not priced"
                );
                errors.push(CycleError {
                    trade_id: Some(position.trade_id.clone()),
                    message: CoreError::UnknownTrade(position.trade_id.clone()).to_string(),
                });
                continue;
            }
        };

        let input = PnlInput {
            trade_id: position.trade_id.clone(),
            entity_id: signal.entity_id.clone(),
            entry_notional_usd,
            exit_notional_usd: fill.exit_notional_usd,
            entry_fees_usd: fill.entry_fees_usd,
            exit_fees_usd: fill.exit_fees_usd,
            entry_slippage_usd: fill.entry_slippage_usd,
            exit_slippage_usd: fill.exit_slippage_usd,
            observed_net_pnl_usd: fill.observed_net_pnl_usd,
        };

        let record = match engine.compute_canonical_pnl(&input, now_ms) {
            Ok(r) => r,
            Err(e) => {
                errors.push(CycleError {
                    trade_id: Some(position.trade_id.clone()),
                    message: e.to_string(),
                });
                continue;
            }
        };

        let adjustment = if engine.capital().is_open(&position.trade_id) {
            match engine.close_position(&position.trade_id, &signal.entity_id) {
                Ok(adj) => Some(adj),
                Err(e) => {
                    errors.push(CycleError {
                        trade_id: Some(position.trade_id.clone()),
                        message: e.to_string(),
                    });
                    None
                }
            }
        } else {
            None
        };

        closed.push(ClosedTrade {
            trade_id: position.trade_id.clone(),
            entity_id: signal.entity_id.clone(),
            db_fields: engine.get_db_fields(&position.trade_id),
            record,
            adjustment,
        });
    }

    // Stable snapshot of what is still open after this cycle's closes.
    let closed_ids: HashSet<&str> = closed.iter().map(|c| c.trade_id.as_str()).collect();
    let live: Vec<PositionNotional> = match &snapshot.live_positions {
        Some(list) => list.clone(),
        None => snapshot
            .positions
            .iter()
            .filter(|p| !closed_ids.contains(p.trade_id.as_str()))
            .map(|p| PositionNotional::new(&p.address, &p.name, p.signal.notional_usd))
            .collect(),
    };
    let reported = snapshot
        .reported_deployed_usd
        .unwrap_or_else(|| engine.capital().deployed_usd());

    // In strict mode the failed check is still in the checker's history.
    let portfolio = match engine.check_portfolio_consistency(&live, reported, now_ms) {
        Ok(r) => Some(r),
        Err(e) => {
            errors.push(CycleError {
                trade_id: None,
                message: e.to_string(),
            });
            None
        }
    };

    let pruned_cooldowns = engine.cooldowns().prune_expired(now_ms);

    let report = CycleReport {
        now_ms,
        decisions,
        closed,
        errors,
        portfolio,
        capital: engine.capital().state(),
        pruned_cooldowns,
    };

    info!(
        evaluated = report.decisions.len(),
        allowed = report.allowed_count(),
        denied = report.denied_count(),
        closed = report.closed.len(),
        errors = report.errors.len(),
        consistent = report.portfolio.as_ref().map(|p| p.consistent()).unwrap_or(false),
        deployed_usd = report.capital.deployed_usd,
        "decision cycle complete"
    );

    report
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cooldown::CooldownStatus;
    use crate::exit::decision::{DecisionDetails, ExitGateCategory};
    use crate::reason::ExitReasonKind;
    use crate::runtime_config::RuntimeConfig;
    use crate::types::MS_PER_MINUTE;

    fn denied(should_log: bool) -> ExitGateDecision {
        let details = DecisionDetails {
            cooldown: Some(CooldownStatus {
                on_cooldown: true,
                should_log,
                remaining_ms: 1_000,
                suppression_count: 2,
            }),
            ..DecisionDetails::default()
        };
        ExitGateDecision::deny(
            "pool-1",
            ExitReasonKind::ScoreDrop,
            "score drop",
            ExitGateCategory::SuppressedNoise,
            "noise",
            details,
            0,
        )
    }

    #[test]
    fn log_decision_handles_throttled_and_open_windows() {
        // Smoke test: both branches run without a subscriber installed.
        log_decision(&denied(false));
        log_decision(&denied(true));
    }

    fn position(
        trade_id: &str,
        reason: &str,
        entry_ms: i64,
        fill: Option<ExitFill>,
    ) -> CyclePosition {
        CyclePosition {
            trade_id: trade_id.to_string(),
            address: format!("addr-{trade_id}"),
            name: format!("pool {trade_id}"),
            signal: ExitGateInput::new(format!("pool-{trade_id}"), reason, entry_ms, 1_000.0),
            fill,
        }
    }

    fn fill() -> ExitFill {
        ExitFill {
            exit_notional_usd: 1_050.0,
            entry_notional_usd: None,
            entry_fees_usd: 2.0,
            exit_fees_usd: 2.0,
            entry_slippage_usd: 1.0,
            exit_slippage_usd: 1.0,
            observed_net_pnl_usd: None,
        }
    }

    #[test]
    fn denied_exit_never_reaches_the_ledger() {
        let engine = DecisionEngine::new(RuntimeConfig::default(), 10_000.0);
        engine.open_position("t1", "pool-t1", "addr-t1", "pool t1", 1_000.0, 0.0, 0);

        let now = 5 * MS_PER_MINUTE;
        let report = run_cycle(
            &engine,
            &CycleSnapshot {
                now_ms: now,
                positions: vec![position("t1", "take profit", 0, Some(fill()))],
                live_positions: None,
                reported_deployed_usd: None,
            },
        );

        assert_eq!(report.denied_count(), 1);
        assert!(report.closed.is_empty());
        assert!(!engine.pnl_ledger().exists("t1"));
        assert!(report.portfolio.unwrap().consistent());
    }

    #[test]
    fn allowed_exit_is_priced_once_and_closed() {
        let engine = DecisionEngine::new(RuntimeConfig::default(), 10_000.0);
        engine.open_position("t1", "pool-t1", "addr-t1", "pool t1", 1_000.0, 6.0, 0);

        let now = 120 * MS_PER_MINUTE;
        let snapshot = CycleSnapshot {
            now_ms: now,
            positions: vec![
                position("t1", "take profit", 0, Some(fill())),
                position("t1", "take profit", 0, Some(fill())),
            ],
            live_positions: None,
            reported_deployed_usd: None,
        };
        let report = run_cycle(&engine, &snapshot);

        assert_eq!(report.allowed_count(), 2);
        assert_eq!(report.closed.len(), 1, "second exit of the same trade is skipped");
        let closed = &report.closed[0];
        assert_eq!(closed.record.net_pnl_usd, 44.0);
        assert!(closed.adjustment.as_ref().unwrap().applied);
        assert!((report.capital.capital_usd - 10_044.0).abs() < 1e-9);
        assert_eq!(report.capital.deployed_usd, 0.0);
        assert!(report.errors.is_empty());
    }

    fn untracked(fill: ExitFill) -> CycleSnapshot {
        // Entered at $1,000, now marked at $1,200.
        let mut p = position("u1", "take profit", 0, Some(fill));
        p.signal.notional_usd = 1_200.0;
        CycleSnapshot {
            now_ms: 120 * MS_PER_MINUTE,
            positions: vec![p],
            live_positions: None,
            reported_deployed_usd: None,
        }
    }

    #[test]
    fn untracked_exit_without_entry_notional_is_not_priced() {
        let engine = DecisionEngine::new(RuntimeConfig::default(), 10_000.0);
        let mut f = fill();
        f.exit_notional_usd = 1_200.0;

        let report = run_cycle(&engine, &untracked(f));

        assert_eq!(report.allowed_count(), 1);
        assert!(report.closed.is_empty());
        assert!(!engine.pnl_ledger().exists("u1"));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].trade_id.as_deref(), Some("u1"));
        assert_eq!(
            report.errors[0].message,
            CoreError::UnknownTrade("u1".into()).to_string()
        );
    }

    #[test]
    fn untracked_exit_uses_fill_entry_notional() {
        let engine = DecisionEngine::new(RuntimeConfig::default(), 10_000.0);
        let f = ExitFill {
            exit_notional_usd: 1_200.0,
            entry_notional_usd: Some(1_000.0),
            entry_fees_usd: 0.0,
            exit_fees_usd: 0.0,
            entry_slippage_usd: 0.0,
            exit_slippage_usd: 0.0,
            observed_net_pnl_usd: None,
        };

        let report = run_cycle(&engine, &untracked(f));

        assert!(report.errors.is_empty());
        assert_eq!(report.closed.len(), 1);
        let closed = &report.closed[0];
        assert!((closed.record.entry_notional_usd - 1_000.0).abs() < 1e-9);
        assert!((closed.record.gross_pnl_usd - 200.0).abs() < 1e-9);
        assert!(closed.adjustment.is_none());
    }
}
