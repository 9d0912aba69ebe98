// =============================================================================
// Capital Ledger: deployed capital bookkeeping, independent of positions
// =============================================================================
//
// Tracks allocations on open/close as a running total. The position snapshot
// supplied each cycle is marked-to-market by a different collaborator, so
// comparing the two is a meaningful cross-check rather than a tautology.
//
// Closing a trade returns its notional to the free pool and applies the
// canonical net PnL through `PnlLedger::apply_to_capital`. A trade whose
// record is missing or flagged invalid still closes, but capital is left
// untouched until the operator resolves the quarantine.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::pnl_ledger::{CapitalAdjustment, PnlLedger};
use crate::types::PositionNotional;

/// One open allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub trade_id: String,
    pub address: String,
    pub name: String,
    pub notional_usd: f64,
    pub opened_at_ms: i64,
}

/// Read-only view for reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalState {
    pub capital_usd: f64,
    pub deployed_usd: f64,
    pub available_usd: f64,
    pub open_count: usize,
    pub realized_pnl_usd: f64,
    pub refused_adjustments: u32,
}

struct Inner {
    capital_usd: f64,
    deployed_usd: f64,
    realized_pnl_usd: f64,
    refused_adjustments: u32,
    allocations: HashMap<String, Allocation>,
}

pub struct CapitalLedger {
    state: RwLock<Inner>,
}

impl CapitalLedger {
    pub fn new(initial_capital_usd: f64) -> Self {
        info!(initial_capital_usd, "CapitalLedger initialised");
        Self {
            state: RwLock::new(Inner {
                capital_usd: initial_capital_usd,
                deployed_usd: 0.0,
                realized_pnl_usd: 0.0,
                refused_adjustments: 0,
                allocations: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Allocation lifecycle
    // -------------------------------------------------------------------------

    /// Reserve capital for a new trade. Returns `false` if the trade id is
    /// already open; the existing allocation is kept.
    pub fn open(
        &self,
        trade_id: &str,
        address: &str,
        name: &str,
        notional_usd: f64,
        now_ms: i64,
    ) -> bool {
        let mut s = self.state.write();
        if s.allocations.contains_key(trade_id) {
            warn!(trade_id, "allocation already open, duplicate open ignored");
            return false;
        }
        s.deployed_usd += notional_usd;
        s.allocations.insert(
            trade_id.to_string(),
            Allocation {
                trade_id: trade_id.to_string(),
                address: address.to_string(),
                name: name.to_string(),
                notional_usd,
                opened_at_ms: now_ms,
            },
        );
        debug!(
            trade_id,
            address,
            notional_usd,
            deployed_usd = s.deployed_usd,
            "allocation opened"
        );
        true
    }

    /// Release a trade's allocation and apply its canonical PnL.
    pub fn close(
        &self,
        trade_id: &str,
        ledger: &PnlLedger,
    ) -> Result<CapitalAdjustment, CoreError> {
        let mut s = self.state.write();
        let alloc = s
            .allocations
            .remove(trade_id)
            .ok_or_else(|| CoreError::UnknownTrade(trade_id.to_string()))?;
        s.deployed_usd -= alloc.notional_usd;

        let adjustment = ledger.apply_to_capital(trade_id, s.capital_usd);
        if adjustment.applied {
            s.capital_usd = adjustment.new_capital_usd;
            s.realized_pnl_usd += adjustment.adjustment_usd;
            info!(
                trade_id,
                address = %alloc.address,
                adjustment_usd = adjustment.adjustment_usd,
                capital_usd = s.capital_usd,
                deployed_usd = s.deployed_usd,
                "allocation closed"
            );
        } else {
            s.refused_adjustments += 1;
            warn!(
                trade_id,
                address = %alloc.address,
                reason = %adjustment.reason,
                capital_usd = s.capital_usd,
                "allocation closed without capital adjustment"
            );
        }
        Ok(adjustment)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Reported deployed capital (running total, not a sum over positions).
    pub fn deployed_usd(&self) -> f64 {
        self.state.read().deployed_usd
    }

    pub fn capital_usd(&self) -> f64 {
        self.state.read().capital_usd
    }

    pub fn is_open(&self, trade_id: &str) -> bool {
        self.state.read().allocations.contains_key(trade_id)
    }

    pub fn allocation(&self, trade_id: &str) -> Option<Allocation> {
        self.state.read().allocations.get(trade_id).cloned()
    }

    /// Open allocations at their entry notional, sorted by trade id.
    pub fn positions(&self) -> Vec<PositionNotional> {
        let s = self.state.read();
        let mut allocs: Vec<&Allocation> = s.allocations.values().collect();
        allocs.sort_by(|a, b| a.trade_id.cmp(&b.trade_id));
        allocs
            .into_iter()
            .map(|a| PositionNotional::new(&a.address, &a.name, a.notional_usd))
            .collect()
    }

    pub fn state(&self) -> CapitalState {
        let s = self.state.read();
        CapitalState {
            capital_usd: s.capital_usd,
            deployed_usd: s.deployed_usd,
            available_usd: s.capital_usd - s.deployed_usd,
            open_count: s.allocations.len(),
            realized_pnl_usd: s.realized_pnl_usd,
            refused_adjustments: s.refused_adjustments,
        }
    }
}

impl std::fmt::Debug for CapitalLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("CapitalLedger")
            .field("capital_usd", &s.capital_usd)
            .field("deployed_usd", &s.deployed_usd)
            .field("open", &s.allocations.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pnl_ledger::PnlInput;
    use crate::runtime_config::PnlParams;
    use crate::types::StrictnessMode;

    fn pnl_input(trade_id: &str, observed: Option<f64>) -> PnlInput {
        PnlInput {
            trade_id: trade_id.to_string(),
            entity_id: "pool-1".to_string(),
            entry_notional_usd: 1_000.0,
            exit_notional_usd: 1_050.0,
            entry_fees_usd: 2.0,
            exit_fees_usd: 2.0,
            entry_slippage_usd: 1.0,
            exit_slippage_usd: 1.0,
            observed_net_pnl_usd: observed,
        }
    }

    #[test]
    fn open_close_moves_deployed_and_capital() {
        let cap = CapitalLedger::new(10_000.0);
        let ledger = PnlLedger::new(PnlParams::default(), StrictnessMode::Permissive);

        assert!(cap.open("t1", "addr-1", "SOL-USDC", 1_000.0, 0));
        assert!(!cap.open("t1", "addr-1", "SOL-USDC", 1_000.0, 0));
        assert_eq!(cap.deployed_usd(), 1_000.0);
        assert_eq!(cap.positions().len(), 1);

        ledger.compute(&pnl_input("t1", None), 10).unwrap();
        let adj = cap.close("t1", &ledger).unwrap();
        assert!(adj.applied);
        assert_eq!(cap.capital_usd(), 10_044.0);
        assert_eq!(cap.deployed_usd(), 0.0);
        assert!(!cap.is_open("t1"));
    }

    #[test]
    fn close_without_record_keeps_capital() {
        let cap = CapitalLedger::new(5_000.0);
        let ledger = PnlLedger::new(PnlParams::default(), StrictnessMode::Permissive);
        cap.open("t1", "a", "n", 500.0, 0);

        let adj = cap.close("t1", &ledger).unwrap();
        assert!(!adj.applied);
        assert_eq!(cap.capital_usd(), 5_000.0);
        assert_eq!(cap.state().refused_adjustments, 1);
    }

    #[test]
    fn quarantined_record_is_not_applied() {
        let cap = CapitalLedger::new(5_000.0);
        let ledger = PnlLedger::new(PnlParams::default(), StrictnessMode::Permissive);
        cap.open("t1", "a", "n", 1_000.0, 0);
        ledger.compute(&pnl_input("t1", Some(-3.0)), 1).unwrap();

        let adj = cap.close("t1", &ledger).unwrap();
        assert!(!adj.applied);
        assert_eq!(cap.capital_usd(), 5_000.0);
    }

    #[test]
    fn unknown_trade_is_an_error() {
        let cap = CapitalLedger::new(1_000.0);
        let ledger = PnlLedger::new(PnlParams::default(), StrictnessMode::Permissive);
        let err = cap.close("nope", &ledger).unwrap_err();
        assert_eq!(err, CoreError::UnknownTrade("nope".into()));
    }

    #[test]
    fn state_reports_available() {
        let cap = CapitalLedger::new(1_000.0);
        cap.open("t1", "a", "n", 300.0, 0);
        cap.open("t2", "b", "m", 200.0, 0);
        let st = cap.state();
        assert_eq!(st.open_count, 2);
        assert!((st.available_usd - 500.0).abs() < 1e-9);
        assert_eq!(cap.positions()[0].address, "a");
    }
}
