// =============================================================================
// Position Fee State: per-trade fee accrual bookkeeping
// =============================================================================
//
// Life-cycle:
//   open()  on position open
//   record_fees() / record_rebalance() / observe_fee_velocity() while open
//   close() on position close (entry removed)
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::MS_PER_HOUR;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionFeeState {
    pub trade_id: String,
    pub entity_id: String,
    pub entry_time_ms: i64,
    pub entry_notional_usd: f64,
    /// Cost paid to open (fees + slippage); the base amortization target.
    pub entry_cost_usd: f64,
    pub fees_accrued_usd: f64,
    pub rebalance_count: u32,
    pub last_update_ms: i64,
    /// Consecutive observation windows with fee velocity below requirement.
    pub low_velocity_windows: u32,
}

impl PositionFeeState {
    /// Average fees per hour since entry.
    pub fn fees_per_hour(&self, now_ms: i64) -> f64 {
        let elapsed = (now_ms - self.entry_time_ms).max(0);
        if elapsed == 0 {
            return 0.0;
        }
        self.fees_accrued_usd / (elapsed as f64 / MS_PER_HOUR as f64)
    }
}

#[derive(Default)]
pub struct FeeStateStore {
    states: RwLock<HashMap<String, PositionFeeState>>,
}

impl FeeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a trade. Re-opening an existing id resets its state.
    pub fn open(
        &self,
        trade_id: &str,
        entity_id: &str,
        entry_time_ms: i64,
        entry_notional_usd: f64,
        entry_cost_usd: f64,
    ) {
        let state = PositionFeeState {
            trade_id: trade_id.to_string(),
            entity_id: entity_id.to_string(),
            entry_time_ms,
            entry_notional_usd,
            entry_cost_usd,
            fees_accrued_usd: 0.0,
            rebalance_count: 0,
            last_update_ms: entry_time_ms,
            low_velocity_windows: 0,
        };
        self.states.write().insert(trade_id.to_string(), state);
        debug!(trade_id, entity_id, entry_notional_usd, entry_cost_usd, "fee state opened");
    }

    /// Add newly claimed/accrued fees. Returns the cumulative total.
    pub fn record_fees(&self, trade_id: &str, fees_usd: f64, now_ms: i64) -> Option<f64> {
        let mut states = self.states.write();
        let s = states.get_mut(trade_id)?;
        if fees_usd.is_finite() && fees_usd > 0.0 {
            s.fees_accrued_usd += fees_usd;
        }
        s.last_update_ms = now_ms;
        Some(s.fees_accrued_usd)
    }

    /// Count a range rebalance. Returns the new rebalance count.
    pub fn record_rebalance(&self, trade_id: &str, now_ms: i64) -> Option<u32> {
        let mut states = self.states.write();
        let s = states.get_mut(trade_id)?;
        s.rebalance_count += 1;
        s.last_update_ms = now_ms;
        Some(s.rebalance_count)
    }

    /// Feed one velocity observation window. A window below the requirement
    /// extends the streak; any other window resets it. Returns the streak.
    pub fn observe_fee_velocity(
        &self,
        trade_id: &str,
        fees_per_hour: f64,
        required_fees_per_hour: f64,
        now_ms: i64,
    ) -> Option<u32> {
        let mut states = self.states.write();
        let s = states.get_mut(trade_id)?;
        if fees_per_hour < required_fees_per_hour {
            s.low_velocity_windows += 1;
        } else {
            s.low_velocity_windows = 0;
        }
        s.last_update_ms = now_ms;
        Some(s.low_velocity_windows)
    }

    pub fn fees_per_hour(&self, trade_id: &str, now_ms: i64) -> Option<f64> {
        self.states.read().get(trade_id).map(|s| s.fees_per_hour(now_ms))
    }

    pub fn get(&self, trade_id: &str) -> Option<PositionFeeState> {
        self.states.read().get(trade_id).cloned()
    }

    /// Stop tracking a trade and hand back its final state.
    pub fn close(&self, trade_id: &str) -> Option<PositionFeeState> {
        self.states.write().remove(trade_id)
    }

    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_open_mutate_close() {
        let store = FeeStateStore::new();
        store.open("t1", "pool-1", 0, 1_000.0, 2.0);

        assert_eq!(store.record_fees("t1", 0.75, 10), Some(0.75));
        assert_eq!(store.record_fees("t1", 0.25, 20), Some(1.0));
        assert_eq!(store.record_rebalance("t1", 30), Some(1));

        let state = store.get("t1").unwrap();
        assert_eq!(state.last_update_ms, 30);
        assert_eq!(state.rebalance_count, 1);

        let closed = store.close("t1").unwrap();
        assert!((closed.fees_accrued_usd - 1.0).abs() < 1e-12);
        assert!(store.is_empty());
        assert_eq!(store.record_fees("t1", 1.0, 40), None);
    }

    #[test]
    fn negative_or_nan_fees_are_ignored() {
        let store = FeeStateStore::new();
        store.open("t1", "p", 0, 100.0, 1.0);
        store.record_fees("t1", -5.0, 1);
        store.record_fees("t1", f64::NAN, 2);
        assert_eq!(store.get("t1").unwrap().fees_accrued_usd, 0.0);
    }

    #[test]
    fn fees_per_hour_uses_elapsed_time() {
        let store = FeeStateStore::new();
        store.open("t1", "p", 0, 100.0, 1.0);
        store.record_fees("t1", 3.0, MS_PER_HOUR);
        let fph = store.fees_per_hour("t1", 2 * MS_PER_HOUR).unwrap();
        assert!((fph - 1.5).abs() < 1e-12);
        assert_eq!(store.fees_per_hour("t1", 0), Some(0.0));
    }

    #[test]
    fn low_velocity_streak_resets_on_recovery() {
        let store = FeeStateStore::new();
        store.open("t1", "p", 0, 100.0, 2.0);
        assert_eq!(store.observe_fee_velocity("t1", 0.1, 0.5, 1), Some(1));
        assert_eq!(store.observe_fee_velocity("t1", 0.2, 0.5, 2), Some(2));
        assert_eq!(store.observe_fee_velocity("t1", 0.9, 0.5, 3), Some(0));
        assert_eq!(store.observe_fee_velocity("t1", 0.1, 0.5, 4), Some(1));
    }
}
