// =============================================================================
// Decision Engine: owns every state store of the exit decision core
// =============================================================================
//
// The single entry point collaborators use. Each component manages its own
// interior mutability; the engine ties them together, keeps a short ring of
// recent decisions for audit, and exposes a unified snapshot.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock inside every store.
//   - All methods take `&self`; share the engine behind an `Arc` if needed.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::amortization_decay::AmortizationDecayGate;
use crate::capital::{CapitalLedger, CapitalState};
use crate::cooldown::CooldownTracker;
use crate::error::CoreError;
use crate::exit::decision::ExitGateDecision;
use crate::exit::gate::{ExitGate, ExitGateInput};
use crate::exit::monitor::{self, CycleReport, CycleSnapshot};
use crate::fee_state::FeeStateStore;
use crate::hold_policy::{HoldPolicy, PolicyInput, PolicyOutcome};
use crate::pnl_ledger::{CanonicalPnlRecord, CapitalAdjustment, DbFields, PnlInput, PnlLedger};
use crate::reason::ExitReasonKind;
use crate::reconcile::{PortfolioConsistencyChecker, PortfolioConsistencyResult, PortfolioSnapshot};
use crate::runtime_config::RuntimeConfig;
use crate::types::{EntityClass, PositionNotional, StrictnessMode};

/// Maximum number of recent decisions to retain.
const MAX_RECENT_DECISIONS: usize = 100;

/// Point-in-time view of the engine for reports.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state_version: u64,
    pub strictness: StrictnessMode,
    pub capital: CapitalState,
    pub open_fee_states: usize,
    pub cached_pnl_records: usize,
    pub quarantined_trades: usize,
    pub consecutive_consistency_violations: u32,
    pub last_consistency: Option<PortfolioSnapshot>,
    pub recent_decisions: Vec<ExitGateDecision>,
}

pub struct DecisionEngine {
    /// Incremented on every state mutation.
    state_version: AtomicU64,
    config: RuntimeConfig,

    gate: ExitGate,
    cooldowns: CooldownTracker,
    fee_state: FeeStateStore,
    pnl_ledger: PnlLedger,
    capital: CapitalLedger,
    consistency: PortfolioConsistencyChecker,

    recent_decisions: RwLock<VecDeque<ExitGateDecision>>,
}

impl DecisionEngine {
    pub fn new(config: RuntimeConfig, initial_capital_usd: f64) -> Self {
        let strictness = config.strictness;
        let gate = ExitGate::new(
            HoldPolicy::new(config.hold_policy.clone()),
            AmortizationDecayGate::new(config.decay.clone()),
            config.exit_gate.clone(),
        );

        info!(
            strictness = %strictness,
            initial_capital_usd,
            decay_enabled = config.decay.enabled,
            "DecisionEngine initialised"
        );

        Self {
            state_version: AtomicU64::new(0),
            cooldowns: CooldownTracker::new(config.cooldown.clone()),
            fee_state: FeeStateStore::new(),
            pnl_ledger: PnlLedger::new(config.pnl.clone(), strictness),
            capital: CapitalLedger::new(initial_capital_usd),
            consistency: PortfolioConsistencyChecker::new(config.consistency.clone(), strictness),
            recent_decisions: RwLock::new(VecDeque::with_capacity(MAX_RECENT_DECISIONS)),
            gate,
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Exit gate
    // -------------------------------------------------------------------------

    /// Evaluate one exit signal, log it (cooldown-throttled) and keep it in
    /// the recent-decision ring.
    pub fn evaluate_exit_gate(&self, input: &ExitGateInput, now_ms: i64) -> ExitGateDecision {
        let decision = self.gate.evaluate(input, &self.cooldowns, now_ms);
        monitor::log_decision(&decision);

        let mut ring = self.recent_decisions.write();
        if ring.len() >= MAX_RECENT_DECISIONS {
            ring.pop_front();
        }
        ring.push_back(decision.clone());
        drop(ring);

        self.bump();
        decision
    }

    /// Run the standalone hold policy for a tracked trade, using its fee state
    /// for entry cost, fee velocity and the low-velocity window streak.
    /// Returns `None` if the trade has no fee state.
    pub fn evaluate_hold_policy(
        &self,
        trade_id: &str,
        reason: ExitReasonKind,
        entity_class: EntityClass,
        current_tvl_usd: f64,
        entry_tvl_usd: f64,
        now_ms: i64,
    ) -> Option<PolicyOutcome> {
        let state = self.fee_state.get(trade_id)?;
        Some(self.gate.policy().evaluate(&PolicyInput {
            reason,
            entity_class,
            entry_time_ms: state.entry_time_ms,
            now_ms,
            entry_cost_usd: state.entry_cost_usd,
            current_fees_per_hour: state.fees_per_hour(now_ms),
            low_velocity_windows: state.low_velocity_windows,
            current_tvl_usd,
            entry_tvl_usd,
        }))
    }

    /// Fill fee fields of a gate input from the fee-state store, when the
    /// trade is tracked. Returns whether anything was filled.
    pub fn hydrate_from_fee_state(
        &self,
        trade_id: &str,
        input: &mut ExitGateInput,
        now_ms: i64,
    ) -> bool {
        match self.fee_state.get(trade_id) {
            Some(state) => {
                input.entry_cost_usd = state.entry_cost_usd;
                input.fees_accrued_usd = state.fees_accrued_usd;
                input.fees_per_hour = state.fees_per_hour(now_ms);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Canonical PnL
    // -------------------------------------------------------------------------

    pub fn compute_canonical_pnl(
        &self,
        input: &PnlInput,
        now_ms: i64,
    ) -> Result<CanonicalPnlRecord, CoreError> {
        let record = self.pnl_ledger.compute(input, now_ms)?;
        self.bump();
        Ok(record)
    }

    pub fn get_db_fields(&self, trade_id: &str) -> Option<DbFields> {
        self.pnl_ledger.db_fields(trade_id)
    }

    pub fn apply_to_capital(&self, trade_id: &str, current_capital_usd: f64) -> CapitalAdjustment {
        self.pnl_ledger.apply_to_capital(trade_id, current_capital_usd)
    }

    // -------------------------------------------------------------------------
    // Portfolio consistency
    // -------------------------------------------------------------------------

    pub fn check_portfolio_consistency(
        &self,
        positions: &[PositionNotional],
        reported_deployed_usd: f64,
        now_ms: i64,
    ) -> Result<PortfolioConsistencyResult, CoreError> {
        let result = self.consistency.check(positions, reported_deployed_usd, now_ms);
        self.bump();
        result
    }

    // -------------------------------------------------------------------------
    // Position lifecycle
    // -------------------------------------------------------------------------

    /// Start tracking a position: capital allocation plus fee state.
    /// Returns `false` if the trade id is already open.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &self,
        trade_id: &str,
        entity_id: &str,
        address: &str,
        name: &str,
        notional_usd: f64,
        entry_cost_usd: f64,
        now_ms: i64,
    ) -> bool {
        if !self.capital.open(trade_id, address, name, notional_usd, now_ms) {
            return false;
        }
        self.fee_state
            .open(trade_id, entity_id, now_ms, notional_usd, entry_cost_usd);
        self.bump();
        true
    }

    /// Close a position: release its allocation through the canonical record,
    /// drop its fee state and clear every cooldown held for the entity.
    pub fn close_position(
        &self,
        trade_id: &str,
        entity_id: &str,
    ) -> Result<CapitalAdjustment, CoreError> {
        let adjustment = self.capital.close(trade_id, &self.pnl_ledger)?;
        self.fee_state.close(trade_id);
        let cleared = self.cooldowns.clear(entity_id, None);
        debug!(trade_id, entity = entity_id, cleared_cooldowns = cleared, "position closed");
        self.bump();
        Ok(adjustment)
    }

    /// One full decision cycle; see [`monitor::run_cycle`].
    pub fn run_cycle(&self, snapshot: &CycleSnapshot) -> CycleReport {
        monitor::run_cycle(self, snapshot)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    pub fn fee_state(&self) -> &FeeStateStore {
        &self.fee_state
    }

    pub fn pnl_ledger(&self) -> &PnlLedger {
        &self.pnl_ledger
    }

    pub fn capital(&self) -> &CapitalLedger {
        &self.capital
    }

    pub fn consistency(&self) -> &PortfolioConsistencyChecker {
        &self.consistency
    }

    pub fn recent_decisions(&self) -> Vec<ExitGateDecision> {
        self.recent_decisions.read().iter().cloned().collect()
    }

    pub fn state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state_version: self.state_version(),
            strictness: self.config.strictness,
            capital: self.capital.state(),
            open_fee_states: self.fee_state.len(),
            cached_pnl_records: self.pnl_ledger.len(),
            quarantined_trades: self.pnl_ledger.quarantine_len(),
            consecutive_consistency_violations: self.consistency.consecutive_violations(),
            last_consistency: self.consistency.last(),
            recent_decisions: self.recent_decisions(),
        }
    }

    fn bump(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("state_version", &self.state_version())
            .field("strictness", &self.config.strictness)
            .field("capital", &self.capital)
            .field("pnl_ledger", &self.pnl_ledger)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
