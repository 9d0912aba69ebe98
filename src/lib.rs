// =============================================================================
// LP Exit Core: exit authorization, canonical PnL and capital consistency
// =============================================================================
//
// Decision core of an automated liquidity-position manager. Given a candidate
// exit signal for an open position it decides whether the exit is authorized,
// computes the one authoritative PnL record for the trade, and checks that
// tracked positions still match reported deployed capital.
//
// Everything is driven by explicit millisecond timestamps supplied by the
// caller; no component reads the wall clock for its decisions.
// =============================================================================

pub mod amortization_decay;
pub mod capital;
pub mod cooldown;
pub mod engine;
pub mod error;
pub mod exit;
pub mod fee_state;
pub mod hold_policy;
pub mod logging;
pub mod pnl_ledger;
pub mod reason;
pub mod reconcile;
pub mod runtime_config;
pub mod types;

pub use engine::DecisionEngine;
pub use error::{CoreError, PnlError};
pub use exit::decision::{ExitGateCategory, ExitGateDecision};
pub use exit::gate::ExitGateInput;
pub use exit::monitor::{CycleReport, CycleSnapshot};
pub use pnl_ledger::{CanonicalPnlRecord, PnlInput};
pub use reconcile::{ConsistencyErrorType, PortfolioConsistencyResult};
pub use runtime_config::RuntimeConfig;
pub use types::{EntityClass, PositionNotional, StrictnessMode};
