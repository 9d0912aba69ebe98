// =============================================================================
// Error taxonomy for the exit decision core
// =============================================================================
//
// Business denials (min hold not met, noise suppression, …) are NOT errors;
// they are `ExitGateDecision` values. Only input validation failures,
// invariant violations and strict-mode portfolio mismatches surface here.
// =============================================================================

use crate::pnl_ledger::ViolationKind;
use crate::reconcile::ConsistencyErrorType;

/// Failures raised by the canonical PnL ledger.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PnlError {
    #[error("trade {trade_id}: entry notional ${entry_notional_usd:.4} is below the ${min_usd:.2} minimum")]
    NotionalBelowMinimum {
        trade_id: String,
        entry_notional_usd: f64,
        min_usd: f64,
    },

    #[error("trade {trade_id}: input field `{field}` is not finite")]
    NonFiniteInput { trade_id: String, field: &'static str },

    #[error("trade {trade_id}: PnL invariant violated ({kind}): {detail}")]
    InvariantViolation {
        trade_id: String,
        kind: ViolationKind,
        detail: String,
    },
}

/// Top-level error type returned by the decision engine facade.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Pnl(#[from] PnlError),

    #[error("portfolio inconsistent ({error_type}): positions ${positions_sum_usd:.2} vs reported ${reported_deployed_usd:.2} (mismatch ${mismatch_usd:.2})")]
    PortfolioMismatch {
        error_type: ConsistencyErrorType,
        positions_sum_usd: f64,
        reported_deployed_usd: f64,
        mismatch_usd: f64,
    },

    #[error("trade {0} is not tracked")]
    UnknownTrade(String),
}
