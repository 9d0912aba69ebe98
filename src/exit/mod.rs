// =============================================================================
// Exit Management Module
// =============================================================================
//
// The exit gate pipeline, the decision record it produces, and the per-cycle
// driver that feeds allowed exits into the PnL ledger and capital ledger.

pub mod decision;
pub mod gate;
pub mod monitor;
