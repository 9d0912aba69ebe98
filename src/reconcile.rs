// =============================================================================
// Portfolio Consistency Checker: tracked positions vs reported capital
// =============================================================================
//
// Once per cycle, the sum of live position notionals must match the deployed
// capital the capital ledger reports. The tolerance is the more permissive
// of an absolute floor and a fraction of reported capital.
//
// SAFETY POLICY: this module logs the full position breakdown for any drift it
// discovers but never closes positions or moves capital. In strict mode a
// mismatch becomes a hard error for the caller to act on; otherwise the
// consecutive-violation counter is left for external monitoring to escalate.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::runtime_config::ConsistencyParams;
use crate::types::{PositionNotional, StrictnessMode};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Direction of an inconsistency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsistencyErrorType {
    /// More capital reported than the positions explain.
    OrphanCapital,
    /// Positions carry more notional than the reported capital accounts for.
    MissingPositions,
    /// Non-finite inputs; direction unknown.
    Mismatch,
}

impl std::fmt::Display for ConsistencyErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrphanCapital => write!(f, "ORPHAN_CAPITAL"),
            Self::MissingPositions => write!(f, "MISSING_POSITIONS"),
            Self::Mismatch => write!(f, "MISMATCH"),
        }
    }
}

/// One entry of the rolling audit history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions_sum_usd: f64,
    pub reported_deployed_usd: f64,
    pub mismatch_usd: f64,
    /// Mismatch as a fraction of reported capital.
    pub mismatch_pct: f64,
    pub position_count: usize,
    pub consistent: bool,
    pub checked_at: DateTime<Utc>,
}

/// Summary of a single consistency check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConsistencyResult {
    #[serde(flatten)]
    pub snapshot: PortfolioSnapshot,
    pub tolerance_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ConsistencyErrorType>,
    pub consecutive_violations: u32,
}

impl PortfolioConsistencyResult {
    pub fn consistent(&self) -> bool {
        self.snapshot.consistent
    }
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

struct Inner {
    history: VecDeque<PortfolioSnapshot>,
    consecutive_violations: u32,
}

pub struct PortfolioConsistencyChecker {
    state: RwLock<Inner>,
    params: ConsistencyParams,
    strictness: StrictnessMode,
}

impl PortfolioConsistencyChecker {
    pub fn new(params: ConsistencyParams, strictness: StrictnessMode) -> Self {
        Self {
            state: RwLock::new(Inner {
                history: VecDeque::with_capacity(params.history_capacity),
                consecutive_violations: 0,
            }),
            params,
            strictness,
        }
    }

    /// Run one check against a stable snapshot of the position set.
    ///
    /// The result is always appended to the history, also when strict mode
    /// turns an inconsistency into an error.
    pub fn check(
        &self,
        positions: &[PositionNotional],
        reported_deployed_usd: f64,
        now_ms: i64,
    ) -> Result<PortfolioConsistencyResult, CoreError> {
        let sum: f64 = positions.iter().map(|p| p.notional_usd).sum();
        let mismatch = (sum - reported_deployed_usd).abs();
        let tolerance = self
            .params
            .abs_tolerance_usd
            .max(self.params.rel_tolerance_pct * reported_deployed_usd.abs());
        let finite = sum.is_finite() && reported_deployed_usd.is_finite();
        let consistent = finite && mismatch <= tolerance;

        let mismatch_pct = if !finite {
            1.0
        } else if reported_deployed_usd.abs() > 0.0 {
            mismatch / reported_deployed_usd.abs()
        } else if mismatch > 0.0 {
            1.0
        } else {
            0.0
        };

        let error_type = if consistent {
            None
        } else if !finite {
            Some(ConsistencyErrorType::Mismatch)
        } else if reported_deployed_usd > sum {
            Some(ConsistencyErrorType::OrphanCapital)
        } else {
            Some(ConsistencyErrorType::MissingPositions)
        };

        let snapshot = PortfolioSnapshot {
            positions_sum_usd: sum,
            reported_deployed_usd,
            mismatch_usd: if finite { mismatch } else { 0.0 },
            mismatch_pct,
            position_count: positions.len(),
            consistent,
            checked_at: Utc
                .timestamp_millis_opt(now_ms)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        };

        let consecutive = {
            let mut s = self.state.write();
            s.consecutive_violations = if consistent {
                0
            } else {
                s.consecutive_violations + 1
            };
            s.history.push_back(snapshot.clone());
            while s.history.len() > self.params.history_capacity {
                s.history.pop_front();
            }
            s.consecutive_violations
        };

        let result = PortfolioConsistencyResult {
            snapshot,
            tolerance_usd: tolerance,
            error_type,
            consecutive_violations: consecutive,
        };

        match error_type {
            None => {
                debug!(
                    positions_sum_usd = sum,
                    reported_deployed_usd,
                    mismatch_usd = mismatch,
                    position_count = positions.len(),
                    "portfolio consistent"
                );
                Ok(result)
            }
            Some(kind) => {
                warn!(
                    error_type = %kind,
                    positions_sum_usd = sum,
                    reported_deployed_usd,
                    mismatch_usd = mismatch,
                    tolerance_usd = tolerance,
                    position_count = positions.len(),
                    consecutive_violations = consecutive,
                    "portfolio inconsistency detected"
                );
                for p in positions {
                    warn!(
                        address = %p.address,
                        name = %p.name,
                        notional_usd = p.notional_usd,
                        "  position breakdown"
                    );
                }

                if self.strictness.is_strict() {
                    return Err(CoreError::PortfolioMismatch {
                        error_type: kind,
                        positions_sum_usd: sum,
                        reported_deployed_usd,
                        mismatch_usd: mismatch,
                    });
                }
                Ok(result)
            }
        }
    }

    /// Rolling history, oldest first.
    pub fn history(&self) -> Vec<PortfolioSnapshot> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<PortfolioSnapshot> {
        self.state.read().history.back().cloned()
    }

    pub fn consecutive_violations(&self) -> u32 {
        self.state.read().consecutive_violations
    }

    /// Clear history and the violation counter (e.g. after operator review).
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.history.clear();
        s.consecutive_violations = 0;
    }
}

impl std::fmt::Debug for PortfolioConsistencyChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortfolioConsistencyChecker")
            .field("params", &self.params)
            .field("strictness", &self.strictness)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn positions() -> Vec<PositionNotional> {
        vec![
            PositionNotional::new("addr-1", "SOL-USDC", 4_000.0),
            PositionNotional::new("addr-2", "JUP-SOL", 3_500.0),
            PositionNotional::new("addr-3", "BONK-SOL", 2_500.0),
        ]
    }

    fn checker(mode: StrictnessMode) -> PortfolioConsistencyChecker {
        PortfolioConsistencyChecker::new(ConsistencyParams::default(), mode)
    }

    #[test]
    fn sixty_cents_is_within_tolerance() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&positions(), 10_000.60, 0).unwrap();
        assert!(r.consistent());
        assert!(r.error_type.is_none());
        assert_eq!(r.snapshot.position_count, 3);
    }

    #[test]
    fn two_dollars_short_is_missing_positions() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&positions(), 9_998.0, 0).unwrap();
        assert!(!r.consistent());
        assert_eq!(r.error_type, Some(ConsistencyErrorType::MissingPositions));
        assert!((r.snapshot.mismatch_usd - 2.0).abs() < 1e-9);
    }

    #[test]
    fn excess_capital_is_orphan_capital() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&positions(), 10_500.0, 0).unwrap();
        assert_eq!(r.error_type, Some(ConsistencyErrorType::OrphanCapital));
    }

    #[test]
    fn relative_tolerance_wins_on_large_books() {
        let c = checker(StrictnessMode::Permissive);
        let big = vec![PositionNotional::new("a", "big", 1_000_000.0)];
        // 0.01 % of $1M = $100 > $1 floor.
        assert!(c.check(&big, 1_000_050.0, 0).unwrap().consistent());
        assert!(!c.check(&big, 1_000_150.0, 0).unwrap().consistent());
    }

    #[test]
    fn counter_resets_on_consistent_cycle() {
        let c = checker(StrictnessMode::Permissive);
        c.check(&positions(), 9_000.0, 0).unwrap();
        c.check(&positions(), 9_000.0, 1).unwrap();
        assert_eq!(c.consecutive_violations(), 2);
        c.check(&positions(), 10_000.0, 2).unwrap();
        assert_eq!(c.consecutive_violations(), 0);
        assert_eq!(c.history().len(), 3);
        assert!(c.last().unwrap().consistent);
    }

    #[test]
    fn strict_mode_errors_but_still_records() {
        let c = checker(StrictnessMode::Strict);
        let err = c.check(&positions(), 9_998.0, 0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::PortfolioMismatch {
                error_type: ConsistencyErrorType::MissingPositions,
                ..
            }
        ));
        assert_eq!(c.consecutive_violations(), 1);
        assert_eq!(c.history().len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let mut params = ConsistencyParams::default();
        params.history_capacity = 2;
        let c = PortfolioConsistencyChecker::new(params, StrictnessMode::Permissive);
        for i in 0..5 {
            c.check(&positions(), 10_000.0 + i as f64 * 10.0, i).unwrap();
        }
        let h = c.history();
        assert_eq!(h.len(), 2);
        assert!((h[1].reported_deployed_usd - 10_040.0).abs() < 1e-9);
    }

    #[test]
    fn empty_book_with_zero_capital_is_consistent() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&[], 0.0, 0).unwrap();
        assert!(r.consistent());
        assert_eq!(r.snapshot.mismatch_pct, 0.0);
    }

    #[test]
    fn non_finite_capital_is_generic_mismatch() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&positions(), f64::NAN, 0).unwrap();
        assert_eq!(r.error_type, Some(ConsistencyErrorType::Mismatch));
    }

    #[test]
    fn out_of_range_timestamp_is_deterministic() {
        let c = checker(StrictnessMode::Permissive);
        let r = c.check(&positions(), 10_000.0, i64::MIN).unwrap();
        assert_eq!(r.snapshot.checked_at, DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn reset_clears_state() {
        let c = checker(StrictnessMode::Permissive);
        c.check(&positions(), 1.0, 0).unwrap();
        c.reset();
        assert_eq!(c.consecutive_violations(), 0);
        assert!(c.history().is_empty());
    }
}
