// =============================================================================
// Canonical PnL Ledger: the only place realized PnL is computed
// =============================================================================
//
//   gross_pnl   = exit_notional - entry_notional
//   total_fees  = entry_fees + exit_fees
//   total_slip  = entry_slippage + exit_slippage
//   net_pnl     = gross_pnl - total_fees - total_slip
//   net_pnl_pct = net_pnl / entry_notional          (fraction, 0.044 = 4.4 %)
//
// Every capital update, log line and persisted row reads from the cached
// record; nothing else recomputes PnL.
//
// Invariant check (after computing the record):
//   - every derived value is finite
//   - the percentage recomputed along an independent path
//     ((exit - entry - fees - slippage) / entry) agrees within tolerance
//   - when the caller supplies an independently observed balance delta, the
//     canonical net PnL agrees with it within the ledger tolerance
//
// Strict mode turns a violation into an error and caches nothing. Permissive
// mode quarantines the trade, flags the record invalid and still caches it so
// downstream code can see `invariant_valid == false` and refuse to act.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::PnlError;
use crate::runtime_config::PnlParams;
use crate::types::StrictnessMode;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlInput {
    pub trade_id: String,
    pub entity_id: String,
    pub entry_notional_usd: f64,
    pub exit_notional_usd: f64,
    #[serde(default)]
    pub entry_fees_usd: f64,
    #[serde(default)]
    pub exit_fees_usd: f64,
    #[serde(default)]
    pub entry_slippage_usd: f64,
    #[serde(default)]
    pub exit_slippage_usd: f64,
    /// Balance delta measured independently (e.g. wallet before / after).
    #[serde(default)]
    pub observed_net_pnl_usd: Option<f64>,
}

/// Immutable, authoritative PnL for one trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPnlRecord {
    pub trade_id: String,
    pub entity_id: String,
    pub entry_notional_usd: f64,
    pub exit_notional_usd: f64,
    pub entry_fees_usd: f64,
    pub exit_fees_usd: f64,
    pub entry_slippage_usd: f64,
    pub exit_slippage_usd: f64,
    pub gross_pnl_usd: f64,
    pub total_fees_usd: f64,
    pub total_slippage_usd: f64,
    pub net_pnl_usd: f64,
    pub net_pnl_pct: f64,
    pub computed_at: DateTime<Utc>,
    pub invariant_valid: bool,
}

/// The only fields persistence may write.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DbFields {
    pub gross_pnl_usd: f64,
    pub net_pnl_usd: f64,
    pub net_pnl_pct: f64,
    pub total_fees_usd: f64,
    pub total_slippage_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    NonFiniteResult,
    PercentMismatch,
    LedgerMismatch,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonFiniteResult => write!(f, "NON_FINITE_RESULT"),
            Self::PercentMismatch => write!(f, "PERCENT_MISMATCH"),
            Self::LedgerMismatch => write!(f, "LEDGER_MISMATCH"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantinedTrade {
    pub input: PnlInput,
    pub record: CanonicalPnlRecord,
    pub violation: ViolationKind,
    pub detail: String,
    pub quarantined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalAdjustment {
    pub new_capital_usd: f64,
    pub adjustment_usd: f64,
    pub applied: bool,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct PnlLedger {
    records: RwLock<HashMap<String, CanonicalPnlRecord>>,
    quarantine: RwLock<VecDeque<QuarantinedTrade>>,
    params: PnlParams,
    strictness: StrictnessMode,
}

impl PnlLedger {
    pub fn new(params: PnlParams, strictness: StrictnessMode) -> Self {
        info!(
            min_entry_notional_usd = params.min_entry_notional_usd,
            pct_tolerance = params.pct_tolerance,
            quarantine_capacity = params.quarantine_capacity,
            strictness = %strictness,
            "PnlLedger initialised"
        );
        Self {
            records: RwLock::new(HashMap::new()),
            quarantine: RwLock::new(VecDeque::with_capacity(params.quarantine_capacity)),
            params,
            strictness,
        }
    }

    /// Compute, check and cache the canonical record for a trade.
    ///
    /// Calling again for the same trade overwrites the cached record.
    pub fn compute(&self, input: &PnlInput, now_ms: i64) -> Result<CanonicalPnlRecord, PnlError> {
        validate_input(input, self.params.min_entry_notional_usd)?;

        let gross_pnl_usd = input.exit_notional_usd - input.entry_notional_usd;
        let total_fees_usd = input.entry_fees_usd + input.exit_fees_usd;
        let total_slippage_usd = input.entry_slippage_usd + input.exit_slippage_usd;
        let net_pnl_usd = gross_pnl_usd - total_fees_usd - total_slippage_usd;
        let net_pnl_pct = net_pnl_usd / input.entry_notional_usd;

        let mut record = CanonicalPnlRecord {
            trade_id: input.trade_id.clone(),
            entity_id: input.entity_id.clone(),
            entry_notional_usd: input.entry_notional_usd,
            exit_notional_usd: input.exit_notional_usd,
            entry_fees_usd: input.entry_fees_usd,
            exit_fees_usd: input.exit_fees_usd,
            entry_slippage_usd: input.entry_slippage_usd,
            exit_slippage_usd: input.exit_slippage_usd,
            gross_pnl_usd,
            total_fees_usd,
            total_slippage_usd,
            net_pnl_usd,
            net_pnl_pct,
            computed_at: timestamp(now_ms),
            invariant_valid: true,
        };

        if let Some((kind, detail)) = self.check_invariant(input, &record) {
            if self.strictness.is_strict() {
                error!(
                    trade_id = %input.trade_id,
                    entity = %input.entity_id,
                    violation = %kind,
                    detail = %detail,
                    "PnL invariant violated in strict mode, record refused"
                );
                return Err(PnlError::InvariantViolation {
                    trade_id: input.trade_id.clone(),
                    kind,
                    detail,
                });
            }

            record.invariant_valid = false;
            warn!(
                trade_id = %input.trade_id,
                entity = %input.entity_id,
                violation = %kind,
                detail = %detail,
                net_pnl_usd = record.net_pnl_usd,
                net_pnl_pct = record.net_pnl_pct,
                "PnL invariant violated, trade quarantined"
            );
            self.push_quarantine(QuarantinedTrade {
                input: input.clone(),
                record: record.clone(),
                violation: kind,
                detail,
                quarantined_at: record.computed_at,
            });
        }

        debug!(
            trade_id = %record.trade_id,
            gross_pnl_usd = record.gross_pnl_usd,
            total_fees_usd = record.total_fees_usd,
            total_slippage_usd = record.total_slippage_usd,
            net_pnl_usd = record.net_pnl_usd,
            net_pnl_pct = record.net_pnl_pct,
            invariant_valid = record.invariant_valid,
            "canonical PnL computed"
        );

        self.records
            .write()
            .insert(record.trade_id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, trade_id: &str) -> Option<CanonicalPnlRecord> {
        self.records.read().get(trade_id).cloned()
    }

    pub fn exists(&self, trade_id: &str) -> bool {
        self.records.read().contains_key(trade_id)
    }

    /// The five persist-eligible fields, or `None` if no record exists.
    pub fn db_fields(&self, trade_id: &str) -> Option<DbFields> {
        self.records.read().get(trade_id).map(|r| DbFields {
            gross_pnl_usd: r.gross_pnl_usd,
            net_pnl_usd: r.net_pnl_usd,
            net_pnl_pct: r.net_pnl_pct,
            total_fees_usd: r.total_fees_usd,
            total_slippage_usd: r.total_slippage_usd,
        })
    }

    /// Apply the canonical net PnL to a capital figure. Refuses unless a
    /// record exists and passed its invariant check.
    pub fn apply_to_capital(&self, trade_id: &str, current_capital_usd: f64) -> CapitalAdjustment {
        let records = self.records.read();
        let refused = |reason: String| CapitalAdjustment {
            new_capital_usd: current_capital_usd,
            adjustment_usd: 0.0,
            applied: false,
            reason,
        };

        match records.get(trade_id) {
            None => refused(format!("no canonical PnL record for trade {trade_id}")),
            Some(r) if !r.invariant_valid => refused(format!(
                "canonical PnL record for trade {trade_id} failed its invariant check"
            )),
            Some(r) => CapitalAdjustment {
                new_capital_usd: current_capital_usd + r.net_pnl_usd,
                adjustment_usd: r.net_pnl_usd,
                applied: true,
                reason: format!("applied canonical net PnL ${:.4}", r.net_pnl_usd),
            },
        }
    }

    /// Drop the cached record for a trade. Returns whether one existed.
    pub fn clear(&self, trade_id: &str) -> bool {
        self.records.write().remove(trade_id).is_some()
    }

    /// Quarantined trades, oldest first.
    pub fn quarantined(&self) -> Vec<QuarantinedTrade> {
        self.quarantine.read().iter().cloned().collect()
    }

    pub fn quarantine_len(&self) -> usize {
        self.quarantine.read().len()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn strictness(&self) -> StrictnessMode {
        self.strictness
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn check_invariant(
        &self,
        input: &PnlInput,
        record: &CanonicalPnlRecord,
    ) -> Option<(ViolationKind, String)> {
        let derived = [
            record.gross_pnl_usd,
            record.total_fees_usd,
            record.total_slippage_usd,
            record.net_pnl_usd,
            record.net_pnl_pct,
        ];
        if derived.iter().any(|v| !v.is_finite()) {
            return Some((
                ViolationKind::NonFiniteResult,
                format!("derived values {derived:?}"),
            ));
        }

        let cross_pct = (input.exit_notional_usd
            - input.entry_notional_usd
            - input.entry_fees_usd
            - input.exit_fees_usd
            - input.entry_slippage_usd
            - input.exit_slippage_usd)
            / input.entry_notional_usd;
        let pct_gap = (record.net_pnl_pct - cross_pct).abs();
        if !(pct_gap <= self.params.pct_tolerance) {
            return Some((
                ViolationKind::PercentMismatch,
                format!(
                    "net_pnl_pct {:.6} vs cross-check {:.6} (tolerance {:.6})",
                    record.net_pnl_pct, cross_pct, self.params.pct_tolerance
                ),
            ));
        }

        if let Some(observed) = input.observed_net_pnl_usd {
            let gap = (record.net_pnl_usd - observed).abs();
            if !(gap <= self.params.ledger_tolerance_usd) {
                return Some((
                    ViolationKind::LedgerMismatch,
                    format!(
                        "net_pnl ${:.4} vs observed balance delta ${:.4} (tolerance ${:.4})",
                        record.net_pnl_usd, observed, self.params.ledger_tolerance_usd
                    ),
                ));
            }
        }

        None
    }

    fn push_quarantine(&self, entry: QuarantinedTrade) {
        let mut q = self.quarantine.write();
        q.push_back(entry);
        while q.len() > self.params.quarantine_capacity {
            q.pop_front();
        }
    }
}

impl std::fmt::Debug for PnlLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PnlLedger")
            .field("records", &self.records.read().len())
            .field("quarantined", &self.quarantine.read().len())
            .field("strictness", &self.strictness)
            .finish()
    }
}

fn validate_input(input: &PnlInput, min_entry_notional_usd: f64) -> Result<(), PnlError> {
    let fields = [
        ("entry_notional_usd", input.entry_notional_usd),
        ("exit_notional_usd", input.exit_notional_usd),
        ("entry_fees_usd", input.entry_fees_usd),
        ("exit_fees_usd", input.exit_fees_usd),
        ("entry_slippage_usd", input.entry_slippage_usd),
        ("exit_slippage_usd", input.exit_slippage_usd),
    ];
    if let Some(&(field, _)) = fields.iter().find(|(_, v)| !v.is_finite()) {
        return Err(PnlError::NonFiniteInput {
            trade_id: input.trade_id.clone(),
            field,
        });
    }

    if input.entry_notional_usd < min_entry_notional_usd {
        return Err(PnlError::NotionalBelowMinimum {
            trade_id: input.trade_id.clone(),
            entry_notional_usd: input.entry_notional_usd,
            min_usd: min_entry_notional_usd,
        });
    }

    Ok(())
}

/// Out-of-range instants map to a fixed sentinel so records stay a pure
/// function of their inputs.
fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// =============================================================================
// Tests
// =============================================================================
