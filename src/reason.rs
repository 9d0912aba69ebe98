// =============================================================================
// Exit Reason Classification: one closed enumeration for every exit signal
// =============================================================================
//
// Raw reason strings come from many producers (health monitor, fee tracker,
// on-chain watchers, operators). They are classified exactly once, at the
// boundary where the signal originates, into an `ExitReasonKind`. Everything
// downstream switches on the variant and never re-parses text.
//
// REASON_TABLE below is the single source of truth for the mapping. It is
// scanned top to bottom and the first matching token wins, so existential
// threats are listed first and curated exits precede the softer signals.
// Tokens match whole words: "struggling" is not a rug.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Closed set of exit reasons understood by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReasonKind {
    // ── True emergencies ──────────────────────────────────────────────
    PoolMigration,
    LiquidityCollapse,
    OnChainFailure,
    MintInconsistency,
    RugSignal,
    InfrastructureFailure,

    // ── Never emergencies ─────────────────────────────────────────────
    ScoreDrop,
    RegimeFlip,
    VelocityDrop,
    FeeBleed,
    /// Composite health / harmonic / microstructure exit signal.
    HealthExit,
    RankingKill,

    // ── Curated valid exits ───────────────────────────────────────────
    TakeProfit,
    StopLoss,
    TrailingStop,
    CostAmortized,
    Rotation,
    VolumeCollapse,
    OutOfRange,
    MaxHoldExpired,
    Manual,

    Unknown,
}

/// (kind, tokens). A normalized reason matching any token maps to the kind.
///
/// Tokens match whole `_`-separated words. A trailing `*` marks a stem: the
/// token's last word may then be a prefix (`MIGRAT*` covers `MIGRATED`).
/// Curated exits sit ahead of the soft signals, so "trailing stop after
/// score dip" is a trailing stop.
pub const REASON_TABLE: &[(ExitReasonKind, &[&str])] = &[
    (ExitReasonKind::PoolMigration, &["MIGRAT*", "DEPRECAT*", "POOL_CLOSED"]),
    (
        ExitReasonKind::LiquidityCollapse,
        &["TVL_COLLAPSE*", "LIQUIDITY_COLLAPSE*", "LIQUIDITY_DRAIN*"],
    ),
    (
        ExitReasonKind::OnChainFailure,
        &["ONCHAIN_FAIL*", "ON_CHAIN_FAIL*", "ACCOUNT_DECODE_FAIL*", "POSITION_NOT_FOUND"],
    ),
    (
        ExitReasonKind::MintInconsistency,
        &["MINT_MISMATCH", "MINT_INCONSISTEN*", "DECIMALS_MISMATCH", "DECIMALS_INCONSISTEN*"],
    ),
    (
        ExitReasonKind::RugSignal,
        &["RUG", "RUGGED", "RUGPULL", "FREEZE_AUTHORITY", "MINT_AUTHORITY"],
    ),
    (
        ExitReasonKind::InfrastructureFailure,
        &["LEDGER_FAIL*", "INFRA_FAIL*", "INFRASTRUCTURE", "RPC_FAIL*"],
    ),
    (ExitReasonKind::TakeProfit, &["TAKE_PROFIT"]),
    (ExitReasonKind::StopLoss, &["STOP_LOSS"]),
    (ExitReasonKind::TrailingStop, &["TRAILING"]),
    (ExitReasonKind::CostAmortized, &["COST_AMORTIZED", "FEES_AMORTIZED", "FEE_TARGET"]),
    (ExitReasonKind::Rotation, &["ROTAT*"]),
    (ExitReasonKind::VolumeCollapse, &["VOLUME_COLLAPSE*"]),
    (ExitReasonKind::OutOfRange, &["OUT_OF_RANGE"]),
    (ExitReasonKind::MaxHoldExpired, &["MAX_HOLD", "TIME_STOP"]),
    (ExitReasonKind::Manual, &["MANUAL*", "OPERATOR"]),
    (ExitReasonKind::HealthExit, &["HARMONIC", "MICROSTRUCTURE", "HEALTH_EXIT"]),
    (ExitReasonKind::ScoreDrop, &["MHI", "SCORE"]),
    (ExitReasonKind::RegimeFlip, &["REGIME"]),
    (ExitReasonKind::VelocityDrop, &["VELOCITY", "VEL_DROP"]),
    (ExitReasonKind::FeeBleed, &["FEE_BLEED*", "BLEED*"]),
    (ExitReasonKind::RankingKill, &["RANK*", "KILL_SIGNAL"]),
];

/// Whether `token` occurs in an already normalized reason on word boundaries.
pub fn token_matches(normalized: &str, token: &str) -> bool {
    let (token, stem) = match token.strip_suffix('*') {
        Some(t) => (t, true),
        None => (token, false),
    };
    let want: Vec<&str> = token.split('_').collect();
    let words: Vec<&str> = normalized.split('_').collect();
    if words.len() < want.len() {
        return false;
    }
    let last = want.len() - 1;
    words.windows(want.len()).any(|w| {
        w[..last] == want[..last]
            && if stem {
                w[last].starts_with(want[last])
            } else {
                w[last] == want[last]
            }
    })
}

/// Uppercase, with every non-alphanumeric run collapsed to `_`.
pub fn normalize_reason(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_sep = true;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

impl ExitReasonKind {
    /// Classify a raw reason string using [`REASON_TABLE`].
    pub fn classify(raw: &str) -> Self {
        let normalized = normalize_reason(raw);
        REASON_TABLE
            .iter()
            .find(|(_, tokens)| tokens.iter().any(|t| token_matches(&normalized, t)))
            .map(|(kind, _)| *kind)
            .unwrap_or(Self::Unknown)
    }

    /// Existential threats that bypass every hold and suppression rule.
    pub fn is_true_emergency(&self) -> bool {
        matches!(
            self,
            Self::PoolMigration
                | Self::LiquidityCollapse
                | Self::OnChainFailure
                | Self::MintInconsistency
                | Self::RugSignal
                | Self::InfrastructureFailure
        )
    }

    /// Signals that must never bypass the minimum hold.
    pub fn is_not_emergency(&self) -> bool {
        matches!(
            self,
            Self::ScoreDrop
                | Self::RegimeFlip
                | Self::VelocityDrop
                | Self::FeeBleed
                | Self::HealthExit
                | Self::RankingKill
        )
    }

    pub fn is_health_triggered(&self) -> bool {
        matches!(self, Self::HealthExit)
    }

    /// Curated allow-list consulted by the final validity check.
    pub fn is_valid_exit(&self) -> bool {
        self.is_true_emergency()
            || matches!(
                self,
                Self::TakeProfit
                    | Self::StopLoss
                    | Self::TrailingStop
                    | Self::CostAmortized
                    | Self::Rotation
                    | Self::VolumeCollapse
                    | Self::OutOfRange
                    | Self::MaxHoldExpired
                    | Self::Manual
            )
    }

    /// Cooldown bucket shared by every raw string of this kind.
    pub fn cooldown_bucket(&self) -> CooldownBucket {
        match self {
            Self::ScoreDrop | Self::HealthExit => CooldownBucket::ScoreHealth,
            Self::VelocityDrop => CooldownBucket::Velocity,
            Self::RegimeFlip => CooldownBucket::Regime,
            Self::FeeBleed => CooldownBucket::FeeBleed,
            Self::RankingKill => CooldownBucket::Ranking,
            other => CooldownBucket::Other(other.label().to_string()),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PoolMigration => "POOL_MIGRATION",
            Self::LiquidityCollapse => "LIQUIDITY_COLLAPSE",
            Self::OnChainFailure => "ONCHAIN_FAILURE",
            Self::MintInconsistency => "MINT_INCONSISTENCY",
            Self::RugSignal => "RUG_SIGNAL",
            Self::InfrastructureFailure => "INFRASTRUCTURE_FAILURE",
            Self::ScoreDrop => "SCORE_DROP",
            Self::RegimeFlip => "REGIME_FLIP",
            Self::VelocityDrop => "VELOCITY_DROP",
            Self::FeeBleed => "FEE_BLEED",
            Self::HealthExit => "HEALTH_EXIT",
            Self::RankingKill => "RANKING_KILL",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::StopLoss => "STOP_LOSS",
            Self::TrailingStop => "TRAILING_STOP",
            Self::CostAmortized => "COST_AMORTIZED",
            Self::Rotation => "ROTATION",
            Self::VolumeCollapse => "VOLUME_COLLAPSE",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::MaxHoldExpired => "MAX_HOLD_EXPIRED",
            Self::Manual => "MANUAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ExitReasonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A raw reason paired with its classification. Serialized as the raw string;
/// the kind is re-derived on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ExitReason {
    pub kind: ExitReasonKind,
    pub raw: String,
}

impl ExitReason {
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            kind: ExitReasonKind::classify(&raw),
            raw,
        }
    }
}

impl From<String> for ExitReason {
    fn from(raw: String) -> Self {
        Self::parse(raw)
    }
}

impl From<ExitReason> for String {
    fn from(reason: ExitReason) -> Self {
        reason.raw
    }
}

// =============================================================================
// Cooldown buckets
// =============================================================================

/// Coarse cooldown key. Semantically equivalent signals share one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CooldownBucket {
    CostNotAmortized,
    MinHoldNotMet,
    ScoreHealth,
    Velocity,
    Regime,
    FeeBleed,
    Ranking,
    Bootstrap,
    Other(String),
}

impl CooldownBucket {
    /// Collapse a free-form suppression cause into its bucket.
    pub fn normalize(raw: &str) -> Self {
        let n = normalize_reason(raw);
        let has = |token: &str| token_matches(&n, token);
        if has("NOT_AMORTIZED") || has("COST_TARGET") {
            Self::CostNotAmortized
        } else if has("MIN_HOLD") {
            Self::MinHoldNotMet
        } else if has("BOOTSTRAP") || has("PROBE*") {
            Self::Bootstrap
        } else {
            match ExitReasonKind::classify(&n) {
                ExitReasonKind::Unknown => Self::Other(n),
                kind => kind.cooldown_bucket(),
            }
        }
    }

    /// Extended buckets get the longest suppression window.
    pub fn is_extended(&self) -> bool {
        matches!(self, Self::CostNotAmortized | Self::MinHoldNotMet)
    }

    pub fn label(&self) -> String {
        match self {
            Self::CostNotAmortized => "COST_NOT_AMORTIZED".to_string(),
            Self::MinHoldNotMet => "MIN_HOLD_NOT_MET".to_string(),
            Self::ScoreHealth => "SCORE_HEALTH".to_string(),
            Self::Velocity => "VELOCITY".to_string(),
            Self::Regime => "REGIME".to_string(),
            Self::FeeBleed => "FEE_BLEED".to_string(),
            Self::Ranking => "RANKING".to_string(),
            Self::Bootstrap => "BOOTSTRAP".to_string(),
            Self::Other(s) => s.clone(),
        }
    }
}

impl std::fmt::Display for CooldownBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

// =============================================================================
// Tests
// =============================================================================
