// =============================================================================
// Exit Gate Decision: auditable record of every allow / deny verdict
// =============================================================================
//
// One decision per evaluation. The details payload carries every number the
// pipeline compared so the verdict can be reconstructed from the log line
// alone, without re-running the code.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::amortization_decay::DecayReason;
use crate::cooldown::CooldownStatus;
use crate::reason::ExitReasonKind;
use crate::types::EntityClass;

/// Which pipeline step produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitGateCategory {
    TrueEmergency,
    EmergencyOverride,
    Rotation,
    Harmonic,
    CostAmortized,
    SuppressedMinHold,
    SuppressedNoise,
    SuppressedBootstrap,
    Blocked,
    Allowed,
}

impl ExitGateCategory {
    pub fn is_suppression(&self) -> bool {
        matches!(
            self,
            Self::SuppressedMinHold
                | Self::SuppressedNoise
                | Self::SuppressedBootstrap
                | Self::Blocked
        )
    }
}

impl std::fmt::Display for ExitGateCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrueEmergency => "TRUE_EMERGENCY",
            Self::EmergencyOverride => "EMERGENCY_OVERRIDE",
            Self::Rotation => "ROTATION",
            Self::Harmonic => "HARMONIC",
            Self::CostAmortized => "COST_AMORTIZED",
            Self::SuppressedMinHold => "SUPPRESSED_MIN_HOLD",
            Self::SuppressedNoise => "SUPPRESSED_NOISE",
            Self::SuppressedBootstrap => "SUPPRESSED_BOOTSTRAP",
            Self::Blocked => "BLOCKED",
            Self::Allowed => "ALLOWED",
        };
        f.write_str(s)
    }
}

/// Numbers and flags the pipeline looked at.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionDetails {
    pub hold_time_minutes: f64,
    pub min_hold_minutes: f64,
    pub tier: EntityClass,
    pub entry_cost_usd: f64,
    pub fees_accrued_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective_cost_target_usd: Option<f64>,
    /// Informational amortization verdict; never blocks an exit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_verdict: Option<DecayReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags_used: Vec<String>,
    /// Cooldown state after the suppression was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<CooldownStatus>,
}

/// Complete verdict of one exit gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitGateDecision {
    /// Unique identifier for this decision (UUID v4).
    pub id: String,
    pub entity_id: String,
    pub reason_kind: ExitReasonKind,
    pub raw_reason: String,
    pub allowed: bool,
    pub category: ExitGateCategory,
    /// Human-readable explanation of the verdict.
    pub reason: String,
    pub details: DecisionDetails,
    pub evaluated_at_ms: i64,
}

impl ExitGateDecision {
    pub fn allow(
        entity_id: impl Into<String>,
        reason_kind: ExitReasonKind,
        raw_reason: impl Into<String>,
        category: ExitGateCategory,
        reason: impl Into<String>,
        details: DecisionDetails,
        now_ms: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: entity_id.into(),
            reason_kind,
            raw_reason: raw_reason.into(),
            allowed: true,
            category,
            reason: reason.into(),
            details,
            evaluated_at_ms: now_ms,
        }
    }

    pub fn deny(
        entity_id: impl Into<String>,
        reason_kind: ExitReasonKind,
        raw_reason: impl Into<String>,
        category: ExitGateCategory,
        reason: impl Into<String>,
        details: DecisionDetails,
        now_ms: i64,
    ) -> Self {
        Self {
            allowed: false,
            ..Self::allow(entity_id, reason_kind, raw_reason, category, reason, details, now_ms)
        }
    }

    /// Whether this decision deserves a log line, honouring cooldown
    /// throttling for repeated suppressions.
    pub fn should_log(&self) -> bool {
        self.details.cooldown.map(|c| c.should_log).unwrap_or(true)
    }
}
