// =============================================================================
// LP Exit Replay: offline reproduction of decision cycles
// =============================================================================
//
// Usage:
//   lp-exit-replay <replay.json>
//
// The replay file lists the positions to open and one or more cycle
// snapshots. Each cycle runs through the decision engine exactly as the live
// scan loop would; the reports and the final engine snapshot are printed to
// stdout as JSON. Nothing here builds transactions or talks to a network.
//
// Environment (read after .env):
//   LP_EXIT_CONFIG  path to a runtime config JSON (defaults used otherwise)
//   LP_EXIT_STRICT  1/true forces strict mode, 0/false forces permissive
//   RUST_LOG        tracing filter (default: info)
// =============================================================================

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use lp_exit_core::engine::EngineSnapshot;
use lp_exit_core::exit::monitor::{CycleReport, CycleSnapshot};
use lp_exit_core::{logging, DecisionEngine, RuntimeConfig, StrictnessMode};

/// A position opened before the first replayed cycle.
#[derive(Debug, Deserialize)]
struct ReplayOpen {
    trade_id: String,
    entity_id: String,
    address: String,
    #[serde(default)]
    name: String,
    notional_usd: f64,
    #[serde(default)]
    entry_cost_usd: f64,
    opened_at_ms: i64,
    /// Fees claimed so far, booked at `opened_at_ms`.
    #[serde(default)]
    fees_accrued_usd: f64,
}

#[derive(Debug, Deserialize)]
struct ReplayFile {
    initial_capital_usd: f64,
    #[serde(default)]
    open: Vec<ReplayOpen>,
    cycles: Vec<CycleSnapshot>,
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    strictness: StrictnessMode,
    reports: Vec<CycleReport>,
    engine: EngineSnapshot,
}

fn strict_override() -> Option<StrictnessMode> {
    let raw = std::env::var("LP_EXIT_STRICT").ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(StrictnessMode::Strict),
        "0" | "false" | "no" => Some(StrictnessMode::Permissive),
        other => {
            warn!(value = other, "ignoring unrecognised LP_EXIT_STRICT");
            None
        }
    }
}

fn load_config() -> RuntimeConfig {
    let mut config = match std::env::var("LP_EXIT_CONFIG") {
        Ok(path) => RuntimeConfig::load(&path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path, "Failed to load config, using defaults");
            RuntimeConfig::default()
        }),
        Err(_) => RuntimeConfig::default(),
    };
    if let Some(mode) = strict_override() {
        config.strictness = mode;
    }
    config
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    logging::init();

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => bail!("usage: lp-exit-replay <replay.json>"),
    };

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read replay file {path}"))?;
    let replay: ReplayFile = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse replay file {path}"))?;

    let config = load_config();
    let strictness = config.strictness;
    info!(
        path = %path,
        strictness = %strictness,
        positions = replay.open.len(),
        cycles = replay.cycles.len(),
        "replay starting"
    );

    let engine = DecisionEngine::new(config, replay.initial_capital_usd);
    for p in &replay.open {
        if !engine.open_position(
            &p.trade_id,
            &p.entity_id,
            &p.address,
            &p.name,
            p.notional_usd,
            p.entry_cost_usd,
            p.opened_at_ms,
        ) {
            warn!(trade_id = %p.trade_id, "duplicate trade id in replay file");
            continue;
        }
        if p.fees_accrued_usd > 0.0 {
            engine
                .fee_state()
                .record_fees(&p.trade_id, p.fees_accrued_usd, p.opened_at_ms);
        }
    }

    let reports: Vec<CycleReport> = replay.cycles.iter().map(|c| engine.run_cycle(c)).collect();
    let error_count: usize = reports.iter().map(|r| r.errors.len()).sum();

    let output = ReplayOutput {
        strictness,
        reports,
        engine: engine.snapshot(),
    };
    let json = serde_json::to_string_pretty(&output).context("failed to serialise replay output")?;
    println!("{json}");

    if error_count > 0 && strictness.is_strict() {
        error!(errors = error_count, "replay finished with strict-mode failures");
        bail!("{error_count} strict-mode failure(s) during replay");
    }
    Ok(())
}
