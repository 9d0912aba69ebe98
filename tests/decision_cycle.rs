// End-to-end decision cycles through the public `DecisionEngine` API.

use lp_exit_core::exit::gate::ExitGateInput;
use lp_exit_core::exit::monitor::{CyclePosition, CycleSnapshot, ExitFill};
use lp_exit_core::types::MS_PER_MINUTE;
use lp_exit_core::{
    ConsistencyErrorType, CoreError, DecisionEngine, ExitGateCategory, PnlError, PnlInput,
    PositionNotional, RuntimeConfig, StrictnessMode,
};

const EPS: f64 = 1e-9;

fn engine(mode: StrictnessMode) -> DecisionEngine {
    let config = RuntimeConfig {
        strictness: mode,
        ..RuntimeConfig::default()
    };
    DecisionEngine::new(config, 10_000.0)
}

fn position(trade_id: &str, reason: &str, notional: f64, fill: Option<ExitFill>) -> CyclePosition {
    CyclePosition {
        trade_id: trade_id.to_string(),
        address: format!("addr-{trade_id}"),
        name: format!("pool {trade_id}"),
        signal: ExitGateInput::new(format!("pool-{trade_id}"), reason, 0, notional),
        fill,
    }
}

fn open_book(e: &DecisionEngine) {
    for (id, notional) in [("t1", 4_000.0), ("t2", 3_500.0), ("t3", 2_500.0)] {
        assert!(e.open_position(
            id,
            &format!("pool-{id}"),
            &format!("addr-{id}"),
            &format!("pool {id}"),
            notional,
            5.0,
            0,
        ));
    }
}

#[test]
fn mixed_cycle_only_prices_the_allowed_exit() {
    let e = engine(StrictnessMode::Permissive);
    open_book(&e);

    let rug_fill = ExitFill {
        exit_notional_usd: 2_400.0,
        entry_notional_usd: None,
        entry_fees_usd: 1.0,
        exit_fees_usd: 1.0,
        entry_slippage_usd: 0.5,
        exit_slippage_usd: 0.5,
        observed_net_pnl_usd: None,
    };
    let snapshot = CycleSnapshot {
        now_ms: 30 * MS_PER_MINUTE,
        positions: vec![
            position("t1", "take profit", 4_000.0, None),
            position("t2", "score drop", 3_500.0, None),
            position("t3", "rug pull detected", 2_500.0, Some(rug_fill)),
        ],
        live_positions: None,
        reported_deployed_usd: None,
    };

    let report = e.run_cycle(&snapshot);

    let categories: Vec<ExitGateCategory> = report.decisions.iter().map(|d| d.category).collect();
    assert_eq!(
        categories,
        vec![
            ExitGateCategory::SuppressedMinHold,
            ExitGateCategory::SuppressedNoise,
            ExitGateCategory::TrueEmergency,
        ]
    );

    assert_eq!(report.closed.len(), 1);
    let closed = &report.closed[0];
    assert_eq!(closed.trade_id, "t3");
    assert!((closed.record.net_pnl_usd - (-103.0)).abs() < EPS);
    assert!(closed.adjustment.as_ref().unwrap().applied);

    assert!(!e.pnl_ledger().exists("t1"), "denied exits never reach the ledger");
    assert!(!e.pnl_ledger().exists("t2"));

    assert!((report.capital.capital_usd - 9_897.0).abs() < EPS);
    assert!((report.capital.deployed_usd - 7_500.0).abs() < EPS);

    let portfolio = report.portfolio.expect("portfolio check ran");
    assert!(portfolio.consistent());
    assert_eq!(portfolio.snapshot.position_count, 2);
    assert!(report.errors.is_empty());
}

#[test]
fn repeated_noise_is_throttled_by_cooldown() {
    let e = engine(StrictnessMode::Permissive);
    let input = ExitGateInput::new("pool-x", "velocity drop", 0, 1_000.0);

    let logged: Vec<bool> = (0..12)
        .map(|i| e.evaluate_exit_gate(&input, i * 10_000).should_log())
        .collect();

    let mut expected = vec![false; 12];
    expected[0] = true;
    expected[9] = true;
    assert_eq!(logged, expected, "first suppression and every 10th are logged");
    assert!(e.recent_decisions().iter().all(|d| !d.allowed));
    let entries = e.cooldowns().snapshot("pool-x");
    assert_eq!(entries.len(), 1, "all variants share one bucket");
    assert_eq!(entries[0].suppression_count, 12);
}

#[test]
fn strict_mode_refuses_ledger_mismatch() {
    let e = engine(StrictnessMode::Strict);
    e.open_position("t1", "pool-t1", "addr-t1", "pool t1", 1_000.0, 0.0, 0);

    let fill = ExitFill {
        exit_notional_usd: 1_050.0,
        entry_notional_usd: None,
        entry_fees_usd: 2.0,
        exit_fees_usd: 2.0,
        entry_slippage_usd: 1.0,
        exit_slippage_usd: 1.0,
        observed_net_pnl_usd: Some(30.0),
    };
    let report = e.run_cycle(&CycleSnapshot {
        now_ms: 90 * MS_PER_MINUTE,
        positions: vec![position("t1", "stop loss", 1_000.0, Some(fill))],
        live_positions: None,
        reported_deployed_usd: None,
    });

    assert_eq!(report.allowed_count(), 1);
    assert!(report.closed.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].trade_id.as_deref(), Some("t1"));
    assert!(!e.pnl_ledger().exists("t1"));
    assert!((e.capital().capital_usd() - 10_000.0).abs() < EPS);
    assert!(e.capital().is_open("t1"));
}

#[test]
fn permissive_quarantine_blocks_capital_adjustment() {
    let e = engine(StrictnessMode::Permissive);
    let input = PnlInput {
        trade_id: "t9".into(),
        entity_id: "pool-9".into(),
        entry_notional_usd: 1_000.0,
        exit_notional_usd: 1_050.0,
        entry_fees_usd: 2.0,
        exit_fees_usd: 2.0,
        entry_slippage_usd: 1.0,
        exit_slippage_usd: 1.0,
        observed_net_pnl_usd: Some(0.0),
    };

    let record = e.compute_canonical_pnl(&input, 0).unwrap();
    assert!(!record.invariant_valid);
    assert_eq!(e.pnl_ledger().quarantine_len(), 1);

    let adj = e.apply_to_capital("t9", 10_000.0);
    assert!(!adj.applied);
    assert_eq!(adj.new_capital_usd, 10_000.0);
    assert_eq!(adj.adjustment_usd, 0.0);
    // Persistence may still read the five fields of the flagged record.
    assert!(e.get_db_fields("t9").is_some());
}

#[test]
fn sub_minimum_notional_surfaces_as_error() {
    let e = engine(StrictnessMode::Permissive);
    let input = PnlInput {
        trade_id: "dust".into(),
        entity_id: "pool".into(),
        entry_notional_usd: 0.25,
        exit_notional_usd: 0.30,
        entry_fees_usd: 0.0,
        exit_fees_usd: 0.0,
        entry_slippage_usd: 0.0,
        exit_slippage_usd: 0.0,
        observed_net_pnl_usd: None,
    };
    let err = e.compute_canonical_pnl(&input, 0).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Pnl(PnlError::NotionalBelowMinimum { .. })
    ));
    assert!(e.get_db_fields("dust").is_none());
}

#[test]
fn portfolio_check_through_engine() {
    let e = engine(StrictnessMode::Permissive);
    let positions = vec![
        PositionNotional::new("a", "A", 6_000.0),
        PositionNotional::new("b", "B", 4_000.0),
    ];

    let ok = e.check_portfolio_consistency(&positions, 10_000.60, 0).unwrap();
    assert!(ok.consistent());

    let bad = e.check_portfolio_consistency(&positions, 9_998.0, 1).unwrap();
    assert!(!bad.consistent());
    assert_eq!(bad.error_type, Some(ConsistencyErrorType::MissingPositions));
    assert_eq!(e.consistency().consecutive_violations(), 1);

    let strict = engine(StrictnessMode::Strict);
    assert!(strict.check_portfolio_consistency(&positions, 9_998.0, 0).is_err());
}

#[test]
fn snapshot_json_round_trips_through_a_cycle() {
    let e = engine(StrictnessMode::Permissive);
    e.open_position("t1", "pool-1", "a1", "SOL-USDC", 1_000.0, 0.0, 0);

    let json = r#"{
        "now_ms": 3600000,
        "positions": [{
            "trade_id": "t1",
            "address": "a1",
            "name": "SOL-USDC",
            "signal": {
                "entity_id": "pool-1",
                "reason": "Take Profit hit",
                "entry_time_ms": 0,
                "notional_usd": 1000.0
            },
            "fill": { "exit_notional_usd": 1050.0 }
        }]
    }"#;
    let snapshot: CycleSnapshot = serde_json::from_str(json).unwrap();
    let report = e.run_cycle(&snapshot);

    assert_eq!(report.decisions[0].category, ExitGateCategory::Allowed);
    assert_eq!(report.closed.len(), 1);
    assert!((report.capital.capital_usd - 10_050.0).abs() < EPS);

    let out = serde_json::to_value(&report).unwrap();
    assert_eq!(out["decisions"][0]["category"], "ALLOWED");
    assert_eq!(out["portfolio"]["consistent"], true);
}
