use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use trendbot::broker::{Broker, PaperBroker};
use trendbot::config::{EngineConfig, PaperConfig};
use trendbot::timing::ServerClock;
use trendbot::*;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 10, 29, 9, 0, 0).unwrap()
}

fn minute(m: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(m)
}

fn bar(m: i64, close: f64, half_range: f64) -> Candle {
    Candle {
        open_time: minute(m),
        open: close,
        high: close + half_range,
        low: close - half_range,
        close,
        volume: 500.0,
    }
}

const INDICES: [&str; 5] = ["NAS100", "US30", "SPX500", "GER40", "UK100"];

fn test_config() -> EngineConfig {
    config_for(&["NAS100"])
}

fn config_for(symbols: &[&str]) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.symbols = symbols.iter().map(|s| s.to_string()).collect();
    config.clock.sample_interval_ms = 0;
    config.clock.health_backoff_ms = 0;
    config.clock.unavailable_pause_ms = 0;
    config.retry.delay_ms = 0;
    config
}

/// Venue at minute 60 holding bars 0..=60; bar 60 is still forming
fn venue(closes: impl Fn(i64) -> f64, half_range: f64) -> Arc<PaperBroker> {
    venue_for(&["NAS100"], closes, half_range)
}

fn venue_for(symbols: &[&str], closes: impl Fn(i64) -> f64, half_range: f64) -> Arc<PaperBroker> {
    let broker = Arc::new(PaperBroker::manual(&PaperConfig::default(), minute(60)));
    for symbol in symbols {
        broker.add_symbol(
            symbol,
            SymbolSpec::default(),
            (0..=60).map(|m| bar(m, closes(m), half_range)).collect(),
        );
    }
    broker
}

/// Push the bar that starts minute `m` and move the server clock onto it
fn step(broker: &PaperBroker, m: i64, close: f64, half_range: f64) {
    step_all(broker, &["NAS100"], m, close, half_range);
}

fn step_all(broker: &PaperBroker, symbols: &[&str], m: i64, close: f64, half_range: f64) {
    for symbol in symbols {
        broker.push_bar(symbol, bar(m, close, half_range));
    }
    broker.set_time(minute(m));
}

#[test]
fn test_entry_pyramid_fill_and_external_close() {
    let _ = tracing_subscriber::fmt::try_init();

    let broker = venue(|m| 100.0 + m as f64, 0.5);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    assert!(trader.feed().is_ready("NAS100"));
    assert_eq!(trader.ledger().total_open_units(), 0);

    // 1. Rising window enters long and stages add-ons in the free slots
    step(&broker, 61, 161.0, 0.5);
    let report = trader.run_cycle(minute(61));

    assert!(!report.skipped);
    assert_eq!(report.bars_appended, 1);
    assert_eq!(report.entries, 1);
    let ledger = trader.ledger();
    let parent = ledger.open_positions("NAS100")[0].clone();
    assert_eq!(parent.side, Side::Long);
    assert_eq!(parent.entry_price, 161.0);
    assert!((parent.stop_price - 157.0).abs() < 0.01);
    assert_eq!(trader.pyramid().pending_count("NAS100"), 3);
    assert_eq!(broker.order_count(), 3);

    // 2. First staged level fills at the venue; the next cycle adopts it
    step(&broker, 62, 161.9, 0.5);
    let report = trader.run_cycle(minute(62));

    assert_eq!(report.adds_filled, 1);
    assert_eq!(ledger.total_open_units(), 2);
    assert_eq!(trader.pyramid().pending_count("NAS100"), 2);

    let positions = ledger.open_positions("NAS100");
    let add_on = positions.iter().find(|p| p.id != parent.id).unwrap();
    assert!((add_on.entry_price - 161.75).abs() < 0.01);
    assert_eq!(add_on.entry_volatility, parent.entry_volatility);

    // Parent stop moved up to the add-on's stop, in the ledger and at the broker
    let moved = positions.iter().find(|p| p.id == parent.id).unwrap();
    assert_eq!(moved.stop_price, add_on.stop_price);
    assert_eq!(broker.position(parent.id).unwrap().stop, Some(add_on.stop_price));

    // 3. Parent closed by hand at the venue
    broker.close_external(parent.id, 160.0).unwrap();
    step(&broker, 63, 161.9, 0.5);
    let report = trader.run_cycle(minute(63));

    assert_eq!(report.externally_closed, 1);
    assert_eq!(ledger.total_open_units(), 1);
    let history = ledger.closed_positions();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exit_reason, Some(ExitReason::ExternalClose));
    assert_eq!(history[0].exit_price, Some(160.0));
    assert_eq!(ledger.total_open_units(), broker.position_count());

    // The rest of the parent's ladder went with it
    assert_eq!(broker.order_count(), 0);
    assert_eq!(trader.pyramid().pending_count("NAS100"), 0);
    assert_eq!(ledger.staged_units("NAS100"), 0);
}

#[test]
fn test_external_close_frees_ladder_for_next_entry() {
    let broker = venue(|m| 100.0 + m as f64, 0.5);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    step(&broker, 61, 161.0, 0.5);
    trader.run_cycle(minute(61));
    let ledger = trader.ledger();
    let parent = ledger.open_positions("NAS100")[0].clone();
    assert_eq!(broker.order_count(), 3);

    // Stopped out by hand; the trend is still up, so the engine re-enters
    broker.close_external(parent.id, 160.5).unwrap();
    step(&broker, 62, 161.1, 0.5);
    let report = trader.run_cycle(minute(62));

    assert_eq!(report.externally_closed, 1);
    assert_eq!(report.entries, 1);
    let reentry = ledger.open_positions("NAS100")[0].clone();
    assert_ne!(reentry.id, parent.id);

    let pending = trader.pyramid().pending("NAS100");
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|o| o.parent_position_id == reentry.id));
    assert!(pending.iter().all(|o| o.trigger_price > reentry.entry_price));
    assert_eq!(broker.order_count(), 3);
    assert_eq!(ledger.staged_units("NAS100"), 3);
}

#[test]
fn test_staged_add_ons_hold_unit_slots_across_symbols() {
    let broker = venue_for(&INDICES, |m| 100.0 + m as f64, 0.5);
    let mut trader = Trader::new(Arc::clone(&broker), config_for(&INDICES));
    trader.bootstrap();

    step_all(&broker, &INDICES, 61, 161.0, 0.5);
    let report = trader.run_cycle(minute(61));

    // Three full ladders plus a partial one exhaust the 15 slots
    assert_eq!(report.entries, 4);
    let ledger = trader.ledger();
    let staged: usize = INDICES.iter().map(|s| trader.pyramid().pending_count(s)).sum();
    assert_eq!(staged, 11);
    assert_eq!(ledger.total_open_units() + staged, 15);
    assert!(ledger.open_positions("UK100").is_empty());
    assert_eq!(broker.order_count(), staged);

    // Rally through every trigger
    step_all(&broker, &INDICES, 62, 164.0, 0.5);
    let report = trader.run_cycle(minute(62));

    assert_eq!(report.adds_filled, staged);
    assert_eq!(broker.position_count(), 15);
    assert_eq!(ledger.total_open_units(), broker.position_count());
    assert_eq!(broker.order_count(), 0);
    for symbol in INDICES {
        assert_eq!(ledger.staged_units(symbol), 0);
    }
}

#[test]
fn test_exit_signal_closes_all_and_cancels_staged() {
    let broker = venue(|m| 200.0 - m as f64, 10.0);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    step(&broker, 61, 139.0, 10.0);
    let report = trader.run_cycle(minute(61));
    assert_eq!(report.entries, 1);

    let ledger = trader.ledger();
    assert_eq!(ledger.open_positions("NAS100")[0].side, Side::Short);
    assert_eq!(broker.order_count(), 3);

    // Sharp rally breaks the bearish alignment before the stop is reached
    let mut exits = 0;
    for (i, m) in (62..=70).enumerate() {
        step(&broker, m, 145.0 + 6.0 * i as f64, 10.0);
        let report = trader.run_cycle(minute(m));
        exits += report.exits;
        if exits > 0 {
            break;
        }
    }

    assert_eq!(exits, 1);
    assert_eq!(ledger.total_open_units(), 0);
    assert_eq!(broker.position_count(), 0);
    assert_eq!(broker.order_count(), 0);
    assert_eq!(trader.pyramid().pending_count("NAS100"), 0);

    let closed = ledger.closed_positions();
    assert_eq!(closed[0].exit_reason, Some(ExitReason::Signal));
    // Short closed above entry
    assert!(closed[0].realized_pnl.unwrap() < 0.0);
}

#[test]
fn test_bootstrap_adopts_broker_positions() {
    let broker = venue(|_| 150.0, 1.0);
    let adopted = broker.open_external("NAS100", Side::Long, 1.0, 150.0, Some(140.0));
    broker.open_external("XAUUSD", Side::Short, 1.0, 2700.0, None);

    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    let ledger = trader.ledger();
    assert_eq!(ledger.total_open_units(), 1);
    let position = &ledger.open_positions("NAS100")[0];
    assert_eq!(position.id, adopted);
    assert_eq!(position.stop_price, 140.0);
}

#[test]
fn test_reconcile_without_trade_history_uses_entry_price() {
    let broker = venue(|_| 150.0, 1.0);
    let ticket = broker.open_external("NAS100", Side::Long, 2.0, 148.0, Some(140.0));
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    broker.close_external(ticket, 155.0).unwrap();
    broker.discard_trade_history();
    step(&broker, 61, 150.0, 1.0);
    let report = trader.run_cycle(minute(61));

    assert_eq!(report.externally_closed, 1);
    let closed = trader.ledger().closed_positions();
    assert_eq!(closed[0].exit_price, Some(148.0));
    assert_eq!(closed[0].realized_pnl, Some(0.0));
}

#[test]
fn test_bootstrap_survives_unreachable_broker() {
    let broker = venue(|_| 150.0, 1.0);
    let ticket = broker.open_external("NAS100", Side::Long, 1.0, 150.0, Some(140.0));
    let mut trader = Trader::new(Arc::clone(&broker), test_config());

    broker.fail_next_calls(1_000);
    trader.bootstrap();
    assert_eq!(trader.ledger().total_open_units(), 0);
    assert!(!trader.feed().is_ready("NAS100"));

    // Venue comes back: the first cycle reloads the window and adopts
    broker.fail_next_calls(0);
    step(&broker, 61, 150.0, 1.0);
    let report = trader.run_cycle(minute(61));

    assert!(!report.skipped);
    assert_eq!(report.windows_reloaded, 1);
    assert!(trader.ledger().contains(ticket));
    assert!(trader.feed().is_ready("NAS100"));
}

#[test]
fn test_run_counts_only_cycles_that_trade() {
    let broker = venue(|m| 100.0 + m as f64, 0.5);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();
    step(&broker, 61, 161.0, 0.5);

    // Boundary wait and server-time read succeed, the health check does not
    broker.fail_calls_after(2, 3);
    assert_eq!(trader.run(Some(1)), 1);

    // The counted cycle is the one that actually traded
    assert_eq!(trader.ledger().total_open_units(), 1);
}

#[test]
fn test_duplicate_minute_is_skipped() {
    let broker = venue(|_| 150.0, 1.0);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    step(&broker, 61, 150.0, 1.0);
    let first = trader.run_cycle(minute(61));
    let second = trader.run_cycle(minute(61) + Duration::seconds(20));

    assert!(!first.skipped);
    assert!(second.skipped);
    assert_eq!(second.bars_appended, 0);
}

#[test]
fn test_unhealthy_clock_skips_cycle_then_recovers() {
    let broker = venue(|_| 150.0, 1.0);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    step(&broker, 61, 150.0, 1.0);
    broker.fail_next_calls(3);
    let report = trader.run_cycle(minute(61));
    assert!(report.skipped);
    assert_eq!(report.errors, 1);

    // Same minute is retried once the venue answers again
    let report = trader.run_cycle(minute(61));
    assert!(!report.skipped);
    assert_eq!(report.bars_appended, 1);
}

#[test]
fn test_capacity_blocks_entry() {
    let broker = venue(|m| 100.0 + m as f64, 0.5);
    for _ in 0..15 {
        broker.open_external("EURUSD", Side::Long, 0.1, 1.08, None);
    }

    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();

    step(&broker, 61, 161.0, 0.5);
    let report = trader.run_cycle(minute(61));

    assert_eq!(report.entries, 0);
    assert_eq!(trader.ledger().total_open_units(), 0);
    assert_eq!(broker.position_count(), 15);
}

#[test]
fn test_stop_flag_ends_run_before_first_cycle() {
    let broker = venue(|_| 150.0, 1.0);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.stop_handle().store(true, Ordering::SeqCst);

    assert_eq!(trader.run(Some(5)), 0);
}

#[test]
fn test_shutdown_flatten_and_export() {
    let broker = venue(|m| 100.0 + m as f64, 0.5);
    let mut trader = Trader::new(Arc::clone(&broker), test_config());
    trader.bootstrap();
    step(&broker, 61, 161.0, 0.5);
    trader.run_cycle(minute(61));
    assert_eq!(trader.ledger().total_open_units(), 1);

    trader.shutdown(true);
    assert_eq!(broker.position_count(), 0);
    assert_eq!(broker.order_count(), 0);

    let dir = std::env::temp_dir().join(format!("trendbot-export-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("history.json");
    trader.export_history(&path).unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let closed = json["closed_positions"].as_array().unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0]["exit_reason"], "Shutdown");
    assert!(json["open_positions"].as_array().unwrap().is_empty());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_shared_broker_reports_manual_time() {
    let broker = venue(|_| 150.0, 1.0);
    let shared: Arc<PaperBroker> = Arc::clone(&broker);
    assert_eq!(shared.server_time().unwrap(), minute(60));
    assert_eq!(shared.recent_bars("NAS100", 3).unwrap().len(), 3);
}
