use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::broker::{Broker, BrokerPosition, MarketOrder};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::execution::{
    ExecutionAction, Executor, PositionLedger, PyramidController, RetryPolicy, UnitCounts,
};
use crate::feed::{DataFeed, FeedStatus};
use crate::models::{ExitReason, Position, PyramidOrder, Side, SymbolSpec, Ticket};
use crate::risk::UnitSizer;
use crate::strategy::{Strategy, TrendStrategy};
use crate::timing::{minute_floor, ClockSync};

/// Counters for one minute cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub minute: Option<DateTime<Utc>>,
    /// Cycle did not run past the gate (unhealthy clock, duplicate minute, no broker truth)
    pub skipped: bool,
    pub bars_appended: usize,
    pub windows_reloaded: usize,
    pub externally_closed: usize,
    pub adds_filled: usize,
    pub entries: usize,
    pub exits: usize,
    pub errors: usize,
}

/// Position history written on shutdown
#[derive(Debug, Serialize)]
struct HistoryExport {
    exported_at: DateTime<Utc>,
    realized_pnl: f64,
    open_positions: Vec<Position>,
    closed_positions: Vec<Position>,
}

/// Minute-by-minute trading loop over one broker connection
pub struct Trader<B: Broker> {
    broker: B,
    config: EngineConfig,
    clock: ClockSync,
    feed: DataFeed,
    strategy: Box<dyn Strategy>,
    ledger: Arc<PositionLedger>,
    executor: Executor,
    pyramid: PyramidController,
    sizer: UnitSizer,
    retry: RetryPolicy,
    specs: HashMap<String, SymbolSpec>,
    stop: Arc<AtomicBool>,
    last_cycle_minute: Option<DateTime<Utc>>,
    /// Broker positions still have to be brought into the ledger
    needs_adoption: bool,
}

impl<B: Broker> Trader<B> {
    pub fn new(broker: B, config: EngineConfig) -> Self {
        let strategy = Box::new(TrendStrategy::new(&config.signal));
        Self::with_strategy(broker, config, strategy)
    }

    pub fn with_strategy(broker: B, config: EngineConfig, strategy: Box<dyn Strategy>) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let ledger = Arc::new(PositionLedger::new(config.units));

        Self {
            clock: ClockSync::new(config.clock.clone()),
            feed: DataFeed::new(&config.symbols, &config.window, retry),
            executor: Executor::new(Arc::clone(&ledger)),
            pyramid: PyramidController::new(&config.pyramid, retry),
            sizer: UnitSizer::new(&config.sizing),
            specs: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
            last_cycle_minute: None,
            needs_adoption: true,
            broker,
            config,
            strategy,
            ledger,
            retry,
        }
    }

    /// Flag checked between cycles and between symbols
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn ledger(&self) -> Arc<PositionLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn feed(&self) -> &DataFeed {
        &self.feed
    }

    pub fn pyramid(&self) -> &PyramidController {
        &self.pyramid
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Start-up
    // ========================================================================

    /// Synchronize the clock, load every window and adopt broker positions
    ///
    /// Nothing here is fatal: windows that fail to load are reloaded by the
    /// cycle, and adoption is retried before the next cycle trades.
    pub fn bootstrap(&mut self) {
        tracing::info!(
            "🚀 Bootstrapping {} symbols: {}",
            self.config.symbols.len(),
            self.config.symbols.join(", ")
        );

        self.clock.synchronize(&self.broker);

        for (symbol, result) in self.feed.initialize_all(&self.broker) {
            if let Err(e) = result {
                tracing::warn!("⚠️  Initial load for {} failed: {}", symbol, e);
            }
        }

        match self.adopt_broker_positions() {
            Ok(adopted) => tracing::info!(
                "✅ Bootstrap complete ({} positions adopted, offset {:+.3}s)",
                adopted,
                self.clock.offset()
            ),
            Err(e) => tracing::error!(
                "❌ Broker positions unavailable at bootstrap, adoption deferred: {}",
                e
            ),
        }
    }

    /// Bring broker positions on configured symbols into the ledger
    fn adopt_broker_positions(&mut self) -> Result<usize, EngineError> {
        let broker = &self.broker;
        let positions = self
            .retry
            .run("open_positions", || broker.open_positions(None))?;

        let mut adopted = 0;
        for bp in positions {
            if !self.config.symbols.contains(&bp.symbol) || self.ledger.contains(bp.ticket) {
                continue;
            }

            let volatility = self
                .feed
                .window(&bp.symbol)
                .and_then(|w| self.strategy.volatility(w.candles()))
                .unwrap_or(0.0);
            let stop = bp
                .stop
                .unwrap_or_else(|| self.sizer.entry_stop(bp.side, bp.price_open, volatility));
            let position = Position::open(
                bp.ticket,
                bp.symbol.clone(),
                bp.side,
                bp.volume,
                bp.price_open,
                stop,
                bp.open_time,
                volatility,
            );

            if self.ledger.open(position) {
                tracing::info!(
                    "📥 Adopted {} {} {} x{:.2} @ {:.5}",
                    bp.side,
                    bp.symbol,
                    bp.ticket,
                    bp.volume,
                    bp.price_open
                );
                adopted += 1;
            } else {
                tracing::warn!(
                    "⚠️  Broker position {} on {} exceeds unit caps, not adopted",
                    bp.ticket,
                    bp.symbol
                );
            }
        }
        self.needs_adoption = false;
        Ok(adopted)
    }

    // ========================================================================
    // Main loop
    // ========================================================================

    /// Run cycles on each server minute boundary until stopped
    ///
    /// Skipped cycles do not count towards `max_cycles`.
    ///
    /// # Arguments
    /// * `max_cycles` - Stop after this many completed cycles, if set
    pub fn run(&mut self, max_cycles: Option<u64>) -> u64 {
        let mut completed = 0;

        while !self.stop_requested() {
            if !self.clock.wait_for_boundary(&self.broker, &self.stop) {
                break;
            }

            let broker = &self.broker;
            let now = match self.retry.run("server_time", || broker.server_time()) {
                Ok(now) => now,
                Err(e) => {
                    tracing::error!("❌ Server time unavailable: {}", e);
                    continue;
                }
            };

            let report = self.run_cycle(now);
            if report.skipped {
                if report.minute.is_some() && report.minute == self.last_cycle_minute {
                    // Still inside the minute we just handled
                    thread::sleep(self.config.clock.unavailable_pause());
                }
                continue;
            }

            completed += 1;
            if max_cycles.is_some_and(|max| completed >= max) {
                break;
            }
        }

        tracing::info!("🛑 Trading loop stopped after {} cycles", completed);
        completed
    }

    /// One full cycle for the server minute containing `now`
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let minute = minute_floor(now);
        let mut report = CycleReport {
            minute: Some(minute),
            ..CycleReport::default()
        };

        if self.last_cycle_minute == Some(minute) {
            tracing::debug!(%minute, "Cycle already ran for this minute");
            report.skipped = true;
            return report;
        }

        if let Err(e) = self.clock.check_health(&self.broker) {
            tracing::error!("❌ Clock unhealthy, skipping cycle: {}", e);
            report.skipped = true;
            report.errors += 1;
            return report;
        }
        self.last_cycle_minute = Some(minute);

        for (symbol, result) in self.feed.update_all(&self.broker, now) {
            match result {
                Ok(FeedStatus::Appended { .. }) => report.bars_appended += 1,
                Ok(FeedStatus::Reloaded) => report.windows_reloaded += 1,
                Ok(FeedStatus::Unchanged) => {}
                Err(e) => {
                    tracing::warn!("⚠️  {} feed update failed: {}", symbol, e);
                    report.errors += 1;
                }
            }
        }

        if self.needs_adoption {
            if let Err(e) = self.adopt_broker_positions() {
                tracing::error!("❌ Position adoption failed, skipping trading this cycle: {}", e);
                report.skipped = true;
                report.errors += 1;
                return report;
            }
        }

        let broker_positions = match self.sync_positions(now, &mut report) {
            Ok(positions) => positions,
            Err(e) => {
                tracing::error!("❌ Position sync failed, skipping trading this cycle: {}", e);
                report.skipped = true;
                report.errors += 1;
                return report;
            }
        };

        for symbol in self.config.symbols.clone() {
            if self.stop_requested() {
                tracing::info!("Stop requested, leaving cycle before {}", symbol);
                break;
            }
            self.process_symbol(&symbol, now, &broker_positions, &mut report);
        }

        tracing::info!(
            "🔄 Cycle {} | bars +{} | entries {} | exits {} | adds {} | ext. closed {} | open units {}",
            minute.format("%H:%M"),
            report.bars_appended,
            report.entries,
            report.exits,
            report.adds_filled,
            report.externally_closed,
            self.ledger.total_open_units()
        );
        report
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Reconcile staged orders and the ledger against broker truth
    ///
    /// Filled add-ons are adopted before the ledger reconcile so a parent
    /// closed in the same minute still supplies its entry volatility. The
    /// remaining ladder of every externally closed parent is cancelled.
    /// Returns the broker's open positions.
    fn sync_positions(
        &mut self,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<Vec<BrokerPosition>, EngineError> {
        let broker = &self.broker;
        let retry = self.retry;
        let positions = retry.run("open_positions", || broker.open_positions(None))?;

        for symbol in self.pyramid.symbols() {
            let pending = match retry.run("pending_orders", || broker.pending_orders(&symbol)) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!("⚠️  Pending orders for {} unavailable: {}", symbol, e);
                    report.errors += 1;
                    continue;
                }
            };
            let pending_ids: HashSet<Ticket> = pending.iter().map(|o| o.ticket).collect();

            for order in self.pyramid.reconcile_executed(&symbol, &pending_ids) {
                match positions.iter().find(|p| p.ticket == order.id) {
                    Some(filled) => {
                        if self.adopt_add_on(&order, filled) {
                            report.adds_filled += 1;
                        }
                    }
                    None => {
                        tracing::info!(
                            "Staged add-on {} on {} no longer pending and not open",
                            order.id,
                            symbol
                        );
                        self.ledger.release_staged(&symbol, 1);
                    }
                }
            }
        }

        let open_ids: HashSet<Ticket> = positions.iter().map(|p| p.ticket).collect();
        let closed = self.ledger.reconcile(
            &open_ids,
            |ticket| match retry.run("closing_deal", || broker.closing_deal(ticket)) {
                Ok(deal) => deal,
                Err(e) => {
                    tracing::warn!("⚠️  Closing deal lookup for {} failed: {}", ticket, e);
                    None
                }
            },
            now,
        );
        report.externally_closed += closed.len();

        for parent in &closed {
            let dropped = self
                .pyramid
                .cancel_for_parent(&self.broker, &parent.symbol, parent.id);
            self.ledger.release_staged(&parent.symbol, dropped);
        }

        Ok(positions)
    }

    /// Record a filled add-on and move every other stop on the symbol to it
    fn adopt_add_on(&self, order: &PyramidOrder, filled: &BrokerPosition) -> bool {
        // Without the parent, recover the volatility from the ladder geometry
        let entry_volatility = self
            .ledger
            .open_positions(&order.symbol)
            .iter()
            .find(|p| p.id == order.parent_position_id)
            .map_or_else(
                || (order.trigger_price - order.stop_price).abs() / self.config.pyramid.stop_multiple,
                |p| p.entry_volatility,
            );

        let stop = filled.stop.unwrap_or(order.stop_price);
        let position = Position::open(
            filled.ticket,
            order.symbol.clone(),
            order.side,
            filled.volume,
            filled.price_open,
            stop,
            filled.open_time,
            entry_volatility,
        );

        if !self.ledger.open_staged(position) {
            tracing::warn!(
                "⚠️  Add-on {} on {} filled beyond unit caps, left untracked",
                filled.ticket,
                order.symbol
            );
            return false;
        }
        tracing::info!(
            "🔺 Add-on {} {} filled @ {:.5}, stops moved to {:.5}",
            order.side,
            order.symbol,
            filled.price_open,
            stop
        );

        for existing in self.ledger.open_positions(&order.symbol) {
            if existing.id == filled.ticket {
                continue;
            }
            let tighter = match existing.side {
                Side::Long => stop > existing.stop_price,
                Side::Short => stop < existing.stop_price,
            };
            if !tighter {
                continue;
            }

            let broker = &self.broker;
            match self
                .retry
                .run("modify_stop", || broker.modify_stop(existing.id, stop))
            {
                Ok(()) => {
                    if let Err(e) = self.ledger.update_stop(&order.symbol, existing.id, stop) {
                        tracing::warn!("⚠️  Ledger stop update failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!(
                    "⚠️  Stop move for {} on {} failed: {}",
                    existing.id,
                    order.symbol,
                    e
                ),
            }
        }
        true
    }

    // ========================================================================
    // Per-symbol trading
    // ========================================================================

    fn process_symbol(
        &mut self,
        symbol: &str,
        now: DateTime<Utc>,
        broker_positions: &[BrokerPosition],
        report: &mut CycleReport,
    ) {
        if !self.feed.is_ready(symbol) {
            tracing::debug!(symbol, "Window not ready, skipping");
            return;
        }
        let candles = match self.feed.window(symbol) {
            Some(window) => window.candles().to_vec(),
            None => return,
        };

        let broker_units = UnitCounts {
            symbol: broker_positions.iter().filter(|p| p.symbol == symbol).count(),
            total: broker_positions.len(),
        };
        let decision =
            self.executor
                .process_signal(symbol, &candles, self.strategy.as_ref(), broker_units);

        match decision.action {
            ExecutionAction::Enter { side } => {
                let Some(volatility) = self.strategy.volatility(&candles) else {
                    return;
                };
                match self.enter(symbol, side, volatility, broker_units) {
                    Ok(_) => report.entries += 1,
                    Err(EngineError::CapacityExceeded { .. }) => {
                        tracing::debug!(symbol, "Entry skipped at capacity")
                    }
                    Err(e) => {
                        tracing::warn!("⚠️  {} entry failed: {}", symbol, e);
                        report.errors += 1;
                    }
                }
            }
            ExecutionAction::CloseAll { exit_reason, .. } => {
                tracing::info!("{}: {}", symbol, decision.reason);
                report.exits += self.close_all(symbol, exit_reason, now);
            }
            ExecutionAction::Skip => {
                tracing::debug!(symbol, reason = %decision.reason, "No action");
            }
        }
    }

    /// Open a unit at market and stage its add-ons
    ///
    /// The unit slot is reserved before the order goes out and released if
    /// the order fails.
    pub fn enter(
        &mut self,
        symbol: &str,
        side: Side,
        volatility: f64,
        broker_units: UnitCounts,
    ) -> Result<Position, EngineError> {
        let ledger = Arc::clone(&self.ledger);
        let reservation = ledger.reserve(symbol, broker_units)?;

        let spec = self.symbol_spec(symbol)?;
        let broker = &self.broker;
        let equity = self
            .retry
            .run("account_equity", || broker.account_equity())?;
        let volume = self.sizer.unit_size(equity, volatility, &spec);

        let reference = self
            .feed
            .window(symbol)
            .and_then(|w| w.last())
            .map(|c| c.close)
            .ok_or_else(|| EngineError::DataIntegrityFailure {
                symbol: symbol.to_string(),
                reason: "no reference price".to_string(),
            })?;
        let stop = self.sizer.entry_stop(side, reference, volatility);

        let order = MarketOrder {
            symbol: symbol.to_string(),
            side,
            volume,
            stop,
        };
        let fill = self
            .retry
            .run("submit_market", || broker.submit_market(&order))?;

        let position = Position::open(
            fill.ticket,
            symbol,
            side,
            volume,
            fill.price,
            stop,
            fill.time,
            volatility,
        );
        reservation.commit(position.clone());
        tracing::info!(
            "📈 Entered {} {} {} x{:.2} @ {:.5} (stop {:.5}, vol {:.5})",
            side,
            symbol,
            fill.ticket,
            volume,
            fill.price,
            stop,
            volatility
        );

        let claimed = ledger.claim_staged(symbol, self.config.pyramid.max_orders, broker_units);
        let placed = self
            .pyramid
            .place_staged_upto(&self.broker, &position, volatility, claimed)
            .len();
        ledger.release_staged(symbol, claimed - placed);
        Ok(position)
    }

    /// Close every open unit on `symbol` and cancel its staged add-ons
    ///
    /// Returns how many units were closed.
    pub fn close_all(&mut self, symbol: &str, reason: ExitReason, now: DateTime<Utc>) -> usize {
        let dropped = self.pyramid.cancel_all(&self.broker, symbol);
        self.ledger.release_staged(symbol, dropped);

        let mut closed = 0;
        for position in self.ledger.open_positions(symbol) {
            let broker = &self.broker;
            match self
                .retry
                .run("close_position", || broker.close_position(position.id))
            {
                Ok(fill) => {
                    match self
                        .ledger
                        .close_with_reason(symbol, position.id, fill.price, fill.time, reason)
                    {
                        Ok(_) => closed += 1,
                        Err(e) => tracing::warn!("⚠️  {}", e),
                    }
                }
                Err(e) => {
                    // Left for the next reconcile if the broker already closed it
                    tracing::warn!(
                        "⚠️  Close of {} {} failed at {}: {}",
                        symbol,
                        position.id,
                        now.format("%H:%M:%S"),
                        e
                    );
                }
            }
        }
        closed
    }

    fn symbol_spec(&mut self, symbol: &str) -> Result<SymbolSpec, EngineError> {
        if let Some(spec) = self.specs.get(symbol) {
            return Ok(spec.clone());
        }
        let broker = &self.broker;
        let spec = self
            .retry
            .run("symbol_spec", || broker.symbol_spec(symbol))?;
        self.specs.insert(symbol.to_string(), spec.clone());
        Ok(spec)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Cancel staged add-ons and optionally flatten every symbol
    pub fn shutdown(&mut self, flatten: bool) {
        let now = Utc::now();
        for symbol in self.config.symbols.clone() {
            let dropped = self.pyramid.cancel_all(&self.broker, &symbol);
            self.ledger.release_staged(&symbol, dropped);
            if flatten {
                self.close_all(&symbol, ExitReason::Shutdown, now);
            }
        }

        tracing::info!(
            "👋 Shutdown: {} units open, {} closed, realized P&L {:.2}",
            self.ledger.total_open_units(),
            self.ledger.closed_positions().len(),
            self.ledger.realized_pnl()
        );
    }

    /// Write open and closed positions as JSON
    pub fn export_history(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let export = HistoryExport {
            exported_at: Utc::now(),
            realized_pnl: self.ledger.realized_pnl(),
            open_positions: self.ledger.all_open_positions(),
            closed_positions: self.ledger.closed_positions(),
        };
        let json = serde_json::to_string_pretty(&export)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write history to {}", path.display()))?;

        tracing::info!("💾 History exported to {}", path.display());
        Ok(())
    }
}
