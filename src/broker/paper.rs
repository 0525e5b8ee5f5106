use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    Broker, BrokerPosition, ClosedDeal, Fill, MarketOrder, PendingOrder, StopEntryOrder,
};
use crate::config::PaperConfig;
use crate::error::BrokerError;
use crate::models::{Candle, Side, SymbolSpec, Ticket};
use crate::timing::{minute_floor, ServerClock};

/// Bars of history generated when a symbol is listed
const HISTORY_BARS: i64 = 180;

const RETCODE_REJECT: i32 = 10006;
const RETCODE_INVALID_VOLUME: i32 = 10014;
const RETCODE_INVALID_PRICE: i32 = 10015;
const RETCODE_UNKNOWN_SYMBOL: i32 = 4301;

#[derive(Debug, Clone, Copy)]
enum PaperClock {
    /// Time only moves when the owner advances it
    Manual(DateTime<Utc>),
    /// Local wall clock shifted by a fixed skew
    Wall { offset: Duration },
}

#[derive(Debug)]
struct Market {
    spec: SymbolSpec,
    bars: Vec<Candle>,
    /// Random-walk markets extend themselves as the clock moves
    generated: bool,
    drift: f64,
}

impl Market {
    fn price(&self) -> Option<f64> {
        self.bars.last().map(|bar| bar.close)
    }

    fn point_value(&self) -> f64 {
        self.spec.tick_value / self.spec.tick_size
    }
}

#[derive(Debug)]
struct PaperState {
    clock: PaperClock,
    markets: BTreeMap<String, Market>,
    positions: BTreeMap<Ticket, BrokerPosition>,
    orders: BTreeMap<Ticket, PendingOrder>,
    deals: HashMap<Ticket, ClosedDeal>,
    next_ticket: u64,
    balance: f64,
    rng: StdRng,
    bar_volatility: f64,
    failing_calls: u32,
    /// Calls answered normally before `failing_calls` start
    passing_calls: u32,
    order_outcomes: VecDeque<bool>,
    keep_history: bool,
}

impl PaperState {
    fn now(&self) -> DateTime<Utc> {
        match self.clock {
            PaperClock::Manual(t) => t,
            PaperClock::Wall { offset } => Utc::now() + offset,
        }
    }

    fn issue_ticket(&mut self) -> Ticket {
        self.next_ticket += 1;
        Ticket(self.next_ticket)
    }

    /// Consume one simulated outage, if any are queued
    fn check_available(&mut self) -> Result<(), BrokerError> {
        if self.passing_calls > 0 {
            self.passing_calls -= 1;
            return Ok(());
        }
        if self.failing_calls > 0 {
            self.failing_calls -= 1;
            return Err(BrokerError::Unavailable("simulated terminal outage".into()));
        }
        Ok(())
    }

    fn check_order_outcome(&mut self) -> Result<(), BrokerError> {
        if let Some(false) = self.order_outcomes.pop_front() {
            return Err(BrokerError::Rejected {
                code: RETCODE_REJECT,
                message: "simulated rejection".into(),
            });
        }
        Ok(())
    }

    fn market(&self, symbol: &str) -> Result<&Market, BrokerError> {
        self.markets.get(symbol).ok_or_else(|| BrokerError::Rejected {
            code: RETCODE_UNKNOWN_SYMBOL,
            message: format!("unknown symbol {symbol}"),
        })
    }

    /// Generate bars for random-walk markets up to the current minute
    fn catch_up(&mut self) {
        let current = minute_floor(self.now());
        let symbols: Vec<String> = self
            .markets
            .iter()
            .filter(|(_, m)| m.generated)
            .map(|(s, _)| s.clone())
            .collect();

        for symbol in symbols {
            loop {
                let next_time = match self.markets.get(&symbol).and_then(|m| m.bars.last()) {
                    Some(last) if last.open_time < current => last.open_time + Duration::minutes(1),
                    _ => break,
                };
                let bar = self.random_bar(&symbol, next_time);
                if let Some(market) = self.markets.get_mut(&symbol) {
                    market.bars.push(bar.clone());
                }
                self.settle_bar(&symbol, &bar);
            }
        }
    }

    fn random_bar(&mut self, symbol: &str, open_time: DateTime<Utc>) -> Candle {
        let vol = self.bar_volatility;
        let (open, mut drift) = match self.markets.get(symbol) {
            Some(m) => (m.price().unwrap_or(1.0), m.drift),
            None => (1.0, 0.0),
        };

        if self.rng.gen_bool(0.02) {
            drift = -drift;
        }
        let ret = drift + vol * self.rng.gen_range(-1.7..1.7);
        let close = (open * (1.0 + ret)).max(0.0);
        let high = open.max(close) * (1.0 + vol * self.rng.gen_range(0.0..0.5));
        let low = open.min(close) * (1.0 - vol * self.rng.gen_range(0.0..0.5));
        let volume = 1000.0 * self.rng.gen_range(0.5..1.5);

        if let Some(market) = self.markets.get_mut(symbol) {
            market.drift = drift;
        }

        Candle {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Apply one bar's range to stops and pending stop-entry orders
    fn settle_bar(&mut self, symbol: &str, bar: &Candle) {
        let stopped: Vec<(Ticket, f64)> = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .filter_map(|p| {
                let stop = p.stop?;
                let hit = match p.side {
                    Side::Long => bar.low <= stop,
                    Side::Short => bar.high >= stop,
                };
                hit.then_some((p.ticket, stop))
            })
            .collect();

        for (ticket, stop) in stopped {
            tracing::debug!(%ticket, stop, "Paper stop-out");
            self.close_at(ticket, stop, bar.open_time);
        }

        let triggered: Vec<Ticket> = self
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .filter(|o| match o.side {
                Side::Long => bar.high >= o.trigger_price,
                Side::Short => bar.low <= o.trigger_price,
            })
            .map(|o| o.ticket)
            .collect();

        for ticket in triggered {
            self.fill_order(ticket, bar.open_time);
        }
    }

    /// Convert a pending order into a position carrying the same ticket
    fn fill_order(&mut self, ticket: Ticket, time: DateTime<Utc>) -> bool {
        let Some(order) = self.orders.remove(&ticket) else {
            return false;
        };
        tracing::debug!(%ticket, price = order.trigger_price, "Paper stop-entry filled");
        self.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: order.symbol,
                side: order.side,
                volume: order.volume,
                price_open: order.trigger_price,
                stop: Some(order.stop),
                open_time: time,
            },
        );
        true
    }

    fn close_at(&mut self, ticket: Ticket, price: f64, time: DateTime<Utc>) -> Option<Fill> {
        let position = self.positions.remove(&ticket)?;
        let point_value = self
            .markets
            .get(&position.symbol)
            .map(Market::point_value)
            .unwrap_or(1.0);
        let pnl = (price - position.price_open) * position.side.sign() * position.volume * point_value;
        self.balance += pnl;
        self.deals.insert(
            ticket,
            ClosedDeal {
                price,
                time,
                commission: 0.0,
                swap: 0.0,
            },
        );
        Some(Fill {
            ticket,
            price,
            time,
        })
    }

    fn floating_pnl(&self) -> f64 {
        self.positions
            .values()
            .filter_map(|p| {
                let market = self.markets.get(&p.symbol)?;
                let price = market.price()?;
                Some((price - p.price_open) * p.side.sign() * p.volume * market.point_value())
            })
            .sum()
    }
}

/// In-memory venue for dry runs and tests
///
/// Markets are either scripted (bars pushed by the caller) or generated by a
/// seeded random walk that advances with the clock. Stop-entry orders fill
/// and protective stops trigger when a bar's range crosses them.
#[derive(Debug)]
pub struct PaperBroker {
    state: Mutex<PaperState>,
    start_price: f64,
}

impl PaperBroker {
    /// Paper venue driven by the local wall clock
    pub fn new(config: &PaperConfig) -> Self {
        Self::with_clock(
            config,
            PaperClock::Wall {
                offset: Duration::seconds(config.clock_offset_secs),
            },
        )
    }

    /// Paper venue whose clock only moves through `set_time` and `advance`
    pub fn manual(config: &PaperConfig, start: DateTime<Utc>) -> Self {
        Self::with_clock(config, PaperClock::Manual(start))
    }

    fn with_clock(config: &PaperConfig, clock: PaperClock) -> Self {
        Self {
            state: Mutex::new(PaperState {
                clock,
                markets: BTreeMap::new(),
                positions: BTreeMap::new(),
                orders: BTreeMap::new(),
                deals: HashMap::new(),
                next_ticket: 1000,
                balance: config.equity,
                rng: StdRng::seed_from_u64(config.seed),
                bar_volatility: config.bar_volatility,
                failing_calls: 0,
                passing_calls: 0,
                order_outcomes: VecDeque::new(),
                keep_history: true,
            }),
            start_price: config.start_price,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// List a random-walk symbol with history ending at the current minute
    pub fn add_generated_symbol(&self, symbol: &str, spec: SymbolSpec) {
        let mut state = self.lock();
        let current = minute_floor(state.now());
        let drift = state.bar_volatility * 0.15;
        let seed_bar = Candle {
            open_time: current - Duration::minutes(HISTORY_BARS),
            open: self.start_price,
            high: self.start_price,
            low: self.start_price,
            close: self.start_price,
            volume: 1000.0,
        };
        state.markets.insert(
            symbol.to_string(),
            Market {
                spec,
                bars: vec![seed_bar],
                generated: true,
                drift,
            },
        );
        state.catch_up();
        tracing::debug!(symbol, "Paper symbol listed");
    }

    /// List a symbol whose bars are supplied by the caller
    pub fn add_symbol(&self, symbol: &str, spec: SymbolSpec, bars: Vec<Candle>) {
        self.lock().markets.insert(
            symbol.to_string(),
            Market {
                spec,
                bars,
                generated: false,
                drift: 0.0,
            },
        );
    }

    /// Append a bar to a scripted symbol and settle stops and orders against it
    pub fn push_bar(&self, symbol: &str, bar: Candle) {
        let mut state = self.lock();
        if let Some(market) = state.markets.get_mut(symbol) {
            market.bars.push(bar.clone());
            state.settle_bar(symbol, &bar);
        }
    }

    /// Move a manual clock to `t`; ignored for a wall clock
    pub fn set_time(&self, t: DateTime<Utc>) {
        let mut state = self.lock();
        if let PaperClock::Manual(_) = state.clock {
            state.clock = PaperClock::Manual(t);
            state.catch_up();
        }
    }

    pub fn advance(&self, by: Duration) {
        let now = self.lock().now();
        self.set_time(now + by);
    }

    /// Fail the next `n` broker calls as unavailable
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_calls_after(0, n);
    }

    /// Answer `ok` more calls, then fail the following `n` as unavailable
    pub fn fail_calls_after(&self, ok: u32, n: u32) {
        let mut state = self.lock();
        state.passing_calls = ok;
        state.failing_calls = n;
    }

    /// Accept (`true`) or reject (`false`) the next order submissions in turn
    pub fn script_order_outcomes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.lock().order_outcomes.extend(outcomes);
    }

    /// Stop reporting closing deals, as when history is unavailable
    pub fn discard_trade_history(&self) {
        let mut state = self.lock();
        state.keep_history = false;
        state.deals.clear();
    }

    /// Open a position outside the engine, as a manual trade would
    pub fn open_external(
        &self,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        stop: Option<f64>,
    ) -> Ticket {
        let mut state = self.lock();
        let ticket = state.issue_ticket();
        let open_time = state.now();
        state.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: symbol.to_string(),
                side,
                volume,
                price_open: price,
                stop,
                open_time,
            },
        );
        ticket
    }

    /// Close a position outside the engine at `price`
    pub fn close_external(&self, ticket: Ticket, price: f64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let now = state.now();
        state
            .close_at(ticket, price, now)
            .map(|_| ())
            .ok_or(BrokerError::UnknownTicket(ticket))
    }

    /// Fill a pending stop-entry order regardless of price
    pub fn trigger_order(&self, ticket: Ticket) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let now = state.now();
        if state.fill_order(ticket, now) {
            Ok(())
        } else {
            Err(BrokerError::UnknownTicket(ticket))
        }
    }

    pub fn position(&self, ticket: Ticket) -> Option<BrokerPosition> {
        self.lock().positions.get(&ticket).cloned()
    }

    pub fn position_count(&self) -> usize {
        self.lock().positions.len()
    }

    pub fn order_count(&self) -> usize {
        self.lock().orders.len()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.lock().markets.get(symbol).and_then(Market::price)
    }
}

impl ServerClock for PaperBroker {
    fn server_time(&self) -> Result<DateTime<Utc>, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.now())
    }
}

impl Broker for PaperBroker {
    fn recent_bars(&self, symbol: &str, count: usize) -> Result<Vec<Candle>, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();
        let bars = &state.market(symbol)?.bars;
        let start = bars.len().saturating_sub(count);
        Ok(bars[start..].to_vec())
    }

    fn open_positions(&self, symbol: Option<&str>) -> Result<Vec<BrokerPosition>, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();
        Ok(state
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .cloned()
            .collect())
    }

    fn pending_orders(&self, symbol: &str) -> Result<Vec<PendingOrder>, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();
        Ok(state
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    fn submit_market(&self, order: &MarketOrder) -> Result<Fill, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();

        let market = state.market(&order.symbol)?;
        if order.volume < market.spec.volume_min || order.volume > market.spec.volume_max {
            return Err(BrokerError::Rejected {
                code: RETCODE_INVALID_VOLUME,
                message: format!("invalid volume {}", order.volume),
            });
        }
        let price = market.price().ok_or_else(|| BrokerError::Rejected {
            code: RETCODE_INVALID_PRICE,
            message: format!("no quote for {}", order.symbol),
        })?;
        state.check_order_outcome()?;

        let ticket = state.issue_ticket();
        let time = state.now();
        state.positions.insert(
            ticket,
            BrokerPosition {
                ticket,
                symbol: order.symbol.clone(),
                side: order.side,
                volume: order.volume,
                price_open: price,
                stop: Some(order.stop),
                open_time: time,
            },
        );
        Ok(Fill {
            ticket,
            price,
            time,
        })
    }

    fn submit_stop_entry(&self, order: &StopEntryOrder) -> Result<Ticket, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();

        let market = state.market(&order.symbol)?;
        if order.volume < market.spec.volume_min || order.volume > market.spec.volume_max {
            return Err(BrokerError::Rejected {
                code: RETCODE_INVALID_VOLUME,
                message: format!("invalid volume {}", order.volume),
            });
        }
        if let Some(price) = market.price() {
            let wrong_side = match order.side {
                Side::Long => order.trigger_price <= price,
                Side::Short => order.trigger_price >= price,
            };
            if wrong_side {
                return Err(BrokerError::Rejected {
                    code: RETCODE_INVALID_PRICE,
                    message: format!(
                        "{} stop at {} is on the wrong side of {}",
                        order.side, order.trigger_price, price
                    ),
                });
            }
        }
        state.check_order_outcome()?;

        let ticket = state.issue_ticket();
        state.orders.insert(
            ticket,
            PendingOrder {
                ticket,
                symbol: order.symbol.clone(),
                side: order.side,
                volume: order.volume,
                trigger_price: order.trigger_price,
                stop: order.stop,
            },
        );
        Ok(ticket)
    }

    fn modify_stop(&self, position: Ticket, stop: f64) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        let entry = state
            .positions
            .get_mut(&position)
            .ok_or(BrokerError::UnknownTicket(position))?;
        entry.stop = Some(stop);
        Ok(())
    }

    fn cancel_order(&self, order: Ticket) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state
            .orders
            .remove(&order)
            .map(|_| ())
            .ok_or(BrokerError::UnknownTicket(order))
    }

    fn close_position(&self, position: Ticket) -> Result<Fill, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.catch_up();
        let symbol = state
            .positions
            .get(&position)
            .map(|p| p.symbol.clone())
            .ok_or(BrokerError::UnknownTicket(position))?;
        let price = state.market(&symbol)?.price().unwrap_or_default();
        let now = state.now();
        state
            .close_at(position, price, now)
            .ok_or(BrokerError::UnknownTicket(position))
    }

    fn closing_deal(&self, position: Ticket) -> Result<Option<ClosedDeal>, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        if !state.keep_history {
            return Ok(None);
        }
        Ok(state.deals.get(&position).copied())
    }

    fn account_equity(&self) -> Result<f64, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        Ok(state.balance + state.floating_pnl())
    }

    fn symbol_spec(&self, symbol: &str) -> Result<SymbolSpec, BrokerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.market(symbol).map(|m| m.spec.clone())
    }
}
