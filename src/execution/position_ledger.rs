use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::broker::ClosedDeal;
use crate::config::UnitLimits;
use crate::error::EngineError;
use crate::models::{ExitReason, Position, PositionStatus, Ticket};

/// Unit counts observed at the broker, used as a floor for the local view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitCounts {
    pub symbol: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct LedgerState {
    open: HashMap<String, Vec<Position>>, // Entry order per symbol
    closed: Vec<Position>,
    total_open_units: usize,
    reserved: HashMap<String, usize>,
    staged: HashMap<String, usize>, // Slots held by pending add-on orders
}

impl LedgerState {
    fn symbol_units(&self, symbol: &str) -> usize {
        self.open.get(symbol).map_or(0, Vec::len)
            + self.reserved.get(symbol).copied().unwrap_or(0)
            + self.staged.get(symbol).copied().unwrap_or(0)
    }

    fn total_units(&self) -> usize {
        self.total_open_units
            + self.reserved.values().sum::<usize>()
            + self.staged.values().sum::<usize>()
    }

    fn has_capacity(&self, symbol: &str, limits: &UnitLimits, broker: UnitCounts) -> bool {
        let symbol_units = self.symbol_units(symbol).max(broker.symbol);
        let total_units = self.total_units().max(broker.total);
        symbol_units < limits.max_units_per_symbol && total_units < limits.max_units
    }

    fn insert(&mut self, position: Position) {
        self.open
            .entry(position.symbol.clone())
            .or_default()
            .push(position);
        self.total_open_units += 1;
    }

    fn release(&mut self, symbol: &str) {
        decrement(&mut self.reserved, symbol, 1);
    }

    fn finish(
        &mut self,
        symbol: &str,
        id: Ticket,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Position, EngineError> {
        let not_found = || EngineError::NotFound {
            symbol: symbol.to_string(),
            id,
        };
        let positions = self.open.get_mut(symbol).ok_or_else(not_found)?;
        let index = positions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(not_found)?;

        let mut position = positions.remove(index);
        if positions.is_empty() {
            self.open.remove(symbol);
        }
        self.total_open_units -= 1;

        let pnl = position.gross_pnl_at(exit_price) - position.commission - position.swap;
        position.status = PositionStatus::Closed;
        position.exit_price = Some(exit_price);
        position.exit_time = Some(exit_time);
        position.realized_pnl = Some(pnl);
        position.exit_reason = Some(reason);

        self.closed.push(position.clone());
        Ok(position)
    }
}

/// Subtract `by` from a per-symbol counter, dropping the entry at zero
///
/// Returns how much was actually subtracted.
fn decrement(counts: &mut HashMap<String, usize>, symbol: &str, by: usize) -> usize {
    let Some(count) = counts.get_mut(symbol) else {
        return 0;
    };
    let taken = by.min(*count);
    *count -= taken;
    if *count == 0 {
        counts.remove(symbol);
    }
    taken
}

/// Open and closed positions per symbol under the unit caps
///
/// All state sits behind one mutex so the capacity check and the insert
/// happen in the same critical section. Share it with `Arc` when another
/// thread needs to open or close positions.
#[derive(Debug)]
pub struct PositionLedger {
    limits: UnitLimits,
    state: Mutex<LedgerState>,
}

impl PositionLedger {
    pub fn new(limits: UnitLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(LedgerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limits(&self) -> UnitLimits {
        self.limits
    }

    /// Room for one more unit on `symbol` by the local view alone
    pub fn can_open(&self, symbol: &str) -> bool {
        self.can_open_with_broker(symbol, UnitCounts::default())
    }

    /// Room for one more unit, taking the larger of local and broker counts
    pub fn can_open_with_broker(&self, symbol: &str, broker: UnitCounts) -> bool {
        self.lock().has_capacity(symbol, &self.limits, broker)
    }

    /// Record a new open position if the caps allow it
    ///
    /// Returns false without touching the ledger when capacity is exhausted.
    pub fn open(&self, position: Position) -> bool {
        let mut state = self.lock();
        if !state.has_capacity(&position.symbol, &self.limits, UnitCounts::default()) {
            tracing::debug!(symbol = %position.symbol, id = %position.id, "Open refused at capacity");
            return false;
        }
        state.insert(position);
        true
    }

    /// Claim a unit slot before the broker round-trip
    ///
    /// The slot counts against the caps until it is committed with the filled
    /// position or the reservation is dropped.
    pub fn reserve(
        &self,
        symbol: &str,
        broker: UnitCounts,
    ) -> Result<UnitReservation<'_>, EngineError> {
        let mut state = self.lock();
        if !state.has_capacity(symbol, &self.limits, broker) {
            return Err(EngineError::CapacityExceeded {
                symbol: symbol.to_string(),
                symbol_units: state.symbol_units(symbol).max(broker.symbol),
                total_units: state.total_units().max(broker.total),
            });
        }
        *state.reserved.entry(symbol.to_string()).or_insert(0) += 1;

        Ok(UnitReservation {
            ledger: self,
            symbol: symbol.to_string(),
            active: true,
        })
    }

    /// Claim up to `wanted` slots for staged add-on orders on `symbol`
    ///
    /// Claimed slots count against the caps like open units until the
    /// add-on fills (`open_staged`) or is withdrawn (`release_staged`).
    /// Returns how many slots were claimed.
    pub fn claim_staged(&self, symbol: &str, wanted: usize, broker: UnitCounts) -> usize {
        let mut state = self.lock();
        let mut claimed = 0;
        while claimed < wanted && state.has_capacity(symbol, &self.limits, broker) {
            *state.staged.entry(symbol.to_string()).or_insert(0) += 1;
            claimed += 1;
        }
        claimed
    }

    /// Give back staged slots whose orders were cancelled or never placed
    pub fn release_staged(&self, symbol: &str, count: usize) {
        if count == 0 {
            return;
        }
        let released = decrement(&mut self.lock().staged, symbol, count);
        if released < count {
            tracing::warn!(
                "⚠️  Released {} staged slots on {} but only {} were held",
                count,
                symbol,
                released
            );
        }
    }

    /// Record a filled add-on in the slot its order was holding
    ///
    /// Without a held slot this falls back to a capped `open`.
    pub fn open_staged(&self, position: Position) -> bool {
        let mut state = self.lock();
        if decrement(&mut state.staged, &position.symbol, 1) == 0
            && !state.has_capacity(&position.symbol, &self.limits, UnitCounts::default())
        {
            return false;
        }
        state.insert(position);
        true
    }

    /// Slots currently held by pending add-on orders on `symbol`
    pub fn staged_units(&self, symbol: &str) -> usize {
        self.lock().staged.get(symbol).copied().unwrap_or(0)
    }

    /// Close an open position on an operator request
    pub fn close(
        &self,
        symbol: &str,
        id: Ticket,
        exit_price: f64,
        exit_time: DateTime<Utc>,
    ) -> Result<Position, EngineError> {
        self.close_with_reason(symbol, id, exit_price, exit_time, ExitReason::Manual)
    }

    pub fn close_with_reason(
        &self,
        symbol: &str,
        id: Ticket,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Result<Position, EngineError> {
        let closed = self
            .lock()
            .finish(symbol, id, exit_price, exit_time, reason)?;

        tracing::info!(
            "📉 Closed {} {} {} @ {:.5} (P&L: {:.2}, {:?})",
            closed.side,
            symbol,
            id,
            exit_price,
            closed.realized_pnl.unwrap_or_default(),
            reason
        );
        Ok(closed)
    }

    pub fn update_stop(&self, symbol: &str, id: Ticket, stop: f64) -> Result<(), EngineError> {
        let mut state = self.lock();
        let position = state
            .open
            .get_mut(symbol)
            .and_then(|positions| positions.iter_mut().find(|p| p.id == id))
            .ok_or_else(|| EngineError::NotFound {
                symbol: symbol.to_string(),
                id,
            })?;
        position.stop_price = stop;
        Ok(())
    }

    /// Close every local position the broker no longer reports as open
    ///
    /// Exit price and time come from `deal_lookup` when the broker still has
    /// the closing deal, otherwise from the entry price and `now`. Never fails.
    pub fn reconcile(
        &self,
        broker_open_ids: &HashSet<Ticket>,
        mut deal_lookup: impl FnMut(Ticket) -> Option<ClosedDeal>,
        now: DateTime<Utc>,
    ) -> Vec<Position> {
        let missing: Vec<(String, Ticket, f64)> = {
            let state = self.lock();
            state
                .open
                .iter()
                .flat_map(|(symbol, positions)| {
                    positions
                        .iter()
                        .filter(|p| !broker_open_ids.contains(&p.id))
                        .map(|p| (symbol.clone(), p.id, p.entry_price))
                })
                .collect()
        };

        let mut closed = Vec::with_capacity(missing.len());
        for (symbol, id, entry_price) in missing {
            let deal = deal_lookup(id);
            let (exit_price, exit_time) = match deal {
                Some(deal) => (deal.price, deal.time),
                None => {
                    tracing::warn!(
                        "⚠️  No closing deal for {} {}, booking at entry price",
                        symbol,
                        id
                    );
                    (entry_price, now)
                }
            };

            let mut state = self.lock();
            if let (Some(deal), Some(position)) = (
                deal,
                state
                    .open
                    .get_mut(&symbol)
                    .and_then(|ps| ps.iter_mut().find(|p| p.id == id)),
            ) {
                position.commission += deal.commission;
                position.swap += deal.swap;
            }

            // Another caller may have closed it while the lock was released
            if let Ok(position) =
                state.finish(&symbol, id, exit_price, exit_time, ExitReason::ExternalClose)
            {
                tracing::info!(
                    "🔄 {} {} externally closed @ {:.5} (P&L: {:.2})",
                    symbol,
                    id,
                    exit_price,
                    position.realized_pnl.unwrap_or_default()
                );
                closed.push(position);
            }
        }
        closed
    }

    pub fn open_positions(&self, symbol: &str) -> Vec<Position> {
        self.lock().open.get(symbol).cloned().unwrap_or_default()
    }

    pub fn all_open_positions(&self) -> Vec<Position> {
        self.lock().open.values().flatten().cloned().collect()
    }

    pub fn closed_positions(&self) -> Vec<Position> {
        self.lock().closed.clone()
    }

    pub fn contains(&self, id: Ticket) -> bool {
        self.lock().open.values().flatten().any(|p| p.id == id)
    }

    /// Open units on `symbol`, excluding reservations and staged slots
    pub fn symbol_units(&self, symbol: &str) -> usize {
        self.lock().open.get(symbol).map_or(0, Vec::len)
    }

    pub fn total_open_units(&self) -> usize {
        self.lock().total_open_units
    }

    pub fn realized_pnl(&self) -> f64 {
        self.lock().closed.iter().filter_map(|p| p.realized_pnl).sum()
    }
}

/// A claimed unit slot; released on drop unless committed
#[derive(Debug)]
pub struct UnitReservation<'a> {
    ledger: &'a PositionLedger,
    symbol: String,
    active: bool,
}

impl UnitReservation<'_> {
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Turn the reserved slot into an open position
    pub fn commit(mut self, position: Position) {
        let mut state = self.ledger.lock();
        state.release(&self.symbol);
        state.insert(position);
        self.active = false;
    }
}

impl Drop for UnitReservation<'_> {
    fn drop(&mut self) {
        if self.active {
            self.ledger.lock().release(&self.symbol);
        }
    }
}
