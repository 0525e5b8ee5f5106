use std::collections::{HashMap, HashSet};

use super::retry::RetryPolicy;
use crate::broker::{Broker, StopEntryOrder};
use crate::config::PyramidConfig;
use crate::models::{Position, PyramidOrder, Ticket};

/// Trigger and protective stop of one staged add-on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StagedLevel {
    pub trigger_price: f64,
    pub stop_price: f64,
}

/// Stages add-on stop-entry orders behind a parent position and tracks them
/// until they execute or are cancelled
pub struct PyramidController {
    config: PyramidConfig,
    retry: RetryPolicy,
    pending: HashMap<String, Vec<PyramidOrder>>,
}

impl PyramidController {
    pub fn new(config: &PyramidConfig, retry: RetryPolicy) -> Self {
        Self {
            config: config.clone(),
            retry,
            pending: HashMap::new(),
        }
    }

    /// Trigger ladder for `position`: entry ± i·spacing·vol, stop ∓ multiple·vol
    pub fn staged_levels(&self, position: &Position, volatility: f64) -> Vec<StagedLevel> {
        let sign = position.side.sign();
        (1..=self.config.max_orders)
            .map(|i| {
                let trigger_price =
                    position.entry_price + sign * i as f64 * self.config.spacing * volatility;
                StagedLevel {
                    trigger_price,
                    stop_price: trigger_price - sign * self.config.stop_multiple * volatility,
                }
            })
            .collect()
    }

    /// Submit the full ladder; rejected levels are skipped
    pub fn place_staged(
        &mut self,
        broker: &dyn Broker,
        position: &Position,
        volatility: f64,
    ) -> Vec<PyramidOrder> {
        self.place_staged_upto(broker, position, volatility, self.config.max_orders)
    }

    /// Submit at most `limit` levels of the ladder, nearest first
    pub fn place_staged_upto(
        &mut self,
        broker: &dyn Broker,
        position: &Position,
        volatility: f64,
        limit: usize,
    ) -> Vec<PyramidOrder> {
        let mut placed = Vec::new();

        for level in self.staged_levels(position, volatility).into_iter().take(limit) {
            let order = StopEntryOrder {
                symbol: position.symbol.clone(),
                side: position.side,
                volume: position.size,
                trigger_price: level.trigger_price,
                stop: level.stop_price,
            };

            match self
                .retry
                .run("submit_stop_entry", || broker.submit_stop_entry(&order))
            {
                Ok(ticket) => {
                    tracing::debug!(
                        symbol = %position.symbol,
                        %ticket,
                        trigger = level.trigger_price,
                        stop = level.stop_price,
                        "Staged add-on placed"
                    );
                    placed.push(PyramidOrder {
                        id: ticket,
                        parent_position_id: position.id,
                        symbol: position.symbol.clone(),
                        side: position.side,
                        size: position.size,
                        trigger_price: level.trigger_price,
                        stop_price: level.stop_price,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        "⚠️  Staged add-on at {:.5} for {} skipped: {}",
                        level.trigger_price,
                        position.symbol,
                        err
                    );
                }
            }
        }

        if !placed.is_empty() {
            tracing::info!(
                "🔺 {} staged add-ons placed for {} {}",
                placed.len(),
                position.symbol,
                position.id
            );
            self.pending
                .entry(position.symbol.clone())
                .or_default()
                .extend(placed.iter().cloned());
        }
        placed
    }

    /// Cancel every tracked order for `symbol`; local tracking is cleared
    /// whatever the individual outcomes
    ///
    /// Returns how many orders were dropped from tracking.
    pub fn cancel_all(&mut self, broker: &dyn Broker, symbol: &str) -> usize {
        let Some(orders) = self.pending.remove(symbol) else {
            return 0;
        };
        self.cancel_orders(broker, symbol, &orders);
        orders.len()
    }

    /// Cancel the add-ons staged behind `parent`, leaving other ladders alone
    ///
    /// Returns how many orders were dropped from tracking.
    pub fn cancel_for_parent(&mut self, broker: &dyn Broker, symbol: &str, parent: Ticket) -> usize {
        let Some(orders) = self.pending.get_mut(symbol) else {
            return 0;
        };
        let (orphaned, kept): (Vec<_>, Vec<_>) = orders
            .drain(..)
            .partition(|o| o.parent_position_id == parent);
        *orders = kept;
        if orders.is_empty() {
            self.pending.remove(symbol);
        }

        if !orphaned.is_empty() {
            self.cancel_orders(broker, symbol, &orphaned);
        }
        orphaned.len()
    }

    fn cancel_orders(&self, broker: &dyn Broker, symbol: &str, orders: &[PyramidOrder]) {
        let mut cancelled = 0;
        for order in orders {
            match self
                .retry
                .run("cancel_order", || broker.cancel_order(order.id))
            {
                Ok(()) => cancelled += 1,
                Err(err) => {
                    tracing::warn!("⚠️  Cancel of {} {} failed: {}", symbol, order.id, err)
                }
            }
        }
        tracing::info!("Cancelled {}/{} staged add-ons for {}", cancelled, orders.len(), symbol);
    }

    /// Drop tracked orders the broker no longer lists as pending
    ///
    /// Returns the dropped orders; each either executed or was cancelled
    /// outside the engine.
    pub fn reconcile_executed(
        &mut self,
        symbol: &str,
        broker_pending_ids: &HashSet<Ticket>,
    ) -> Vec<PyramidOrder> {
        let Some(orders) = self.pending.get_mut(symbol) else {
            return Vec::new();
        };

        let (still_pending, gone): (Vec<_>, Vec<_>) = orders
            .drain(..)
            .partition(|o| broker_pending_ids.contains(&o.id));
        *orders = still_pending;
        if orders.is_empty() {
            self.pending.remove(symbol);
        }
        gone
    }

    pub fn pending(&self, symbol: &str) -> &[PyramidOrder] {
        self.pending
            .get(symbol)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn pending_count(&self, symbol: &str) -> usize {
        self.pending(symbol).len()
    }

    /// Symbols with at least one tracked order
    pub fn symbols(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }
}
