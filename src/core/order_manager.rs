//! Grid order lifecycle simulation
//!
//! `GridOrderManager` owns every order of one backtest run. Orders live in a
//! `BTreeMap` keyed by id; an opening order and its counter-order reference
//! each other only by id. Per level the lifecycle is
//! `Pending -> Filled -> CounterPlaced -> Pending`, or `Cancelled` when a
//! rebalance replaces the grid.
//!
//! Fills are detected by sweeping the candle's assumed intra-candle path
//! (see `Candle::sweep_path`). Orders placed while a candle is processed only
//! become fillable from the next candle.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::grid_calculator::{compute_levels, effective_bounds, recentred_bounds, round_half_up};
use crate::core::types::{
    Candle, GridConfig, GridLevel, LevelStatus, OrderSide, PriceBounds, SpacingMode,
};
use crate::error::{GridError, GridResult};

/// Quantities at or below this are treated as zero
const QTY_EPSILON: f64 = 1e-12;

pub type OrderId = u64;
pub type CycleId = u64;

/// Fee schedule. Grid orders are resting limit orders, so every fill pays the maker rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeModel {
    pub maker_fee_rate: f64,     // 0.001 = 0.1% of notional
    pub fixed_fee_per_fill: f64, // Flat quote-currency fee per fill
}

impl Default for FeeModel {
    fn default() -> Self {
        Self {
            maker_fee_rate: 0.001,
            fixed_fee_per_fill: 0.0,
        }
    }
}

impl FeeModel {
    pub fn fee_for(&self, price: f64, size: f64) -> f64 {
        price * size * self.maker_fee_rate + self.fixed_fee_per_fill
    }

    pub fn validate(&self) -> GridResult<()> {
        if !self.maker_fee_rate.is_finite() || !(0.0..1.0).contains(&self.maker_fee_rate) {
            return Err(GridError::invalid_config("maker_fee_rate must be in [0, 1)"));
        }
        if !self.fixed_fee_per_fill.is_finite() || self.fixed_fee_per_fill < 0.0 {
            return Err(GridError::invalid_config("fixed_fee_per_fill must be non-negative"));
        }
        Ok(())
    }
}

/// Simulated liquidity. With the defaults every crossed order fills completely
/// and no random numbers are drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillModel {
    /// Chance that a crossed order only partially fills
    pub partial_fill_probability: f64,
    /// Lower bound of the filled fraction when a partial fill happens
    pub min_fill_ratio: f64,
    /// Cap on total filled quantity per candle as a fraction of candle volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_volume_participation: Option<f64>,
    pub seed: u64,
}

impl Default for FillModel {
    fn default() -> Self {
        Self {
            partial_fill_probability: 0.0,
            min_fill_ratio: 0.25,
            max_volume_participation: None,
            seed: 42,
        }
    }
}

impl FillModel {
    pub fn validate(&self) -> GridResult<()> {
        if !(0.0..=1.0).contains(&self.partial_fill_probability) {
            return Err(GridError::invalid_config("partial_fill_probability must be in [0, 1]"));
        }
        if !(self.min_fill_ratio > 0.0 && self.min_fill_ratio <= 1.0) {
            return Err(GridError::invalid_config("min_fill_ratio must be in (0, 1]"));
        }
        if let Some(p) = self.max_volume_participation {
            if !(p > 0.0 && p <= 1.0) {
                return Err(GridError::invalid_config("max_volume_participation must be in (0, 1]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerSettings {
    pub capital: f64,
    pub fees: FeeModel,
    pub fill_model: FillModel,
    /// Realized P&L threshold in addition to the grid's own `take_profit`; the lower one wins
    pub take_profit: Option<f64>,
}

impl ManagerSettings {
    pub fn new(capital: f64) -> Self {
        Self {
            capital,
            fees: FeeModel::default(),
            fill_model: FillModel::default(),
            take_profit: None,
        }
    }

    fn validate(&self) -> GridResult<()> {
        if !self.capital.is_finite() || self.capital <= 0.0 {
            return Err(GridError::invalid_config(format!(
                "capital must be positive, got {}",
                self.capital
            )));
        }
        self.fees.validate()?;
        self.fill_model.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Opening, // Placed on a grid level
    Counter, // Placed after an opening fill, closes the cycle
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOrder {
    pub id: OrderId,
    /// Grid generation; bumped on every rebalance
    pub generation: u32,
    /// Level the order belongs to (the opening level for counter-orders)
    pub level_index: usize,
    pub role: OrderRole,
    pub side: OrderSide,
    pub price: f64,
    /// Requested quantity; grows on a counter-order while its opening order keeps filling
    pub size: f64,
    pub remaining: f64,
    pub filled: f64,
    pub fees: f64,
    pub status: OrderStatus,
    pub placed_at: DateTime<Utc>,
    /// First fill
    pub filled_at: Option<DateTime<Utc>>,
    pub counter_order_id: Option<OrderId>,
    pub parent_order_id: Option<OrderId>,
    /// Opening fees already charged to cycles
    #[serde(skip)]
    fees_closed: f64,
    #[serde(skip)]
    armed: bool,
}

impl GridOrder {
    pub fn is_resting(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::PartiallyFilled)
            && self.remaining > QTY_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub role: OrderRole,
    pub side: OrderSide,
    pub price: f64,
    pub size: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
    pub level_index: usize,
    /// Set on counter fills, each of which closes a cycle for its size
    pub cycle_id: Option<CycleId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleDirection {
    BuyThenSell,
    SellThenBuy,
}

/// A completed round trip. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridCycle {
    pub id: CycleId,
    pub direction: CycleDirection,
    pub opening_order_id: OrderId,
    pub closing_order_id: OrderId,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub fees: f64,
    /// (sell price - buy price) * size - fees
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub duration_secs: i64,
}

/// A filled opening order whose counter-order has not completed yet
#[derive(Debug, Clone, PartialEq)]
pub struct OpenPosition {
    pub opening_order_id: OrderId,
    pub counter_order_id: OrderId,
    pub side: OrderSide,
    pub entry_price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Termination {
    Completed,
    TakeProfit {
        realized_pnl: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Manager state captured when an invariant breaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub generation: u32,
    pub bounds: PriceBounds,
    pub levels: Vec<GridLevel>,
    pub resting_orders: Vec<GridOrder>,
    pub completed_cycles: usize,
    pub open_exposure: f64,
    pub capital: f64,
    pub realized_pnl: f64,
    pub fees_paid: f64,
    pub last_price: f64,
    pub rebalance_count: usize,
}

impl ManagerSnapshot {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "  generation {} bounds [{:.8}, {:.8}] last price {:.8}\n  \
             exposure {:.8} / capital {:.8}, realized {:.8}, fees {:.8}\n  \
             {} cycles, {} rebalances, {} resting orders",
            self.generation,
            self.bounds.lower,
            self.bounds.upper,
            self.last_price,
            self.open_exposure,
            self.capital,
            self.realized_pnl,
            self.fees_paid,
            self.completed_cycles,
            self.rebalance_count,
            self.resting_orders.len(),
        );
        for order in &self.resting_orders {
            out.push_str(&format!(
                "\n    #{} {:?} {:?} @ {:.8} remaining {:.8} ({:?})",
                order.id, order.role, order.side, order.price, order.remaining, order.status
            ));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationFault {
    pub reason: String,
    pub snapshot: ManagerSnapshot,
}

struct OrderRequest {
    role: OrderRole,
    side: OrderSide,
    price: f64,
    size: f64,
    level_index: usize,
    generation: u32,
    parent: Option<OrderId>,
    armed: bool,
}

pub struct GridOrderManager {
    settings: ManagerSettings,
    config: Option<GridConfig>,
    bounds: PriceBounds,
    levels: Vec<GridLevel>,
    generation: u32,
    orders: BTreeMap<OrderId, GridOrder>,
    resting: BTreeSet<OrderId>,
    /// Orders already tried during the current candle
    attempted: BTreeSet<OrderId>,
    next_order_id: OrderId,
    cycles: Vec<GridCycle>,
    exposure: f64,
    realized_pnl: f64,
    fees_paid: f64,
    take_profit: Option<f64>,
    termination: Option<Termination>,
    rebalance_count: usize,
    last_price: f64,
    volume_budget: Option<f64>,
    rng: StdRng,
}

impl GridOrderManager {
    pub fn new(settings: ManagerSettings) -> Self {
        let seed = settings.fill_model.seed;
        Self {
            settings,
            config: None,
            bounds: PriceBounds::new(0.0, 0.0),
            levels: Vec::new(),
            generation: 0,
            orders: BTreeMap::new(),
            resting: BTreeSet::new(),
            attempted: BTreeSet::new(),
            next_order_id: 0,
            cycles: Vec::new(),
            exposure: 0.0,
            realized_pnl: 0.0,
            fees_paid: 0.0,
            take_profit: None,
            termination: None,
            rebalance_count: 0,
            last_price: 0.0,
            volume_budget: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Build the grid and place one opening order per level around `price`:
    /// buys below, sells above, and the level the price sits on left empty.
    /// Resets any previous run state.
    pub fn initialize(&mut self, config: GridConfig, price: f64, timestamp: DateTime<Utc>) -> GridResult<()> {
        self.settings.validate()?;
        if !price.is_finite() || price <= 0.0 {
            return Err(GridError::invalid_config(format!(
                "reference price must be positive, got {}",
                price
            )));
        }
        let levels = compute_levels(&config)?;
        let bounds = effective_bounds(&config)?;

        self.take_profit = match (config.take_profit, self.settings.take_profit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.bounds = bounds;
        self.levels = levels;
        self.config = Some(config);
        self.generation = 0;
        self.orders.clear();
        self.resting.clear();
        self.attempted.clear();
        self.next_order_id = 0;
        self.cycles.clear();
        self.exposure = 0.0;
        self.realized_pnl = 0.0;
        self.fees_paid = 0.0;
        self.termination = None;
        self.rebalance_count = 0;
        self.last_price = price;
        self.rng = StdRng::seed_from_u64(self.settings.fill_model.seed);

        self.place_grid_orders(price, timestamp, true);

        info!(
            "🎯 Grid initialized: {} levels in [{:.4}, {:.4}] around {:.4}, {} orders placed",
            self.levels.len(),
            self.bounds.lower,
            self.bounds.upper,
            price,
            self.resting.len()
        );
        Ok(())
    }

    /// Process one candle and return its fills in execution order.
    pub fn on_price(&mut self, candle: &Candle) -> GridResult<Vec<FillEvent>> {
        let rebalance_on_exit = match &self.config {
            Some(config) => config.rebalance_on_exit,
            None => return Err(GridError::invalid_config("order manager used before initialize")),
        };
        if self.termination.is_some() {
            return Ok(Vec::new());
        }
        if !candle.is_well_formed() {
            warn!("⚠️  Skipping malformed candle at {}", candle.timestamp);
            return Ok(Vec::new());
        }

        for id in &self.resting {
            if let Some(order) = self.orders.get_mut(id) {
                order.armed = true;
            }
        }
        self.attempted.clear();
        self.volume_budget = self
            .settings
            .fill_model
            .max_volume_participation
            .map(|p| candle.volume * p);

        let mut fills = Vec::new();
        let path = candle.sweep_path();
        for segment in path.windows(2) {
            if self.termination.is_some() {
                break;
            }
            self.sweep_segment(segment[0], segment[1], candle.timestamp, &mut fills)?;
        }
        self.last_price = candle.close;

        if rebalance_on_exit && self.termination.is_none() && !self.bounds.contains(candle.close) {
            self.rebalance(candle.close, candle.timestamp)?;
        }

        self.check_invariants()?;
        Ok(fills)
    }

    /// Resting orders as level views (price, side, remaining size), ordered by price
    pub fn pending_orders(&self) -> Vec<GridLevel> {
        self.resting_orders()
            .into_iter()
            .map(|order| GridLevel {
                index: order.level_index,
                price: order.price,
                side: order.side,
                size: order.remaining,
                status: LevelStatus::Pending,
            })
            .collect()
    }

    /// Levels of the current grid waiting on their opening order
    pub fn pending_levels(&self) -> Vec<&GridLevel> {
        self.levels
            .iter()
            .filter(|level| level.status == LevelStatus::Pending)
            .collect()
    }

    pub fn resting_orders(&self) -> Vec<&GridOrder> {
        let mut orders: Vec<&GridOrder> = self
            .resting
            .iter()
            .filter_map(|id| self.orders.get(id))
            .collect();
        orders.sort_by(|a, b| a.price.total_cmp(&b.price).then(a.id.cmp(&b.id)));
        orders
    }

    pub fn order(&self, id: OrderId) -> Option<&GridOrder> {
        self.orders.get(&id)
    }

    pub fn cycle_log(&self) -> &[GridCycle] {
        &self.cycles
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn bounds(&self) -> PriceBounds {
        self.bounds
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Notional of filled opening quantity not yet closed by a counter-order
    pub fn open_exposure(&self) -> f64 {
        self.exposure
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn fees_paid(&self) -> f64 {
        self.fees_paid
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn rebalance_count(&self) -> usize {
        self.rebalance_count
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.resting
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|order| order.role == OrderRole::Counter)
            .filter_map(|counter| {
                let parent = self.orders.get(&counter.parent_order_id?)?;
                Some(OpenPosition {
                    opening_order_id: parent.id,
                    counter_order_id: counter.id,
                    side: parent.side,
                    entry_price: parent.price,
                    size: counter.remaining,
                })
            })
            .collect()
    }

    /// Mark-to-market P&L of open positions, before fees
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        self.open_positions()
            .iter()
            .map(|pos| match pos.side {
                OrderSide::Buy => (mark - pos.entry_price) * pos.size,
                OrderSide::Sell => (pos.entry_price - mark) * pos.size,
            })
            .sum()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            generation: self.generation,
            bounds: self.bounds,
            levels: self.levels.clone(),
            resting_orders: self.resting_orders().into_iter().cloned().collect(),
            completed_cycles: self.cycles.len(),
            open_exposure: self.exposure,
            capital: self.settings.capital,
            realized_pnl: self.realized_pnl,
            fees_paid: self.fees_paid,
            last_price: self.last_price,
            rebalance_count: self.rebalance_count,
        }
    }

    fn fault(&self, reason: impl Into<String>) -> GridError {
        GridError::from(SimulationFault {
            reason: reason.into(),
            snapshot: self.snapshot(),
        })
    }

    fn order_size(&self) -> f64 {
        self.config.as_ref().map_or(0.0, |c| c.order_size)
    }

    fn place_order(&mut self, request: OrderRequest, timestamp: DateTime<Utc>) -> OrderId {
        self.next_order_id += 1;
        let id = self.next_order_id;
        self.orders.insert(
            id,
            GridOrder {
                id,
                generation: request.generation,
                level_index: request.level_index,
                role: request.role,
                side: request.side,
                price: request.price,
                size: request.size,
                remaining: request.size,
                filled: 0.0,
                fees: 0.0,
                status: OrderStatus::Open,
                placed_at: timestamp,
                filled_at: None,
                counter_order_id: None,
                parent_order_id: request.parent,
                fees_closed: 0.0,
                armed: request.armed,
            },
        );
        self.resting.insert(id);
        id
    }

    fn place_grid_orders(&mut self, price: f64, timestamp: DateTime<Utc>, armed: bool) {
        let size = self.order_size();
        let count = self.levels.len();

        for i in 0..count {
            let level_price = self.levels[i].price;
            let below = if i > 0 { level_price - self.levels[i - 1].price } else { f64::INFINITY };
            let above = if i + 1 < count { self.levels[i + 1].price - level_price } else { f64::INFINITY };
            let spacing = below.min(above);

            if (level_price - price).abs() < spacing / 2.0 {
                // The level the price sits on stays empty
                self.levels[i].status = LevelStatus::Filled;
                continue;
            }

            let side = if level_price < price { OrderSide::Buy } else { OrderSide::Sell };
            self.levels[i].side = side;
            self.levels[i].status = LevelStatus::Pending;
            let generation = self.generation;
            self.place_order(
                OrderRequest {
                    role: OrderRole::Opening,
                    side,
                    price: level_price,
                    size,
                    level_index: i,
                    generation,
                    parent: None,
                    armed,
                },
                timestamp,
            );
        }
    }

    /// Orders to try on one leg of the intra-candle path, in execution order:
    /// orders already marketable at the start of the leg, then orders crossed
    /// during the leg in the direction of travel.
    fn fill_queue(&self, from: f64, to: f64) -> Vec<OrderId> {
        let rising = to > from;
        let falling = to < from;
        let mut marketable: Vec<&GridOrder> = Vec::new();
        let mut crossed: Vec<&GridOrder> = Vec::new();

        for order in self.resting.iter().filter_map(|id| self.orders.get(id)) {
            if !order.armed {
                continue;
            }
            match order.side {
                OrderSide::Buy => {
                    if order.price >= from {
                        marketable.push(order);
                    } else if falling && order.price >= to {
                        crossed.push(order);
                    }
                }
                OrderSide::Sell => {
                    if order.price <= from {
                        marketable.push(order);
                    } else if rising && order.price <= to {
                        crossed.push(order);
                    }
                }
            }
        }

        let by_travel = |a: &&GridOrder, b: &&GridOrder| {
            let ord = if falling {
                b.price.total_cmp(&a.price)
            } else {
                a.price.total_cmp(&b.price)
            };
            ord.then(a.id.cmp(&b.id))
        };
        marketable.sort_by(by_travel);
        crossed.sort_by(by_travel);

        marketable.into_iter().chain(crossed).map(|o| o.id).collect()
    }

    fn sweep_segment(
        &mut self,
        from: f64,
        to: f64,
        timestamp: DateTime<Utc>,
        fills: &mut Vec<FillEvent>,
    ) -> GridResult<()> {
        for id in self.fill_queue(from, to) {
            if self.termination.is_some() {
                break;
            }
            // An earlier fill in this leg may have closed the cycle and cancelled this order
            if !self.orders.get(&id).map_or(false, |o| o.is_resting()) {
                continue;
            }
            // One fill opportunity per order per candle
            if !self.attempted.insert(id) {
                continue;
            }
            if let Some(fill) = self.fill_order(id, timestamp)? {
                fills.push(fill);
            }
        }
        Ok(())
    }

    fn fill_order(&mut self, id: OrderId, timestamp: DateTime<Utc>) -> GridResult<Option<FillEvent>> {
        let (role, side, price, remaining, level_index, parent_id) = match self.orders.get(&id) {
            Some(o) => (o.role, o.side, o.price, o.remaining, o.level_index, o.parent_order_id),
            None => return Err(self.fault(format!("resting order #{} missing from the book", id))),
        };

        let mut qty = remaining;
        let fill_model = &self.settings.fill_model;
        if fill_model.partial_fill_probability > 0.0
            && self.rng.gen::<f64>() < fill_model.partial_fill_probability
        {
            let ratio = if fill_model.min_fill_ratio < 1.0 {
                self.rng.gen_range(fill_model.min_fill_ratio..1.0)
            } else {
                1.0
            };
            qty *= ratio;
        }
        if let Some(budget) = self.volume_budget {
            qty = qty.min(budget.max(0.0));
        }
        if role == OrderRole::Opening {
            let room = (self.settings.capital - self.exposure) / price;
            qty = qty.min(room.max(0.0));
        }
        if qty <= QTY_EPSILON {
            debug!("Order #{} crossed at {:.8} but nothing fillable (capital or volume cap)", id, price);
            return Ok(None);
        }

        let fee = self.settings.fees.fee_for(price, qty);
        let fully_filled = match self.orders.get_mut(&id) {
            Some(order) => {
                order.remaining -= qty;
                order.filled += qty;
                order.fees += fee;
                if order.filled_at.is_none() {
                    order.filled_at = Some(timestamp);
                }
                if order.remaining <= QTY_EPSILON {
                    order.remaining = 0.0;
                    order.status = OrderStatus::Filled;
                    Some(true)
                } else {
                    order.status = OrderStatus::PartiallyFilled;
                    Some(false)
                }
            }
            None => None,
        };
        let fully_filled = match fully_filled {
            Some(done) => done,
            None => return Err(self.fault(format!("order #{} vanished during fill", id))),
        };
        if fully_filled {
            self.resting.remove(&id);
        }
        if let Some(budget) = self.volume_budget.as_mut() {
            *budget -= qty;
        }
        self.fees_paid += fee;

        let mut cycle_id = None;
        match role {
            OrderRole::Opening => {
                self.exposure += price * qty;
                self.attach_counter(id, qty, timestamp)?;
            }
            OrderRole::Counter => {
                let parent_id = match parent_id {
                    Some(p) => p,
                    None => return Err(self.fault(format!("counter-order #{} has no opening order", id))),
                };
                let entry_price = match self.orders.get(&parent_id) {
                    Some(parent) => parent.price,
                    None => return Err(self.fault(format!("opening order #{} missing", parent_id))),
                };
                self.exposure -= entry_price * qty;
                cycle_id = Some(self.close_cycle(id, qty, fee, fully_filled, timestamp)?);
            }
        }
        self.check_order(id)?;

        debug!(
            "{} {:?} {:?} #{} {:.8} @ {:.8} (fee {:.8})",
            if fully_filled { "Filled" } else { "Partially filled" },
            role,
            side,
            id,
            qty,
            price,
            fee
        );

        Ok(Some(FillEvent {
            order_id: id,
            role,
            side,
            price,
            size: qty,
            fee,
            timestamp,
            level_index,
            cycle_id,
        }))
    }

    /// First fill of an opening order places its counter-order; later partial
    /// fills grow that same counter-order.
    fn attach_counter(&mut self, opening_id: OrderId, qty: f64, timestamp: DateTime<Utc>) -> GridResult<()> {
        let (counter_id, side, price, level_index, generation) = match self.orders.get(&opening_id) {
            Some(o) => (o.counter_order_id, o.side, o.price, o.level_index, o.generation),
            None => return Err(self.fault(format!("opening order #{} missing", opening_id))),
        };

        if let Some(counter_id) = counter_id {
            let grown = match self.orders.get_mut(&counter_id) {
                Some(counter) if counter.is_resting() => {
                    counter.size += qty;
                    counter.remaining += qty;
                    true
                }
                _ => false,
            };
            if grown {
                return Ok(());
            }
            return Err(self.fault(format!(
                "opening order #{} filled again after its counter-order #{} closed",
                opening_id, counter_id
            )));
        }

        let counter_price = self.counter_price(level_index, side, price);
        let counter_id = self.place_order(
            OrderRequest {
                role: OrderRole::Counter,
                side: side.opposite(),
                price: counter_price,
                size: qty,
                level_index,
                generation,
                parent: Some(opening_id),
                armed: false,
            },
            timestamp,
        );
        if let Some(opening) = self.orders.get_mut(&opening_id) {
            opening.counter_order_id = Some(counter_id);
        }
        if generation == self.generation {
            if let Some(level) = self.levels.get_mut(level_index) {
                level.status = LevelStatus::CounterPlaced;
            }
        }
        Ok(())
    }

    /// Adjacent level on the profitable side; one edge spacing beyond the grid
    /// when the opening level is the outermost one.
    fn counter_price(&self, index: usize, side: OrderSide, price: f64) -> f64 {
        let n = self.levels.len();
        let spacing_mode = self.config.as_ref().map_or(SpacingMode::Arithmetic, |c| c.spacing);
        let precision = self.config.as_ref().map_or(8, |c| c.price_precision);

        match side {
            OrderSide::Buy => {
                if let Some(level) = self.levels.get(index + 1) {
                    return level.price;
                }
                let (a, b) = (self.levels[n - 2].price, self.levels[n - 1].price);
                let raw = match spacing_mode {
                    SpacingMode::Arithmetic => price + (b - a),
                    SpacingMode::Geometric => price * (b / a),
                };
                round_half_up(raw, precision)
            }
            OrderSide::Sell => {
                if index > 0 {
                    if let Some(level) = self.levels.get(index - 1) {
                        return level.price;
                    }
                }
                let (a, b) = (self.levels[0].price, self.levels[1].price);
                let raw = match spacing_mode {
                    SpacingMode::Arithmetic if price - (b - a) > 0.0 => price - (b - a),
                    _ => price * (a / b),
                };
                round_half_up(raw, precision)
            }
        }
    }

    /// Book a cycle for `qty` closed by one counter fill. The opening order's
    /// fees are charged pro rata to the quantity still open on it. The level
    /// is re-armed once the counter-order is fully filled.
    fn close_cycle(
        &mut self,
        counter_id: OrderId,
        qty: f64,
        fee: f64,
        fully_filled: bool,
        timestamp: DateTime<Utc>,
    ) -> GridResult<CycleId> {
        let (counter_price, counter_filled, parent_id) = match self.orders.get(&counter_id) {
            Some(c) => (c.price, c.filled, c.parent_order_id),
            None => return Err(self.fault(format!("counter-order #{} missing", counter_id))),
        };
        let parent_id = match parent_id {
            Some(p) => p,
            None => return Err(self.fault(format!("counter-order #{} has no opening order", counter_id))),
        };
        let closed_before = counter_filled - qty;
        let parent = self.orders.get_mut(&parent_id).map(|parent| {
            let unallocated = parent.fees - parent.fees_closed;
            let still_open = parent.filled - closed_before;
            let share = if fully_filled || still_open <= qty + QTY_EPSILON {
                unallocated
            } else {
                unallocated * qty / still_open
            };
            parent.fees_closed += share;
            // Unfilled remainder of a partially filled opening order is dropped
            if fully_filled && parent.remaining > 0.0 {
                parent.remaining = 0.0;
                parent.status = OrderStatus::Cancelled;
            }
            (parent.clone(), share)
        });
        let (parent, opening_fees) = match parent {
            Some(found) => found,
            None => return Err(self.fault(format!("opening order #{} missing", parent_id))),
        };
        if fully_filled {
            self.resting.remove(&parent_id);
        }

        let (buy_price, sell_price, direction) = match parent.side {
            OrderSide::Buy => (parent.price, counter_price, CycleDirection::BuyThenSell),
            OrderSide::Sell => (counter_price, parent.price, CycleDirection::SellThenBuy),
        };
        let size = qty;
        let fees = opening_fees + fee;
        let realized_pnl = (sell_price - buy_price) * size - fees;
        let opened_at = parent.filled_at.unwrap_or(timestamp);

        let id = self.cycles.len() as CycleId + 1;
        self.cycles.push(GridCycle {
            id,
            direction,
            opening_order_id: parent_id,
            closing_order_id: counter_id,
            entry_price: parent.price,
            exit_price: counter_price,
            size,
            fees,
            realized_pnl,
            opened_at,
            closed_at: timestamp,
            duration_secs: (timestamp - opened_at).num_seconds(),
        });
        self.realized_pnl += realized_pnl;

        // Re-arm the opening level unless a rebalance replaced the grid since
        if fully_filled && parent.generation == self.generation {
            let level = self
                .levels
                .get(parent.level_index)
                .filter(|l| l.status != LevelStatus::Cancelled)
                .map(|l| l.price);
            if let Some(level_price) = level {
                let size = self.order_size();
                let generation = self.generation;
                self.place_order(
                    OrderRequest {
                        role: OrderRole::Opening,
                        side: parent.side,
                        price: level_price,
                        size,
                        level_index: parent.level_index,
                        generation,
                        parent: None,
                        armed: false,
                    },
                    timestamp,
                );
                self.levels[parent.level_index].status = LevelStatus::Pending;
            }
        }

        if let Some(threshold) = self.take_profit {
            if self.termination.is_none() && self.realized_pnl >= threshold {
                info!(
                    "💰 Take-profit reached: realized {:.4} >= {:.4} at {}",
                    self.realized_pnl, threshold, timestamp
                );
                self.termination = Some(Termination::TakeProfit {
                    realized_pnl: self.realized_pnl,
                    timestamp,
                });
            }
        }

        Ok(id)
    }

    /// Replace the grid with one of the same shape centred on `center`.
    ///
    /// Every resting opening order is cancelled; counter-orders of open cycles
    /// stay on the book and complete normally, without re-arming a level of
    /// the old grid.
    fn rebalance(&mut self, center: f64, timestamp: DateTime<Utc>) -> GridResult<()> {
        let mut next = match &self.config {
            Some(config) => config.clone(),
            None => return Err(GridError::invalid_config("order manager used before initialize")),
        };
        let bounds = recentred_bounds(next.spacing, self.bounds, center);
        next.lower_price = bounds.lower;
        next.upper_price = bounds.upper;
        next.atr_adjustment = None;

        let levels = match compute_levels(&next) {
            Ok(levels) => levels,
            Err(e) => {
                warn!("⚠️  Rebalance around {:.8} skipped: {}", center, e);
                return Ok(());
            }
        };

        let cancelled: Vec<OrderId> = self
            .resting
            .iter()
            .copied()
            .filter(|id| self.orders.get(id).map_or(false, |o| o.role == OrderRole::Opening))
            .collect();
        for id in &cancelled {
            if let Some(order) = self.orders.get_mut(id) {
                order.remaining = 0.0;
                order.status = OrderStatus::Cancelled;
            }
            self.resting.remove(id);
        }
        for level in &mut self.levels {
            level.status = LevelStatus::Cancelled;
        }

        self.generation += 1;
        self.levels = levels;
        self.bounds = bounds;
        self.rebalance_count += 1;
        self.place_grid_orders(center, timestamp, false);

        info!(
            "♻️  Rebalanced around {:.4}: [{:.4}, {:.4}], {} orders cancelled (generation {})",
            center,
            bounds.lower,
            bounds.upper,
            cancelled.len(),
            self.generation
        );
        Ok(())
    }

    fn check_order(&self, id: OrderId) -> GridResult<()> {
        let order = match self.orders.get(&id) {
            Some(o) => o,
            None => return Err(self.fault(format!("order #{} missing", id))),
        };
        if order.remaining < 0.0 || order.filled < 0.0 {
            return Err(self.fault(format!(
                "order #{} has negative size (remaining {}, filled {})",
                id, order.remaining, order.filled
            )));
        }
        if order.filled > order.size * (1.0 + 1e-9) + QTY_EPSILON {
            return Err(self.fault(format!(
                "order #{} overfilled: {} of {}",
                id, order.filled, order.size
            )));
        }
        if order.role == OrderRole::Opening && order.filled > 0.0 && order.counter_order_id.is_none() {
            return Err(self.fault(format!("filled opening order #{} has no counter-order", id)));
        }
        Ok(())
    }

    fn check_invariants(&self) -> GridResult<()> {
        let tolerance = self.settings.capital * 1e-9 + 1e-9;
        if self.exposure < -tolerance {
            return Err(self.fault(format!("negative open exposure {:.12}", self.exposure)));
        }
        if self.exposure > self.settings.capital + tolerance {
            return Err(self.fault(format!(
                "open exposure {:.8} exceeds capital {:.8}",
                self.exposure, self.settings.capital
            )));
        }
        if let Some(pair) = self.levels.windows(2).find(|w| w[1].price <= w[0].price) {
            return Err(self.fault(format!(
                "grid levels not strictly increasing: {} then {}",
                pair[0].price, pair[1].price
            )));
        }
        for id in &self.resting {
            let order = match self.orders.get(id) {
                Some(o) => o,
                None => return Err(self.fault(format!("resting order #{} missing from the book", id))),
            };
            if !order.price.is_finite() || order.price <= 0.0 || order.remaining <= 0.0 {
                return Err(self.fault(format!(
                    "resting order #{} has price {} and remaining {}",
                    id, order.price, order.remaining
                )));
            }
        }
        Ok(())
    }
}
