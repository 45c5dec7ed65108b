//! Perp engine: tickers, leveraged positions, liquidation and funding.
//!
//! Each ticker is one lock domain holding its mark price, open interest and
//! positions. Posted margin lives in the `PerpVault` account, which is the
//! house counterparty: closes pay out of it and liquidations leave the margin
//! in it. Funding only moves the margin owed to a position, not balances.

use crate::balance::{BalanceError, BalanceStore, Posting, TransactionType};
use crate::config::{PerpConfig, RetryConfig};
use crate::events::{
    CloseReason, EventLog, EventPayload, FundingAppliedEvent, PerpClosedEvent, PerpOpenedEvent,
};
use crate::fees::{FeeBreakdown, FeeError, FeeKind, FeeLedger};
use crate::perp::{self, CloseSettlement};
use crate::retry::{lock_with_retry, LockError};
use crate::types::{AccountId, Leverage, PerpPositionId, Price, Quote, Side, Ticker, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpMarket {
    pub ticker: Ticker,
    pub mark_price: Price,
    pub max_leverage: Leverage,
    pub min_order_size: Quote,
    pub open_interest_long: Quote,
    pub open_interest_short: Quote,
    pub last_funding_rate: Decimal,
    pub updated_at: Timestamp,
}

impl PerpMarket {
    fn add_open_interest(&mut self, side: Side, notional: Quote) {
        match side {
            Side::Long => self.open_interest_long = self.open_interest_long.add(notional),
            Side::Short => self.open_interest_short = self.open_interest_short.add(notional),
        }
    }

    fn remove_open_interest(&mut self, side: Side, notional: Quote) {
        match side {
            Side::Long => self.open_interest_long = self.open_interest_long.sub(notional).floor_zero(),
            Side::Short => self.open_interest_short = self.open_interest_short.sub(notional).floor_zero(),
        }
    }
}

/// Result of `list_ticker`. Relisting an existing ticker is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    Listed(PerpMarket),
    AlreadyListed(PerpMarket),
}

impl Listing {
    pub fn market(&self) -> &PerpMarket {
        match self {
            Listing::Listed(m) | Listing::AlreadyListed(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerpPosition {
    pub id: PerpPositionId,
    pub account: AccountId,
    pub ticker: Ticker,
    pub side: Side,
    pub entry_price: Price,
    pub margin: Quote,
    pub leverage: Leverage,
    pub notional: Quote,
    pub liquidation_price: Price,
    // derived on every mark
    pub unrealized_pnl: Quote,
    pub unrealized_pnl_percent: Decimal,
    pub funding_paid: Quote,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub exit_price: Option<Price>,
    pub realized_pnl: Option<Quote>,
    pub close_reason: Option<CloseReason>,
}

impl PerpPosition {
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    fn remark(&mut self, mark_price: Price) {
        self.unrealized_pnl = perp::unrealized_pnl(self.side, self.notional, self.entry_price, mark_price);
        self.unrealized_pnl_percent = perp::pnl_percent(self.unrealized_pnl, self.margin);
    }

    /// What a close at `mark_price` would hand back, before fees.
    pub fn close_value(&self, mark_price: Price) -> Quote {
        let pnl = perp::unrealized_pnl(self.side, self.notional, self.entry_price, mark_price);
        perp::settle_close(self.margin, pnl).returned
    }

    fn finish(&mut self, exit_price: Price, settled: CloseSettlement, reason: CloseReason, now: Timestamp) {
        self.exit_price = Some(exit_price);
        self.realized_pnl = Some(settled.realized_pnl);
        self.unrealized_pnl = Quote::zero();
        self.unrealized_pnl_percent = Decimal::ZERO;
        self.close_reason = Some(reason);
        self.closed_at = Some(now);
    }
}

/// Parameters for opening a position.
#[derive(Debug, Clone)]
pub struct OpenPerp {
    pub ticker: Ticker,
    pub side: Side,
    pub margin: Quote,
    pub leverage: u32,
    pub referrer: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingSummary {
    pub ticker: Ticker,
    pub funding_rate: Decimal,
    pub positions_charged: usize,
    pub closed: Vec<PerpPositionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PerpError {
    #[error("Ticker {0} not found")]
    TickerNotFound(Ticker),

    #[error("Position {0:?} not found")]
    PositionNotFound(PerpPositionId),

    #[error("Leverage {requested}x outside [1, {max}]")]
    LeverageOutOfBounds { requested: u32, max: Leverage },

    #[error("Notional {notional} below minimum {minimum}")]
    BelowMinimumOrder { notional: Quote, minimum: Quote },

    #[error("Margin must be positive, got {0}")]
    InvalidMargin(Quote),

    #[error("Price must be positive, got {0}")]
    InvalidPrice(Decimal),

    #[error("Position {0:?} already closed")]
    AlreadyClosed(PerpPositionId),

    #[error("Position {position_id:?} not liquidatable: mark {mark_price}, liquidation {liquidation_price}")]
    NotLiquidatable {
        position_id: PerpPositionId,
        mark_price: Price,
        liquidation_price: Price,
    },

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug)]
struct TickerState {
    market: PerpMarket,
    positions: BTreeMap<PerpPositionId, PerpPosition>,
}

impl TickerState {
    fn position_mut(&mut self, id: PerpPositionId) -> Result<&mut PerpPosition, PerpError> {
        self.positions.get_mut(&id).ok_or(PerpError::PositionNotFound(id))
    }

    fn open_position_mut(&mut self, id: PerpPositionId) -> Result<&mut PerpPosition, PerpError> {
        let position = self.position_mut(id)?;
        if !position.is_open() {
            return Err(PerpError::AlreadyClosed(id));
        }
        Ok(position)
    }
}

#[derive(Debug)]
pub struct PerpEngine {
    tickers: RwLock<HashMap<Ticker, Arc<Mutex<TickerState>>>>,
    index: RwLock<HashMap<PerpPositionId, Ticker>>,
    balances: Arc<BalanceStore>,
    fees: Arc<FeeLedger>,
    events: Arc<EventLog>,
    config: PerpConfig,
    retry: RetryConfig,
    next_position_id: AtomicU64,
}

impl PerpEngine {
    pub fn new(
        balances: Arc<BalanceStore>,
        fees: Arc<FeeLedger>,
        events: Arc<EventLog>,
        config: PerpConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            balances,
            fees,
            events,
            config,
            retry,
            next_position_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &PerpConfig {
        &self.config
    }

    pub fn list_ticker(
        &self,
        ticker: Ticker,
        initial_price: Price,
        max_leverage: Option<Leverage>,
        min_order_size: Option<Quote>,
    ) -> Listing {
        let mut tickers = self.tickers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = tickers.get(&ticker) {
            let state = existing.lock().unwrap_or_else(|e| e.into_inner());
            return Listing::AlreadyListed(state.market.clone());
        }

        let market = PerpMarket {
            ticker: ticker.clone(),
            mark_price: initial_price,
            max_leverage: max_leverage.unwrap_or(self.config.default_max_leverage),
            min_order_size: min_order_size.unwrap_or(self.config.min_order_size),
            open_interest_long: Quote::zero(),
            open_interest_short: Quote::zero(),
            last_funding_rate: Decimal::ZERO,
            updated_at: Timestamp::now(),
        };
        tickers.insert(
            ticker.clone(),
            Arc::new(Mutex::new(TickerState {
                market: market.clone(),
                positions: BTreeMap::new(),
            })),
        );
        tracing::info!(%ticker, price = %initial_price, max_leverage = %market.max_leverage, "ticker listed");
        Listing::Listed(market)
    }

    pub fn market(&self, ticker: &Ticker) -> Result<PerpMarket, PerpError> {
        let handle = self.handle(ticker)?;
        let state = self.lock(&handle, ticker)?;
        Ok(state.market.clone())
    }

    pub fn markets(&self) -> Vec<PerpMarket> {
        self.handles()
            .into_iter()
            .filter_map(|(t, h)| self.lock(&h, &t).ok().map(|s| s.market.clone()))
            .collect()
    }

    // new mark price, re-marks every open position on the ticker
    pub fn update_price(&self, ticker: &Ticker, price: Decimal) -> Result<PerpMarket, PerpError> {
        let mark_price = Price::new(price).ok_or(PerpError::InvalidPrice(price))?;
        let handle = self.handle(ticker)?;
        let mut state = self.lock(&handle, ticker)?;
        state.market.mark_price = mark_price;
        state.market.updated_at = Timestamp::now();
        for position in state.positions.values_mut().filter(|p| p.is_open()) {
            position.remark(mark_price);
        }
        tracing::debug!(%ticker, %mark_price, "mark price updated");
        Ok(state.market.clone())
    }

    // 7.1: margin and fee leave the account as one posting set
    pub fn open(&self, account: AccountId, order: OpenPerp) -> Result<PerpPosition, PerpError> {
        if !order.margin.is_positive() {
            return Err(PerpError::InvalidMargin(order.margin));
        }

        let handle = self.handle(&order.ticker)?;
        let mut state = self.lock(&handle, &order.ticker)?;

        let max = state.market.max_leverage;
        let leverage = Leverage::new(order.leverage)
            .filter(|l| *l <= max)
            .ok_or(PerpError::LeverageOutOfBounds { requested: order.leverage, max })?;

        let notional = perp::notional(order.margin, leverage);
        if notional < state.market.min_order_size {
            return Err(PerpError::BelowMinimumOrder {
                notional,
                minimum: state.market.min_order_size,
            });
        }

        let fee = self.fees.quote_trade(account, notional, order.referrer)?;
        let mut postings = vec![
            Posting::debit(account, order.margin, TransactionType::PerpOpen),
            Posting::credit(AccountId::PerpVault, order.margin, TransactionType::PerpOpen),
        ];
        postings.extend(self.fees.postings(account, &fee, FeeKind::Trading));
        self.balances.apply(&postings)?;

        let now = Timestamp::now();
        let entry_price = state.market.mark_price;
        let id = PerpPositionId(self.next_position_id.fetch_add(1, Ordering::SeqCst));
        let position = PerpPosition {
            id,
            account,
            ticker: order.ticker.clone(),
            side: order.side,
            entry_price,
            margin: order.margin,
            leverage,
            notional,
            liquidation_price: perp::liquidation_price(
                entry_price,
                leverage,
                order.side,
                self.config.maintenance_threshold,
            ),
            unrealized_pnl: Quote::zero(),
            unrealized_pnl_percent: Decimal::ZERO,
            funding_paid: Quote::zero(),
            opened_at: now,
            closed_at: None,
            exit_price: None,
            realized_pnl: None,
            close_reason: None,
        };
        state.market.add_open_interest(order.side, notional);
        state.positions.insert(id, position.clone());
        drop(state);

        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, order.ticker.clone());
        self.fees.record(account, FeeKind::Trading, notional, &fee);
        self.emit_opened(&position, &fee);
        tracing::info!(
            position = id.0,
            %account,
            ticker = %order.ticker,
            side = ?order.side,
            margin = %order.margin,
            %leverage,
            %entry_price,
            liquidation_price = %position.liquidation_price,
            "perp opened"
        );
        Ok(position)
    }

    // 7.2: recompute unrealized pnl at the current mark
    pub fn mark(&self, position_id: PerpPositionId) -> Result<PerpPosition, PerpError> {
        let ticker = self.ticker_of(position_id)?;
        let handle = self.handle(&ticker)?;
        let mut state = self.lock(&handle, &ticker)?;
        let mark_price = state.market.mark_price;
        let position = state.position_mut(position_id)?;
        if position.is_open() {
            position.remark(mark_price);
        }
        Ok(position.clone())
    }

    // 7.3: user close at the current mark
    pub fn close(&self, position_id: PerpPositionId) -> Result<PerpPosition, PerpError> {
        let ticker = self.ticker_of(position_id)?;
        let handle = self.handle(&ticker)?;
        let mut state = self.lock(&handle, &ticker)?;
        let closed = self.close_locked(&mut state, position_id, CloseReason::UserClosed)?;
        drop(state);
        tracing::info!(
            position = position_id.0,
            account = %closed.account,
            realized_pnl = ?closed.realized_pnl,
            "perp closed"
        );
        Ok(closed)
    }

    // 7.4: forced close once the mark crosses the liquidation price
    pub fn liquidate(&self, position_id: PerpPositionId) -> Result<PerpPosition, PerpError> {
        let ticker = self.ticker_of(position_id)?;
        let handle = self.handle(&ticker)?;
        let mut state = self.lock(&handle, &ticker)?;
        let mark_price = state.market.mark_price;

        let position = state.open_position_mut(position_id)?;
        if !perp::is_liquidatable(position.side, position.liquidation_price, mark_price) {
            let liquidation_price = position.liquidation_price;
            tracing::warn!(
                position = position_id.0,
                %mark_price,
                %liquidation_price,
                "liquidation rejected: price not crossed"
            );
            return Err(PerpError::NotLiquidatable {
                position_id,
                mark_price,
                liquidation_price,
            });
        }

        // the margin stays in the vault
        let settled = perp::settle_liquidation(position.margin);
        position.finish(mark_price, settled, CloseReason::Liquidation, Timestamp::now());
        let closed = position.clone();
        state.market.remove_open_interest(closed.side, closed.notional);
        drop(state);

        self.emit_closed(&closed, settled.returned);
        tracing::info!(position = position_id.0, account = %closed.account, %mark_price, "perp liquidated");
        Ok(closed)
    }

    /// Open positions on `ticker` whose liquidation price the mark has crossed.
    pub fn liquidatable(&self, ticker: &Ticker) -> Result<Vec<PerpPositionId>, PerpError> {
        let handle = self.handle(ticker)?;
        let state = self.lock(&handle, ticker)?;
        let mark_price = state.market.mark_price;
        Ok(state
            .positions
            .values()
            .filter(|p| p.is_open() && perp::is_liquidatable(p.side, p.liquidation_price, mark_price))
            .map(|p| p.id)
            .collect())
    }

    // 7.5: charges side.sign() * notional * rate against each open position's margin.
    // a position whose margin runs out is closed at mark.
    pub fn apply_funding(&self, ticker: &Ticker, rate: Decimal) -> Result<FundingSummary, PerpError> {
        let funding_rate = perp::clamp_funding_rate(rate, self.config.max_funding_rate);
        if funding_rate != rate {
            tracing::debug!(%ticker, requested = %rate, applied = %funding_rate, "funding rate clamped");
        }

        let handle = self.handle(ticker)?;
        let mut state = self.lock(&handle, ticker)?;

        let mut charged = 0;
        let mut exhausted = Vec::new();
        for position in state.positions.values_mut().filter(|p| p.is_open()) {
            let payment = perp::funding_payment(position.side, position.notional, funding_rate);
            let applied = payment.min(position.margin);
            position.margin = position.margin.sub(applied);
            position.funding_paid = position.funding_paid.add(applied);
            charged += 1;
            if !position.margin.is_positive() {
                exhausted.push(position.id);
            }
        }

        let mut closed = Vec::with_capacity(exhausted.len());
        for id in exhausted {
            match self.close_locked(&mut state, id, CloseReason::FundingExhausted) {
                Ok(_) => closed.push(id),
                // stays open on zero margin; the next tick or a liquidation retries
                Err(e) => tracing::warn!(position = id.0, error = %e, "funding close failed"),
            }
        }
        state.market.last_funding_rate = funding_rate;
        drop(state);

        self.events.emit(EventPayload::FundingApplied(FundingAppliedEvent {
            ticker: ticker.clone(),
            funding_rate,
            positions_charged: charged,
            positions_closed: closed.len(),
        }));
        tracing::info!(%ticker, %funding_rate, charged, closed = closed.len(), "funding applied");
        Ok(FundingSummary {
            ticker: ticker.clone(),
            funding_rate,
            positions_charged: charged,
            closed,
        })
    }

    pub fn position(&self, position_id: PerpPositionId) -> Result<PerpPosition, PerpError> {
        let ticker = self.ticker_of(position_id)?;
        let handle = self.handle(&ticker)?;
        let state = self.lock(&handle, &ticker)?;
        state
            .positions
            .get(&position_id)
            .cloned()
            .ok_or(PerpError::PositionNotFound(position_id))
    }

    pub fn positions_for(&self, account: AccountId) -> Vec<PerpPosition> {
        self.all_positions()
            .into_iter()
            .filter(|p| p.account == account)
            .collect()
    }

    pub fn all_positions(&self) -> Vec<PerpPosition> {
        let mut positions: Vec<PerpPosition> = self
            .handles()
            .into_iter()
            .filter_map(|(t, h)| {
                self.lock(&h, &t)
                    .ok()
                    .map(|s| s.positions.values().cloned().collect::<Vec<_>>())
            })
            .flatten()
            .collect();
        positions.sort_by_key(|p| p.id);
        positions
    }

    /// What closing every open position of `account` would return right now.
    pub fn mark_value(&self, account: AccountId) -> Result<Quote, PerpError> {
        let mut total = Quote::zero();
        for (ticker, handle) in self.handles() {
            let state = self.lock(&handle, &ticker)?;
            let mark_price = state.market.mark_price;
            total = total.add(
                state
                    .positions
                    .values()
                    .filter(|p| p.is_open() && p.account == account)
                    .map(|p| p.close_value(mark_price))
                    .sum(),
            );
        }
        Ok(total)
    }

    fn close_locked(
        &self,
        state: &mut TickerState,
        position_id: PerpPositionId,
        reason: CloseReason,
    ) -> Result<PerpPosition, PerpError> {
        let mark_price = state.market.mark_price;
        let position = state.open_position_mut(position_id)?;
        let pnl = perp::unrealized_pnl(position.side, position.notional, position.entry_price, mark_price);
        let settled = perp::settle_close(position.margin, pnl);

        self.balances.apply(&[
            Posting::debit(AccountId::PerpVault, settled.returned, TransactionType::PerpClose),
            Posting::credit(position.account, settled.returned, TransactionType::PerpClose),
        ])?;

        position.finish(mark_price, settled, reason, Timestamp::now());
        let closed = position.clone();
        state.market.remove_open_interest(closed.side, closed.notional);
        self.emit_closed(&closed, settled.returned);
        Ok(closed)
    }

    fn emit_opened(&self, position: &PerpPosition, fee: &FeeBreakdown) {
        self.events.emit(EventPayload::PerpOpened(PerpOpenedEvent {
            position_id: position.id,
            account: position.account,
            ticker: position.ticker.clone(),
            side: position.side,
            margin: position.margin,
            leverage: position.leverage,
            entry_price: position.entry_price,
            liquidation_price: position.liquidation_price,
            fee: fee.fee_amount,
        }));
    }

    fn emit_closed(&self, position: &PerpPosition, returned: Quote) {
        if let (Some(exit_price), Some(realized_pnl), Some(reason)) =
            (position.exit_price, position.realized_pnl, position.close_reason)
        {
            self.events.emit(EventPayload::PerpClosed(PerpClosedEvent {
                position_id: position.id,
                account: position.account,
                exit_price,
                realized_pnl,
                returned,
                reason,
            }));
        }
    }

    fn ticker_of(&self, position_id: PerpPositionId) -> Result<Ticker, PerpError> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&position_id)
            .cloned()
            .ok_or(PerpError::PositionNotFound(position_id))
    }

    fn handle(&self, ticker: &Ticker) -> Result<Arc<Mutex<TickerState>>, PerpError> {
        self.tickers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(ticker)
            .cloned()
            .ok_or_else(|| PerpError::TickerNotFound(ticker.clone()))
    }

    fn handles(&self) -> Vec<(Ticker, Arc<Mutex<TickerState>>)> {
        let mut handles: Vec<_> = self
            .tickers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(t, h)| (t.clone(), Arc::clone(h)))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));
        handles
    }

    fn lock<'a>(
        &self,
        handle: &'a Arc<Mutex<TickerState>>,
        ticker: &Ticker,
    ) -> Result<MutexGuard<'a, TickerState>, PerpError> {
        Ok(lock_with_retry(handle, &self.retry, || format!("ticker {ticker}"))?)
    }
}
