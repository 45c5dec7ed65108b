//! Prediction market AMM.
//!
//! Owns every binary market and every prediction position. A trade locks its
//! market, prices the fill against the reserves it sees under that lock, applies
//! principal and fee as one posting set, and only then writes the new reserves
//! and position. Money paid for shares sits in the market's escrow account until
//! the market is resolved or cancelled.

use crate::balance::{BalanceError, BalanceStore, BalanceTransaction, Posting, TransactionType};
use crate::config::{PredictionConfig, RetryConfig};
use crate::events::{
    EventLog, EventPayload, MarketCreatedEvent, MarketSettledEvent, Settlement, SharesTradedEvent,
    TradeDirection,
};
use crate::fees::{FeeBreakdown, FeeError, FeeKind, FeeLedger};
use crate::lmsr::{self, LmsrError, Prices, Reserves, TradeQuote};
use crate::retry::{lock_with_retry, LockError};
use crate::types::{AccountId, MarketId, Outcome, PositionId, Quote, Timestamp, UserId};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Resolved,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub question: String,
    pub yes_shares: Decimal,
    pub no_shares: Decimal,
    // LMSR depth b, fixed at creation
    pub liquidity: Decimal,
    pub status: MarketStatus,
    pub resolution: Option<Outcome>,
    pub end_date: Timestamp,
    pub created_at: Timestamp,
}

impl Market {
    pub fn reserves(&self) -> Reserves {
        Reserves::new(self.yes_shares, self.no_shares)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == MarketStatus::Resolved
    }

    pub fn prices(&self) -> Result<Prices, LmsrError> {
        lmsr::prices(self.reserves(), self.liquidity)
    }

    fn ensure_tradable(&self, now: Timestamp) -> Result<(), AmmError> {
        match self.status {
            MarketStatus::Resolved => Err(AmmError::MarketResolved(self.id)),
            MarketStatus::Cancelled => Err(AmmError::MarketInactive(self.id)),
            MarketStatus::Open if now.is_after(&self.end_date) => Err(AmmError::MarketInactive(self.id)),
            MarketStatus::Open => Ok(()),
        }
    }
}

/// Parameters for a new market. `liquidity: None` uses the configured default.
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub question: String,
    pub liquidity: Option<Decimal>,
    pub initial_reserves: Reserves,
    pub end_date: Timestamp,
}

impl NewMarket {
    pub fn balanced(question: impl Into<String>, end_date: Timestamp) -> Self {
        Self {
            question: question.into(),
            liquidity: None,
            initial_reserves: Reserves::new(Decimal::ZERO, Decimal::ZERO),
            end_date,
        }
    }

    pub fn with_liquidity(mut self, liquidity: Decimal) -> Self {
        self.liquidity = Some(liquidity);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Active,
    Resolved,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionPosition {
    pub id: PositionId,
    pub account: AccountId,
    pub market_id: MarketId,
    pub outcome: Outcome,
    pub shares: Decimal,
    pub avg_price: Decimal,
    // dollars paid for the shares still held
    pub cost_basis: Quote,
    pub realized_pnl: Quote,
    pub status: PositionStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl PredictionPosition {
    fn add(&mut self, shares: Decimal, cost: Quote, now: Timestamp) {
        self.shares += shares;
        self.cost_basis = self.cost_basis.add(cost);
        if self.shares > Decimal::ZERO {
            self.avg_price = self.cost_basis.value() / self.shares;
        }
        self.updated_at = now;
    }

    // returns the cost basis released by the sale
    fn remove(&mut self, shares: Decimal, proceeds: Quote, now: Timestamp) -> Quote {
        let released = Quote::new(self.avg_price * shares).min(self.cost_basis);
        self.shares -= shares;
        self.cost_basis = self.cost_basis.sub(released);
        if self.shares.is_zero() {
            self.cost_basis = Quote::zero();
        }
        self.realized_pnl = self.realized_pnl.add(proceeds.sub(released));
        self.updated_at = now;
        released
    }

    fn settle(&mut self, status: PositionStatus, paid: Quote, now: Timestamp) {
        self.realized_pnl = self.realized_pnl.add(paid.sub(self.cost_basis));
        self.status = status;
        self.updated_at = now;
    }

    pub fn mark_value(&self, prices: &Prices) -> Quote {
        Quote::new(self.shares * prices.get(self.outcome))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionFill {
    pub market_id: MarketId,
    pub position_id: PositionId,
    pub quote: TradeQuote,
    pub fee: FeeBreakdown,
    pub balance_after: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub market_id: MarketId,
    pub settlement: Settlement,
    pub total_paid: Quote,
    pub positions_settled: usize,
    pub residual_to_platform: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmmError {
    #[error("Market {0:?} not found")]
    MarketNotFound(MarketId),

    #[error("Market {0:?} is resolved")]
    MarketResolved(MarketId),

    #[error("Market {0:?} is not accepting trades")]
    MarketInactive(MarketId),

    #[error("Order {amount} below minimum {minimum}")]
    BelowMinimumOrder { amount: Quote, minimum: Quote },

    #[error("No {outcome} position for {account} in market {market_id:?}")]
    PositionNotFound {
        market_id: MarketId,
        account: AccountId,
        outcome: Outcome,
    },

    #[error("Cannot sell {requested} shares, holding {held}")]
    InsufficientShares { held: Decimal, requested: Decimal },

    #[error("Escrow {escrow} cannot cover payout {payout}")]
    EscrowShortfall { escrow: Quote, payout: Quote },

    #[error("Pricing error: {0}")]
    Pricing(#[from] LmsrError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug)]
struct MarketState {
    market: Market,
    positions: BTreeMap<PositionId, PredictionPosition>,
    active: HashMap<(AccountId, Outcome), PositionId>,
}

impl MarketState {
    fn active_position_mut(&mut self, account: AccountId, outcome: Outcome) -> Option<&mut PredictionPosition> {
        let id = self.active.get(&(account, outcome))?;
        self.positions.get_mut(id)
    }
}

#[derive(Debug)]
pub struct PredictionAmm {
    markets: RwLock<HashMap<MarketId, Arc<Mutex<MarketState>>>>,
    balances: Arc<BalanceStore>,
    fees: Arc<FeeLedger>,
    events: Arc<EventLog>,
    config: PredictionConfig,
    retry: RetryConfig,
    next_market_id: AtomicU64,
    next_position_id: AtomicU64,
}

impl PredictionAmm {
    pub fn new(
        balances: Arc<BalanceStore>,
        fees: Arc<FeeLedger>,
        events: Arc<EventLog>,
        config: PredictionConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            markets: RwLock::new(HashMap::new()),
            balances,
            fees,
            events,
            config,
            retry,
            next_market_id: AtomicU64::new(1),
            next_position_id: AtomicU64::new(1),
        }
    }

    // 5.1: funds the escrow with the worst-case subsidy so resolution can always pay out
    pub fn create_market(&self, request: NewMarket, sponsor: AccountId) -> Result<Market, AmmError> {
        let liquidity = request.liquidity.unwrap_or(self.config.default_liquidity);
        if liquidity <= Decimal::ZERO {
            return Err(LmsrError::InvalidLiquidity(liquidity).into());
        }
        let initial = request.initial_reserves;
        if initial.yes < Decimal::ZERO || initial.no < Decimal::ZERO {
            return Err(LmsrError::NonPositiveAmount(initial.yes.min(initial.no)).into());
        }

        let subsidy = Quote::new(lmsr::worst_case_subsidy(initial, liquidity)?);
        let id = MarketId(self.next_market_id.fetch_add(1, Ordering::SeqCst));
        if subsidy.is_positive() {
            self.balances.transfer(
                sponsor,
                AccountId::MarketEscrow(id),
                subsidy,
                TransactionType::MarketSubsidy,
            )?;
        }

        let market = Market {
            id,
            question: request.question,
            yes_shares: initial.yes,
            no_shares: initial.no,
            liquidity,
            status: MarketStatus::Open,
            resolution: None,
            end_date: request.end_date,
            created_at: Timestamp::now(),
        };

        let state = MarketState {
            market: market.clone(),
            positions: BTreeMap::new(),
            active: HashMap::new(),
        };
        self.markets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Mutex::new(state)));

        self.events.emit(EventPayload::MarketCreated(MarketCreatedEvent {
            market_id: id,
            liquidity,
            subsidy,
            sponsor,
        }));
        tracing::info!(market = id.0, %liquidity, %subsidy, "market created");
        Ok(market)
    }

    pub fn market(&self, market_id: MarketId) -> Result<Market, AmmError> {
        let handle = self.handle(market_id)?;
        let state = self.lock(&handle, market_id)?;
        Ok(state.market.clone())
    }

    pub fn markets(&self) -> Vec<Market> {
        let mut markets: Vec<Market> = self
            .handles()
            .into_iter()
            .filter_map(|(id, h)| self.lock(&h, id).ok().map(|s| s.market.clone()))
            .collect();
        markets.sort_by_key(|m| m.id);
        markets
    }

    pub fn prices(&self, market_id: MarketId) -> Result<Prices, AmmError> {
        Ok(self.market(market_id)?.prices()?)
    }

    // 5.2: calculateBuy. pure: prices a buy against the current reserves
    pub fn quote_buy(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        amount: Quote,
    ) -> Result<TradeQuote, AmmError> {
        let market = self.market(market_id)?;
        self.price_buy(&market, outcome, amount, Timestamp::now())
    }

    pub fn quote_sell(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        shares: Decimal,
    ) -> Result<TradeQuote, AmmError> {
        let market = self.market(market_id)?;
        market.ensure_tradable(Timestamp::now())?;
        Ok(lmsr::calculate_sell(market.reserves(), market.liquidity, outcome, shares)?)
    }

    fn price_buy(
        &self,
        market: &Market,
        outcome: Outcome,
        amount: Quote,
        now: Timestamp,
    ) -> Result<TradeQuote, AmmError> {
        market.ensure_tradable(now)?;
        if amount < self.config.min_order {
            return Err(AmmError::BelowMinimumOrder {
                amount,
                minimum: self.config.min_order,
            });
        }
        Ok(lmsr::calculate_buy(market.reserves(), market.liquidity, outcome, amount.value())?)
    }

    // 5.3: buy with a dollar budget. the fee is charged on top of the budget.
    pub fn buy(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        amount: Quote,
        account: AccountId,
        referrer: Option<UserId>,
    ) -> Result<PredictionFill, AmmError> {
        let handle = self.handle(market_id)?;
        let mut state = self.lock(&handle, market_id)?;
        let now = Timestamp::now();

        let quote = self.price_buy(&state.market, outcome, amount, now)?;
        let fee = self.fees.quote_trade(account, amount, referrer)?;

        let escrow = AccountId::MarketEscrow(market_id);
        let mut postings = vec![
            Posting::debit(account, amount, TransactionType::PredictionBuy),
            Posting::credit(escrow, amount, TransactionType::PredictionBuy),
        ];
        postings.extend(self.fees.postings(account, &fee, FeeKind::Trading));
        let rows = self.balances.apply(&postings)?;

        state.market.yes_shares = quote.new_reserves.yes;
        state.market.no_shares = quote.new_reserves.no;

        let position_id = match state.active_position_mut(account, outcome) {
            Some(position) => {
                position.add(quote.shares, amount, now);
                position.id
            }
            None => {
                let id = PositionId(self.next_position_id.fetch_add(1, Ordering::SeqCst));
                let position = PredictionPosition {
                    id,
                    account,
                    market_id,
                    outcome,
                    shares: quote.shares,
                    avg_price: quote.avg_price,
                    cost_basis: amount,
                    realized_pnl: Quote::zero(),
                    status: PositionStatus::Active,
                    created_at: now,
                    updated_at: now,
                };
                state.positions.insert(id, position);
                state.active.insert((account, outcome), id);
                id
            }
        };
        drop(state);

        self.fees.record(account, FeeKind::Trading, amount, &fee);
        self.events.emit(EventPayload::SharesTraded(SharesTradedEvent {
            market_id,
            account,
            direction: TradeDirection::Buy,
            outcome,
            shares: quote.shares,
            amount,
            fee: fee.fee_amount,
            new_yes_price: quote.new_prices.yes,
        }));
        tracing::info!(
            market = market_id.0,
            %account,
            %outcome,
            %amount,
            shares = %quote.shares,
            yes_price = %quote.new_prices.yes,
            "prediction buy filled"
        );

        Ok(PredictionFill {
            market_id,
            position_id,
            quote,
            fee,
            balance_after: balance_of(&rows, account),
        })
    }

    // 5.4: sell shares back to the curve. the fee comes out of the proceeds.
    pub fn sell(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        shares: Decimal,
        account: AccountId,
        referrer: Option<UserId>,
    ) -> Result<PredictionFill, AmmError> {
        let handle = self.handle(market_id)?;
        let mut state = self.lock(&handle, market_id)?;
        let now = Timestamp::now();
        state.market.ensure_tradable(now)?;

        let (position_id, held) = state
            .active_position_mut(account, outcome)
            .map(|p| (p.id, p.shares))
            .ok_or(AmmError::PositionNotFound { market_id, account, outcome })?;
        if shares > held {
            return Err(AmmError::InsufficientShares { held, requested: shares });
        }

        let quote = lmsr::calculate_sell(state.market.reserves(), state.market.liquidity, outcome, shares)?;
        let proceeds = Quote::new(quote.amount);
        let fee = self.fees.quote_trade(account, proceeds, referrer)?;

        let escrow = AccountId::MarketEscrow(market_id);
        let mut postings = vec![
            Posting::debit(escrow, proceeds, TransactionType::PredictionSell),
            Posting::credit(account, proceeds, TransactionType::PredictionSell),
        ];
        postings.extend(self.fees.postings(account, &fee, FeeKind::Trading));
        let rows = self.balances.apply(&postings)?;

        state.market.yes_shares = quote.new_reserves.yes;
        state.market.no_shares = quote.new_reserves.no;
        if let Some(position) = state.positions.get_mut(&position_id) {
            position.remove(shares, proceeds, now);
        }
        drop(state);

        self.fees.record(account, FeeKind::Trading, proceeds, &fee);
        self.events.emit(EventPayload::SharesTraded(SharesTradedEvent {
            market_id,
            account,
            direction: TradeDirection::Sell,
            outcome,
            shares,
            amount: proceeds,
            fee: fee.fee_amount,
            new_yes_price: quote.new_prices.yes,
        }));
        tracing::info!(market = market_id.0, %account, %outcome, %shares, %proceeds, "prediction sell filled");

        Ok(PredictionFill {
            market_id,
            position_id,
            quote,
            fee,
            balance_after: balance_of(&rows, account),
        })
    }

    // 5.5: winning shares pay 1 each, losing shares 0. escrow leftovers go to the platform.
    pub fn resolve(&self, market_id: MarketId, outcome: Outcome) -> Result<SettlementSummary, AmmError> {
        self.settle(market_id, Settlement::Resolved(outcome))
    }

    // 5.6: refunds each holder's remaining cost basis, pro rata if escrow falls short
    pub fn cancel(&self, market_id: MarketId) -> Result<SettlementSummary, AmmError> {
        self.settle(market_id, Settlement::Cancelled)
    }

    fn settle(&self, market_id: MarketId, settlement: Settlement) -> Result<SettlementSummary, AmmError> {
        let handle = self.handle(market_id)?;
        let mut state = self.lock(&handle, market_id)?;
        match state.market.status {
            MarketStatus::Resolved => return Err(AmmError::MarketResolved(market_id)),
            MarketStatus::Cancelled => return Err(AmmError::MarketInactive(market_id)),
            MarketStatus::Open => {}
        }

        let escrow = AccountId::MarketEscrow(market_id);
        let escrow_balance = self.balances.balance(escrow);

        let active: Vec<PositionId> = state.active.values().copied().collect();
        let mut owed: Vec<(PositionId, AccountId, Quote)> = Vec::with_capacity(active.len());
        for id in &active {
            if let Some(position) = state.positions.get(id) {
                let due = match settlement {
                    Settlement::Resolved(winner) if position.outcome == winner => Quote::new(position.shares),
                    Settlement::Resolved(_) => Quote::zero(),
                    Settlement::Cancelled => position.cost_basis,
                };
                owed.push((*id, position.account, due));
            }
        }

        let total_due: Quote = owed.iter().map(|(_, _, q)| *q).sum();
        if total_due > escrow_balance {
            match settlement {
                Settlement::Resolved(_) => {
                    return Err(AmmError::EscrowShortfall { escrow: escrow_balance, payout: total_due });
                }
                Settlement::Cancelled => {
                    let scale = escrow_balance.value() / total_due.value();
                    for entry in owed.iter_mut() {
                        let scaled = (entry.2.value() * scale)
                            .round_dp_with_strategy(lmsr::SHARE_DP, RoundingStrategy::ToZero);
                        entry.2 = Quote::new(scaled);
                    }
                }
            }
        }

        let total_paid: Quote = owed.iter().map(|(_, _, q)| *q).sum();
        let residual = escrow_balance.sub(total_paid).floor_zero();
        let tx_type = match settlement {
            Settlement::Resolved(_) => TransactionType::PredictionPayout,
            Settlement::Cancelled => TransactionType::PredictionRefund,
        };

        let mut per_account: BTreeMap<AccountId, Quote> = BTreeMap::new();
        for (_, account, due) in &owed {
            let entry = per_account.entry(*account).or_insert_with(Quote::zero);
            *entry = entry.add(*due);
        }
        let mut postings = vec![Posting::debit(escrow, total_paid.add(residual), tx_type)];
        postings.extend(
            per_account
                .iter()
                .map(|(account, amount)| Posting::credit(*account, *amount, tx_type)),
        );
        postings.push(Posting::credit(AccountId::Platform, residual, tx_type));
        self.balances.apply(&postings)?;

        let now = Timestamp::now();
        let status = match settlement {
            Settlement::Resolved(_) => PositionStatus::Resolved,
            Settlement::Cancelled => PositionStatus::Cancelled,
        };
        for (id, _, due) in &owed {
            if let Some(position) = state.positions.get_mut(id) {
                position.settle(status, *due, now);
            }
        }
        state.active.clear();
        match settlement {
            Settlement::Resolved(winner) => {
                state.market.status = MarketStatus::Resolved;
                state.market.resolution = Some(winner);
            }
            Settlement::Cancelled => state.market.status = MarketStatus::Cancelled,
        }
        drop(state);

        let summary = SettlementSummary {
            market_id,
            settlement,
            total_paid,
            positions_settled: owed.len(),
            residual_to_platform: residual,
        };
        self.events.emit(EventPayload::MarketSettled(MarketSettledEvent {
            market_id,
            settlement,
            total_paid,
            positions_settled: owed.len(),
            residual_to_platform: residual,
        }));
        tracing::info!(market = market_id.0, ?settlement, %total_paid, %residual, "market settled");
        Ok(summary)
    }

    pub fn positions(&self, market_id: MarketId) -> Result<Vec<PredictionPosition>, AmmError> {
        let handle = self.handle(market_id)?;
        let state = self.lock(&handle, market_id)?;
        Ok(state.positions.values().cloned().collect())
    }

    pub fn positions_for(&self, account: AccountId) -> Vec<PredictionPosition> {
        self.all_positions()
            .into_iter()
            .filter(|p| p.account == account)
            .collect()
    }

    pub fn all_positions(&self) -> Vec<PredictionPosition> {
        let mut positions: Vec<PredictionPosition> = self
            .handles()
            .into_iter()
            .filter_map(|(id, h)| {
                self.lock(&h, id)
                    .ok()
                    .map(|s| s.positions.values().cloned().collect::<Vec<_>>())
            })
            .flatten()
            .collect();
        positions.sort_by_key(|p| p.id);
        positions
    }

    /// Current value of an account's open shares at quoted prices.
    pub fn mark_value(&self, account: AccountId) -> Result<Quote, AmmError> {
        let mut total = Quote::zero();
        for (id, handle) in self.handles() {
            let state = self.lock(&handle, id)?;
            if state.market.status != MarketStatus::Open {
                continue;
            }
            let prices = state.market.prices()?;
            for outcome in [Outcome::Yes, Outcome::No] {
                if let Some(position) = state
                    .active
                    .get(&(account, outcome))
                    .and_then(|pid| state.positions.get(pid))
                {
                    total = total.add(position.mark_value(&prices));
                }
            }
        }
        Ok(total)
    }

    fn handle(&self, market_id: MarketId) -> Result<Arc<Mutex<MarketState>>, AmmError> {
        self.markets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&market_id)
            .cloned()
            .ok_or(AmmError::MarketNotFound(market_id))
    }

    fn handles(&self) -> Vec<(MarketId, Arc<Mutex<MarketState>>)> {
        let mut handles: Vec<_> = self
            .markets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    fn lock<'a>(
        &self,
        handle: &'a Arc<Mutex<MarketState>>,
        market_id: MarketId,
    ) -> Result<MutexGuard<'a, MarketState>, AmmError> {
        Ok(lock_with_retry(handle, &self.retry, || format!("market {}", market_id.0))?)
    }
}

fn balance_of(rows: &[BalanceTransaction], account: AccountId) -> Quote {
    rows.iter()
        .filter(|r| r.account == account)
        .last()
        .map(|r| r.balance_after)
        .unwrap_or_else(Quote::zero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use rust_decimal_macros::dec;

    struct Fixture {
        balances: Arc<BalanceStore>,
        amm: PredictionAmm,
    }

    fn fixture(fee_rate: Decimal) -> Fixture {
        let balances = Arc::new(BalanceStore::new(RetryConfig::default()));
        let fees = Arc::new(FeeLedger::new(
            Arc::clone(&balances),
            FeeConfig {
                trading_fee_rate: fee_rate,
                referrer_share: dec!(0.5),
            },
        ));
        let amm = PredictionAmm::new(
            Arc::clone(&balances),
            fees,
            Arc::new(EventLog::new(1000)),
            PredictionConfig::default(),
            RetryConfig::default(),
        );
        balances.mint(AccountId::Platform, Quote::new(dec!(10_000))).unwrap();
        Fixture { balances, amm }
    }

    fn far_future() -> Timestamp {
        Timestamp::from_millis(i64::MAX)
    }

    fn open_market(f: &Fixture) -> MarketId {
        f.amm
            .create_market(
                NewMarket::balanced("Will it rain?", far_future()).with_liquidity(dec!(100)),
                AccountId::Platform,
            )
            .unwrap()
            .id
    }

    #[test]
    fn create_market_funds_escrow() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        assert_eq!(f.balances.balance(AccountId::MarketEscrow(id)).value(), dec!(69.32));
        let prices = f.amm.prices(id).unwrap();
        assert_eq!(prices.yes, dec!(0.5));
    }

    #[test]
    fn buy_moves_money_and_reserves() {
        let f = fixture(dec!(0.01));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();

        let fill = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(10)), alice, None).unwrap();
        assert!(fill.quote.shares > dec!(19));
        assert_eq!(fill.fee.fee_amount.value(), dec!(0.1));
        assert_eq!(fill.balance_after.value(), dec!(89.9));

        let market = f.amm.market(id).unwrap();
        assert_eq!(market.yes_shares, fill.quote.shares);
        assert_eq!(market.no_shares, Decimal::ZERO);
        assert_eq!(f.balances.balance(AccountId::MarketEscrow(id)).value(), dec!(79.32));

        let positions = f.amm.positions_for(alice);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].shares, fill.quote.shares);
        assert_eq!(positions[0].cost_basis.value(), dec!(10));
    }

    #[test]
    fn repeated_buys_average_the_price() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();

        let first = f.amm.buy(id, Outcome::No, Quote::new(dec!(10)), alice, None).unwrap();
        let second = f.amm.buy(id, Outcome::No, Quote::new(dec!(10)), alice, None).unwrap();
        assert_eq!(first.position_id, second.position_id);
        assert!(second.quote.avg_price > first.quote.avg_price);

        let position = &f.amm.positions_for(alice)[0];
        let expected = dec!(20) / (first.quote.shares + second.quote.shares);
        assert_eq!(position.avg_price, expected);
    }

    #[test]
    fn below_minimum_rejected() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();

        let result = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(0.5)), alice, None);
        assert!(matches!(result, Err(AmmError::BelowMinimumOrder { .. })));
    }

    #[test]
    fn insufficient_funds_leaves_market_untouched() {
        let f = fixture(dec!(0.01));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(10))).unwrap();

        // principal fits, principal + fee does not
        let result = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(10)), alice, None);
        assert!(matches!(result, Err(AmmError::Balance(BalanceError::InsufficientFunds { .. }))));
        let market = f.amm.market(id).unwrap();
        assert_eq!(market.yes_shares, Decimal::ZERO);
        assert!(f.amm.positions_for(alice).is_empty());
        assert_eq!(f.balances.balance(alice).value(), dec!(10));
    }

    #[test]
    fn expired_market_inactive() {
        let f = fixture(dec!(0));
        let market = f
            .amm
            .create_market(NewMarket::balanced("Old news", Timestamp::from_millis(0)), AccountId::Platform)
            .unwrap();
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();
        let result = f.amm.buy(market.id, Outcome::Yes, Quote::new(dec!(5)), alice, None);
        assert!(matches!(result, Err(AmmError::MarketInactive(_))));
    }

    #[test]
    fn sell_returns_proceeds_and_realizes_pnl() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        let bob = AccountId::user(2);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();
        f.balances.mint(bob, Quote::new(dec!(100))).unwrap();

        let fill = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(20)), alice, None).unwrap();
        // bob pushes YES higher, alice sells into it at a profit
        f.amm.buy(id, Outcome::Yes, Quote::new(dec!(20)), bob, None).unwrap();
        let half = fill.quote.shares / dec!(2);
        let sale = f.amm.sell(id, Outcome::Yes, half, alice, None).unwrap();
        assert!(sale.quote.amount > dec!(10));

        let position = &f.amm.positions_for(alice)[0];
        assert_eq!(position.shares, fill.quote.shares - half);
        assert!(position.realized_pnl.is_positive());

        let too_many = f.amm.sell(id, Outcome::Yes, fill.quote.shares, alice, None);
        assert!(matches!(too_many, Err(AmmError::InsufficientShares { .. })));
        let none = f.amm.sell(id, Outcome::No, dec!(1), alice, None);
        assert!(matches!(none, Err(AmmError::PositionNotFound { .. })));
    }

    #[test]
    fn resolution_pays_winners_and_drains_escrow() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        let bob = AccountId::user(2);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();
        f.balances.mint(bob, Quote::new(dec!(100))).unwrap();

        let yes = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(30)), alice, None).unwrap();
        f.amm.buy(id, Outcome::No, Quote::new(dec!(30)), bob, None).unwrap();

        let total_before = f.balances.total_balance();
        let summary = f.amm.resolve(id, Outcome::Yes).unwrap();
        assert_eq!(summary.total_paid.value(), yes.quote.shares);
        assert_eq!(f.balances.balance(AccountId::MarketEscrow(id)), Quote::zero());
        assert_eq!(f.balances.total_balance(), total_before);
        assert_eq!(f.balances.balance(alice).value(), dec!(70) + yes.quote.shares);
        assert_eq!(f.balances.balance(bob).value(), dec!(70));

        let positions = f.amm.positions(id).unwrap();
        assert!(positions.iter().all(|p| p.status == PositionStatus::Resolved));
        let bob_pos = positions.iter().find(|p| p.account == bob).unwrap();
        assert_eq!(bob_pos.realized_pnl.value(), dec!(-30));

        assert!(matches!(
            f.amm.buy(id, Outcome::Yes, Quote::new(dec!(5)), alice, None),
            Err(AmmError::MarketResolved(_))
        ));
        assert!(matches!(f.amm.resolve(id, Outcome::No), Err(AmmError::MarketResolved(_))));
    }

    #[test]
    fn cancellation_refunds_cost_basis() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();
        f.amm.buy(id, Outcome::No, Quote::new(dec!(25)), alice, None).unwrap();

        let summary = f.amm.cancel(id).unwrap();
        assert_eq!(summary.total_paid.value(), dec!(25));
        assert_eq!(f.balances.balance(alice).value(), dec!(100));
        assert_eq!(f.amm.market(id).unwrap().status, MarketStatus::Cancelled);
        assert_eq!(f.amm.positions_for(alice)[0].status, PositionStatus::Cancelled);
    }

    #[test]
    fn mark_value_uses_current_prices() {
        let f = fixture(dec!(0));
        let id = open_market(&f);
        let alice = AccountId::user(1);
        f.balances.mint(alice, Quote::new(dec!(100))).unwrap();
        let fill = f.amm.buy(id, Outcome::Yes, Quote::new(dec!(10)), alice, None).unwrap();

        let value = f.amm.mark_value(alice).unwrap();
        assert_eq!(value.value(), fill.quote.shares * fill.quote.new_prices.yes);
        assert_eq!(f.amm.mark_value(AccountId::user(9)).unwrap(), Quote::zero());
    }

    #[test]
    fn unknown_market() {
        let f = fixture(dec!(0));
        assert!(matches!(f.amm.market(MarketId(42)), Err(AmmError::MarketNotFound(_))));
    }
}
