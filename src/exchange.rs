// 9.0: the Exchange is the composition root. it wires one BalanceStore, FeeLedger
// and EventLog into the AMM, the perp engine and the pool allocator, and exposes
// the inbound trade calls that the API and agent layers use.

use crate::balance::{BalanceError, BalanceStore, BalanceTransaction};
use crate::config::{ConfigError, EngineConfig};
use crate::events::{Event, EventLog};
use crate::fees::{FeeError, FeeLedger, TradingFee};
use crate::perp_engine::{OpenPerp, PerpEngine, PerpError, PerpMarket, PerpPosition};
use crate::pool::{Pool, PoolAllocator, PoolDeposit, PoolError, Withdrawal};
use crate::prediction::{AmmError, Market, PredictionAmm, PredictionFill, PredictionPosition};
use crate::retry::LockError;
use crate::types::{
    AccountId, DepositId, MarketId, Outcome, PerpPositionId, PoolId, Quote, Side, Ticker, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Error taxonomy shared by every component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    InsufficientFunds,
    MarketResolved,
    MarketInactive,
    BelowMinimumOrder,
    LeverageOutOfBounds,
    PoolInactive,
    ConcurrencyConflict,
    NotFound,
    InvalidInput,
    AlreadyClosed,
    NotLiquidatable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Fee(#[from] FeeError),

    #[error(transparent)]
    Prediction(#[from] AmmError),

    #[error(transparent)]
    Perp(#[from] PerpError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Account {0} cannot trade through the exchange")]
    NotTradable(AccountId),

    #[error("User {user:?} cannot be referred by {referrer:?}")]
    InvalidReferral { user: UserId, referrer: UserId },
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Balance(e) => balance_kind(e),
            ExchangeError::Fee(e) => fee_kind(e),
            ExchangeError::Prediction(e) => amm_kind(e),
            ExchangeError::Perp(e) => perp_kind(e),
            ExchangeError::Pool(e) => pool_kind(e),
            ExchangeError::Config(_) | ExchangeError::NotTradable(_) | ExchangeError::InvalidReferral { .. } => {
                ErrorKind::InvalidInput
            }
        }
    }
}

fn lock_kind(_: &LockError) -> ErrorKind {
    ErrorKind::ConcurrencyConflict
}

fn balance_kind(e: &BalanceError) -> ErrorKind {
    match e {
        BalanceError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
        BalanceError::InvalidAmount(_) | BalanceError::Unbalanced(_) => ErrorKind::InvalidInput,
        BalanceError::Lock(e) => lock_kind(e),
    }
}

fn fee_kind(e: &FeeError) -> ErrorKind {
    match e {
        FeeError::InvalidRate(_) | FeeError::NegativeNotional(_) => ErrorKind::InvalidInput,
        FeeError::Balance(e) => balance_kind(e),
    }
}

fn amm_kind(e: &AmmError) -> ErrorKind {
    match e {
        AmmError::MarketNotFound(_) | AmmError::PositionNotFound { .. } => ErrorKind::NotFound,
        AmmError::MarketResolved(_) => ErrorKind::MarketResolved,
        AmmError::MarketInactive(_) => ErrorKind::MarketInactive,
        AmmError::BelowMinimumOrder { .. } => ErrorKind::BelowMinimumOrder,
        AmmError::InsufficientShares { .. } | AmmError::Pricing(_) => ErrorKind::InvalidInput,
        AmmError::EscrowShortfall { .. } => ErrorKind::InsufficientFunds,
        AmmError::Balance(e) => balance_kind(e),
        AmmError::Fee(e) => fee_kind(e),
        AmmError::Lock(e) => lock_kind(e),
    }
}

fn perp_kind(e: &PerpError) -> ErrorKind {
    match e {
        PerpError::TickerNotFound(_) | PerpError::PositionNotFound(_) => ErrorKind::NotFound,
        PerpError::LeverageOutOfBounds { .. } => ErrorKind::LeverageOutOfBounds,
        PerpError::BelowMinimumOrder { .. } => ErrorKind::BelowMinimumOrder,
        PerpError::InvalidMargin(_) | PerpError::InvalidPrice(_) => ErrorKind::InvalidInput,
        PerpError::AlreadyClosed(_) => ErrorKind::AlreadyClosed,
        PerpError::NotLiquidatable { .. } => ErrorKind::NotLiquidatable,
        PerpError::Fee(e) => fee_kind(e),
        PerpError::Balance(e) => balance_kind(e),
        PerpError::Lock(e) => lock_kind(e),
    }
}

fn pool_kind(e: &PoolError) -> ErrorKind {
    match e {
        PoolError::PoolNotFound(_) | PoolError::DepositNotFound(_) => ErrorKind::NotFound,
        PoolError::PoolInactive(_) | PoolError::Insolvent(_) => ErrorKind::PoolInactive,
        PoolError::BelowMinimumDeposit { .. } => ErrorKind::BelowMinimumOrder,
        PoolError::InvalidAmount(_) | PoolError::PositionNotOwned { .. } => ErrorKind::InvalidInput,
        PoolError::AlreadyWithdrawn(_) => ErrorKind::AlreadyClosed,
        PoolError::InsufficientPoolLiquidity { .. } => ErrorKind::InsufficientFunds,
        PoolError::Amm(e) => amm_kind(e),
        PoolError::Perp(e) => perp_kind(e),
        PoolError::Fee(e) => fee_kind(e),
        PoolError::Balance(e) => balance_kind(e),
        PoolError::Lock(e) => lock_kind(e),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account: AccountId,
    pub balance: Quote,
}

/// Every persisted row, in id order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub markets: Vec<Market>,
    pub prediction_positions: Vec<PredictionPosition>,
    pub perp_markets: Vec<PerpMarket>,
    pub perp_positions: Vec<PerpPosition>,
    pub pools: Vec<Pool>,
    pub pool_deposits: Vec<PoolDeposit>,
    pub balances: Vec<AccountBalance>,
    pub transactions: Vec<BalanceTransaction>,
    pub fees: Vec<TradingFee>,
}

impl Snapshot {
    pub fn total_balance(&self) -> Quote {
        self.balances.iter().map(|b| b.balance).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationSweep {
    pub ticker: Ticker,
    pub liquidated: Vec<PerpPositionId>,
    pub skipped: usize,
}

#[derive(Debug)]
pub struct Exchange {
    config: EngineConfig,
    balances: Arc<BalanceStore>,
    fees: Arc<FeeLedger>,
    events: Arc<EventLog>,
    amm: Arc<PredictionAmm>,
    perps: Arc<PerpEngine>,
    pools: Arc<PoolAllocator>,
    // user -> the user who referred them
    referrals: RwLock<HashMap<UserId, UserId>>,
}

impl Exchange {
    pub fn new(config: EngineConfig) -> Result<Self, ExchangeError> {
        config.validate()?;
        let balances = Arc::new(BalanceStore::new(config.retry.clone()));
        let fees = Arc::new(FeeLedger::new(Arc::clone(&balances), config.fees.clone()));
        let events = Arc::new(EventLog::new(config.events.max_events));
        let amm = Arc::new(PredictionAmm::new(
            Arc::clone(&balances),
            Arc::clone(&fees),
            Arc::clone(&events),
            config.prediction.clone(),
            config.retry.clone(),
        ));
        let perps = Arc::new(PerpEngine::new(
            Arc::clone(&balances),
            Arc::clone(&fees),
            Arc::clone(&events),
            config.perp.clone(),
            config.retry.clone(),
        ));
        let pools = Arc::new(PoolAllocator::new(
            Arc::clone(&amm),
            Arc::clone(&perps),
            Arc::clone(&balances),
            Arc::clone(&fees),
            Arc::clone(&events),
            config.pool.clone(),
            config.retry.clone(),
        ));
        tracing::info!(
            fee_rate = %config.fees.trading_fee_rate,
            max_leverage = %config.perp.default_max_leverage,
            "exchange started"
        );
        Ok(Self {
            config,
            balances,
            fees,
            events,
            amm,
            perps,
            pools,
            referrals: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn balances(&self) -> &BalanceStore {
        &self.balances
    }

    pub fn fees(&self) -> &FeeLedger {
        &self.fees
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn amm(&self) -> &PredictionAmm {
        &self.amm
    }

    pub fn perps(&self) -> &PerpEngine {
        &self.perps
    }

    pub fn pools(&self) -> &PoolAllocator {
        &self.pools
    }

    // 9.1: external funding (signup grant, on-ramp)
    pub fn fund(&self, account: AccountId, amount: Quote) -> Result<Quote, ExchangeError> {
        Ok(self.balances.mint(account, amount)?)
    }

    /// Records who referred `user`. Set once; later trading fees split with the referrer.
    pub fn register_referral(&self, user: UserId, referrer: UserId) -> Result<(), ExchangeError> {
        let mut referrals = self.referrals.write().unwrap_or_else(|e| e.into_inner());
        if user == referrer || referrals.contains_key(&user) {
            return Err(ExchangeError::InvalidReferral { user, referrer });
        }
        referrals.insert(user, referrer);
        tracing::info!(user = user.0, referrer = referrer.0, "referral registered");
        Ok(())
    }

    pub fn referrer_of(&self, user: UserId) -> Option<UserId> {
        self.referrals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user)
            .copied()
    }

    pub fn buy_prediction(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        amount: Quote,
        account: AccountId,
    ) -> Result<PredictionFill, ExchangeError> {
        let referrer = self.trader(account)?;
        Ok(self.amm.buy(market_id, outcome, amount, account, referrer)?)
    }

    pub fn sell_prediction(
        &self,
        market_id: MarketId,
        outcome: Outcome,
        shares: Decimal,
        account: AccountId,
    ) -> Result<PredictionFill, ExchangeError> {
        let referrer = self.trader(account)?;
        Ok(self.amm.sell(market_id, outcome, shares, account, referrer)?)
    }

    pub fn open_perp(
        &self,
        ticker: Ticker,
        side: Side,
        margin: Quote,
        leverage: u32,
        account: AccountId,
    ) -> Result<PerpPosition, ExchangeError> {
        let referrer = self.trader(account)?;
        let order = OpenPerp {
            ticker,
            side,
            margin,
            leverage,
            referrer,
        };
        Ok(self.perps.open(account, order)?)
    }

    pub fn close_perp(&self, position_id: PerpPositionId) -> Result<PerpPosition, ExchangeError> {
        let position = self.perps.position(position_id)?;
        self.trader(position.account)?;
        Ok(self.perps.close(position_id)?)
    }

    // only users trade here; pools go through the allocator so they stay locked and revalued
    fn trader(&self, account: AccountId) -> Result<Option<UserId>, ExchangeError> {
        let user = account.user_id().ok_or(ExchangeError::NotTradable(account))?;
        Ok(self.referrer_of(user))
    }

    pub fn deposit_pool(&self, pool_id: PoolId, user: UserId, amount: Quote) -> Result<PoolDeposit, ExchangeError> {
        Ok(self.pools.deposit(pool_id, AccountId::User(user), amount)?)
    }

    pub fn withdraw_pool(&self, deposit_id: DepositId) -> Result<Withdrawal, ExchangeError> {
        Ok(self.pools.withdraw(deposit_id)?)
    }

    // 9.2: liquidation sweep. rejections are logged and skipped, never surfaced.
    pub fn sweep_liquidations(&self, ticker: &Ticker) -> Result<LiquidationSweep, ExchangeError> {
        let candidates = self.perps.liquidatable(ticker)?;
        let mut liquidated = Vec::with_capacity(candidates.len());
        let mut skipped = 0;
        for position_id in candidates {
            match self.perps.liquidate(position_id) {
                Ok(_) => liquidated.push(position_id),
                Err(e) => {
                    tracing::warn!(position = position_id.0, error = %e, "liquidation skipped");
                    skipped += 1;
                }
            }
        }
        Ok(LiquidationSweep {
            ticker: ticker.clone(),
            liquidated,
            skipped,
        })
    }

    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        self.events.recent(count)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            markets: self.amm.markets(),
            prediction_positions: self.amm.all_positions(),
            perp_markets: self.perps.markets(),
            perp_positions: self.perps.all_positions(),
            pools: self.pools.pools(),
            pool_deposits: self.pools.all_deposits(),
            balances: self
                .balances
                .balances()
                .into_iter()
                .map(|(account, balance)| AccountBalance { account, balance })
                .collect(),
            transactions: self.balances.transactions(),
            fees: self.fees.records(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ActorTier;
    use crate::prediction::NewMarket;
    use crate::types::{Price, Timestamp};
    use rust_decimal_macros::dec;

    fn exchange() -> Exchange {
        let exchange = Exchange::new(EngineConfig::default()).unwrap();
        exchange.fund(AccountId::Platform, Quote::new(dec!(1_000))).unwrap();
        exchange.fund(AccountId::PerpVault, Quote::new(dec!(1_000))).unwrap();
        exchange.fund(AccountId::user(1), Quote::new(dec!(500))).unwrap();
        exchange
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.perp.maintenance_threshold = dec!(1.5);
        let err = Exchange::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn error_kinds_follow_taxonomy() {
        let ex = exchange();
        let ticker = Ticker::new("GOOGI");
        ex.perps().list_ticker(ticker.clone(), Price::new(dec!(10)).unwrap(), None, None);

        let err = ex
            .open_perp(ticker.clone(), Side::Long, Quote::new(dec!(10)), 500, AccountId::user(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeverageOutOfBounds);

        let err = ex
            .open_perp(ticker, Side::Long, Quote::new(dec!(499.6)), 2, AccountId::user(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

        let err = ex.close_perp(PerpPositionId(77)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn sweep_liquidates_crossed_positions() {
        let ex = exchange();
        let ticker = Ticker::new("AMZNI");
        ex.perps().list_ticker(ticker.clone(), Price::new(dec!(100)).unwrap(), None, None);
        let position = ex
            .open_perp(ticker.clone(), Side::Long, Quote::new(dec!(50)), 10, AccountId::user(1))
            .unwrap();

        ex.perps().update_price(&ticker, dec!(80)).unwrap();
        let sweep = ex.sweep_liquidations(&ticker).unwrap();
        assert_eq!(sweep.liquidated, vec![position.id]);
        assert_eq!(sweep.skipped, 0);
        assert!(!ex.perps().position(position.id).unwrap().is_open());
    }

    #[test]
    fn snapshot_serializes_and_conserves() {
        let ex = exchange();
        let market = ex
            .amm()
            .create_market(
                NewMarket::balanced("Snapshot", Timestamp::from_millis(i64::MAX)),
                AccountId::Platform,
            )
            .unwrap();
        ex.buy_prediction(market.id, Outcome::No, Quote::new(dec!(20)), AccountId::user(1))
            .unwrap();

        let snapshot = ex.snapshot();
        assert_eq!(snapshot.markets.len(), 1);
        assert_eq!(snapshot.prediction_positions.len(), 1);
        assert_eq!(snapshot.total_balance().value(), dec!(2_500));

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn only_users_trade_through_the_facade() {
        let ex = exchange();
        let ticker = Ticker::new("NFLXI");
        ex.perps().list_ticker(ticker.clone(), Price::new(dec!(100)).unwrap(), None, None);
        let pool = ex
            .pools()
            .seed(AccountId::user(1), ActorTier::Standard, Quote::new(dec!(200)))
            .unwrap();
        let market = ex
            .amm()
            .create_market(
                NewMarket::balanced("Facade", Timestamp::from_millis(i64::MAX)),
                AccountId::Platform,
            )
            .unwrap();

        let err = ex
            .buy_prediction(market.id, Outcome::Yes, Quote::new(dec!(10)), pool.account())
            .unwrap_err();
        assert_eq!(err, ExchangeError::NotTradable(pool.account()));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = ex
            .open_perp(ticker.clone(), Side::Short, Quote::new(dec!(10)), 2, AccountId::PerpVault)
            .unwrap_err();
        assert_eq!(err, ExchangeError::NotTradable(AccountId::PerpVault));

        // a pool position can only be closed by its pool
        let position = ex
            .pools()
            .open_perp(
                pool.id,
                OpenPerp {
                    ticker,
                    side: Side::Long,
                    margin: Quote::new(dec!(50)),
                    leverage: 2,
                    referrer: None,
                },
            )
            .unwrap();
        let err = ex.close_perp(position.id).unwrap_err();
        assert_eq!(err, ExchangeError::NotTradable(pool.account()));
        assert!(ex.perps().position(position.id).unwrap().is_open());
        assert_eq!(ex.balances().balance(pool.account()).value(), dec!(149.9));
    }

    #[test]
    fn registered_referrer_earns_fee_share() {
        let ex = exchange();
        let ticker = Ticker::new("UBERI");
        ex.perps().list_ticker(ticker.clone(), Price::new(dec!(100)).unwrap(), None, None);
        ex.register_referral(UserId(1), UserId(2)).unwrap();
        assert_eq!(ex.referrer_of(UserId(1)), Some(UserId(2)));

        // 100 margin at 10x is 1000 notional, fee 1, a tenth of it to the referrer
        ex.open_perp(ticker, Side::Long, Quote::new(dec!(100)), 10, AccountId::user(1))
            .unwrap();
        assert_eq!(ex.balances().balance(AccountId::user(2)).value(), dec!(0.1));
        assert_eq!(ex.balances().balance(AccountId::Platform).value(), dec!(1_000.9));
        let fee = ex.fees().records().pop().unwrap();
        assert_eq!(fee.referrer_id, Some(UserId(2)));

        let err = ex.register_referral(UserId(1), UserId(3)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(ex.register_referral(UserId(4), UserId(4)).is_err());
        assert_eq!(ex.referrer_of(UserId(1)), Some(UserId(2)));
    }
}
