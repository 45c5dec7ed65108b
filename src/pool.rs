//! Pool allocator: fund-like pools run by non-player actors.
//!
//! A pool holds its cash in `AccountId::Pool` and trades through the same AMM
//! and perp engine paths as a user. Depositors own shares priced at the pool's
//! NAV per share; withdrawals pay shares times NAV less a performance fee on
//! the gain. The pool lock is always taken before any market, ticker or
//! account lock.

use crate::balance::{BalanceError, BalanceStore, Posting, TransactionType};
use crate::config::{PoolConfig, RetryConfig};
use crate::events::{
    EventLog, EventPayload, PoolDeactivatedEvent, PoolFlowEvent, PoolRevaluedEvent, PoolSeededEvent,
};
use crate::fees::{FeeError, FeeKind, FeeLedger};
use crate::lmsr::SHARE_DP;
use crate::perp_engine::{OpenPerp, PerpEngine, PerpError, PerpPosition};
use crate::prediction::{AmmError, PredictionAmm, PredictionFill};
use crate::retry::{lock_with_retry, LockError};
use crate::types::{AccountId, DepositId, MarketId, Outcome, PerpPositionId, PoolId, Quote, Timestamp};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorTier {
    Standard,
    Veteran,
    Elite,
}

impl ActorTier {
    pub fn performance_fee_rate(&self, config: &PoolConfig) -> Decimal {
        match self {
            ActorTier::Standard => config.standard_fee_rate,
            ActorTier::Veteran => config.veteran_fee_rate,
            ActorTier::Elite => config.elite_fee_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub manager: AccountId,
    pub tier: ActorTier,
    // cash plus marked value of open positions
    pub total_value: Quote,
    // principal of deposits not yet withdrawn
    pub total_deposits: Quote,
    pub available_balance: Quote,
    pub lifetime_pnl: Quote,
    pub performance_fee_rate: Decimal,
    pub total_fees_collected: Quote,
    pub total_shares: Decimal,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Pool {
    pub fn account(&self) -> AccountId {
        AccountId::Pool(self.id)
    }

    // 8.1: totalValue / shares, or 1 before the first deposit
    pub fn nav_per_share(&self) -> Decimal {
        self.nav_at(self.total_value)
    }

    fn nav_at(&self, total_value: Quote) -> Decimal {
        if self.total_shares.is_zero() {
            Decimal::ONE
        } else {
            total_value.value() / self.total_shares
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDeposit {
    pub id: DepositId,
    pub pool_id: PoolId,
    pub account: AccountId,
    pub amount: Quote,
    pub shares: Decimal,
    pub current_value: Quote,
    // the manager's seed capital. not counted in `total_deposits`.
    pub seed: bool,
    pub deposited_at: Timestamp,
    pub withdrawn_at: Option<Timestamp>,
    pub withdrawn_amount: Option<Quote>,
}

impl PoolDeposit {
    pub fn is_withdrawn(&self) -> bool {
        self.withdrawn_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub deposit_id: DepositId,
    pub gross_value: Quote,
    pub performance_fee: Quote,
    pub net_amount: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("Pool {0:?} not found")]
    PoolNotFound(PoolId),

    #[error("Deposit {0:?} not found")]
    DepositNotFound(DepositId),

    #[error("Pool {0:?} is not active")]
    PoolInactive(PoolId),

    #[error("Deposit {amount} below minimum {minimum}")]
    BelowMinimumDeposit { amount: Quote, minimum: Quote },

    #[error("Amount must not be negative, got {0}")]
    InvalidAmount(Quote),

    #[error("Pool {0:?} has no value left behind its shares")]
    Insolvent(PoolId),

    #[error("Deposit {0:?} already withdrawn")]
    AlreadyWithdrawn(DepositId),

    #[error("Pool holds {available} in cash, withdrawal needs {requested}")]
    InsufficientPoolLiquidity { available: Quote, requested: Quote },

    #[error("Position {position_id:?} does not belong to pool {pool_id:?}")]
    PositionNotOwned {
        pool_id: PoolId,
        position_id: PerpPositionId,
    },

    #[error("Prediction error: {0}")]
    Amm(#[from] AmmError),

    #[error("Perp error: {0}")]
    Perp(#[from] PerpError),

    #[error("Fee error: {0}")]
    Fee(#[from] FeeError),

    #[error("Balance error: {0}")]
    Balance(#[from] BalanceError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone, Copy)]
struct Valuation {
    cash: Quote,
    total_value: Quote,
}

#[derive(Debug)]
struct PoolState {
    pool: Pool,
    deposits: BTreeMap<DepositId, PoolDeposit>,
}

impl PoolState {
    fn ensure_active(&self) -> Result<(), PoolError> {
        if self.pool.is_active {
            Ok(())
        } else {
            Err(PoolError::PoolInactive(self.pool.id))
        }
    }

    fn refresh_deposit_values(&mut self) {
        let nav = self.pool.nav_per_share();
        for deposit in self.deposits.values_mut().filter(|d| !d.is_withdrawn()) {
            deposit.current_value = Quote::new(deposit.shares * nav);
        }
    }
}

#[derive(Debug)]
pub struct PoolAllocator {
    pools: RwLock<HashMap<PoolId, Arc<Mutex<PoolState>>>>,
    deposit_index: RwLock<HashMap<DepositId, PoolId>>,
    amm: Arc<PredictionAmm>,
    perps: Arc<PerpEngine>,
    balances: Arc<BalanceStore>,
    fees: Arc<FeeLedger>,
    events: Arc<EventLog>,
    config: PoolConfig,
    retry: RetryConfig,
    next_pool_id: AtomicU64,
    next_deposit_id: AtomicU64,
}

impl PoolAllocator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        amm: Arc<PredictionAmm>,
        perps: Arc<PerpEngine>,
        balances: Arc<BalanceStore>,
        fees: Arc<FeeLedger>,
        events: Arc<EventLog>,
        config: PoolConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            deposit_index: RwLock::new(HashMap::new()),
            amm,
            perps,
            balances,
            fees,
            events,
            config,
            retry,
            next_pool_id: AtomicU64::new(1),
            next_deposit_id: AtomicU64::new(1),
        }
    }

    // 8.2: the manager's capital moves into the pool account and is issued to
    // the manager as shares at NAV 1, so later depositors buy in at the seeded NAV.
    pub fn seed(&self, manager: AccountId, tier: ActorTier, initial_capital: Quote) -> Result<Pool, PoolError> {
        if initial_capital.is_negative() {
            return Err(PoolError::InvalidAmount(initial_capital));
        }
        let id = PoolId(self.next_pool_id.fetch_add(1, Ordering::SeqCst));
        if initial_capital.is_positive() {
            self.balances
                .transfer(manager, AccountId::Pool(id), initial_capital, TransactionType::PoolSeed)?;
        }

        let now = Timestamp::now();
        let mut deposits = BTreeMap::new();
        let seed_deposit = initial_capital.is_positive().then(|| {
            let deposit_id = DepositId(self.next_deposit_id.fetch_add(1, Ordering::SeqCst));
            deposits.insert(
                deposit_id,
                PoolDeposit {
                    id: deposit_id,
                    pool_id: id,
                    account: manager,
                    amount: initial_capital,
                    shares: initial_capital.value(),
                    current_value: initial_capital,
                    seed: true,
                    deposited_at: now,
                    withdrawn_at: None,
                    withdrawn_amount: None,
                },
            );
            deposit_id
        });

        let pool = Pool {
            id,
            manager,
            tier,
            total_value: initial_capital,
            total_deposits: Quote::zero(),
            available_balance: initial_capital,
            lifetime_pnl: Quote::zero(),
            performance_fee_rate: tier.performance_fee_rate(&self.config),
            total_fees_collected: Quote::zero(),
            total_shares: initial_capital.value(),
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        self.pools.write().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Arc::new(Mutex::new(PoolState {
                pool: pool.clone(),
                deposits,
            })),
        );
        if let Some(deposit_id) = seed_deposit {
            self.deposit_index
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(deposit_id, id);
        }

        self.events.emit(EventPayload::PoolSeeded(PoolSeededEvent {
            pool_id: id,
            manager,
            initial_capital,
            seed_deposit,
            performance_fee_rate: pool.performance_fee_rate,
        }));
        tracing::info!(pool = id.0, %manager, %initial_capital, ?tier, "pool seeded");
        Ok(pool)
    }

    // 8.3: shares minted at the NAV the pool is revalued to under its lock
    pub fn deposit(&self, pool_id: PoolId, account: AccountId, amount: Quote) -> Result<PoolDeposit, PoolError> {
        let handle = self.handle(pool_id)?;
        let mut state = self.lock(&handle, pool_id)?;
        state.ensure_active()?;
        if amount < self.config.min_deposit {
            return Err(PoolError::BelowMinimumDeposit {
                amount,
                minimum: self.config.min_deposit,
            });
        }

        let valuation = self.valuation(&state.pool)?;
        let nav = state.pool.nav_at(valuation.total_value);
        if nav <= Decimal::ZERO {
            return Err(PoolError::Insolvent(pool_id));
        }
        let shares = amount.value() / nav;

        self.balances
            .transfer(account, state.pool.account(), amount, TransactionType::PoolDeposit)?;
        self.apply_valuation(&mut state, valuation);

        let id = DepositId(self.next_deposit_id.fetch_add(1, Ordering::SeqCst));
        let now = Timestamp::now();
        let deposit = PoolDeposit {
            id,
            pool_id,
            account,
            amount,
            shares,
            current_value: amount,
            seed: false,
            deposited_at: now,
            withdrawn_at: None,
            withdrawn_amount: None,
        };

        let pool = &mut state.pool;
        pool.total_value = pool.total_value.add(amount);
        pool.available_balance = pool.available_balance.add(amount);
        pool.total_deposits = pool.total_deposits.add(amount);
        pool.total_shares += shares;
        pool.updated_at = now;
        state.deposits.insert(id, deposit.clone());
        state.refresh_deposit_values();
        drop(state);

        self.deposit_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, pool_id);
        self.events.emit(EventPayload::PoolDeposited(PoolFlowEvent {
            pool_id,
            deposit_id: id,
            account,
            amount,
            shares,
            performance_fee: Quote::zero(),
        }));
        tracing::info!(pool = pool_id.0, deposit = id.0, %account, %amount, %shares, %nav, "pool deposit");
        Ok(deposit)
    }

    // 8.4: pays shares * NAV, skimming the performance fee on any gain over principal
    pub fn withdraw(&self, deposit_id: DepositId) -> Result<Withdrawal, PoolError> {
        let pool_id = self.pool_of(deposit_id)?;
        let handle = self.handle(pool_id)?;
        let mut state = self.lock(&handle, pool_id)?;

        let deposit = state
            .deposits
            .get(&deposit_id)
            .cloned()
            .ok_or(PoolError::DepositNotFound(deposit_id))?;
        if deposit.is_withdrawn() {
            return Err(PoolError::AlreadyWithdrawn(deposit_id));
        }

        let valuation = self.valuation(&state.pool)?;
        let nav = state.pool.nav_at(valuation.total_value);
        let gross_value = Quote::new(
            (deposit.shares * nav).round_dp_with_strategy(SHARE_DP, RoundingStrategy::ToZero),
        );

        let pool_account = state.pool.account();
        let cash = self.balances.balance(pool_account);
        if gross_value > cash {
            return Err(PoolError::InsufficientPoolLiquidity {
                available: cash,
                requested: gross_value,
            });
        }

        let gain = gross_value.sub(deposit.amount).floor_zero();
        let fee = self
            .fees
            .quote(deposit.account, gain, state.pool.performance_fee_rate, None)?;
        let net_amount = gross_value.sub(fee.fee_amount);

        let mut postings = vec![
            Posting::debit(pool_account, net_amount, TransactionType::PoolWithdrawal),
            Posting::credit(deposit.account, net_amount, TransactionType::PoolWithdrawal),
        ];
        postings.extend(self.fees.postings(pool_account, &fee, FeeKind::Performance));
        self.balances.apply(&postings)?;
        self.apply_valuation(&mut state, valuation);

        let now = Timestamp::now();
        let pool = &mut state.pool;
        pool.total_value = pool.total_value.sub(gross_value).floor_zero();
        pool.available_balance = pool.available_balance.sub(gross_value).floor_zero();
        if !deposit.seed {
            pool.total_deposits = pool.total_deposits.sub(deposit.amount).floor_zero();
        }
        pool.total_shares -= deposit.shares;
        pool.total_fees_collected = pool.total_fees_collected.add(fee.fee_amount);
        pool.updated_at = now;
        if let Some(row) = state.deposits.get_mut(&deposit_id) {
            row.withdrawn_at = Some(now);
            row.withdrawn_amount = Some(net_amount);
            row.current_value = Quote::zero();
        }
        state.refresh_deposit_values();
        drop(state);

        self.fees.record(pool_account, FeeKind::Performance, gain, &fee);
        self.events.emit(EventPayload::PoolWithdrawn(PoolFlowEvent {
            pool_id,
            deposit_id,
            account: deposit.account,
            amount: net_amount,
            shares: deposit.shares,
            performance_fee: fee.fee_amount,
        }));
        tracing::info!(
            pool = pool_id.0,
            deposit = deposit_id.0,
            %gross_value,
            performance_fee = %fee.fee_amount,
            "pool withdrawal"
        );
        Ok(Withdrawal {
            deposit_id,
            gross_value,
            performance_fee: fee.fee_amount,
            net_amount,
        })
    }

    pub fn nav_per_share(&self, pool_id: PoolId) -> Result<Decimal, PoolError> {
        Ok(self.pool(pool_id)?.nav_per_share())
    }

    /// Re-marks the pool: cash from the balance store plus open positions at current prices.
    pub fn revalue(&self, pool_id: PoolId) -> Result<Pool, PoolError> {
        let handle = self.handle(pool_id)?;
        let mut state = self.lock(&handle, pool_id)?;
        self.revalue_locked(&mut state)?;
        Ok(state.pool.clone())
    }

    pub fn deactivate(&self, pool_id: PoolId) -> Result<Pool, PoolError> {
        let handle = self.handle(pool_id)?;
        let mut state = self.lock(&handle, pool_id)?;
        state.pool.is_active = false;
        state.pool.updated_at = Timestamp::now();
        let pool = state.pool.clone();
        drop(state);

        self.events.emit(EventPayload::PoolDeactivated(PoolDeactivatedEvent {
            pool_id,
            total_value: pool.total_value,
            total_shares: pool.total_shares,
        }));
        tracing::info!(pool = pool_id.0, "pool deactivated");
        Ok(pool)
    }

    pub fn buy_prediction(
        &self,
        pool_id: PoolId,
        market_id: MarketId,
        outcome: Outcome,
        amount: Quote,
    ) -> Result<PredictionFill, PoolError> {
        self.trade(pool_id, |account| Ok(self.amm.buy(market_id, outcome, amount, account, None)?))
    }

    pub fn sell_prediction(
        &self,
        pool_id: PoolId,
        market_id: MarketId,
        outcome: Outcome,
        shares: Decimal,
    ) -> Result<PredictionFill, PoolError> {
        self.trade(pool_id, |account| Ok(self.amm.sell(market_id, outcome, shares, account, None)?))
    }

    pub fn open_perp(&self, pool_id: PoolId, order: OpenPerp) -> Result<PerpPosition, PoolError> {
        self.trade(pool_id, |account| Ok(self.perps.open(account, order)?))
    }

    pub fn close_perp(&self, pool_id: PoolId, position_id: PerpPositionId) -> Result<PerpPosition, PoolError> {
        self.trade(pool_id, |account| {
            let position = self.perps.position(position_id)?;
            if position.account != account {
                return Err(PoolError::PositionNotOwned { pool_id, position_id });
            }
            Ok(self.perps.close(position_id)?)
        })
    }

    pub fn pool(&self, pool_id: PoolId) -> Result<Pool, PoolError> {
        let handle = self.handle(pool_id)?;
        let state = self.lock(&handle, pool_id)?;
        Ok(state.pool.clone())
    }

    pub fn pools(&self) -> Vec<Pool> {
        self.handles()
            .into_iter()
            .filter_map(|(id, h)| self.lock(&h, id).ok().map(|s| s.pool.clone()))
            .collect()
    }

    pub fn deposit_record(&self, deposit_id: DepositId) -> Result<PoolDeposit, PoolError> {
        let pool_id = self.pool_of(deposit_id)?;
        let handle = self.handle(pool_id)?;
        let state = self.lock(&handle, pool_id)?;
        state
            .deposits
            .get(&deposit_id)
            .cloned()
            .ok_or(PoolError::DepositNotFound(deposit_id))
    }

    pub fn deposits(&self, pool_id: PoolId) -> Result<Vec<PoolDeposit>, PoolError> {
        let handle = self.handle(pool_id)?;
        let state = self.lock(&handle, pool_id)?;
        Ok(state.deposits.values().cloned().collect())
    }

    pub fn all_deposits(&self) -> Vec<PoolDeposit> {
        let mut deposits: Vec<PoolDeposit> = self
            .handles()
            .into_iter()
            .filter_map(|(id, h)| {
                self.lock(&h, id)
                    .ok()
                    .map(|s| s.deposits.values().cloned().collect::<Vec<_>>())
            })
            .flatten()
            .collect();
        deposits.sort_by_key(|d| d.id);
        deposits
    }

    // runs a trade for the pool account under the pool lock, then re-marks the pool
    fn trade<T>(&self, pool_id: PoolId, f: impl FnOnce(AccountId) -> Result<T, PoolError>) -> Result<T, PoolError> {
        let handle = self.handle(pool_id)?;
        let mut state = self.lock(&handle, pool_id)?;
        state.ensure_active()?;
        let out = f(state.pool.account())?;
        // the trade is committed; a stale valuation is corrected by the next revalue
        if let Err(e) = self.revalue_locked(&mut state) {
            tracing::warn!(pool = pool_id.0, error = %e, "revalue after trade failed");
        }
        Ok(out)
    }

    fn revalue_locked(&self, state: &mut PoolState) -> Result<(), PoolError> {
        let valuation = self.valuation(&state.pool)?;
        self.apply_valuation(state, valuation);
        Ok(())
    }

    // cash from the balance store plus open positions at current marks. reads only.
    fn valuation(&self, pool: &Pool) -> Result<Valuation, PoolError> {
        let account = pool.account();
        let cash = self.balances.balance(account);
        let positions = self.amm.mark_value(account)?.add(self.perps.mark_value(account)?);
        Ok(Valuation {
            cash,
            total_value: cash.add(positions),
        })
    }

    fn apply_valuation(&self, state: &mut PoolState, valuation: Valuation) {
        let new_value = valuation.total_value;
        let pool = &mut state.pool;
        let old_value = pool.total_value;
        pool.available_balance = valuation.cash;
        pool.total_value = new_value;
        pool.lifetime_pnl = pool.lifetime_pnl.add(new_value.sub(old_value));
        pool.updated_at = Timestamp::now();
        let pool_id = pool.id;
        state.refresh_deposit_values();

        if new_value != old_value {
            self.events.emit(EventPayload::PoolRevalued(PoolRevaluedEvent {
                pool_id,
                old_value,
                new_value,
            }));
            tracing::debug!(pool = pool_id.0, %old_value, %new_value, "pool revalued");
        }
    }

    fn pool_of(&self, deposit_id: DepositId) -> Result<PoolId, PoolError> {
        self.deposit_index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&deposit_id)
            .copied()
            .ok_or(PoolError::DepositNotFound(deposit_id))
    }

    fn handle(&self, pool_id: PoolId) -> Result<Arc<Mutex<PoolState>>, PoolError> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pool_id)
            .cloned()
            .ok_or(PoolError::PoolNotFound(pool_id))
    }

    fn handles(&self) -> Vec<(PoolId, Arc<Mutex<PoolState>>)> {
        let mut handles: Vec<_> = self
            .pools
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
        handle: &'a Arc<Mutex<PoolState>>,
        pool_id: PoolId,
    ) -> Result<MutexGuard<'a, PoolState>, PoolError> {
        Ok(lock_with_retry(handle, &self.retry, || format!("pool {}", pool_id.0))?)
    }
}
