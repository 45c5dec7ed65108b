//! Balance store: the only owner of account balances.
//!
//! Every mutation goes through a posting set that is applied atomically. The
//! accounts involved are locked in `AccountId` order, every debit is checked
//! against the balance it will see, and only then are the balances changed and
//! one [`BalanceTransaction`] per leg appended to the ledger. A rejected set
//! changes nothing and writes nothing.

use crate::config::RetryConfig;
use crate::retry::{lock_with_retry, LockError};
use crate::types::{AccountId, PoolId, Quote, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Deposit,
    Withdrawal,
    Transfer,
    PredictionBuy,
    PredictionSell,
    PredictionPayout,
    PredictionRefund,
    MarketSubsidy,
    PerpOpen,
    PerpClose,
    PerpLiquidation,
    TradingFee,
    ReferralFee,
    PoolSeed,
    PoolDeposit,
    PoolWithdrawal,
    PerformanceFee,
}

// Append-only ledger row. amount is signed: negative for debits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceTransaction {
    pub id: TxId,
    pub account: AccountId,
    pub tx_type: TransactionType,
    pub amount: Quote,
    pub balance_before: Quote,
    pub balance_after: Quote,
    pub created_at: Timestamp,
}

impl BalanceTransaction {
    pub fn user_id(&self) -> Option<UserId> {
        self.account.user_id()
    }

    pub fn pool_id(&self) -> Option<PoolId> {
        self.account.pool_id()
    }
}

/// One leg of an atomic posting set. Positive delta credits, negative debits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub account: AccountId,
    pub delta: Quote,
    pub tx_type: TransactionType,
}

impl Posting {
    pub fn debit(account: AccountId, amount: Quote, tx_type: TransactionType) -> Self {
        Self { account, delta: amount.negate(), tx_type }
    }

    pub fn credit(account: AccountId, amount: Quote, tx_type: TransactionType) -> Self {
        Self { account, delta: amount, tx_type }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BalanceError {
    #[error("Insufficient funds in {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        requested: Quote,
        available: Quote,
    },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(Quote),

    #[error("Posting set does not balance: net {0}")]
    Unbalanced(Quote),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Default)]
struct AccountState {
    balance: Quote,
    // false until a posting commits. a rejected set can register an account
    // but must not make it visible.
    posted: bool,
}

#[derive(Debug)]
pub struct BalanceStore {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<AccountState>>>>,
    ledger: Mutex<Vec<BalanceTransaction>>,
    retry: RetryConfig,
}

impl BalanceStore {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            ledger: Mutex::new(Vec::new()),
            retry,
        }
    }

    pub fn balance(&self, account: AccountId) -> Quote {
        let handle = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.get(&account).cloned()
        };
        match handle {
            Some(handle) => handle.lock().map(|s| s.balance).unwrap_or_else(|e| e.into_inner().balance),
            None => Quote::zero(),
        }
    }

    /// Sum of every balance. Only `mint` and `burn` change it.
    pub fn total_balance(&self) -> Quote {
        self.balances().values().sum()
    }

    pub fn balances(&self) -> BTreeMap<AccountId, Quote> {
        let handles: Vec<(AccountId, Arc<Mutex<AccountState>>)> = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts.iter().map(|(id, h)| (*id, Arc::clone(h))).collect()
        };
        handles
            .into_iter()
            .filter_map(|(id, h)| {
                let state = h.lock().unwrap_or_else(|e| e.into_inner());
                state.posted.then_some((id, state.balance))
            })
            .collect()
    }

    pub fn transactions(&self) -> Vec<BalanceTransaction> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn transactions_for(&self, account: AccountId) -> Vec<BalanceTransaction> {
        self.ledger
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|tx| tx.account == account)
            .cloned()
            .collect()
    }

    // 2.1: external value entering the system (e.g. signup grant, fiat on-ramp)
    pub fn mint(&self, account: AccountId, amount: Quote) -> Result<Quote, BalanceError> {
        require_positive(amount)?;
        let rows = self.post(&[Posting::credit(account, amount, TransactionType::Deposit)])?;
        Ok(last_balance(&rows, amount))
    }

    // 2.2: external value leaving the system
    pub fn burn(&self, account: AccountId, amount: Quote) -> Result<Quote, BalanceError> {
        require_positive(amount)?;
        let rows = self.post(&[Posting::debit(account, amount, TransactionType::Withdrawal)])?;
        Ok(last_balance(&rows, Quote::zero()))
    }

    pub fn debit(
        &self,
        account: AccountId,
        amount: Quote,
        tx_type: TransactionType,
    ) -> Result<Quote, BalanceError> {
        require_positive(amount)?;
        let rows = self.post(&[Posting::debit(account, amount, tx_type)])?;
        Ok(last_balance(&rows, Quote::zero()))
    }

    pub fn credit(
        &self,
        account: AccountId,
        amount: Quote,
        tx_type: TransactionType,
    ) -> Result<Quote, BalanceError> {
        require_positive(amount)?;
        let rows = self.post(&[Posting::credit(account, amount, tx_type)])?;
        Ok(last_balance(&rows, amount))
    }

    // 2.3: debit then credit as one unit. only the debit can fail.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Quote,
        tx_type: TransactionType,
    ) -> Result<Vec<BalanceTransaction>, BalanceError> {
        require_positive(amount)?;
        self.apply(&[
            Posting::debit(from, amount, tx_type),
            Posting::credit(to, amount, tx_type),
        ])
    }

    /// Apply a balanced posting set atomically. Zero-delta legs are skipped.
    pub fn apply(&self, postings: &[Posting]) -> Result<Vec<BalanceTransaction>, BalanceError> {
        let net: Quote = postings.iter().map(|p| p.delta).sum();
        if !net.is_zero() {
            return Err(BalanceError::Unbalanced(net));
        }
        self.post(postings)
    }

    fn post(&self, postings: &[Posting]) -> Result<Vec<BalanceTransaction>, BalanceError> {
        let legs: Vec<&Posting> = postings.iter().filter(|p| !p.delta.is_zero()).collect();
        if legs.is_empty() {
            return Ok(Vec::new());
        }

        // BTreeMap keys come out sorted, which is the lock order.
        let mut handles: BTreeMap<AccountId, Arc<Mutex<AccountState>>> = BTreeMap::new();
        for leg in &legs {
            if !handles.contains_key(&leg.account) {
                handles.insert(leg.account, self.handle(leg.account));
            }
        }

        let mut guards: BTreeMap<AccountId, MutexGuard<'_, AccountState>> = BTreeMap::new();
        for (account, handle) in &handles {
            let guard = lock_with_retry(handle, &self.retry, || format!("account {account}"))?;
            guards.insert(*account, guard);
        }

        // dry run against a scratch copy so a late failure leaves nothing behind
        let mut scratch: BTreeMap<AccountId, Quote> =
            guards.iter().map(|(id, g)| (*id, g.balance)).collect();
        let mut staged = Vec::with_capacity(legs.len());
        for leg in &legs {
            let before = scratch.get(&leg.account).copied().unwrap_or_else(Quote::zero);
            let after = before.add(leg.delta);
            if after.is_negative() {
                return Err(BalanceError::InsufficientFunds {
                    account: leg.account,
                    requested: leg.delta.abs(),
                    available: before,
                });
            }
            scratch.insert(leg.account, after);
            staged.push((leg, before, after));
        }

        for (account, guard) in guards.iter_mut() {
            if let Some(balance) = scratch.get(account) {
                guard.balance = *balance;
                guard.posted = true;
            }
        }

        let now = Timestamp::now();
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let mut rows = Vec::with_capacity(staged.len());
        for (leg, before, after) in staged {
            let row = BalanceTransaction {
                id: TxId(ledger.len() as u64 + 1),
                account: leg.account,
                tx_type: leg.tx_type,
                amount: leg.delta,
                balance_before: before,
                balance_after: after,
                created_at: now,
            };
            ledger.push(row.clone());
            rows.push(row);
        }

        tracing::debug!(legs = rows.len(), "posting set applied");
        Ok(rows)
    }

    fn handle(&self, account: AccountId) -> Arc<Mutex<AccountState>> {
        {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = accounts.get(&account) {
                return Arc::clone(handle);
            }
        }
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(accounts.entry(account).or_default())
    }
}

fn require_positive(amount: Quote) -> Result<(), BalanceError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(BalanceError::InvalidAmount(amount))
    }
}

fn last_balance(rows: &[BalanceTransaction], fallback: Quote) -> Quote {
    rows.last().map(|r| r.balance_after).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store() -> BalanceStore {
        BalanceStore::new(RetryConfig::default())
    }

    #[test]
    fn debit_and_credit_record_before_after() {
        let store = store();
        let alice = AccountId::user(1);
        store.mint(alice, Quote::new(dec!(100))).unwrap();

        let after = store.debit(alice, Quote::new(dec!(30)), TransactionType::PredictionBuy).unwrap();
        assert_eq!(after.value(), dec!(70));

        let after = store.credit(alice, Quote::new(dec!(5)), TransactionType::PredictionSell).unwrap();
        assert_eq!(after.value(), dec!(75));

        let rows = store.transactions_for(alice);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].balance_before.value(), dec!(100));
        assert_eq!(rows[1].balance_after.value(), dec!(70));
        assert_eq!(rows[1].amount.value(), dec!(-30));
        assert_eq!(rows[1].user_id(), Some(UserId(1)));
    }

    #[test]
    fn overdraft_rejected_without_record() {
        let store = store();
        let alice = AccountId::user(1);
        store.mint(alice, Quote::new(dec!(10))).unwrap();

        let result = store.debit(alice, Quote::new(dec!(10.01)), TransactionType::PerpOpen);
        assert!(matches!(result, Err(BalanceError::InsufficientFunds { .. })));
        assert_eq!(store.balance(alice).value(), dec!(10));
        assert_eq!(store.transactions().len(), 1);
    }

    #[test]
    fn non_positive_amounts_rejected() {
        let store = store();
        let alice = AccountId::user(1);
        assert!(matches!(
            store.credit(alice, Quote::zero(), TransactionType::Deposit),
            Err(BalanceError::InvalidAmount(_))
        ));
        assert!(matches!(
            store.debit(alice, Quote::new(dec!(-1)), TransactionType::Deposit),
            Err(BalanceError::InvalidAmount(_))
        ));
    }

    #[test]
    fn transfer_is_all_or_nothing() {
        let store = store();
        let alice = AccountId::user(1);
        let bob = AccountId::user(2);
        store.mint(alice, Quote::new(dec!(50))).unwrap();

        store.transfer(alice, bob, Quote::new(dec!(20)), TransactionType::Transfer).unwrap();
        assert_eq!(store.balance(alice).value(), dec!(30));
        assert_eq!(store.balance(bob).value(), dec!(20));

        let result = store.transfer(alice, bob, Quote::new(dec!(31)), TransactionType::Transfer);
        assert!(result.is_err());
        assert_eq!(store.balance(alice).value(), dec!(30));
        assert_eq!(store.balance(bob).value(), dec!(20));
    }

    #[test]
    fn multi_leg_failure_leaves_earlier_legs_unapplied() {
        let store = store();
        let alice = AccountId::user(1);
        let bob = AccountId::user(2);
        store.mint(alice, Quote::new(dec!(50))).unwrap();
        let ledger_len = store.transactions().len();

        // first leg would succeed, second overdraws bob
        let result = store.apply(&[
            Posting::debit(alice, Quote::new(dec!(10)), TransactionType::Transfer),
            Posting::debit(bob, Quote::new(dec!(5)), TransactionType::Transfer),
            Posting::credit(AccountId::Platform, Quote::new(dec!(15)), TransactionType::Transfer),
        ]);
        assert!(matches!(result, Err(BalanceError::InsufficientFunds { account, .. }) if account == bob));
        assert_eq!(store.balance(alice).value(), dec!(50));
        assert_eq!(store.balance(AccountId::Platform).value(), dec!(0));
        assert_eq!(store.transactions().len(), ledger_len);
    }

    #[test]
    fn unbalanced_sets_rejected() {
        let store = store();
        let result = store.apply(&[Posting::credit(
            AccountId::user(1),
            Quote::new(dec!(1)),
            TransactionType::Transfer,
        )]);
        assert!(matches!(result, Err(BalanceError::Unbalanced(_))));
    }

    #[test]
    fn total_balance_only_moves_with_mint_and_burn() {
        let store = store();
        let alice = AccountId::user(1);
        store.mint(alice, Quote::new(dec!(100))).unwrap();
        store.transfer(alice, AccountId::Platform, Quote::new(dec!(40)), TransactionType::TradingFee).unwrap();
        assert_eq!(store.total_balance().value(), dec!(100));

        store.burn(alice, Quote::new(dec!(60))).unwrap();
        assert_eq!(store.total_balance().value(), dec!(40));
    }

    #[test]
    fn unknown_account_reads_zero() {
        let store = store();
        assert_eq!(store.balance(AccountId::user(99)), Quote::zero());
    }

    #[test]
    fn rejected_set_registers_no_visible_account() {
        let store = store();
        let alice = AccountId::user(1);
        store.mint(alice, Quote::new(dec!(5))).unwrap();

        let result = store.transfer(alice, AccountId::user(2), Quote::new(dec!(6)), TransactionType::Transfer);
        assert!(result.is_err());
        assert_eq!(store.balances().len(), 1);
    }
}
