// 3.0 fees.rs: trading and performance fees. fee = notional * rate,
// split between the platform and an optional referrer.
// trades fold the fee legs into their own posting set so principal and fee land together.

use crate::balance::{BalanceError, BalanceStore, Posting, TransactionType};
use crate::config::FeeConfig;
use crate::types::{AccountId, Quote, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    Trading,
    Performance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub fee_amount: Quote,
    pub platform_fee: Quote,
    pub referrer_fee: Quote,
    pub referrer: Option<UserId>,
}

// Append-only fee record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingFee {
    pub id: FeeId,
    pub payer: AccountId,
    pub kind: FeeKind,
    pub notional: Quote,
    pub fee_amount: Quote,
    pub platform_fee: Quote,
    pub referrer_fee: Quote,
    pub referrer_id: Option<UserId>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeeError {
    #[error("Fee rate {0} outside [0, 1)")]
    InvalidRate(Decimal),

    #[error("Notional must not be negative, got {0}")]
    NegativeNotional(Quote),

    #[error(transparent)]
    Balance(#[from] BalanceError),
}

// 3.1: the split. self-referral routes everything to the platform.
pub fn compute_fee(
    payer: AccountId,
    notional: Quote,
    fee_rate: Decimal,
    referrer: Option<UserId>,
    referrer_share: Decimal,
) -> Result<FeeBreakdown, FeeError> {
    if fee_rate < Decimal::ZERO || fee_rate >= Decimal::ONE {
        return Err(FeeError::InvalidRate(fee_rate));
    }
    if notional.is_negative() {
        return Err(FeeError::NegativeNotional(notional));
    }

    let fee_amount = notional.mul(fee_rate);
    let referrer = referrer.filter(|r| payer.user_id() != Some(*r));

    let (platform_fee, referrer_fee) = match referrer {
        Some(_) => {
            let referrer_fee = fee_amount.mul(referrer_share);
            (fee_amount.sub(referrer_fee), referrer_fee)
        }
        None => (fee_amount, Quote::zero()),
    };

    Ok(FeeBreakdown {
        fee_amount,
        platform_fee,
        referrer_fee,
        referrer,
    })
}

#[derive(Debug)]
pub struct FeeLedger {
    balances: Arc<BalanceStore>,
    config: FeeConfig,
    records: Mutex<Vec<TradingFee>>,
}

impl FeeLedger {
    pub fn new(balances: Arc<BalanceStore>, config: FeeConfig) -> Self {
        Self {
            balances,
            config,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn quote(
        &self,
        payer: AccountId,
        notional: Quote,
        fee_rate: Decimal,
        referrer: Option<UserId>,
    ) -> Result<FeeBreakdown, FeeError> {
        compute_fee(payer, notional, fee_rate, referrer, self.config.referrer_share)
    }

    pub fn quote_trade(
        &self,
        payer: AccountId,
        notional: Quote,
        referrer: Option<UserId>,
    ) -> Result<FeeBreakdown, FeeError> {
        self.quote(payer, notional, self.config.trading_fee_rate, referrer)
    }

    /// Legs moving a fee from `payer` to the platform and referrer.
    pub fn postings(&self, payer: AccountId, fee: &FeeBreakdown, kind: FeeKind) -> Vec<Posting> {
        let payer_type = match kind {
            FeeKind::Trading => TransactionType::TradingFee,
            FeeKind::Performance => TransactionType::PerformanceFee,
        };
        let mut legs = vec![
            Posting::debit(payer, fee.fee_amount, payer_type),
            Posting::credit(AccountId::Platform, fee.platform_fee, payer_type),
        ];
        if let Some(referrer) = fee.referrer {
            legs.push(Posting::credit(
                AccountId::User(referrer),
                fee.referrer_fee,
                TransactionType::ReferralFee,
            ));
        }
        legs
    }

    /// Appends the fee row. Call only after the fee legs were applied.
    pub fn record(
        &self,
        payer: AccountId,
        kind: FeeKind,
        notional: Quote,
        fee: &FeeBreakdown,
    ) -> Option<TradingFee> {
        if fee.fee_amount.is_zero() {
            return None;
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let row = TradingFee {
            id: FeeId(records.len() as u64 + 1),
            payer,
            kind,
            notional,
            fee_amount: fee.fee_amount,
            platform_fee: fee.platform_fee,
            referrer_fee: fee.referrer_fee,
            referrer_id: fee.referrer,
            created_at: Timestamp::now(),
        };
        records.push(row.clone());
        Some(row)
    }

    // 3.2: standalone charge: debit payer, credit platform/referrer, record.
    pub fn charge(
        &self,
        payer: AccountId,
        notional: Quote,
        fee_rate: Decimal,
        referrer: Option<UserId>,
    ) -> Result<FeeBreakdown, FeeError> {
        let fee = self.quote(payer, notional, fee_rate, referrer)?;
        self.balances.apply(&self.postings(payer, &fee, FeeKind::Trading))?;
        self.record(payer, FeeKind::Trading, notional, &fee);
        tracing::debug!(%payer, fee = %fee.fee_amount, "fee charged");
        Ok(fee)
    }

    pub fn records(&self) -> Vec<TradingFee> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn total_collected(&self) -> Quote {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| r.fee_amount)
            .sum()
    }
}
