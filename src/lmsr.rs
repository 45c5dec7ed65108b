// 4.0 lmsr.rs: logarithmic market scoring rule, pure math on decimals.
//   C(y, n)   = b * ln(e^(y/b) + e^(n/b))
//   p_yes     = e^(y/b) / (e^(y/b) + e^(n/b))
//   buy A on yes: Δ = b * ln(e^(A/b) * (e^(y/b) + e^(n/b)) - e^(n/b)) - y
// every exponential is taken after subtracting max(y, n)/b so arguments stay <= 0.
// 4.1 exp/ln live at the bottom; they range-reduce so large reserves stay exact.

use crate::types::Outcome;
use rust_decimal::prelude::MathematicalOps;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

// shares and proceeds are truncated here; the truncation always favors the escrow
pub const SHARE_DP: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LmsrError {
    #[error("Liquidity must be positive, got {0}")]
    InvalidLiquidity(Decimal),

    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),

    #[error("Cannot sell {requested} shares, only {available} outstanding")]
    InsufficientReserves { requested: Decimal, available: Decimal },

    #[error("Numeric overflow evaluating {0}")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserves {
    pub yes: Decimal,
    pub no: Decimal,
}

impl Reserves {
    pub fn new(yes: Decimal, no: Decimal) -> Self {
        Self { yes, no }
    }

    pub fn get(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes,
            Outcome::No => self.no,
        }
    }

    // (traded side, other side)
    fn split(&self, outcome: Outcome) -> (Decimal, Decimal) {
        (self.get(outcome), self.get(outcome.opposite()))
    }

    fn with(&self, outcome: Outcome, shares: Decimal) -> Self {
        match outcome {
            Outcome::Yes => Self { yes: shares, no: self.no },
            Outcome::No => Self { yes: self.yes, no: shares },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prices {
    pub yes: Decimal,
    pub no: Decimal,
}

impl Prices {
    pub fn get(&self, outcome: Outcome) -> Decimal {
        match outcome {
            Outcome::Yes => self.yes,
            Outcome::No => self.no,
        }
    }
}

/// Result of pricing a trade against fixed reserves. Nothing is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeQuote {
    pub outcome: Outcome,
    // dollars paid in (buy) or paid out before fees (sell)
    pub amount: Decimal,
    pub shares: Decimal,
    pub avg_price: Decimal,
    pub old_prices: Prices,
    pub new_prices: Prices,
    // relative move of the traded side's price
    pub price_impact: Decimal,
    pub new_reserves: Reserves,
}

fn check_liquidity(b: Decimal) -> Result<(), LmsrError> {
    if b <= Decimal::ZERO {
        return Err(LmsrError::InvalidLiquidity(b));
    }
    Ok(())
}

// 4.2: logistic form of p_yes. yes + no is exactly 1 by construction.
pub fn prices(reserves: Reserves, b: Decimal) -> Result<Prices, LmsrError> {
    check_liquidity(b)?;
    let d = (reserves.no - reserves.yes) / b;
    let yes = if d >= Decimal::ZERO {
        let e = exp(-d)?;
        e / (Decimal::ONE + e)
    } else {
        let e = exp(d)?;
        Decimal::ONE / (Decimal::ONE + e)
    };
    Ok(Prices { yes, no: Decimal::ONE - yes })
}

// 4.3: cost function with the max shift
pub fn cost(reserves: Reserves, b: Decimal) -> Result<Decimal, LmsrError> {
    check_liquidity(b)?;
    let m = reserves.yes.max(reserves.no) / b;
    let sum = exp(reserves.yes / b - m)? + exp(reserves.no / b - m)?;
    Ok(b * (m + ln(sum)?))
}

// 4.4: shares bought for `amount` dollars. rearranged as
//   Δ = b * (m + a + ln(e_own + e_other * (1 - e^-a))) - own
// with a = A/b and e_* shifted by m, so nothing exponentiates a positive number.
pub fn shares_for_amount(
    reserves: Reserves,
    b: Decimal,
    outcome: Outcome,
    amount: Decimal,
) -> Result<Decimal, LmsrError> {
    check_liquidity(b)?;
    if amount <= Decimal::ZERO {
        return Err(LmsrError::NonPositiveAmount(amount));
    }
    let (own, other) = reserves.split(outcome);
    let a = amount / b;
    let m = own.max(other) / b;
    let e_own = exp(own / b - m)?;
    let e_other = exp(other / b - m)?;
    let inner = e_own + e_other * (Decimal::ONE - exp(-a)?);
    let delta = b * (m + a + ln(inner)?) - own;
    Ok(delta.round_dp_with_strategy(SHARE_DP, RoundingStrategy::ToZero))
}

// 4.5: dollars returned for selling `shares` back: C(before) - C(after)
pub fn proceeds_for_shares(
    reserves: Reserves,
    b: Decimal,
    outcome: Outcome,
    shares: Decimal,
) -> Result<Decimal, LmsrError> {
    check_liquidity(b)?;
    if shares <= Decimal::ZERO {
        return Err(LmsrError::NonPositiveAmount(shares));
    }
    let own = reserves.get(outcome);
    if shares > own {
        return Err(LmsrError::InsufficientReserves { requested: shares, available: own });
    }
    let after = reserves.with(outcome, own - shares);
    let proceeds = cost(reserves, b)? - cost(after, b)?;
    Ok(proceeds
        .max(Decimal::ZERO)
        .round_dp_with_strategy(SHARE_DP, RoundingStrategy::ToZero))
}

fn impact(old: Decimal, new: Decimal) -> Decimal {
    if old.is_zero() {
        Decimal::ZERO
    } else {
        (new - old) / old
    }
}

pub fn calculate_buy(
    reserves: Reserves,
    b: Decimal,
    outcome: Outcome,
    amount: Decimal,
) -> Result<TradeQuote, LmsrError> {
    let old_prices = prices(reserves, b)?;
    let shares = shares_for_amount(reserves, b, outcome, amount)?;
    if shares <= Decimal::ZERO {
        return Err(LmsrError::NonPositiveAmount(shares));
    }
    let new_reserves = reserves.with(outcome, reserves.get(outcome) + shares);
    let new_prices = prices(new_reserves, b)?;

    Ok(TradeQuote {
        outcome,
        amount,
        shares,
        avg_price: amount / shares,
        old_prices,
        new_prices,
        price_impact: impact(old_prices.get(outcome), new_prices.get(outcome)),
        new_reserves,
    })
}

pub fn calculate_sell(
    reserves: Reserves,
    b: Decimal,
    outcome: Outcome,
    shares: Decimal,
) -> Result<TradeQuote, LmsrError> {
    let old_prices = prices(reserves, b)?;
    let proceeds = proceeds_for_shares(reserves, b, outcome, shares)?;
    let new_reserves = reserves.with(outcome, reserves.get(outcome) - shares);
    let new_prices = prices(new_reserves, b)?;

    Ok(TradeQuote {
        outcome,
        amount: proceeds,
        shares,
        avg_price: proceeds / shares,
        old_prices,
        new_prices,
        price_impact: impact(old_prices.get(outcome), new_prices.get(outcome)),
        new_reserves,
    })
}

/// Escrow a market needs up front so that every share issued after creation
/// can be paid 1 at resolution: C(y0, n0) - min(y0, n0), rounded up to the cent.
pub fn worst_case_subsidy(initial: Reserves, b: Decimal) -> Result<Decimal, LmsrError> {
    let subsidy = cost(initial, b)? - initial.yes.min(initial.no);
    Ok(subsidy.round_dp_with_strategy(2, RoundingStrategy::AwayFromZero))
}

// below this e^x is under the 28-digit resolution of Decimal
const EXP_UNDERFLOW: Decimal = dec!(-64);
const SERIES_EPSILON: Decimal = dec!(0.0000000000000000000000001);

// 4.6: e^x = e^k * e^f with k integer and |f| < 1, f by Taylor series
pub fn exp(x: Decimal) -> Result<Decimal, LmsrError> {
    if x.is_zero() {
        return Ok(Decimal::ONE);
    }
    if x < Decimal::ZERO {
        if x < EXP_UNDERFLOW {
            return Ok(Decimal::ZERO);
        }
        let positive = exp(-x)?;
        return Decimal::ONE
            .checked_div(positive)
            .ok_or(LmsrError::Overflow("exp"));
    }

    let k = x.trunc();
    let f = x - k;

    let mut term = Decimal::ONE;
    let mut series = Decimal::ONE;
    for n in 1..=40u32 {
        term = term * f / Decimal::from(n);
        series += term;
        if term.abs() < SERIES_EPSILON {
            break;
        }
    }

    let mut whole = Decimal::ONE;
    let mut remaining = k;
    while remaining > Decimal::ZERO {
        whole = whole.checked_mul(Decimal::E).ok_or(LmsrError::Overflow("exp"))?;
        remaining -= Decimal::ONE;
    }

    whole.checked_mul(series).ok_or(LmsrError::Overflow("exp"))
}

// 4.7: ln seeded by the library and polished with Halley steps against our exp
pub fn ln(x: Decimal) -> Result<Decimal, LmsrError> {
    if x <= Decimal::ZERO {
        return Err(LmsrError::NonPositiveAmount(x));
    }
    if x == Decimal::ONE {
        return Ok(Decimal::ZERO);
    }
    let mut y = x.checked_ln().ok_or(LmsrError::Overflow("ln"))?;
    for _ in 0..8 {
        let ey = exp(y)?;
        let step = dec!(2) * (x - ey) / (x + ey);
        y += step;
        if step.abs() < SERIES_EPSILON {
            break;
        }
    }
    Ok(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Decimal, b: Decimal, tol: Decimal) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn exp_and_ln_match_known_values() {
        assert!(close(exp(dec!(1)).unwrap(), Decimal::E, dec!(0.000000000001)));
        assert!(close(exp(dec!(0.1)).unwrap(), dec!(1.1051709180756476), dec!(0.000000000001)));
        assert!(close(exp(dec!(-2)).unwrap(), dec!(0.1353352832366127), dec!(0.000000000001)));
        assert!(close(ln(dec!(2)).unwrap(), dec!(0.6931471805599453), dec!(0.000000000001)));
        assert!(close(ln(exp(dec!(12.5)).unwrap()).unwrap(), dec!(12.5), dec!(0.000000001)));
        assert_eq!(exp(dec!(-100)).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn balanced_market_prices_half() {
        let p = prices(Reserves::new(dec!(0), dec!(0)), dec!(100)).unwrap();
        assert_eq!(p.yes, dec!(0.5));
        assert_eq!(p.yes + p.no, Decimal::ONE);
    }

    #[test]
    fn worked_example_ten_dollars_of_yes() {
        let quote = calculate_buy(Reserves::new(dec!(0), dec!(0)), dec!(100), Outcome::Yes, dec!(10)).unwrap();
        // closed form: Δ = 100 * ln(2e^0.1 - 1)
        assert!(close(quote.shares, dec!(19.0902), dec!(0.001)), "shares {}", quote.shares);
        assert!(close(quote.avg_price, dec!(0.5238), dec!(0.0001)), "avg {}", quote.avg_price);
        assert!(close(quote.new_prices.yes, dec!(0.5476), dec!(0.0001)), "yes {}", quote.new_prices.yes);
        assert!(close(quote.new_prices.no, dec!(0.4524), dec!(0.0001)), "no {}", quote.new_prices.no);
        assert_eq!(quote.new_prices.yes + quote.new_prices.no, Decimal::ONE);
        assert!(quote.price_impact > Decimal::ZERO);
    }

    #[test]
    fn buy_cost_matches_cost_function() {
        let reserves = Reserves::new(dec!(40), dec!(15));
        let b = dec!(50);
        let quote = calculate_buy(reserves, b, Outcome::No, dec!(25)).unwrap();
        let paid = cost(quote.new_reserves, b).unwrap() - cost(reserves, b).unwrap();
        assert!(close(paid, dec!(25), dec!(0.00000001)), "paid {}", paid);
    }

    #[test]
    fn no_side_buy_mirrors_yes_side() {
        let b = dec!(100);
        let yes = calculate_buy(Reserves::new(dec!(10), dec!(30)), b, Outcome::Yes, dec!(7)).unwrap();
        let no = calculate_buy(Reserves::new(dec!(30), dec!(10)), b, Outcome::No, dec!(7)).unwrap();
        assert_eq!(yes.shares, no.shares);
        assert!(close(yes.new_prices.yes, no.new_prices.no, dec!(0.000000000000000001)));
    }

    #[test]
    fn large_reserves_do_not_overflow() {
        let reserves = Reserves::new(dec!(1_000_000), dec!(999_000));
        let quote = calculate_buy(reserves, dec!(100), Outcome::No, dec!(50)).unwrap();
        assert!(quote.shares > Decimal::ZERO);
        assert!(quote.old_prices.yes > dec!(0.9999));
        assert!(quote.new_prices.no > quote.old_prices.no);

        // a huge budget relative to b
        let quote = calculate_buy(Reserves::new(dec!(0), dec!(0)), dec!(10), Outcome::Yes, dec!(5000)).unwrap();
        assert!(quote.avg_price < Decimal::ONE);
        assert!(quote.shares > dec!(5000));
    }

    #[test]
    fn sell_round_trip_returns_at_most_paid() {
        let reserves = Reserves::new(dec!(20), dec!(20));
        let b = dec!(100);
        let buy = calculate_buy(reserves, b, Outcome::Yes, dec!(30)).unwrap();
        let sell = calculate_sell(buy.new_reserves, b, Outcome::Yes, buy.shares).unwrap();
        assert!(sell.amount <= dec!(30));
        assert!(close(sell.amount, dec!(30), dec!(0.0000001)));
        assert_eq!(sell.new_reserves, reserves);
        assert!(sell.price_impact < Decimal::ZERO);
    }

    #[test]
    fn cannot_sell_more_than_reserves() {
        let result = calculate_sell(Reserves::new(dec!(5), dec!(0)), dec!(100), Outcome::Yes, dec!(6));
        assert!(matches!(result, Err(LmsrError::InsufficientReserves { .. })));
    }

    #[test]
    fn subsidy_for_empty_market_is_b_ln2() {
        let subsidy = worst_case_subsidy(Reserves::new(dec!(0), dec!(0)), dec!(100)).unwrap();
        assert_eq!(subsidy, dec!(69.32));
    }

    #[test]
    fn rejects_bad_inputs() {
        let r = Reserves::new(dec!(0), dec!(0));
        assert!(matches!(prices(r, dec!(0)), Err(LmsrError::InvalidLiquidity(_))));
        assert!(matches!(
            calculate_buy(r, dec!(100), Outcome::Yes, dec!(0)),
            Err(LmsrError::NonPositiveAmount(_))
        ));
    }
}
