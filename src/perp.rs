// 6.0: leveraged position math. everything here is pure: no locks, no balances.
// exposure is margin-based: notional = margin * leverage.

use crate::types::{Leverage, Price, Quote, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// liquidation prices never reach zero, even at 1x with a full threshold
const MIN_LIQUIDATION_PRICE: Decimal = dec!(0.0001);

pub fn notional(margin: Quote, leverage: Leverage) -> Quote {
    margin.mul(leverage.value())
}

// 6.1: fixed at open. long: entry * (1 - t/lev), short: entry * (1 + t/lev)
pub fn liquidation_price(
    entry_price: Price,
    leverage: Leverage,
    side: Side,
    maintenance_threshold: Decimal,
) -> Price {
    let move_fraction = maintenance_threshold / leverage.value();
    let liq_price = match side {
        Side::Long => entry_price.value() * (Decimal::ONE - move_fraction),
        Side::Short => entry_price.value() * (Decimal::ONE + move_fraction),
    };
    Price::new_unchecked(liq_price.max(MIN_LIQUIDATION_PRICE))
}

// 6.2: notional * (current - entry) / entry, negated for shorts
pub fn unrealized_pnl(side: Side, notional: Quote, entry_price: Price, current_price: Price) -> Quote {
    let change = (current_price.value() - entry_price.value()) / entry_price.value();
    notional.mul(change * side.sign())
}

pub fn pnl_percent(pnl: Quote, margin: Quote) -> Decimal {
    if margin.is_zero() {
        return Decimal::ZERO;
    }
    pnl.value() / margin.value() * dec!(100)
}

pub fn is_liquidatable(side: Side, liquidation_price: Price, mark_price: Price) -> bool {
    match side {
        Side::Long => mark_price <= liquidation_price,
        Side::Short => mark_price >= liquidation_price,
    }
}

/// Outcome of closing a position: the realized PnL and what goes back to the holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSettlement {
    pub realized_pnl: Quote,
    pub returned: Quote,
}

// 6.3: losses stop at the posted margin
pub fn settle_close(margin: Quote, pnl: Quote) -> CloseSettlement {
    let realized_pnl = pnl.max(margin.negate());
    CloseSettlement {
        realized_pnl,
        returned: margin.add(realized_pnl).floor_zero(),
    }
}

pub fn settle_liquidation(margin: Quote) -> CloseSettlement {
    CloseSettlement {
        realized_pnl: margin.negate(),
        returned: Quote::zero(),
    }
}

// 6.4: positive = the position pays. longs pay a positive rate, shorts receive it.
pub fn funding_payment(side: Side, notional: Quote, funding_rate: Decimal) -> Quote {
    notional.mul(funding_rate * side.sign())
}

pub fn clamp_funding_rate(rate: Decimal, max_rate: Decimal) -> Decimal {
    rate.max(-max_rate).min(max_rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(v: Decimal) -> Price {
        Price::new(v).unwrap()
    }

    fn lev(v: u32) -> Leverage {
        Leverage::new(v).unwrap()
    }

    #[test]
    fn liquidation_price_long_10x() {
        let liq = liquidation_price(price(dec!(100)), lev(10), Side::Long, dec!(0.9));
        assert_eq!(liq.value(), dec!(91));
    }

    #[test]
    fn liquidation_price_short_10x() {
        let liq = liquidation_price(price(dec!(100)), lev(10), Side::Short, dec!(0.9));
        assert_eq!(liq.value(), dec!(109));
    }

    #[test]
    fn liquidation_buffer_leaves_ten_percent() {
        let margin = Quote::new(dec!(100));
        let size = notional(margin, lev(10));
        assert_eq!(size.value(), dec!(1000));

        let pnl = unrealized_pnl(Side::Long, size, price(dec!(100)), price(dec!(91)));
        assert_eq!(pnl.value(), dec!(-90));
        assert_eq!(pnl_percent(pnl, margin), dec!(-90));
    }

    #[test]
    fn liquidation_price_floored_at_1x() {
        let liq = liquidation_price(price(dec!(100)), lev(1), Side::Long, dec!(1));
        assert_eq!(liq.value(), MIN_LIQUIDATION_PRICE);
    }

    #[test]
    fn short_profits_when_price_falls() {
        let pnl = unrealized_pnl(Side::Short, Quote::new(dec!(500)), price(dec!(50)), price(dec!(45)));
        assert_eq!(pnl.value(), dec!(50));
    }

    #[test]
    fn crossed_checks() {
        assert!(is_liquidatable(Side::Long, price(dec!(91)), price(dec!(91))));
        assert!(!is_liquidatable(Side::Long, price(dec!(91)), price(dec!(92))));
        assert!(is_liquidatable(Side::Short, price(dec!(109)), price(dec!(110))));
        assert!(!is_liquidatable(Side::Short, price(dec!(109)), price(dec!(100))));
    }

    #[test]
    fn close_caps_loss_at_margin() {
        let settled = settle_close(Quote::new(dec!(100)), Quote::new(dec!(-250)));
        assert_eq!(settled.realized_pnl.value(), dec!(-100));
        assert_eq!(settled.returned, Quote::zero());

        let settled = settle_close(Quote::new(dec!(100)), Quote::new(dec!(40)));
        assert_eq!(settled.returned.value(), dec!(140));
    }

    #[test]
    fn funding_sign_follows_side() {
        let n = Quote::new(dec!(1000));
        assert_eq!(funding_payment(Side::Long, n, dec!(0.001)).value(), dec!(1));
        assert_eq!(funding_payment(Side::Short, n, dec!(0.001)).value(), dec!(-1));
        assert_eq!(clamp_funding_rate(dec!(0.5), dec!(0.01)), dec!(0.01));
        assert_eq!(clamp_funding_rate(dec!(-0.5), dec!(0.01)), dec!(-0.01));
    }
}
