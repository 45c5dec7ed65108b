//! Stress tests
//!
//! These tests simulate extreme market conditions and heavy contention to verify
//! the engine stays solvent and never double spends.

use market_core::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::thread;

fn patient_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 1_000,
        base_delay_micros: 10,
        max_delay_micros: 1_000,
    }
}

fn exchange() -> Exchange {
    let mut config = EngineConfig::default();
    config.retry = patient_retry();
    Exchange::new(config).unwrap()
}

/// Tests rapid price movements and cascading liquidations.
mod cascade_tests {
    use super::*;

    #[test]
    fn liquidation_cascade_no_bad_debt() {
        let ex = exchange();
        let ticker = Ticker::new("CRASHI");
        ex.perps()
            .list_ticker(ticker.clone(), Price::new_unchecked(dec!(100)), None, None);
        ex.fund(AccountId::PerpVault, Quote::new(dec!(100_000))).unwrap();

        // increasingly risky longs
        let mut positions = Vec::new();
        for i in 1..=10u32 {
            let trader = AccountId::user(i as u64);
            ex.fund(trader, Quote::new(dec!(1_000))).unwrap();
            let position = ex
                .open_perp(ticker.clone(), Side::Long, Quote::new(dec!(100)), i * 5, trader)
                .unwrap();
            positions.push(position);
        }
        let total = ex.balances().total_balance();

        let mut liquidated = 0;
        for price in [dec!(98), dec!(95), dec!(92), dec!(88), dec!(80), dec!(60)] {
            ex.perps().update_price(&ticker, price).unwrap();
            let sweep = ex.sweep_liquidations(&ticker).unwrap();
            assert_eq!(sweep.skipped, 0);
            liquidated += sweep.liquidated.len();

            // every survivor is still above its liquidation price
            for position in ex.perps().positions_for(AccountId::user(1)) {
                if position.is_open() {
                    assert!(position.liquidation_price.value() < price);
                }
            }
            assert_eq!(ex.balances().total_balance(), total);
        }

        assert_eq!(liquidated, 10);
        for position in &positions {
            let closed = ex.perps().position(position.id).unwrap();
            assert_eq!(closed.realized_pnl, Some(position.margin.negate()));
            // the loss never exceeds what was posted
            assert_eq!(ex.balances().balance(position.account).value(), dec!(900) - closed.notional.value() * dec!(0.001));
        }
        assert!(!ex.balances().balance(AccountId::PerpVault).is_negative());
    }

    #[test]
    fn price_spike_pays_shorts_from_vault() {
        let ex = exchange();
        let ticker = Ticker::new("MOONI");
        ex.perps()
            .list_ticker(ticker.clone(), Price::new_unchecked(dec!(10)), None, None);
        ex.fund(AccountId::PerpVault, Quote::new(dec!(5_000))).unwrap();
        let trader = AccountId::user(1);
        ex.fund(trader, Quote::new(dec!(1_000))).unwrap();

        let long = ex
            .open_perp(ticker.clone(), Side::Long, Quote::new(dec!(100)), 20, trader)
            .unwrap();
        // 10 -> 15 is +50% on 2000 notional
        ex.perps().update_price(&ticker, dec!(15)).unwrap();
        let closed = ex.close_perp(long.id).unwrap();
        assert_eq!(closed.realized_pnl, Some(Quote::new(dec!(1_000))));
        assert_eq!(ex.balances().balance(AccountId::PerpVault).value(), dec!(4_000));
    }

    #[test]
    fn max_funding_drains_thin_margin() {
        let ex = exchange();
        let ticker = Ticker::new("FUNDI");
        ex.perps()
            .list_ticker(ticker.clone(), Price::new_unchecked(dec!(50)), None, None);
        let trader = AccountId::user(1);
        ex.fund(trader, Quote::new(dec!(1_000))).unwrap();
        ex.open_perp(ticker.clone(), Side::Long, Quote::new(dec!(10)), 100, trader)
            .unwrap();

        // 1% of 1000 notional per tick eats 10 margin in one step
        let summary = ex.perps().apply_funding(&ticker, dec!(5)).unwrap();
        assert_eq!(summary.funding_rate, dec!(0.01));
        assert_eq!(summary.closed.len(), 1);
        assert!(ex.perps().all_positions().iter().all(|p| !p.is_open()));
    }
}

/// Tests many threads racing on the same rows.
mod contention_tests {
    use super::*;

    #[test]
    fn concurrent_debits_never_overdraw() {
        let store = BalanceStore::new(patient_retry());
        let account = AccountId::user(1);
        store.mint(account, Quote::new(dec!(100))).unwrap();

        let successes: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..32)
                .map(|_| {
                    s.spawn(|| {
                        store
                            .debit(account, Quote::new(dec!(7)), TransactionType::Transfer)
                            .is_ok()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count()
        });

        // 14 * 7 = 98, the 15th would overdraw
        assert_eq!(successes, 14);
        assert_eq!(store.balance(account).value(), dec!(2));
    }

    #[test]
    fn concurrent_transfers_conserve_total() {
        let store = BalanceStore::new(patient_retry());
        for user in 1..=4 {
            store.mint(AccountId::user(user), Quote::new(dec!(1_000))).unwrap();
        }

        thread::scope(|s| {
            for t in 0..8u64 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..50u64 {
                        let from = AccountId::user((t + i) % 4 + 1);
                        let to = AccountId::user((t + i + 1) % 4 + 1);
                        let _ = store.transfer(from, to, Quote::new(dec!(13.37)), TransactionType::Transfer);
                    }
                });
            }
        });

        assert_eq!(store.total_balance().value(), dec!(4_000));
        assert!(store.balances().values().all(|b| !b.is_negative()));
    }

    #[test]
    fn concurrent_buys_fill_in_sequence() {
        let ex = exchange();
        ex.fund(AccountId::Platform, Quote::new(dec!(1_000))).unwrap();
        let market = ex
            .amm()
            .create_market(
                NewMarket::balanced("Contended", Timestamp::from_millis(i64::MAX)),
                AccountId::Platform,
            )
            .unwrap();
        for user in 1..=8 {
            ex.fund(AccountId::user(user), Quote::new(dec!(500))).unwrap();
        }

        let fills: Vec<PredictionFill> = thread::scope(|s| {
            let handles: Vec<_> = (1..=8u64)
                .map(|user| {
                    let ex = &ex;
                    s.spawn(move || {
                        (0..5)
                            .map(|_| {
                                ex.buy_prediction(market.id, Outcome::Yes, Quote::new(dec!(20)), AccountId::user(user))
                                    .unwrap()
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(fills.len(), 40);
        let issued: Decimal = fills.iter().map(|f| f.quote.shares).sum();
        let after = ex.amm().market(market.id).unwrap();
        assert_eq!(after.yes_shares, issued);
        assert_eq!(after.no_shares, Decimal::ZERO);

        // each fill saw the price left by the one before it
        let mut starts: Vec<Decimal> = fills.iter().map(|f| f.quote.old_prices.yes).collect();
        starts.sort();
        starts.dedup();
        assert_eq!(starts.len(), 40);

        let escrow = ex.balances().balance(AccountId::MarketEscrow(market.id)).value();
        assert!(escrow >= issued);
    }

    #[test]
    fn concurrent_pool_deposits_share_nav() {
        let ex = exchange();
        let pool = ex
            .pools()
            .seed(AccountId::user(100), ActorTier::Standard, Quote::zero())
            .unwrap();
        for user in 1..=16 {
            ex.fund(AccountId::user(user), Quote::new(dec!(100))).unwrap();
        }

        thread::scope(|s| {
            for user in 1..=16u64 {
                let ex = &ex;
                s.spawn(move || ex.deposit_pool(pool.id, UserId(user), Quote::new(dec!(100))).unwrap());
            }
        });

        let pool = ex.pools().pool(pool.id).unwrap();
        assert_eq!(pool.total_value.value(), dec!(1_600));
        assert_eq!(pool.total_shares, dec!(1_600));
        assert_eq!(pool.nav_per_share(), Decimal::ONE);
    }
}
