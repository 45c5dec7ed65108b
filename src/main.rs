//! Market engine simulation.
//!
//! Runs prediction market, perp and pool scenarios end to end against one
//! `Exchange` and prints balances, fills and pool NAV as it goes.

use clap::{Parser, ValueEnum};
use market_core::*;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    All,
    Prediction,
    Perp,
    Pool,
}

#[derive(Parser, Debug)]
#[command(name = "market-sim")]
#[command(about = "Run market engine scenarios")]
struct Args {
    /// Config preset
    #[arg(short, long, value_enum, default_value = "development")]
    env: Environment,

    /// JSON config file, overrides the preset
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "all")]
    scenario: Scenario,
}

type SimResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> SimResult {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => args.env.config(),
    };

    println!("Market Engine Simulation ({:?})\n", args.env);

    if matches!(args.scenario, Scenario::All | Scenario::Prediction) {
        prediction_market_lifecycle(&config)?;
    }
    if matches!(args.scenario, Scenario::All | Scenario::Perp) {
        perp_lifecycle(&config)?;
    }
    if matches!(args.scenario, Scenario::All | Scenario::Pool) {
        pool_lifecycle(&config)?;
    }

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn bootstrap(config: &EngineConfig) -> Result<Exchange, ExchangeError> {
    let exchange = Exchange::new(config.clone())?;
    exchange.fund(AccountId::Platform, Quote::new(dec!(10_000)))?;
    exchange.fund(AccountId::PerpVault, Quote::new(dec!(50_000)))?;
    for user in 1..=3 {
        exchange.fund(AccountId::user(user), Quote::new(dec!(1_000)))?;
    }
    Ok(exchange)
}

/// Two traders take opposite sides, the market resolves YES.
fn prediction_market_lifecycle(config: &EngineConfig) -> SimResult {
    println!("Scenario 1: Prediction Market Lifecycle\n");
    let ex = bootstrap(config)?;
    let (alice, bob) = (AccountId::user(1), AccountId::user(2));

    let market = ex.amm().create_market(
        NewMarket::balanced("Will the parody senator resign by Friday?", Timestamp::from_millis(i64::MAX)),
        AccountId::Platform,
    )?;
    println!("  Market {} created, b = {}", market.id.0, market.liquidity);
    println!("  Escrow subsidy: ${}\n", ex.balances().balance(AccountId::MarketEscrow(market.id)));

    let fill = ex.buy_prediction(market.id, Outcome::Yes, Quote::new(dec!(10)), alice)?;
    println!(
        "  Alice buys $10 YES: {} shares @ {} avg, YES now {}",
        fill.quote.shares.round_dp(4),
        fill.quote.avg_price.round_dp(4),
        fill.quote.new_prices.yes.round_dp(4)
    );

    let fill = ex.buy_prediction(market.id, Outcome::No, Quote::new(dec!(25)), bob)?;
    println!(
        "  Bob buys $25 NO: {} shares, YES now {}",
        fill.quote.shares.round_dp(4),
        fill.quote.new_prices.yes.round_dp(4)
    );

    let summary = ex.amm().resolve(market.id, Outcome::Yes)?;
    println!("\n  Resolved YES: paid ${}, residual ${} to platform", summary.total_paid.value().round_dp(4), summary.residual_to_platform.value().round_dp(4));
    println!("  Alice balance: ${}", ex.balances().balance(alice).value().round_dp(4));
    println!("  Bob balance: ${}\n", ex.balances().balance(bob).value().round_dp(4));
    Ok(())
}

/// Open, move the mark, close one position and liquidate another.
fn perp_lifecycle(config: &EngineConfig) -> SimResult {
    println!("Scenario 2: Perp Lifecycle\n");
    let ex = bootstrap(config)?;
    let ticker = Ticker::new("NVDAI");
    ex.perps().list_ticker(ticker.clone(), Price::new_unchecked(dec!(100)), None, None);

    let long = ex.open_perp(ticker.clone(), Side::Long, Quote::new(dec!(100)), 10, AccountId::user(1))?;
    let short = ex.open_perp(ticker.clone(), Side::Short, Quote::new(dec!(100)), 5, AccountId::user(2))?;
    println!(
        "  Alice long 10x, notional ${}, liquidation at ${}",
        long.notional, long.liquidation_price
    );
    println!(
        "  Bob short 5x, notional ${}, liquidation at ${}\n",
        short.notional, short.liquidation_price
    );

    ex.perps().update_price(&ticker, dec!(95))?;
    ex.perps().apply_funding(&ticker, dec!(0.0005))?;
    let marked = ex.perps().mark(short.id)?;
    println!("  Mark $95: Bob unrealized ${} ({}%)", marked.unrealized_pnl, marked.unrealized_pnl_percent.round_dp(2));

    let closed = ex.close_perp(short.id)?;
    println!("  Bob closes, realized ${:?}", closed.realized_pnl);

    ex.perps().update_price(&ticker, dec!(90))?;
    let sweep = ex.sweep_liquidations(&ticker)?;
    println!("  Mark $90: liquidated {:?}, skipped {}", sweep.liquidated, sweep.skipped);
    println!("  Vault balance: ${}\n", ex.balances().balance(AccountId::PerpVault));
    Ok(())
}

/// A pool takes a deposit, trades a perp at a profit, pays out less the fee.
fn pool_lifecycle(config: &EngineConfig) -> SimResult {
    println!("Scenario 3: NPC Pool\n");
    let ex = bootstrap(config)?;
    let ticker = Ticker::new("TSLAI");
    ex.perps().list_ticker(ticker.clone(), Price::new_unchecked(dec!(200)), None, None);

    let pool = ex.pools().seed(AccountId::user(3), ActorTier::Elite, Quote::new(dec!(250)))?;
    println!("  Manager seeds the pool with $250");
    let deposit = ex.deposit_pool(pool.id, UserId(1), Quote::new(dec!(500)))?;
    println!("  Alice deposits $500 for {} shares", deposit.shares);

    let position = ex.pools().open_perp(
        pool.id,
        OpenPerp {
            ticker: ticker.clone(),
            side: Side::Long,
            margin: Quote::new(dec!(200)),
            leverage: 3,
            referrer: None,
        },
    )?;
    ex.perps().update_price(&ticker, dec!(220))?;
    ex.pools().close_perp(pool.id, position.id)?;

    let pool = ex.pools().pool(pool.id)?;
    println!("  Pool value ${}, NAV/share {}", pool.total_value.value().round_dp(4), pool.nav_per_share().round_dp(6));

    let out = ex.withdraw_pool(deposit.id)?;
    println!(
        "  Alice withdraws ${} (gross ${}, performance fee ${})\n",
        out.net_amount.value().round_dp(4),
        out.gross_value.value().round_dp(4),
        out.performance_fee.value().round_dp(4)
    );

    let snapshot = ex.snapshot();
    println!("  Ledger rows: {}, fee rows: {}, total balance ${}", snapshot.transactions.len(), snapshot.fees.len(), snapshot.total_balance());
    Ok(())
}
