// market-core: pricing and position engine for a virtual trading game.
// money is conserved: only mint/burn change the total, everything else is a
// balanced posting set. all computation is deterministic decimal math.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: ids, AccountId, Side, Outcome, Price, Quote, Leverage
//   2.x  balance.rs: BalanceStore, atomic posting sets, transaction ledger
//   3.x  fees.rs: trading/performance fees, platform/referrer split
//   4.x  lmsr.rs: LMSR cost function, buy/sell closed forms, exp/ln
//   5.x  prediction.rs: PredictionAmm: markets, positions, resolve/cancel
//   6.x  perp.rs: leveraged position math: notional, pnl, liquidation, funding
//   7.x  perp_engine.rs: PerpEngine: tickers, open/mark/close/liquidate/funding
//   8.x  pool.rs: PoolAllocator: seed, deposit/withdraw against NAV, pool trading
//   9.x  exchange.rs: composition root, inbound API, snapshot, error taxonomy
//   10.x config.rs: fees, prediction, perp, pool, retry params, env presets
//   11.x events.rs: state transition events for audit
//   12.x retry.rs: lock acquisition with jittered backoff

// core modules
pub mod balance;
pub mod fees;
pub mod lmsr;
pub mod perp;
pub mod perp_engine;
pub mod pool;
pub mod prediction;
pub mod types;

// integration modules
pub mod config;
pub mod events;
pub mod exchange;
pub mod retry;

// re exports for convenience
pub use balance::{BalanceError, BalanceStore, BalanceTransaction, Posting, TransactionType, TxId};
pub use config::{ConfigError, EngineConfig, Environment, FeeConfig, PerpConfig, PoolConfig, PredictionConfig, RetryConfig};
pub use events::*;
pub use exchange::{AccountBalance, ErrorKind, Exchange, ExchangeError, LiquidationSweep, Snapshot};
pub use fees::{FeeBreakdown, FeeError, FeeKind, FeeLedger, TradingFee};
pub use lmsr::{LmsrError, Prices, Reserves, TradeQuote};
pub use perp_engine::{FundingSummary, Listing, OpenPerp, PerpEngine, PerpError, PerpMarket, PerpPosition};
pub use pool::{ActorTier, Pool, PoolAllocator, PoolDeposit, PoolError, Withdrawal};
pub use prediction::{
    AmmError, Market, MarketStatus, NewMarket, PositionStatus, PredictionAmm, PredictionFill, PredictionPosition,
    SettlementSummary,
};
pub use retry::LockError;
pub use types::*;
