// 10.0 config.rs: all settings in one place. fees, order floors, margin, pool tiers, lock retry.
// 10.1 presets per environment at the bottom, plus json loading for deployments.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Leverage, Quote};

/** 10.2: trading fee settings. rates are fractions, 0.001 = 0.1% */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    // Fee charged on every prediction buy/sell amount and perp notional
    pub trading_fee_rate: Decimal,
    // Fraction of a fee routed to the referrer when one is attached (0.10 = 10%)
    pub referrer_share: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            trading_fee_rate: dec!(0.001),
            referrer_share: dec!(0.10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    // Smallest dollar amount accepted for a buy
    pub min_order: Quote,
    // LMSR depth used when a market is created without an explicit one
    pub default_liquidity: Decimal,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            min_order: Quote::new(dec!(1)),
            default_liquidity: dec!(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpConfig {
    // Fraction of posted margin that may be lost before liquidation
    pub maintenance_threshold: Decimal,
    // Leverage cap for tickers listed without their own
    pub default_max_leverage: Leverage,
    // Minimum notional (margin * leverage) for an open
    pub min_order_size: Quote,
    // Absolute cap on a single funding tick rate
    pub max_funding_rate: Decimal,
}

impl Default for PerpConfig {
    fn default() -> Self {
        Self {
            maintenance_threshold: dec!(0.9),
            default_max_leverage: Leverage::clamped(100),
            min_order_size: Quote::new(dec!(10)),
            max_funding_rate: dec!(0.01),
        }
    }
}

/** 10.3: performance fee by npc actor tier */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub standard_fee_rate: Decimal,
    pub veteran_fee_rate: Decimal,
    pub elite_fee_rate: Decimal,
    // Smallest user deposit accepted
    pub min_deposit: Quote,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            standard_fee_rate: dec!(0.05),
            veteran_fee_rate: dec!(0.065),
            elite_fee_rate: dec!(0.08),
            min_deposit: Quote::new(dec!(1)),
        }
    }
}

/** 10.4: bounded exponential backoff for lock acquisition */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_micros: u64,
    pub max_delay_micros: u64,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_micros(self.base_delay_micros)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_micros(self.max_delay_micros)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_micros: 200,
            max_delay_micros: 5_000,
        }
    }
}

// The complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub fees: FeeConfig,
    pub prediction: PredictionConfig,
    pub perp: PerpConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub events: EventLogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    // Maximum number of events to retain in memory
    pub max_events: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self { max_events: 100_000 }
    }
}

impl EngineConfig {
    pub fn testnet() -> Self {
        let mut config = Self::default();
        config.fees.trading_fee_rate = Decimal::ZERO; // free trading on testnet
        config.prediction.min_order = Quote::new(dec!(0.01));
        config.retry.max_attempts = 5;
        config
    }

    pub fn production() -> Self {
        let mut config = Self::default();
        config.fees.trading_fee_rate = dec!(0.002);
        config.perp.default_max_leverage = Leverage::clamped(50);
        config.perp.min_order_size = Quote::new(dec!(25));
        config
    }

    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)
            .map_err(|e| ConfigError::Parse { reason: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fees.trading_fee_rate < Decimal::ZERO || self.fees.trading_fee_rate >= dec!(0.1) {
            return Err(ConfigError::InvalidFees {
                reason: "trading fee rate must be in [0, 0.1)".to_string(),
            });
        }
        if self.fees.referrer_share < Decimal::ZERO || self.fees.referrer_share > Decimal::ONE {
            return Err(ConfigError::InvalidFees {
                reason: "referrer share must be in [0, 1]".to_string(),
            });
        }

        if !self.prediction.min_order.is_positive() {
            return Err(ConfigError::InvalidPrediction {
                reason: "minimum order must be positive".to_string(),
            });
        }
        if self.prediction.default_liquidity <= Decimal::ZERO {
            return Err(ConfigError::InvalidPrediction {
                reason: "liquidity must be positive".to_string(),
            });
        }

        // threshold of 1 would liquidate at exactly zero equity, leaving no buffer
        if self.perp.maintenance_threshold <= Decimal::ZERO
            || self.perp.maintenance_threshold >= Decimal::ONE
        {
            return Err(ConfigError::InvalidPerp {
                reason: "maintenance threshold must be between 0 and 1".to_string(),
            });
        }
        if !self.perp.min_order_size.is_positive() {
            return Err(ConfigError::InvalidPerp {
                reason: "minimum order size must be positive".to_string(),
            });
        }
        if self.perp.max_funding_rate < Decimal::ZERO {
            return Err(ConfigError::InvalidPerp {
                reason: "funding cap cannot be negative".to_string(),
            });
        }

        for rate in [
            self.pool.standard_fee_rate,
            self.pool.veteran_fee_rate,
            self.pool.elite_fee_rate,
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(ConfigError::InvalidPool {
                    reason: format!("performance fee rate {rate} out of range"),
                });
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidRetry {
                reason: "need at least one lock attempt".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid fees: {reason}")]
    InvalidFees { reason: String },
    #[error("Invalid prediction settings: {reason}")]
    InvalidPrediction { reason: String },
    #[error("Invalid perp settings: {reason}")]
    InvalidPerp { reason: String },
    #[error("Invalid pool settings: {reason}")]
    InvalidPool { reason: String },
    #[error("Invalid retry settings: {reason}")]
    InvalidRetry { reason: String },
    #[error("Config parse error: {reason}")]
    Parse { reason: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testnet,
    Production,
}

impl Environment {
    pub fn config(&self) -> EngineConfig {
        match self {
            Environment::Development => EngineConfig::default(),
            Environment::Testnet => EngineConfig::testnet(),
            Environment::Production => EngineConfig::production(),
        }
    }
}
