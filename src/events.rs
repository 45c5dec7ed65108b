// 11.0: every successful state change produces an event. used for audit trails and
// notifying the display layer. the EventPayload enum lists all event types.
// rejected operations emit nothing.

use crate::types::{
    AccountId, DepositId, Leverage, MarketId, Outcome, PerpPositionId, PoolId, Price, Quote, Side,
    Ticker, Timestamp,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Prediction market events
    MarketCreated(MarketCreatedEvent),
    SharesTraded(SharesTradedEvent),
    MarketSettled(MarketSettledEvent),

    // Perp events
    PerpOpened(PerpOpenedEvent),
    PerpClosed(PerpClosedEvent),
    FundingApplied(FundingAppliedEvent),

    // Pool events
    PoolSeeded(PoolSeededEvent),
    PoolDeposited(PoolFlowEvent),
    PoolWithdrawn(PoolFlowEvent),
    PoolRevalued(PoolRevaluedEvent),
    PoolDeactivated(PoolDeactivatedEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCreatedEvent {
    pub market_id: MarketId,
    pub liquidity: Decimal,
    pub subsidy: Quote,
    pub sponsor: AccountId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeDirection {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharesTradedEvent {
    pub market_id: MarketId,
    pub account: AccountId,
    pub direction: TradeDirection,
    pub outcome: Outcome,
    pub shares: Decimal,
    pub amount: Quote,
    pub fee: Quote,
    pub new_yes_price: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    Resolved(Outcome),
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSettledEvent {
    pub market_id: MarketId,
    pub settlement: Settlement,
    pub total_paid: Quote,
    pub positions_settled: usize,
    pub residual_to_platform: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpOpenedEvent {
    pub position_id: PerpPositionId,
    pub account: AccountId,
    pub ticker: Ticker,
    pub side: Side,
    pub margin: Quote,
    pub leverage: Leverage,
    pub entry_price: Price,
    pub liquidation_price: Price,
    pub fee: Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    UserClosed,
    Liquidation,
    FundingExhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerpClosedEvent {
    pub position_id: PerpPositionId,
    pub account: AccountId,
    pub exit_price: Price,
    pub realized_pnl: Quote,
    pub returned: Quote,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingAppliedEvent {
    pub ticker: Ticker,
    pub funding_rate: Decimal,
    pub positions_charged: usize,
    pub positions_closed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSeededEvent {
    pub pool_id: PoolId,
    pub manager: AccountId,
    pub initial_capital: Quote,
    // manager's share row, none for an empty seed
    pub seed_deposit: Option<DepositId>,
    pub performance_fee_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolFlowEvent {
    pub pool_id: PoolId,
    pub deposit_id: DepositId,
    pub account: AccountId,
    pub amount: Quote,
    pub shares: Decimal,
    pub performance_fee: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRevaluedEvent {
    pub pool_id: PoolId,
    pub old_value: Quote,
    pub new_value: Quote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDeactivatedEvent {
    pub pool_id: PoolId,
    pub total_value: Quote,
    pub total_shares: Decimal,
}

/// Bounded, thread-safe event log.
#[derive(Debug)]
pub struct EventLog {
    inner: Mutex<EventBuffer>,
    max_events: usize,
}

#[derive(Debug, Default)]
struct EventBuffer {
    events: VecDeque<Event>,
    next_id: u64,
}

impl EventLog {
    pub fn new(max_events: usize) -> Self {
        Self {
            inner: Mutex::new(EventBuffer {
                events: VecDeque::new(),
                next_id: 1,
            }),
            max_events,
        }
    }

    pub fn emit(&self, payload: EventPayload) -> EventId {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = EventId(inner.next_id);
        inner.next_id += 1;

        tracing::trace!(event = id.0, ?payload, "event");
        inner.events.push_back(Event::new(id, Timestamp::now(), payload));

        while inner.events.len() > self.max_events {
            inner.events.pop_front();
        }
        id
    }

    pub fn events(&self) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.events.iter().cloned().collect()
    }

    pub fn recent(&self, count: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let start = inner.events.len().saturating_sub(count);
        inner.events.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pool_event(n: u64) -> EventPayload {
        EventPayload::PoolRevalued(PoolRevaluedEvent {
            pool_id: PoolId(n),
            old_value: Quote::new(dec!(100)),
            new_value: Quote::new(dec!(110)),
        })
    }

    #[test]
    fn event_ids_increase() {
        let log = EventLog::new(10);
        let first = log.emit(pool_event(1));
        let second = log.emit(pool_event(2));
        assert!(second > first);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn log_drops_oldest_past_capacity() {
        let log = EventLog::new(3);
        for n in 0..5 {
            log.emit(pool_event(n));
        }
        let events = log.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, EventId(3));
        assert_eq!(log.recent(1)[0].id, EventId(5));
    }
}
