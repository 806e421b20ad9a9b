//! In-process domain event bus (§9: "event bus = multi-consumer channel, one
//! handler task per subscriber, tracked for cleanup"). Grounded on
//! `original_source/src/funding_bot/adapters/messaging/event_bus.py` and the
//! teacher's broadcast-channel usage for order-update fanout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::warn;

use crate::domain::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub enum DomainEvent {
    TradeOpened { trade_id: String, symbol: Symbol },
    TradeClosed { trade_id: String, symbol: Symbol, reason: String },
    BrokenHedgeDetected { trade_id: String, symbol: Symbol, detail: String },
    CircuitBreakerTripped { host: String, reason: String },
    TradingPaused { reason: String, until: Option<DateTime<Utc>> },
    TradingResumed { symbol: Option<Symbol> },
    FundingCrash { symbol: Symbol, z_score: Decimal },
    Alert { severity: AlertSeverity, message: String },
}

/// Object-safe port so components depend on the trait, not a concrete bus.
#[async_trait]
pub trait EventBusPort: Send + Sync {
    fn publish(&self, event: DomainEvent);
    fn subscribe(&self) -> broadcast::Receiver<DomainEvent>;
}

/// `tokio::sync::broadcast`-backed bus. Lagging subscribers drop the oldest
/// events rather than block publishers — publishers must never be slowed by
/// a stalled consumer.
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Spawn `handler` as a tracked task consuming this bus; the returned
    /// `JoinSet` is drained periodically so completed handlers don't leak
    /// (§5: "completed-task cleanup must run periodically").
    pub fn spawn_handler<F, Fut>(&self, tasks: &mut JoinSet<()>, mut handler: F)
    where
        F: FnMut(DomainEvent) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut rx = self.tx.subscribe();
        tasks.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "event bus subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

#[async_trait]
impl EventBusPort for EventBus {
    fn publish(&self, event: DomainEvent) {
        // A publish with zero subscribers is not an error — just drop it.
        let _ = self.tx.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

/// Drain `tasks` of already-completed handlers without blocking; call this
/// from the supervisor's periodic tick.
pub async fn drain_completed(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.try_join_next() {
        if let Err(e) = res {
            if e.is_panic() {
                warn!(error = %e, "event bus handler task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::TradingResumed { symbol: None });
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(DomainEvent::CircuitBreakerTripped {
            host: "lighter".into(),
            reason: "too many failures".into(),
        });
        let event = rx.recv().await.unwrap();
        matches!(event, DomainEvent::CircuitBreakerTripped { .. });
    }
}
