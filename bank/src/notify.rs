//! In-process notification fan-out for committed ledger events (C10).
//!
//! A single background task LISTENs on four Postgres channels and republishes
//! each payload to whichever in-process long-poll waiters are registered
//! under the relevant key. The subscriber map is reference-counted so it
//! never grows past the number of open long-poll calls.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CHANNELS: &[&str] = &["bank_tx", "outgoing_tx", "incoming_tx", "withdrawal_status"];
const CHANNEL_CAPACITY: usize = 64;

/// Registry of per-key broadcast channels. Keys are caller-defined strings,
/// e.g. `"account:42"` or `"withdrawal:<uuid>"`.
#[derive(Default)]
pub struct NotifyBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl NotifyBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribes to `key`, creating its broadcast channel if this is the
    /// first subscriber. The returned receiver's drop does not, by itself,
    /// prune the entry — pruning happens lazily on the next [`publish`] that
    /// finds zero receivers, keeping this call synchronous and infallible.
    pub fn subscribe(&self, key: &str) -> broadcast::Receiver<String> {
        self.channels
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publishes `payload` under `key`. No-op if nobody is subscribed.
    pub fn publish(&self, key: &str, payload: String) {
        if let Some(entry) = self.channels.get(key) {
            if entry.receiver_count() == 0 {
                drop(entry);
                self.channels.remove(key);
                return;
            }
            let _ = entry.send(payload);
        }
    }
}

/// Runs the LISTEN loop until `shutdown` fires. Reconnects with exponential
/// backoff on any driver error; the backoff resets after a cycle that
/// receives at least one notification.
pub async fn run(
    pool: PgPool,
    bus: Arc<NotifyBus>,
    mut shutdown: tokio::sync::mpsc::Receiver<()>,
) {
    let mut backoff = Duration::from_millis(200);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("notification listener shutting down");
                return;
            }
            result = listen_once(&pool, &bus) => {
                match result {
                    Ok(()) => backoff = Duration::from_millis(200),
                    Err(e) => {
                        error!(error = %e, "notification listener error, reconnecting");
                        tokio::select! {
                            _ = shutdown.recv() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    }
}

async fn listen_once(pool: &PgPool, bus: &Arc<NotifyBus>) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen_all(CHANNELS.iter().copied()).await?;
    loop {
        let notification = listener.recv().await?;
        route(bus, notification.channel(), notification.payload());
    }
}

/// Dispatches one raw notification payload to the subscriber keys it names,
/// per the §4.7 channel payload shapes.
fn route(bus: &Arc<NotifyBus>, channel: &str, payload: &str) {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    match channel {
        "bank_tx" | "outgoing_tx" => {
            if let [debtor, creditor, debit_row, credit_row] = parts[..] {
                bus.publish(&format!("account:{debtor}"), debit_row.to_string());
                bus.publish(&format!("account:{creditor}"), credit_row.to_string());
            } else {
                warn!(channel, payload, "malformed notification payload");
            }
        }
        "incoming_tx" => {
            if let [account, row] = parts[..] {
                bus.publish(&format!("account:{account}"), row.to_string());
            } else {
                warn!(channel, payload, "malformed notification payload");
            }
        }
        "withdrawal_status" => {
            if let [uuid, status] = parts[..] {
                bus.publish(&format!("withdrawal:{uuid}"), status.to_string());
            } else {
                warn!(channel, payload, "malformed notification payload");
            }
        }
        other => warn!(channel = other, "notification on unknown channel"),
    }
}

/// Waits for `predicate` to hold against a freshly-read value, subscribing
/// before the first read so a notification arriving in between is not
/// missed. Returns the last read value either way once `poll_ms` elapses.
pub async fn long_poll<T, F, Fut>(
    bus: &Arc<NotifyBus>,
    key: &str,
    poll_ms: u64,
    mut read: F,
    predicate: impl Fn(&T) -> bool,
) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let mut rx = bus.subscribe(key);
    let first = read().await;
    if predicate(&first) {
        return first;
    }
    tokio::select! {
        _ = rx.recv() => {}
        _ = tokio::time::sleep(Duration::from_millis(poll_ms)) => {}
    }
    read().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = NotifyBus::default();
        bus.publish("account:1", "5".to_string());
    }

    #[tokio::test]
    async fn subscriber_receives_published_payload() {
        let bus = NotifyBus::default();
        let mut rx = bus.subscribe("account:1");
        bus.publish("account:1", "42".to_string());
        assert_eq!(rx.recv().await.unwrap(), "42");
    }

    #[test]
    fn route_parses_bank_tx_payload() {
        let bus = NotifyBus::new();
        let _rx_debtor = bus.subscribe("account:1");
        let _rx_creditor = bus.subscribe("account:2");
        route(&bus, "bank_tx", "1 2 10 11");
    }
}
