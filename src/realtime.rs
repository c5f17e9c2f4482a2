//! Per-table change notifications.
//!
//! Write paths publish an event after their transaction commits; interested
//! parties hold a receiver per table. Dropping a receiver (or the
//! [`Subscription`] guard) unsubscribes. Events are fan-out only and lossy
//! under backpressure, so they drive cache refreshes, never state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Table names carried in change events and accepted by `subscribe`.
pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const PLANS: &str = "plans";
    pub const VOUCHERS: &str = "vouchers";
    pub const WALLET_ENTRIES: &str = "wallet_entries";
    pub const PURCHASES: &str = "purchases";
    pub const CREDIT_TRANSACTIONS: &str = "credit_transactions";
    pub const CREDIT_REQUESTS: &str = "credit_requests";

    pub const ALL: &[&str] = &[
        PROFILES,
        PLANS,
        VOUCHERS,
        WALLET_ENTRIES,
        PURCHASES,
        CREDIT_TRANSACTIONS,
        CREDIT_REQUESTS,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub table: &'static str,
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

/// Guard for a handler-style subscription; dropping it stops delivery.
pub struct Subscription {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Clone)]
pub struct ChangeFeed {
    channels: Arc<HashMap<&'static str, broadcast::Sender<ChangeEvent>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let mut channels = HashMap::new();
        for table in tables::ALL {
            let (tx, _) = broadcast::channel(256);
            channels.insert(*table, tx);
        }
        Self {
            channels: Arc::new(channels),
        }
    }

    /// A raw receiver for one table, or `None` for an unknown table name.
    pub fn subscribe(&self, table: &str) -> Option<broadcast::Receiver<ChangeEvent>> {
        self.channels.get(table).map(broadcast::Sender::subscribe)
    }

    /// Callback-style subscription; the handler runs on a spawned task until
    /// the returned guard is dropped.
    pub fn subscribe_with<F>(&self, table: &str, mut handler: F) -> Option<Subscription>
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut rx = self.subscribe(table)?;
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Some(Subscription { handle })
    }

    pub fn inserted<T: Serialize>(&self, table: &'static str, row: &T) {
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Insert,
            before: None,
            after: Some(to_value(row)),
        });
    }

    pub fn updated<B: Serialize, T: Serialize>(
        &self,
        table: &'static str,
        before: Option<&B>,
        after: &T,
    ) {
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Update,
            before: before.map(to_value),
            after: Some(to_value(after)),
        });
    }

    pub fn deleted<T: Serialize>(&self, table: &'static str, row: &T) {
        self.publish(ChangeEvent {
            table,
            kind: ChangeKind::Delete,
            before: Some(to_value(row)),
            after: None,
        });
    }

    pub fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = self.channels.get(event.table) {
            // send only fails when nobody is listening
            let _ = tx.send(event);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

fn to_value<T: Serialize>(row: &T) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_receives_published_events() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe(tables::PLANS).unwrap();

        feed.inserted(tables::PLANS, &serde_json::json!({ "price": 5 }));

        let event = tokio_test::block_on(rx.recv()).unwrap();
        assert_eq!(event.table, tables::PLANS);
        assert_eq!(event.kind, ChangeKind::Insert);
        assert!(event.before.is_none());
        assert_eq!(event.after.unwrap()["price"], 5);
    }

    #[test]
    fn unknown_table_is_rejected() {
        let feed = ChangeFeed::new();
        assert!(feed.subscribe("not_a_table").is_none());
    }

    #[test]
    fn events_do_not_cross_tables() {
        let feed = ChangeFeed::new();
        let mut plans = feed.subscribe(tables::PLANS).unwrap();
        let mut vouchers = feed.subscribe(tables::VOUCHERS).unwrap();

        feed.inserted(tables::VOUCHERS, &serde_json::json!({ "code": "abc" }));

        let event = tokio_test::block_on(vouchers.recv()).unwrap();
        assert_eq!(event.table, tables::VOUCHERS);
        assert!(plans.try_recv().is_err());
    }

    #[test]
    fn handler_subscription_fires_until_dropped() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let feed = ChangeFeed::new();
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            let sub = feed
                .subscribe_with(tables::PURCHASES, move |event| {
                    let _ = tx.send(event.kind);
                })
                .unwrap();

            feed.inserted(tables::PURCHASES, &serde_json::json!({}));
            assert_eq!(rx.recv().await, Some(ChangeKind::Insert));

            drop(sub);
        });
    }
}
