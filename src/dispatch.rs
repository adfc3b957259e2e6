//! Correlation table and event bus for a single connection.
//!
//! Every outbound request that expects a reply registers a single-fire
//! waiter here, keyed either by a generated correlation id or — for the
//! degraded unnamespaced variant — by the operation name alone. Unsolicited
//! frames fan out to subscribers through the event bus, optionally filtered
//! by a structural predicate.
//!
//! Both tables are owned exclusively by their connection and mutated only
//! under the connection's dispatch lock; no state is shared across
//! connections.

use std::collections::{HashMap, VecDeque};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::Error;
use crate::filter::EventFilter;

/// Where on the bus an event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// An asynchronous server push (`event`, `msg`, `interuser`).
    Push,
    /// An uncorrelated frame broadcast under its own operation name —
    /// the compatibility path for operations that never echo an id.
    Action(String),
    /// The connection closed. Delivered to every subscription, bypassing
    /// filters.
    Close,
}

/// One delivery from the event bus.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: Topic,
    pub frame: Value,
}

/// Opaque handle for cancelling a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Waiter = oneshot::Sender<Result<Value, Error>>;

/// Registry of pending correlated and unnamespaced requests.
///
/// Correlation ids have the form `<name-hint>_<counter>`; the counter is a
/// per-connection `u32` that wraps at `u32::MAX`. Ids are unique among
/// *currently pending* requests — a candidate colliding with a pending id
/// is skipped and the counter probed forward.
pub struct CorrelationTable {
    counter: u32,
    pending: HashMap<String, Waiter>,
    /// Waiters keyed by operation name only, settled oldest-first. If two
    /// requests for the same operation overlap, the first reply goes to the
    /// older waiter whether or not it produced it — callers of the
    /// unnamespaced variant are expected to avoid overlap.
    unnamespaced: HashMap<String, VecDeque<Waiter>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            counter: 0,
            pending: HashMap::new(),
            unnamespaced: HashMap::new(),
        }
    }

    /// Register a waiter and return its generated correlation id.
    pub fn register(&mut self, name_hint: &str, waiter: Waiter) -> String {
        loop {
            self.counter = self.counter.wrapping_add(1);
            let id = format!("{}_{}", name_hint, self.counter);
            if !self.pending.contains_key(&id) {
                self.pending.insert(id.clone(), waiter);
                return id;
            }
        }
    }

    /// Register a waiter keyed by operation name alone.
    pub fn register_unnamespaced(&mut self, action: &str, waiter: Waiter) {
        self.unnamespaced
            .entry(action.to_string())
            .or_default()
            .push_back(waiter);
    }

    /// Deliver a reply to the waiter registered under `id`.
    ///
    /// Returns `true` if a pending entry existed. At-most-once: the entry
    /// is removed whether or not the receiving side is still listening.
    pub fn settle(&mut self, id: &str, frame: Value) -> bool {
        match self.pending.remove(id) {
            Some(waiter) => {
                let _ = waiter.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Deliver a reply to the oldest unnamespaced waiter for `action`.
    pub fn settle_unnamespaced(&mut self, action: &str, frame: Value) -> bool {
        let Some(queue) = self.unnamespaced.get_mut(action) else {
            return false;
        };
        let settled = match queue.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(Ok(frame));
                true
            }
            None => false,
        };
        if queue.is_empty() {
            self.unnamespaced.remove(action);
        }
        settled
    }

    /// Remove a pending entry without settling it (timeout path). A late
    /// reply for the id then falls through to the event bus instead.
    pub fn discard(&mut self, id: &str) {
        self.pending.remove(id);
    }

    /// Fail every pending and unnamespaced waiter with `reason`.
    pub fn fail_all(&mut self, reason: &Error) {
        let pending = self.pending.len();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(reason.clone()));
        }
        for (_, queue) in self.unnamespaced.drain() {
            for waiter in queue {
                let _ = waiter.send(Err(reason.clone()));
            }
        }
        if pending > 0 {
            debug!(pending, "failed outstanding requests");
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    token: SubscriptionToken,
    filter: Option<EventFilter>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// Fan-out channel for unsolicited frames.
///
/// Subscriptions are held in registration order; frames are delivered in
/// arrival order, at most once per subscription per frame.
pub struct EventBus {
    next_token: u64,
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            subscriptions: Vec::new(),
        }
    }

    /// Add a subscription with an optional structural filter.
    pub fn subscribe(
        &mut self,
        filter: Option<EventFilter>,
    ) -> (SubscriptionToken, mpsc::UnboundedReceiver<BusEvent>) {
        self.next_token += 1;
        let token = SubscriptionToken(self.next_token);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.push(Subscription { token, filter, tx });
        (token, rx)
    }

    /// Remove the subscription behind `token`. Unknown tokens are ignored.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) {
        self.subscriptions.retain(|s| s.token != token);
    }

    /// Deliver `frame` under `topic` to every subscription whose filter
    /// accepts it. Subscriptions whose receivers are gone are pruned.
    pub fn broadcast(&mut self, topic: Topic, frame: &Value) {
        self.subscriptions.retain(|sub| {
            if let Some(filter) = &sub.filter {
                if !filter.matches(frame) {
                    return true;
                }
            }
            sub.tx
                .send(BusEvent {
                    topic: topic.clone(),
                    frame: frame.clone(),
                })
                .is_ok()
        });
    }

    /// Notify every subscription that the connection closed, bypassing
    /// filters, then drop all subscriptions so receivers see end-of-stream.
    pub fn close_all(&mut self, reason: &Error) {
        let frame = json!({ "cause": reason.to_string() });
        for sub in self.subscriptions.drain(..) {
            let _ = sub.tx.send(BusEvent {
                topic: Topic::Close,
                frame: frame.clone(),
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_produces_hint_counter_ids() {
        let mut table = CorrelationTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert_eq!(table.register("nodes", tx1), "nodes_1");
        assert_eq!(table.register("meshes", tx2), "meshes_2");
    }

    #[test]
    fn register_probes_past_pending_collisions() {
        let mut table = CorrelationTable::new();
        let (tx, _rx) = oneshot::channel();
        let id = table.register("op", tx);
        assert_eq!(id, "op_1");

        // Rewind the counter so the next candidate is the still-pending
        // "op_1"; it must be skipped.
        table.counter = 0;
        let (tx, _rx) = oneshot::channel();
        let id = table.register("op", tx);
        assert_eq!(id, "op_2");
        assert_eq!(table.pending_len(), 2);
    }

    #[tokio::test]
    async fn settle_routes_by_id_and_removes_entry() {
        let mut table = CorrelationTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        let id_a = table.register("op", tx_a);
        let id_b = table.register("op", tx_b);

        assert!(table.settle(&id_b, json!({"n": "b"})));
        assert!(table.settle(&id_a, json!({"n": "a"})));
        assert!(!table.settle(&id_a, json!({"n": "late"})));

        assert_eq!(rx_a.await.unwrap().unwrap()["n"], "a");
        assert_eq!(rx_b.await.unwrap().unwrap()["n"], "b");
    }

    #[tokio::test]
    async fn unnamespaced_settles_oldest_first() {
        let mut table = CorrelationTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        table.register_unnamespaced("authcookie", tx_a);
        table.register_unnamespaced("authcookie", tx_b);

        assert!(table.settle_unnamespaced("authcookie", json!({"seq": 1})));
        assert!(table.settle_unnamespaced("authcookie", json!({"seq": 2})));
        assert!(!table.settle_unnamespaced("authcookie", json!({"seq": 3})));

        // First reply lands on the older waiter regardless of which call
        // produced it — the documented overlap hazard.
        assert_eq!(rx_a.await.unwrap().unwrap()["seq"], 1);
        assert_eq!(rx_b.await.unwrap().unwrap()["seq"], 2);
    }

    #[tokio::test]
    async fn fail_all_settles_everything_with_reason() {
        let mut table = CorrelationTable::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        table.register("op", tx_a);
        table.register_unnamespaced("authcookie", tx_b);

        table.fail_all(&Error::closed());
        assert_eq!(table.pending_len(), 0);
        assert!(matches!(
            rx_a.await.unwrap(),
            Err(Error::Closed { partial: None })
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(Error::Closed { partial: None })
        ));
    }

    #[test]
    fn discard_makes_late_reply_unroutable() {
        let mut table = CorrelationTable::new();
        let (tx, _rx) = oneshot::channel();
        let id = table.register("op", tx);
        table.discard(&id);
        assert!(!table.settle(&id, json!({})));
    }

    #[tokio::test]
    async fn bus_filters_and_preserves_order() {
        let mut bus = EventBus::new();
        let (_tok_all, mut rx_all) = bus.subscribe(None);
        let filter = EventFilter::from(json!({"event": {"etype": "ugrp"}}));
        let (_tok_ugrp, mut rx_ugrp) = bus.subscribe(Some(filter));

        bus.broadcast(Topic::Push, &json!({"event": {"etype": "node"}}));
        bus.broadcast(Topic::Push, &json!({"event": {"etype": "ugrp"}}));

        assert_eq!(rx_all.recv().await.unwrap().frame["event"]["etype"], "node");
        assert_eq!(rx_all.recv().await.unwrap().frame["event"]["etype"], "ugrp");
        let only = rx_ugrp.recv().await.unwrap();
        assert_eq!(only.frame["event"]["etype"], "ugrp");
        assert!(rx_ugrp.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_bypasses_filters_and_ends_streams() {
        let mut bus = EventBus::new();
        let filter = EventFilter::from(json!({"event": {"etype": "never"}}));
        let (_tok, mut rx) = bus.subscribe(Some(filter));

        bus.close_all(&Error::Transport("reset".into()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic, Topic::Close);
        assert!(event.frame["cause"].as_str().unwrap().contains("reset"));
        assert!(rx.recv().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let mut bus = EventBus::new();
        let (token, mut rx) = bus.subscribe(None);
        bus.unsubscribe(token);
        bus.broadcast(Topic::Push, &json!({"event": {}}));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let mut bus = EventBus::new();
        let (_token, rx) = bus.subscribe(None);
        drop(rx);
        bus.broadcast(Topic::Push, &json!({"event": {}}));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
