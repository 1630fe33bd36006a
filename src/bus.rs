//! Notification bus: fans "open" events out to editor sessions.
//!
//! The bus maps a session identity to the set of currently subscribed
//! live connections. What happens when an event is published for an
//! identity with no subscriber depends on the delivery policy chosen at
//! construction:
//!
//! - [`DeliveryPolicy::Strict`]: publishing fails with
//!   [`PublishError::NoClient`], and identities whose subscriber set
//!   becomes empty are pruned.
//! - [`DeliveryPolicy::Lenient`]: events accumulate in an ordered
//!   backlog and are replayed, in arrival order, to the next subscriber
//!   that attaches.
//!
//! A bus instance applies exactly one policy; the two are never mixed.
//! Delivery uses per-subscriber unbounded senders, so `publish` never
//! blocks on a slow connection. Keep-alive ping/pong runs in each
//! subscriber's connection loop and does not pass through the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

/// Behavior when publishing to an identity with zero subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Fail fast with [`PublishError::NoClient`].
    Strict,
    /// Buffer the event and replay it to the next subscriber.
    Lenient,
}

/// Publish failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// No live subscriber for the identity (strict policy only).
    #[error("no-client")]
    NoClient,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Default)]
struct IdentityEntry {
    subscribers: Vec<Subscriber>,
    /// Not-yet-delivered open events, lenient policy only.
    pending: Vec<String>,
}

/// Registry of identity → subscriber set, with policy-dependent buffering.
#[derive(Debug)]
pub struct NotificationBus {
    policy: DeliveryPolicy,
    identities: Mutex<HashMap<String, IdentityEntry>>,
    next_id: AtomicU64,
}

/// One live subscriber connection on the bus.
///
/// Dropping the subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    bus: Arc<NotificationBus>,
    identity: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
}

impl NotificationBus {
    /// Create a bus applying `policy`.
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            policy,
            identities: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// The policy this bus was constructed with.
    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Register a live connection for `identity`.
    ///
    /// Under the lenient policy any buffered events are delivered to the
    /// new subscriber in arrival order, then the backlog is cleared.
    pub fn subscribe(self: &Arc<Self>, identity: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut identities = self.identities.lock().expect("bus table poisoned");
        let entry = identities.entry(identity.to_string()).or_default();
        for resource_ref in entry.pending.drain(..) {
            // Cannot fail: rx is alive in this scope.
            let _ = tx.send(resource_ref);
        }
        entry.subscribers.push(Subscriber { id, tx });

        Subscription {
            bus: Arc::clone(self),
            identity: identity.to_string(),
            id,
            rx,
        }
    }

    /// Deliver `resource_ref` to every live subscriber of `identity`.
    ///
    /// # Errors
    ///
    /// Under the strict policy, returns [`PublishError::NoClient`] when
    /// the identity has no live subscriber.
    pub fn publish(&self, identity: &str, resource_ref: &str) -> Result<(), PublishError> {
        let mut identities = self.identities.lock().expect("bus table poisoned");
        let entry = identities.entry(identity.to_string()).or_default();

        if entry.subscribers.is_empty() {
            match self.policy {
                DeliveryPolicy::Strict => {
                    // Do not retain the empty entry this lookup created.
                    if entry.pending.is_empty() {
                        identities.remove(identity);
                    }
                    return Err(PublishError::NoClient);
                }
                DeliveryPolicy::Lenient => {
                    entry.pending.push(resource_ref.to_string());
                    return Ok(());
                }
            }
        }

        for subscriber in &entry.subscribers {
            // A closed receiver means the connection is tearing down and
            // will unsubscribe itself; skip it.
            let _ = subscriber.tx.send(resource_ref.to_string());
        }
        Ok(())
    }

    /// Number of live subscribers for `identity`.
    pub fn subscriber_count(&self, identity: &str) -> usize {
        self.identities
            .lock()
            .expect("bus table poisoned")
            .get(identity)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    fn unsubscribe(&self, identity: &str, id: u64) {
        let mut identities = self.identities.lock().expect("bus table poisoned");
        let Some(entry) = identities.get_mut(identity) else {
            return;
        };
        entry.subscribers.retain(|s| s.id != id);
        if entry.subscribers.is_empty() && self.policy == DeliveryPolicy::Strict {
            // Strict policy prunes; lenient retains the identity so a
            // backlog can accumulate for the next subscriber.
            identities.remove(identity);
        }
    }
}

impl Subscription {
    /// Receive the next open event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// The identity this subscription is registered under.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.identity, self.id);
    }
}
