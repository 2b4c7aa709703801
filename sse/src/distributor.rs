use bytes::Bytes;
use futures::Stream;
use log::*;
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::error::Error;

/// Pending payloads a subscriber may hold before new ones are dropped for it.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 100;

/// Unique identifier for a subscriber (server-generated)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outcome of one broadcast, per subscriber.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Queue was full; this payload was skipped for that subscriber.
    pub dropped: usize,
    /// Consumer had gone away without unsubscribing; entry removed.
    pub pruned: usize,
}

struct Registry {
    subscribers: HashMap<SubscriberId, mpsc::Sender<Bytes>>,
    closed: bool,
}

struct Shared {
    // Registry mutation and broadcast iteration share this one lock.
    registry: Mutex<Registry>,
    capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: &SubscriberId) -> bool {
        // Dropping the sender closes the queue for the consumer.
        let removed = self.lock().subscribers.remove(id).is_some();
        if removed {
            info!("Unregistered subscriber {id}");
        }
        removed
    }
}

/// Subscriber registry with best-effort, non-blocking fan-out.
///
/// Every payload handed to [`Distributor::broadcast`] is offered once to each
/// registered queue. A full queue loses that payload; nobody else is affected
/// and the caller never waits.
#[derive(Clone)]
pub struct Distributor {
    shared: Arc<Shared>,
}

impl Distributor {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry {
                    subscribers: HashMap::new(),
                    closed: false,
                }),
                capacity: capacity.max(1),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new bounded queue and returns its consuming handle - O(1)
    ///
    /// Once [`Distributor::close_all`] has run the handle comes back already
    /// closed.
    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        let id = SubscriberId::new();

        let mut registry = self.shared.lock();
        if registry.closed {
            drop(registry);
            debug!("Distributor closed, handing out a closed subscription {id}");
        } else {
            registry.subscribers.insert(id, sender);
            let active = registry.subscribers.len();
            drop(registry);
            info!("Registered subscriber {id} ({active} active)");
        }

        Subscription {
            id,
            receiver,
            registry: Arc::downgrade(&self.shared),
        }
    }

    /// Removes a subscriber and closes its queue. Unknown or already removed
    /// ids are ignored; returns whether anything was removed.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        self.shared.remove(id)
    }

    /// Offers `payload` to every registered subscriber without blocking - O(n)
    pub fn broadcast(&self, payload: Bytes) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let mut registry = self.shared.lock();
        registry
            .subscribers
            .retain(|id, sender| match sender.try_send(payload.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    warn!("Subscriber {id} is slow ({}), skipping", Error::SubscriberFull);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    report.pruned += 1;
                    debug!("Subscriber {id} went away, removing it");
                    false
                }
            });
        drop(registry);

        self.shared
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.shared
            .dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        trace!("Broadcast {} bytes: {report:?}", payload.len());

        report
    }

    /// Closes every queue and refuses new registrations from now on.
    pub fn close_all(&self) {
        let mut registry = self.shared.lock();
        registry.closed = true;
        let closed = registry.subscribers.len();
        registry.subscribers.clear();
        drop(registry);
        info!("Closed {closed} subscriber queue(s)");
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    pub fn delivered_total(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Distributor {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}

/// Consuming half of one subscriber queue.
///
/// Yields framed payloads until the subscriber is unsubscribed or the
/// distributor shuts down. Dropping the handle unsubscribes it.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Bytes>,
    registry: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next payload; `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Takes a payload if one is already queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.registry.upgrade() {
            shared.remove(&self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
