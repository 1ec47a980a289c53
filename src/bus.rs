//! Event Bus
//!
//! Typed publish/subscribe layered on the shared store's channels.
//!
//! ## Delivery
//! ```text
//! publisher ──► store channel ──► subscriber thread ──► handler(event)
//!                                   │
//!                                   └─ connection lost: resubscribe with
//!                                      backoff, then on_gap()
//! ```
//!
//! Delivery is best effort and at most once. Anything published while a
//! subscriber is disconnected is lost to it; `on_gap` tells the subscriber
//! to reconcile against the store instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::RecvTimeoutError;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{PartyError, Result};
use crate::retry::{sleep_unless, Backoff};
use crate::store::{SharedStore, Subscription};

/// Topic carrying [`PartyEvent`](crate::model::PartyEvent)s
pub const PARTY_EVENTS: &str = "party:events";

/// Topic carrying [`PartyMessage`](crate::model::PartyMessage)s
pub const PARTY_MESSAGES: &str = "party:message";

/// How often a subscriber thread checks its stop flag
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Publisher/subscriber factory over a [`SharedStore`]
#[derive(Clone)]
pub struct EventBus {
    store: Arc<dyn SharedStore>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EventBus {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
        }
    }

    /// Bounds for the resubscribe backoff
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Publish `event` as JSON; returns the number of subscribers reached
    pub fn publish<T: Serialize>(&self, topic: &str, event: &T) -> Result<usize> {
        let payload = serde_json::to_vec(event)?;
        self.store
            .publish(topic, Bytes::from(payload))
            .map_err(|e| match e {
                PartyError::StoreUnavailable(reason) => PartyError::BusUnavailable(reason),
                other => other,
            })
    }

    /// Deliver every event on `topic` to `handler` on a background thread
    ///
    /// `on_gap` runs each time the subscription is (re)established after a
    /// period in which events may have been missed. A first attempt is made
    /// before returning; if it fails the thread keeps retrying.
    pub fn subscribe<T, H, G>(&self, topic: &str, mut handler: H, mut on_gap: G) -> Result<BusSubscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: FnMut(T) + Send + 'static,
        G: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let connected = Arc::new(AtomicBool::new(false));

        let initial = match self.store.subscribe(topic) {
            Ok(subscription) => {
                connected.store(true, Ordering::SeqCst);
                Some(subscription)
            }
            Err(e) => {
                tracing::warn!("Subscribe to {} failed, retrying in background: {}", topic, e);
                None
            }
        };

        let store = Arc::clone(&self.store);
        let topic_name = topic.to_string();
        let mut backoff = Backoff::new(self.backoff_base, self.backoff_max);
        let stop_flag = Arc::clone(&stop);
        let connected_flag = Arc::clone(&connected);

        let handle = thread::Builder::new()
            .name(format!("bus-{}", topic))
            .spawn(move || {
                let mut current: Option<Subscription> = initial;
                while !stop_flag.load(Ordering::SeqCst) {
                    let Some(subscription) = current.as_ref() else {
                        match store.subscribe(&topic_name) {
                            Ok(subscription) => {
                                tracing::info!("Resubscribed to {}", topic_name);
                                current = Some(subscription);
                                connected_flag.store(true, Ordering::SeqCst);
                                backoff.reset();
                                on_gap();
                            }
                            Err(e) => {
                                let delay = backoff.next_delay();
                                tracing::debug!(
                                    "Resubscribe to {} failed (attempt {}), retry in {:?}: {}",
                                    topic_name,
                                    backoff.attempts(),
                                    delay,
                                    e
                                );
                                sleep_unless(delay, || stop_flag.load(Ordering::SeqCst));
                            }
                        }
                        continue;
                    };

                    match subscription.recv_timeout(RECV_POLL_INTERVAL) {
                        Ok(message) => match serde_json::from_slice::<T>(&message.payload) {
                            Ok(event) => handler(event),
                            Err(e) => tracing::warn!("Dropping malformed event on {}: {}", topic_name, e),
                        },
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            tracing::warn!("Lost subscription to {}", topic_name);
                            current = None;
                            connected_flag.store(false, Ordering::SeqCst);
                        }
                    }
                }
            })?;

        Ok(BusSubscription {
            stop,
            connected,
            handle: Some(handle),
        })
    }
}

/// Handle to a running subscriber thread; stops it when dropped
pub struct BusSubscription {
    stop: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl BusSubscription {
    /// Whether a store subscription is currently established
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Bus subscriber thread panicked");
            }
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
