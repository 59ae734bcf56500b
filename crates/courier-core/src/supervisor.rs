//! Resilient subscription supervisor.
//!
//! Keeps one broker subscription alive across transport failures. The driver
//! callback only tags events with the subscription generation and forwards
//! them into a channel; a pump task translates records into envelopes for the
//! owning queue and reacts to failure events by starting recovery.
//!
//! Recovery is single-flight. Failure signals arriving while a recovery run is
//! in progress are folded into that run instead of starting another one.
//! Failures reported by a subscription that has already been replaced are
//! ignored.

use crate::error::QueueError;
use crate::options::RecordCodec;
use crate::providers::DeliverySink;
use crate::transport::{
    decode_record, ConnectionParams, TransportCallback, TransportDriver, TransportEvent,
    TransportSubscription,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;

/// Lifecycle of a supervised subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not yet started
    Unsubscribed,
    /// Subscribed and delivering
    Active,
    /// Transport failed; reconnecting and resubscribing
    Recovering,
    /// Stopped for good
    Terminated,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Active => "active",
            Self::Recovering => "recovering",
            Self::Terminated => "terminated",
        };
        f.write_str(text)
    }
}

/// What to subscribe to and how to translate what arrives
#[derive(Debug, Clone)]
pub struct SubscriptionTarget {
    pub topic: String,
    pub group: String,
    pub codec: RecordCodec,
}

type TaggedEvent = (u64, TransportEvent);

struct Shared<D: TransportDriver> {
    driver: Arc<D>,
    /// Set when the subscribing queue owns the connection and may reconnect it
    reconnect_with: Option<ConnectionParams>,
    target: SubscriptionTarget,
    recovery_pause: Duration,
    generation: AtomicU64,
    handle: tokio::sync::Mutex<Option<Box<dyn TransportSubscription>>>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    state: watch::Sender<SubscriptionState>,
    recovering: AtomicBool,
    pending_failure: AtomicBool,
    recovery_runs: AtomicU64,
}

/// Supervises one subscription on behalf of a broker-backed queue
pub struct SubscriptionSupervisor<D: TransportDriver> {
    shared: Arc<Shared<D>>,
    pump_input: Mutex<Option<(mpsc::UnboundedReceiver<TaggedEvent>, DeliverySink)>>,
}

impl<D: TransportDriver> SubscriptionSupervisor<D> {
    pub fn new(
        driver: Arc<D>,
        reconnect_with: Option<ConnectionParams>,
        target: SubscriptionTarget,
        sink: DeliverySink,
        recovery_pause: Duration,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SubscriptionState::Unsubscribed);
        Self {
            shared: Arc::new(Shared {
                driver,
                reconnect_with,
                target,
                recovery_pause,
                generation: AtomicU64::new(0),
                handle: tokio::sync::Mutex::new(None),
                events,
                state,
                recovering: AtomicBool::new(false),
                pending_failure: AtomicBool::new(false),
                recovery_runs: AtomicU64::new(0),
            }),
            pump_input: Mutex::new(Some((receiver, sink))),
        }
    }

    /// Subscribe and start delivering. Calling it again is a no-op.
    pub async fn start(&self) -> Result<(), QueueError> {
        let input = self
            .pump_input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some((events, sink)) = input else {
            return Ok(());
        };

        if let Err(e) = self.shared.subscribe().await {
            // Leave the supervisor startable again
            *self.pump_input.lock().unwrap_or_else(|e| e.into_inner()) = Some((events, sink));
            return Err(e);
        }

        tokio::spawn(Shared::pump(
            Arc::clone(&self.shared),
            events,
            sink,
            self.shared.state.subscribe(),
        ));
        Ok(())
    }

    /// Stop supervising and drop the subscription; recovery in flight winds down
    pub async fn stop(&self) {
        self.shared.state.send_replace(SubscriptionState::Terminated);
        self.shared.release_handle().await;
        info!(
            topic = %self.shared.target.topic,
            group = %self.shared.target.group,
            "Subscription stopped"
        );
    }

    pub fn state(&self) -> SubscriptionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.shared.state.subscribe()
    }

    /// Number of recovery runs started so far
    pub fn recovery_runs(&self) -> u64 {
        self.shared.recovery_runs.load(Ordering::SeqCst)
    }
}

impl<D: TransportDriver> Drop for SubscriptionSupervisor<D> {
    fn drop(&mut self) {
        // Ends the pump and any recovery loop still running
        self.shared.state.send_replace(SubscriptionState::Terminated);
    }
}

impl<D: TransportDriver> Shared<D> {
    fn is_terminated(&self) -> bool {
        *self.state.borrow() == SubscriptionState::Terminated
    }

    /// Move to `next` unless the subscription has been terminated
    fn transition(&self, next: SubscriptionState) {
        self.state.send_if_modified(|state| {
            if *state == SubscriptionState::Terminated || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    async fn release_handle(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.unsubscribe().await {
                debug!(topic = %self.target.topic, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Issue a subscribe under a fresh generation
    async fn subscribe(&self) -> Result<(), QueueError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let events = self.events.clone();
        let callback: TransportCallback = Arc::new(move |event| {
            // The pump is gone once the supervisor stops; nothing to do then
            let _ = events.send((generation, event));
        });

        let handle = self
            .driver
            .subscribe(&self.target.topic, &self.target.group, callback)
            .await?;

        if self.is_terminated() {
            // Stopped while the subscribe was in flight
            if let Err(e) = handle.unsubscribe().await {
                debug!(topic = %self.target.topic, error = %e, "Unsubscribe failed");
            }
            return Ok(());
        }

        *self.handle.lock().await = Some(handle);
        self.transition(SubscriptionState::Active);
        debug!(
            topic = %self.target.topic,
            group = %self.target.group,
            generation,
            "Subscription established"
        );
        Ok(())
    }

    /// Forward records to the sink and failures to recovery until terminated
    async fn pump(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TaggedEvent>,
        sink: DeliverySink,
        mut state: watch::Receiver<SubscriptionState>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some((generation, event)) = event else {
                        break;
                    };
                    match event {
                        TransportEvent::Record(record) => {
                            match decode_record(self.target.codec, &record) {
                                Ok(envelope) => sink.deliver(envelope).await,
                                Err(e) => warn!(
                                    topic = %self.target.topic,
                                    position = ?record.position,
                                    error = %e,
                                    "Dropping undecodable transport record"
                                ),
                            }
                        }
                        TransportEvent::Failed(cause) => {
                            if generation != self.generation.load(Ordering::SeqCst) {
                                debug!(
                                    topic = %self.target.topic,
                                    generation,
                                    "Ignoring failure from replaced subscription"
                                );
                                continue;
                            }
                            Arc::clone(&self).on_failure(&cause);
                        }
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() == SubscriptionState::Terminated {
                        break;
                    }
                }
            }
        }

        debug!(topic = %self.target.topic, "Subscription pump stopped");
    }

    /// Record a failure and start recovery unless a run is already going
    fn on_failure(self: Arc<Self>, cause: &str) {
        if self.is_terminated() {
            return;
        }

        warn!(
            topic = %self.target.topic,
            group = %self.target.group,
            cause,
            "Subscription crashed"
        );
        self.pending_failure.store(true, Ordering::SeqCst);

        if self
            .recovering
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(topic = %self.target.topic, "Recovery already running; failure coalesced");
            return;
        }

        self.recovery_runs.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.recover());
    }

    async fn recover(self: Arc<Self>) {
        loop {
            self.pending_failure.store(false, Ordering::SeqCst);
            self.transition(SubscriptionState::Recovering);

            let mut attempt: u32 = 0;
            while !self.is_terminated() {
                attempt += 1;
                match self.resubscribe().await {
                    Ok(()) if self.is_terminated() => break,
                    Ok(()) => {
                        info!(
                            topic = %self.target.topic,
                            group = %self.target.group,
                            attempt,
                            "Subscription restored"
                        );
                        break;
                    }
                    Err(e) => {
                        warn!(
                            topic = %self.target.topic,
                            attempt,
                            error = %e,
                            "Recovery attempt failed"
                        );
                        tokio::time::sleep(self.recovery_pause).await;
                    }
                }
            }

            if self.is_terminated() || !self.pending_failure.load(Ordering::SeqCst) {
                self.recovering.store(false, Ordering::SeqCst);
                // A failure may have slipped in between the check and the release
                let reclaimed = self.pending_failure.load(Ordering::SeqCst)
                    && !self.is_terminated()
                    && self
                        .recovering
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                if !reclaimed {
                    break;
                }
            }
        }
    }

    /// Tear down the old subscription, reconnect when owned, subscribe again
    async fn resubscribe(&self) -> Result<(), QueueError> {
        // Failures from the old subscription are stale from here on
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.release_handle().await;

        if let Some(params) = &self.reconnect_with {
            if let Err(e) = self.driver.disconnect().await {
                debug!(transport = self.driver.name(), error = %e, "Disconnect before reconnect failed");
            }
            self.driver.connect(params).await?;

            // Stopped while connecting; the owning queue has already released
            // its connection, so this one must not outlive it
            if self.is_terminated() {
                if let Err(e) = self.driver.disconnect().await {
                    debug!(transport = self.driver.name(), error = %e, "Disconnect after stop failed");
                }
                debug!(topic = %self.target.topic, "Recovery abandoned; subscription stopped");
                return Ok(());
            }
        }

        self.subscribe().await
    }
}
