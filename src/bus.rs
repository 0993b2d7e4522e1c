//! In-process publish/subscribe event bus
//!
//! Decouples data-source workers from the graph writer and output emitter.
//! Subscribers register per-topic callbacks; a single background dispatcher
//! drains published deliveries and invokes every subscriber of that topic
//! concurrently, bounded by a generous global semaphore that exists only as
//! a safety ceiling (see the concurrency and resource model).
//!
//! Topics are modeled as a closed sum type ([`Topic`]) rather than
//! string-keyed runtime reflection, per the design notes' preference for
//! compile-time wiring over dynamic dispatch.

use crate::model::{AddrRequest, AsnRequest, DnsRequest, Output};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

/// The geometric back-off ladder shared by the bus dispatcher and the
/// resolver/worker queue drainers when their queue runs dry.
pub const BACKOFF_LADDER_MS: &[u64] = &[10, 25, 50, 75, 100, 150, 250, 500];

/// Safety ceiling on in-flight subscriber callbacks; never the primary
/// throttle (that is the controller's timing gate).
const DISPATCH_SEMAPHORE_CAPACITY: usize = 1_000_000;

/// A typed payload delivered on a bus topic. One variant per well-known
/// topic in the component design.
#[derive(Debug, Clone)]
pub enum Event {
    NewName(DnsRequest),
    Resolved(DnsRequest),
    NewAddress(AddrRequest),
    NewAsn(AsnRequest),
    Sweep(AddrRequest),
    ActiveCert(AddrRequest),
    Output(Output),
    Log(String),
}

impl Event {
    fn topic(&self) -> Topic {
        match self {
            Event::NewName(_) => Topic::NewName,
            Event::Resolved(_) => Topic::Resolved,
            Event::NewAddress(_) => Topic::NewAddress,
            Event::NewAsn(_) => Topic::NewAsn,
            Event::Sweep(_) => Topic::Sweep,
            Event::ActiveCert(_) => Topic::ActiveCert,
            Event::Output(_) => Topic::Output,
            Event::Log(_) => Topic::Log,
        }
    }
}

/// The well-known topic names from the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewName,
    Resolved,
    NewAddress,
    NewAsn,
    Sweep,
    ActiveCert,
    Output,
    Log,
}

type Callback = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Subscription {
    topic: Topic,
    callback: Callback,
}

/// A publish/subscribe broker carrying the event types above between the
/// controller's workers, graph writer, and output emitter.
pub struct EventBus {
    subscriptions: dashmap::DashMap<u64, Subscription>,
    next_sub_id: std::sync::atomic::AtomicU64,
    queue_tx: mpsc::UnboundedSender<Event>,
    queue_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    dispatch_semaphore: Arc<Semaphore>,
    stopped: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            subscriptions: dashmap::DashMap::new(),
            next_sub_id: std::sync::atomic::AtomicU64::new(0),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(Some(queue_rx)),
            dispatch_semaphore: Arc::new(Semaphore::new(DISPATCH_SEMAPHORE_CAPACITY)),
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers `callback` to be invoked for every delivery on `topic`.
    /// Returns a subscription id that [`EventBus::unsubscribe`] can use.
    pub fn subscribe<F, Fut>(&self, topic: Topic, callback: F) -> u64
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let callback: Callback = Arc::new(move |event| Box::pin(callback(event)));
        self.subscriptions.insert(id, Subscription { topic, callback });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscriptions.remove(&id);
    }

    /// Enqueues a delivery. Publishing after [`EventBus::stop`] is a no-op.
    pub fn publish(&self, event: Event) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        // The send only fails if the dispatcher task has already dropped its
        // receiver, which only happens after stop(); harmless to ignore.
        let _ = self.queue_tx.send(event);
    }

    /// Starts the background dispatcher loop. Must be called exactly once;
    /// returns the task handle so the controller can await it on shutdown.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.dispatch_loop().await })
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .expect("EventBus::run called more than once");

        let mut backoff_idx = 0usize;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    backoff_idx = 0;
                    self.dispatch_one(event).await;
                    // Drain everything currently queued before sleeping again,
                    // preserving publication order up to the handoff point.
                    while let Ok(event) = rx.try_recv() {
                        self.dispatch_one(event).await;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    let delay = BACKOFF_LADDER_MS[backoff_idx.min(BACKOFF_LADDER_MS.len() - 1)];
                    sleep(Duration::from_millis(delay)).await;
                    if backoff_idx < BACKOFF_LADDER_MS.len() - 1 {
                        backoff_idx += 1;
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            }
        }
    }

    async fn dispatch_one(&self, event: Event) {
        let topic = event.topic();
        if let Event::Log(msg) = &event {
            info!(target: "sweepcore::bus::log", "{msg}");
        }
        let subscribers: Vec<Callback> = self
            .subscriptions
            .iter()
            .filter(|s| s.topic == topic)
            .map(|s| Arc::clone(&s.callback))
            .collect();

        if subscribers.is_empty() {
            return;
        }

        debug!("dispatching event on {:?} to {} subscriber(s)", topic, subscribers.len());
        let mut handles = Vec::with_capacity(subscribers.len());
        for cb in subscribers {
            let event = event.clone();
            let permit = match Arc::clone(&self.dispatch_semaphore).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                cb(event).await;
            }));
        }
        for h in handles {
            if let Err(e) = h.await {
                warn!("bus subscriber task panicked: {e}");
            }
        }
    }

    /// Closes the bus: subsequent publishes are silently dropped. In-flight
    /// callbacks are allowed to finish; queued-but-undispatched events are
    /// dropped once the dispatcher observes the empty queue.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl Default for Arc<EventBus> {
    fn default() -> Self {
        EventBus::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn delivers_to_matching_topic_only() {
        let bus = EventBus::new();
        let handle = bus.run();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        bus.subscribe(Topic::NewName, move |_event| {
            let hits = Arc::clone(&hits2);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        let other_hits = Arc::new(AtomicUsize::new(0));
        let other_hits2 = Arc::clone(&other_hits);
        bus.subscribe(Topic::Resolved, move |_event| {
            let h = Arc::clone(&other_hits2);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        bus.publish(Event::NewName(DnsRequest::new(
            "www.example.com",
            "example.com",
            Tag::Dns,
            "test",
        )));

        timeout(Duration::from_secs(2), async {
            while hits.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event was never dispatched");

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);

        bus.stop();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn publish_after_stop_is_dropped() {
        let bus = EventBus::new();
        bus.stop();
        bus.publish(Event::Log("should be dropped".into()));
        // No panic, no delivery: nothing further to assert beyond "does not hang".
    }
}
