//! Data-source worker framework: lifecycle, per-type queues, heartbeats
//!
//! Every data source (certificate-transparency scraper, passive-DNS client,
//! archive crawler, WHOIS client, the bundled DNS/reverse-sweep workers) is
//! built on [`WorkerBase`] and implements the [`Worker`] trait's lifecycle
//! hooks. The base gives every source the same four typed queues, the same
//! pause/resume/stop signaling, and the same liveness heartbeat, so the
//! controller never has to special-case a source's internals.

use crate::bus::EventBus;
use crate::config::EngineConfig;
use crate::model::{AddrRequest, AsnRequest, DnsRequest, WhoisRequest};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::sleep;
use tracing::{debug, warn};

/// How long a worker may go without calling [`WorkerBase::set_active`] before
/// the controller considers it idle.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

/// The back-off ladder used by each per-queue drainer when its queue is empty.
const QUEUE_BACKOFF_MS: &[u64] = &[25, 50, 100, 150, 250, 400, 600, 750];

/// Point-in-time statistics a worker reports to the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub dns_qps: f64,
    pub names_remaining: usize,
    pub addrs_remaining: usize,
}

/// Lifecycle and work-item hooks a data source implements. The base handles
/// everything else (queues, heartbeats, pause/resume plumbing).
#[async_trait::async_trait]
pub trait Worker: Send + Sync {
    fn description(&self) -> &str;

    /// Called once, before the queue drainers are spawned.
    async fn on_start(&self, _base: &WorkerBase) {}
    /// Called when `pause()` is invoked, before the pause signal is sent.
    async fn on_pause(&self, _base: &WorkerBase) {}
    /// Called when `resume()` is invoked, before the resume signal is sent.
    async fn on_resume(&self, _base: &WorkerBase) {}
    /// Called once during `stop()`, after any paused state has been lifted.
    async fn on_stop(&self, _base: &WorkerBase) {}

    /// Handles one item pulled off the DNS-request delivery channel.
    async fn handle_dns(&self, _base: &WorkerBase, _req: DnsRequest) {}
    /// Handles one item pulled off the address-request delivery channel.
    async fn handle_addr(&self, _base: &WorkerBase, _req: AddrRequest) {}
    /// Handles one item pulled off the ASN-request delivery channel.
    async fn handle_asn(&self, _base: &WorkerBase, _req: AsnRequest) {}
    /// Handles one item pulled off the WHOIS-request delivery channel.
    async fn handle_whois(&self, _base: &WorkerBase, _req: WhoisRequest) {}
}

/// Uniform per-worker state: name, lifecycle flags, the four typed intake
/// queues, their delivery channels, and pause/resume/quit signaling.
pub struct WorkerBase {
    pub name: String,
    started: AtomicBool,
    stopped: AtomicBool,
    last_active_unix_ms: AtomicI64,

    dns_in: mpsc::UnboundedSender<DnsRequest>,
    dns_queue: Mutex<Option<mpsc::UnboundedReceiver<DnsRequest>>>,
    dns_out: (mpsc::UnboundedSender<DnsRequest>, Mutex<mpsc::UnboundedReceiver<DnsRequest>>),

    addr_in: mpsc::UnboundedSender<AddrRequest>,
    addr_queue: Mutex<Option<mpsc::UnboundedReceiver<AddrRequest>>>,
    addr_out: (mpsc::UnboundedSender<AddrRequest>, Mutex<mpsc::UnboundedReceiver<AddrRequest>>),

    asn_in: mpsc::UnboundedSender<AsnRequest>,
    asn_queue: Mutex<Option<mpsc::UnboundedReceiver<AsnRequest>>>,
    asn_out: (mpsc::UnboundedSender<AsnRequest>, Mutex<mpsc::UnboundedReceiver<AsnRequest>>),

    whois_in: mpsc::UnboundedSender<WhoisRequest>,
    whois_queue: Mutex<Option<mpsc::UnboundedReceiver<WhoisRequest>>>,
    whois_out: (mpsc::UnboundedSender<WhoisRequest>, Mutex<mpsc::UnboundedReceiver<WhoisRequest>>),

    dns_depth: std::sync::atomic::AtomicUsize,
    addr_depth: std::sync::atomic::AtomicUsize,
    asn_depth: std::sync::atomic::AtomicUsize,
    whois_depth: std::sync::atomic::AtomicUsize,

    quit_tx: broadcast::Sender<()>,
    paused: AtomicBool,
    pause_notify: Notify,
    pub bus: Arc<EventBus>,
    pub config: Arc<EngineConfig>,
}

impl WorkerBase {
    pub fn new(name: impl Into<String>, bus: Arc<EventBus>, config: Arc<EngineConfig>) -> Arc<Self> {
        let (dns_tx, dns_rx) = mpsc::unbounded_channel();
        let (dns_out_tx, dns_out_rx) = mpsc::unbounded_channel();
        let (addr_tx, addr_rx) = mpsc::unbounded_channel();
        let (addr_out_tx, addr_out_rx) = mpsc::unbounded_channel();
        let (asn_tx, asn_rx) = mpsc::unbounded_channel();
        let (asn_out_tx, asn_out_rx) = mpsc::unbounded_channel();
        let (whois_tx, whois_rx) = mpsc::unbounded_channel();
        let (whois_out_tx, whois_out_rx) = mpsc::unbounded_channel();
        let (quit_tx, _) = broadcast::channel(1);

        Arc::new(Self {
            name: name.into(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            last_active_unix_ms: AtomicI64::new(now_ms()),
            dns_in: dns_tx,
            dns_queue: Mutex::new(Some(dns_rx)),
            dns_out: (dns_out_tx, Mutex::new(dns_out_rx)),
            addr_in: addr_tx,
            addr_queue: Mutex::new(Some(addr_rx)),
            addr_out: (addr_out_tx, Mutex::new(addr_out_rx)),
            asn_in: asn_tx,
            asn_queue: Mutex::new(Some(asn_rx)),
            asn_out: (asn_out_tx, Mutex::new(asn_out_rx)),
            whois_in: whois_tx,
            whois_queue: Mutex::new(Some(whois_rx)),
            whois_out: (whois_out_tx, Mutex::new(whois_out_rx)),
            dns_depth: std::sync::atomic::AtomicUsize::new(0),
            addr_depth: std::sync::atomic::AtomicUsize::new(0),
            asn_depth: std::sync::atomic::AtomicUsize::new(0),
            whois_depth: std::sync::atomic::AtomicUsize::new(0),
            quit_tx,
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            bus,
            config,
        })
    }

    pub fn enqueue_dns(&self, req: DnsRequest) {
        self.dns_depth.fetch_add(1, Ordering::Relaxed);
        let _ = self.dns_in.send(req);
    }
    pub fn enqueue_addr(&self, req: AddrRequest) {
        self.addr_depth.fetch_add(1, Ordering::Relaxed);
        let _ = self.addr_in.send(req);
    }
    pub fn enqueue_asn(&self, req: AsnRequest) {
        self.asn_depth.fetch_add(1, Ordering::Relaxed);
        let _ = self.asn_in.send(req);
    }
    pub fn enqueue_whois(&self, req: WhoisRequest) {
        self.whois_depth.fetch_add(1, Ordering::Relaxed);
        let _ = self.whois_in.send(req);
    }

    pub fn set_active(&self) {
        self.last_active_unix_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        let last = self.last_active_unix_ms.load(Ordering::Relaxed);
        now_ms() - last <= LIVENESS_TIMEOUT.as_millis() as i64
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            dns_qps: 0.0,
            names_remaining: self.dns_depth.load(Ordering::Relaxed)
                + self.whois_depth.load(Ordering::Relaxed),
            addrs_remaining: self.addr_depth.load(Ordering::Relaxed)
                + self.asn_depth.load(Ordering::Relaxed),
        }
    }

    fn pause_signal(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume_signal(&self) {
        self.paused.store(false, Ordering::Release);
        self.pause_notify.notify_waiters();
    }

    /// Blocks a drainer/consumer loop while the worker is paused, waking on
    /// either resume or quit. Returns `true` if a quit signal arrived while
    /// waiting, telling the caller to stop rather than resume work.
    async fn wait_while_paused(&self, quit_rx: &mut broadcast::Receiver<()>) -> bool {
        while self.paused.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = quit_rx.recv() => return true,
                _ = self.pause_notify.notified() => {}
            }
        }
        false
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Owning handle returned to the controller: pairs a worker implementation
/// with its [`WorkerBase`] and drives the lifecycle transitions.
pub struct WorkerHandle {
    pub base: Arc<WorkerBase>,
    worker: Arc<dyn Worker>,
    drainer_handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

macro_rules! spawn_drainer {
    ($base:expr, $queue_field:ident, $out_field:ident, $depth_field:ident, $handler_name:expr) => {{
        let base = Arc::clone($base);
        let mut rx = base
            .$queue_field
            .lock()
            .await
            .take()
            .expect("drainer spawned twice");
        let out_tx = base.$out_field.0.clone();
        let mut quit_rx = base.quit_tx.subscribe();
        tokio::spawn(async move {
            let mut backoff_idx = 0usize;
            loop {
                if base.wait_while_paused(&mut quit_rx).await {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = quit_rx.recv() => break,
                    item = rx.recv() => {
                        match item {
                            Some(item) => {
                                backoff_idx = 0;
                                base.$depth_field.fetch_sub(1, Ordering::Relaxed);
                                if out_tx.send(item).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
                if rx.is_empty() {
                    let delay = QUEUE_BACKOFF_MS[backoff_idx.min(QUEUE_BACKOFF_MS.len() - 1)];
                    tokio::select! {
                        biased;
                        _ = quit_rx.recv() => break,
                        _ = sleep(Duration::from_millis(delay)) => {}
                    }
                    if backoff_idx < QUEUE_BACKOFF_MS.len() - 1 {
                        backoff_idx += 1;
                    }
                }
            }
            debug!("{} drainer for {} exiting", $handler_name, base.name);
        })
    }};
}

impl WorkerHandle {
    pub fn new(worker: Arc<dyn Worker>, base: Arc<WorkerBase>) -> Self {
        Self {
            base,
            worker,
            drainer_handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts the worker: runs `on_start`, then launches the four queue
    /// drainers. Idempotent-fails if already started.
    pub async fn start(&self) -> Result<(), &'static str> {
        if self.base.started.swap(true, Ordering::AcqRel) {
            return Err("already started");
        }
        self.worker.on_start(&self.base).await;

        let mut handles = self.drainer_handles.lock().await;
        handles.push(spawn_drainer!(&self.base, dns_queue, dns_out, dns_depth, "dns"));
        handles.push(spawn_drainer!(&self.base, addr_queue, addr_out, addr_depth, "addr"));
        handles.push(spawn_drainer!(&self.base, asn_queue, asn_out, asn_depth, "asn"));
        handles.push(spawn_drainer!(&self.base, whois_queue, whois_out, whois_depth, "whois"));
        handles.push(self.spawn_dns_consumer());
        handles.push(self.spawn_addr_consumer());
        handles.push(self.spawn_asn_consumer());
        handles.push(self.spawn_whois_consumer());
        Ok(())
    }

    fn spawn_dns_consumer(&self) -> tokio::task::JoinHandle<()> {
        let base = Arc::clone(&self.base);
        let worker = Arc::clone(&self.worker);
        let mut quit_rx = base.quit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if base.wait_while_paused(&mut quit_rx).await {
                    break;
                }
                let mut rx = base.dns_out.1.lock().await;
                tokio::select! {
                    biased;
                    _ = quit_rx.recv() => break,
                    item = rx.recv() => match item {
                        Some(req) => { drop(rx); worker.handle_dns(&base, req).await; }
                        None => break,
                    }
                }
            }
        })
    }

    fn spawn_addr_consumer(&self) -> tokio::task::JoinHandle<()> {
        let base = Arc::clone(&self.base);
        let worker = Arc::clone(&self.worker);
        let mut quit_rx = base.quit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if base.wait_while_paused(&mut quit_rx).await {
                    break;
                }
                let mut rx = base.addr_out.1.lock().await;
                tokio::select! {
                    biased;
                    _ = quit_rx.recv() => break,
                    item = rx.recv() => match item {
                        Some(req) => { drop(rx); worker.handle_addr(&base, req).await; }
                        None => break,
                    }
                }
            }
        })
    }

    fn spawn_asn_consumer(&self) -> tokio::task::JoinHandle<()> {
        let base = Arc::clone(&self.base);
        let worker = Arc::clone(&self.worker);
        let mut quit_rx = base.quit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if base.wait_while_paused(&mut quit_rx).await {
                    break;
                }
                let mut rx = base.asn_out.1.lock().await;
                tokio::select! {
                    biased;
                    _ = quit_rx.recv() => break,
                    item = rx.recv() => match item {
                        Some(req) => { drop(rx); worker.handle_asn(&base, req).await; }
                        None => break,
                    }
                }
            }
        })
    }

    fn spawn_whois_consumer(&self) -> tokio::task::JoinHandle<()> {
        let base = Arc::clone(&self.base);
        let worker = Arc::clone(&self.worker);
        let mut quit_rx = base.quit_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if base.wait_while_paused(&mut quit_rx).await {
                    break;
                }
                let mut rx = base.whois_out.1.lock().await;
                tokio::select! {
                    biased;
                    _ = quit_rx.recv() => break,
                    item = rx.recv() => match item {
                        Some(req) => { drop(rx); worker.handle_whois(&base, req).await; }
                        None => break,
                    }
                }
            }
        })
    }

    /// Suspends the worker's drainers and consumers: no queued item is
    /// handed to `Worker::handle_*` until [`WorkerHandle::resume`].
    pub async fn pause(&self) {
        self.base.pause_signal();
        self.worker.on_pause(&self.base).await;
    }

    pub async fn resume(&self) {
        self.base.resume_signal();
        self.worker.on_resume(&self.base).await;
    }

    /// Stops the worker: resumes first (to unblock any paused state), runs
    /// `on_stop`, marks stopped, and closes the quit broadcast. Idempotent-fails
    /// if already stopped.
    pub async fn stop(&self) -> Result<(), &'static str> {
        if self.base.stopped.swap(true, Ordering::AcqRel) {
            return Err("already stopped");
        }
        self.resume().await;
        self.worker.on_stop(&self.base).await;
        let _ = self.base.quit_tx.send(());

        let mut handles = self.drainer_handles.lock().await;
        for h in handles.drain(..) {
            let _ = h.await;
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.base.is_active()
    }

    pub fn stats(&self) -> WorkerStats {
        self.base.stats()
    }

    pub fn description(&self) -> &str {
        self.worker.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Echo {
        started: Arc<AtomicUsize>,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Worker for Echo {
        fn description(&self) -> &str {
            "echo test worker"
        }

        async fn on_start(&self, _base: &WorkerBase) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_dns(&self, base: &WorkerBase, _req: DnsRequest) {
            base.set_active();
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_base(name: &str) -> Arc<WorkerBase> {
        let bus = EventBus::new();
        let cfg = Arc::new(crate::config::EngineConfig {
            uuid: uuid::Uuid::new_v4(),
            domains: vec!["example.com".into()],
            blacklist: vec![],
            addresses: vec![],
            cidrs: vec![],
            asns: vec![],
            ports: vec![443],
            resolvers: vec![],
            max_dns_queries: 1000,
            brute_forcing: false,
            recursive_brute_forcing: false,
            minimum_for_recursive: 3,
            alterations: false,
            flip_words: false,
            flip_numbers: false,
            add_words: false,
            add_numbers: false,
            edit_distance: 0,
            passive: true,
            active: false,
            include_unresolvable: false,
            timing_band: crate::config::TimingBand::Normal,
            disabled_sources: vec![],
            api_keys: Default::default(),
            has_data_ops_writer_source: false,
        });
        WorkerBase::new(name, bus, cfg)
    }

    #[tokio::test]
    async fn start_is_idempotent_fail() {
        let base = test_base("w1");
        let started = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(Echo {
            started: Arc::clone(&started),
            handled: Arc::new(AtomicUsize::new(0)),
        });
        let handle = WorkerHandle::new(worker, base);

        handle.start().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(handle.start().await.is_err());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_fail() {
        let base = test_base("w2");
        let worker = Arc::new(Echo {
            started: Arc::new(AtomicUsize::new(0)),
            handled: Arc::new(AtomicUsize::new(0)),
        });
        let handle = WorkerHandle::new(worker, base);
        handle.start().await.unwrap();
        handle.stop().await.unwrap();
        assert!(handle.stop().await.is_err());
    }

    #[tokio::test]
    async fn liveness_reflects_recent_activity() {
        let base = test_base("w3");
        assert!(base.is_active());
        base.last_active_unix_ms.store(0, Ordering::Relaxed);
        assert!(!base.is_active());
        base.set_active();
        assert!(base.is_active());
    }

    #[tokio::test]
    async fn pause_suspends_delivery_until_resume() {
        let base = test_base("w4");
        let handled = Arc::new(AtomicUsize::new(0));
        let worker = Arc::new(Echo {
            started: Arc::new(AtomicUsize::new(0)),
            handled: Arc::clone(&handled),
        });
        let handle = WorkerHandle::new(worker, Arc::clone(&base));
        handle.start().await.unwrap();

        handle.pause().await;
        base.enqueue_dns(DnsRequest::new("host.example.com", "example.com", crate::model::Tag::Dns, "test"));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(handled.load(Ordering::SeqCst), 0, "paused worker must not dequeue");

        handle.resume().await;
        let deadline = Duration::from_secs(2);
        let start = std::time::Instant::now();
        while handled.load(Ordering::SeqCst) == 0 && start.elapsed() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handled.load(Ordering::SeqCst), 1, "resumed worker must deliver the queued item");

        handle.stop().await.unwrap();
    }
}
