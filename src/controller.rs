//! Enumeration controller: the top-level orchestrator
//!
//! Owns the bus, the resolver pool, the graph, and the registered worker
//! set exclusively; nothing outside this module holds a long-lived
//! reference into any of them. Composes the other four components into a
//! single run and exposes the external API (§6): seed domains, register
//! workers, start, pause/resume, stats, shutdown, and the output stream.

use crate::bus::{Event, EventBus, Topic};
use crate::config::EngineConfig;
use crate::error::EnumError;
use crate::graph::FindingGraph;
use crate::model::{AddrRequest, AsnRequest, DnsAnswer, DnsRequest, Output, Priority, Tag};
use crate::rate_limit::{create_timing_band_limiter, RateLimiter};
use crate::resolver::ResolverPool;
use crate::sanitize::sanitize_output;
use crate::scope::ScopeFilter;
use crate::validation::validate_domain;
use crate::worker::{Worker, WorkerBase, WorkerHandle, LIVENESS_TIMEOUT};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use trust_dns_resolver::proto::rr::RecordType;

/// Cap applied to the raised open-file limit, regardless of the platform
/// hard limit.
const FD_LIMIT_CAP: u64 = 100_000;
/// Fraction of the (capped) fd limit reserved for outbound connections.
const CONNECTION_BUDGET_FRACTION: f64 = 0.9;
/// How often the output emitter polls the graph for newly-complete findings.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How often the termination watcher re-checks its three conditions.
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Aggregate statistics returned by [`EnumerationController::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub dns_qps: f64,
    pub names_remaining: usize,
    pub addrs_remaining: usize,
}

/// Composes the resolver pool, event bus, finding graph, and a caller-
/// supplied worker set into one enumeration run.
pub struct EnumerationController {
    pub config: Arc<EngineConfig>,
    pub bus: Arc<EventBus>,
    pub pool: Arc<ResolverPool>,
    pub graph: Arc<FindingGraph>,
    scope: ScopeFilter,
    connection_semaphore: Arc<Semaphore>,
    timing_gate: Arc<RateLimiter>,
    workers: Mutex<Vec<Arc<WorkerHandle>>>,
    output_tx: mpsc::UnboundedSender<Output>,
    output_rx: Mutex<mpsc::UnboundedReceiver<Output>>,
    paused: Arc<AtomicBool>,
    pause_notify: Arc<Notify>,
    stopped: AtomicBool,
    inflight_resolves: Arc<AtomicUsize>,
    last_resolve_activity_ms: Arc<AtomicI64>,
    bg_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl EnumerationController {
    /// Validates `config`, raises the open-file limit, builds and sanity-
    /// checks the resolver pool, and starts the bus and pool background
    /// tasks. Returns a controller ready for [`EnumerationController::add_worker`]
    /// and [`EnumerationController::start`].
    pub async fn build(config: EngineConfig) -> Result<Arc<Self>, EnumError> {
        config.validate()?;

        let raised = rlimit::increase_nofile_limit(FD_LIMIT_CAP).unwrap_or_else(|err| {
            warn!("failed to raise open-file limit, continuing with a conservative default: {err}");
            1024
        });
        let connection_budget = ((raised as f64) * CONNECTION_BUDGET_FRACTION).max(1.0) as usize;
        info!(fd_limit = raised, connection_budget, "startup resource budget");

        let pool = ResolverPool::build(&config.resolvers).await.map_err(EnumError::Config)?;
        pool.run();

        let bus = EventBus::new();
        bus.run();

        let graph = Arc::new(FindingGraph::new());

        let scope = ScopeFilter::new(
            config.domains.clone(),
            config.blacklist.clone(),
            config.addresses.clone(),
            config.cidrs.clone(),
            config.asns.clone(),
        );

        let (max_in_flight, delay) = config.timing_band.params();
        let timing_gate = Arc::new(create_timing_band_limiter(max_in_flight, delay.as_millis() as u64));

        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(Self {
            config: Arc::new(config),
            bus,
            pool,
            graph,
            scope,
            connection_semaphore: Arc::new(Semaphore::new(connection_budget)),
            timing_gate,
            workers: Mutex::new(Vec::new()),
            output_tx,
            output_rx: Mutex::new(output_rx),
            paused: Arc::new(AtomicBool::new(false)),
            pause_notify: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            inflight_resolves: Arc::new(AtomicUsize::new(0)),
            last_resolve_activity_ms: Arc::new(AtomicI64::new(now_ms())),
            bg_handles: Mutex::new(Vec::new()),
        });

        controller.wire_subscriptions();
        Ok(controller)
    }

    fn wire_subscriptions(self: &Arc<Self>) {
        let new_name = Arc::clone(self);
        self.bus.subscribe(Topic::NewName, move |event| {
            let controller = Arc::clone(&new_name);
            async move {
                if let Event::NewName(req) = event {
                    controller.handle_new_name(req).await;
                }
            }
        });

        let new_address = Arc::clone(self);
        self.bus.subscribe(Topic::NewAddress, move |event| {
            let controller = Arc::clone(&new_address);
            async move {
                if let Event::NewAddress(req) = event {
                    controller.handle_new_address(req).await;
                }
            }
        });

        let new_asn = Arc::clone(self);
        self.bus.subscribe(Topic::NewAsn, move |event| {
            let controller = Arc::clone(&new_asn);
            async move {
                if let Event::NewAsn(req) = event {
                    controller.handle_new_asn(req).await;
                }
            }
        });

        let output = Arc::clone(self);
        self.bus.subscribe(Topic::Output, move |event| {
            let controller = Arc::clone(&output);
            async move {
                if let Event::Output(out) = event {
                    controller.deliver_output(out).await;
                }
            }
        });
    }

    /// Registers a data-source worker. Must be called before [`EnumerationController::start`].
    pub async fn add_worker(&self, worker: Arc<dyn Worker>, name: impl Into<String>) -> Arc<WorkerHandle> {
        let base = WorkerBase::new(name, Arc::clone(&self.bus), Arc::clone(&self.config));
        let handle = Arc::new(WorkerHandle::new(worker, base));
        self.workers.lock().await.push(Arc::clone(&handle));
        handle
    }

    /// Starts every registered worker, seeds the configured root domains
    /// onto `new-name`, and starts the output emitter and termination
    /// watcher background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), EnumError> {
        for handle in self.workers.lock().await.iter() {
            handle
                .start()
                .await
                .map_err(|e| EnumError::SourceLocal(e.to_string()))?;
        }

        for domain in self.config.domains.clone() {
            self.bus.publish(Event::NewName(DnsRequest::new(
                domain.clone(),
                domain,
                Tag::Dns,
                "controller-seed",
            )));
        }

        let mut handles = self.bg_handles.lock().await;
        handles.push(self.spawn_output_emitter());
        handles.push(self.spawn_termination_watcher());
        Ok(())
    }

    async fn handle_new_name(self: &Arc<Self>, req: DnsRequest) {
        if validate_domain(&req.name).is_err() {
            return;
        }
        if !self.scope.admits(&req.name) {
            return;
        }

        if self.config.passive {
            // Passive mode: no DNS resolution. Sources assert their own
            // records on the request; admit them to the graph as-is.
            let records = req.records.clone();
            self.ingest_answers(&req, &records);
            self.bus.publish(Event::Resolved(req.with_records(records)));
            return;
        }

        let priority = if req.tag.is_trusted() { Priority::High } else { Priority::Low };

        let conn_permit = match Arc::clone(&self.connection_semaphore).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        let gate_guard = match self.timing_gate.acquire().await {
            Ok(g) => g,
            Err(_) => return,
        };

        self.inflight_resolves.fetch_add(1, Ordering::SeqCst);
        self.last_resolve_activity_ms.store(now_ms(), Ordering::SeqCst);

        let result = self.pool.resolve(&req.name, RecordType::A, priority).await;

        self.inflight_resolves.fetch_sub(1, Ordering::SeqCst);
        self.last_resolve_activity_ms.store(now_ms(), Ordering::SeqCst);
        drop(gate_guard);
        drop(conn_permit);

        match result {
            Ok(answers) => {
                self.ingest_answers(&req, &answers);
                self.bus
                    .publish(Event::Resolved(req.clone().with_records(answers)));
            }
            Err(err) => {
                self.bus
                    .publish(Event::Log(format!("resolve failed for {}: {err}", req.name)));
            }
        }
    }

    /// Inserts `answers` for `req.name` into the graph and republishes any
    /// address found, regardless of whether they came from a live resolve
    /// or a passive source's own assertion.
    fn ingest_answers(self: &Arc<Self>, req: &DnsRequest, answers: &[DnsAnswer]) {
        self.graph.insert_domain(&req.domain, req.tag, &req.source);
        for answer in answers {
            if answer.record_type == RecordType::A || answer.record_type == RecordType::AAAA {
                if let Ok(addr) = answer.data.parse::<IpAddr>() {
                    match addr {
                        IpAddr::V4(v4) => self.graph.insert_a(&req.name, &req.domain, v4, req.tag, &req.source),
                        IpAddr::V6(v6) => self.graph.insert_aaaa(&req.name, &req.domain, v6, req.tag, &req.source),
                    };
                    self.bus.publish(Event::NewAddress(AddrRequest {
                        address: addr,
                        domain: req.domain.clone(),
                        tag: req.tag,
                        source: req.source.clone(),
                    }));
                }
            } else if answer.record_type == RecordType::CNAME {
                let target = answer.data.trim_end_matches('.').to_string();
                self.graph
                    .insert_cname(&req.name, &req.domain, &target, &req.domain, req.tag, &req.source);
            }
        }
    }

    async fn handle_new_address(self: &Arc<Self>, req: AddrRequest) {
        self.bus.publish(Event::Sweep(req));
    }

    async fn handle_new_asn(self: &Arc<Self>, req: AsnRequest) {
        let mut covered = self.graph.addresses_matching(req.prefix);
        for netblock in &req.netblocks {
            covered.extend(self.graph.addresses_matching(*netblock));
        }
        covered.sort();
        covered.dedup();

        for addr in covered {
            if let Err(err) = self
                .graph
                .insert_infrastructure(addr, req.asn, req.prefix, &req.description, &req.country_code)
            {
                self.bus.publish(Event::Log(format!("graph insertion abandoned: {err}")));
            }
        }
    }

    async fn deliver_output(self: &Arc<Self>, output: Output) {
        while self.paused.load(Ordering::Acquire) {
            self.pause_notify.notified().await;
        }
        let sanitized = sanitize_output(&output);
        let _ = self.output_tx.send(sanitized);
    }

    fn spawn_output_emitter(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(OUTPUT_POLL_INTERVAL).await;
                if controller.stopped.load(Ordering::Acquire) {
                    break;
                }
                for output in controller.graph.get_new_output() {
                    controller.bus.publish(Event::Output(output));
                }
            }
        })
    }

    fn spawn_termination_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(TERMINATION_POLL_INTERVAL).await;
                if controller.stopped.load(Ordering::Acquire) {
                    break;
                }
                if controller.termination_condition_met().await {
                    controller.shutdown().await;
                    break;
                }
            }
        })
    }

    async fn termination_condition_met(&self) -> bool {
        let workers = self.workers.lock().await;
        if workers.is_empty() {
            return false;
        }
        let all_idle = workers.iter().all(|w| !w.is_active());
        if !all_idle {
            return false;
        }
        let queues_empty = workers.iter().all(|w| {
            let stats = w.stats();
            stats.names_remaining == 0 && stats.addrs_remaining == 0
        });
        if !queues_empty {
            return false;
        }
        if self.inflight_resolves.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let since_last_resolve = now_ms() - self.last_resolve_activity_ms.load(Ordering::SeqCst);
        since_last_resolve >= LIVENESS_TIMEOUT.as_millis() as i64
    }

    /// Forwards pause to every registered worker and suspends output delivery.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        for handle in self.workers.lock().await.iter() {
            handle.pause().await;
        }
    }

    /// Forwards resume to every registered worker and resumes output delivery.
    pub async fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.pause_notify.notify_waiters();
        for handle in self.workers.lock().await.iter() {
            handle.resume().await;
        }
    }

    /// Reads the next output record, respecting pause. Returns `None` once
    /// the controller has shut down and no further records will arrive.
    pub async fn recv_output(&self) -> Option<Output> {
        self.output_rx.lock().await.recv().await
    }

    pub async fn stats(&self) -> EngineStats {
        let workers = self.workers.lock().await;
        let mut stats = EngineStats::default();
        for handle in workers.iter() {
            let s = handle.stats();
            stats.dns_qps += s.dns_qps;
            stats.names_remaining += s.names_remaining;
            stats.addrs_remaining += s.addrs_remaining;
        }
        stats
    }

    /// Stops every worker, the resolver pool, and the bus, and closes the
    /// graph and the output channel. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.workers.lock().await.iter() {
            let _ = handle.stop().await;
        }
        self.pool.stop();
        self.bus.stop();
        self.graph.close();

        let mut handles = self.bg_handles.lock().await;
        for h in handles.drain(..) {
            h.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig {
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
        }
    }

    #[test]
    fn timing_band_maps_to_one_token_per_delay() {
        let (max_in_flight, delay) = base_config().timing_band.params();
        assert_eq!(max_in_flight, 333);
        assert_eq!(delay, Duration::from_millis(3));
    }
}
