//! Resolver pool: selection, retries, wildcard election, and bulk operations
//!
//! All socket-level DNS mechanics (UDP send/receive, TCP fallback, 16-bit
//! transaction ids) are delegated to `trust_dns_resolver`, one instance per
//! nameserver per transport. The pool only adds the logic the resolver
//! crate doesn't have an opinion on: which nameserver to ask next, how hard
//! to retry, and when to trust an answer over a suspected wildcard.

use super::state::{now_ms, ResolverSlot};
use crate::error::{ConfigError, ResolveError};
use crate::model::Priority;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::proto::rr::RecordType;
use trust_dns_resolver::TokioAsyncResolver;

use crate::model::DnsAnswer;

const SCORING_TICK: Duration = Duration::from_secs(5);
const RESET_TICK: Duration = Duration::from_secs(60);

/// Well-known names a candidate resolver must answer correctly before it is
/// trusted with real traffic.
const SANITY_WELL_KNOWN: &[&str] = &[
    "www.google.com.",
    "www.cloudflare.com.",
    "www.microsoft.com.",
    "www.amazon.com.",
];

/// Invented names a candidate resolver must NXDOMAIN, catching resolvers
/// that answer everything (hijacking, ad-injection, captive portals).
const SANITY_INVENTED_COUNT: usize = 8;

/// A pool of sanity-checked nameservers, selected and paced per resolver.
pub struct ResolverPool {
    slots: Vec<Arc<ResolverSlot>>,
    quit_tx: broadcast::Sender<()>,
}

impl ResolverPool {
    /// Parses `addrs`, sanity-checks each candidate, and keeps only the
    /// ones that pass. Fails with [`ConfigError::EmptyResolverPool`] if none
    /// survive.
    pub async fn build(addrs: &[String]) -> Result<Arc<ResolverPool>, ConfigError> {
        let mut candidates = Vec::with_capacity(addrs.len());
        for raw in addrs {
            let addr: SocketAddr = raw
                .parse()
                .map_err(|_| ConfigError::InvalidResolver(raw.clone()))?;
            candidates.push(Arc::new(new_slot(addr)));
        }

        let mut survivors = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if sanity_check(&candidate).await {
                info!(resolver = %candidate.address, "resolver passed sanity check");
                survivors.push(candidate);
            } else {
                warn!(resolver = %candidate.address, "resolver failed sanity check, dropping");
            }
        }

        if survivors.is_empty() {
            return Err(ConfigError::EmptyResolverPool);
        }

        let (quit_tx, _) = broadcast::channel(1);
        Ok(Arc::new(ResolverPool {
            slots: survivors,
            quit_tx,
        }))
    }

    /// Starts the background scoring and reset ticks. Returns their handles
    /// so the caller can await them after [`ResolverPool::stop`].
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let scoring = {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.scoring_tick_loop().await })
        };
        let reset = {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.reset_tick_loop().await })
        };
        vec![scoring, reset]
    }

    pub fn stop(&self) {
        let _ = self.quit_tx.send(());
    }

    pub fn usable_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_usable()).count()
    }

    async fn scoring_tick_loop(self: Arc<Self>) {
        let mut quit = self.quit_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = quit.recv() => break,
                _ = sleep(SCORING_TICK) => {
                    let sole_usable = self.usable_count() <= 1;
                    for slot in &self.slots {
                        slot.apply_scoring_tick(sole_usable);
                    }
                }
            }
        }
    }

    async fn reset_tick_loop(self: Arc<Self>) {
        let mut quit = self.quit_tx.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = quit.recv() => break,
                _ = sleep(RESET_TICK) => {
                    for slot in &self.slots {
                        slot.apply_minute_reset();
                    }
                }
            }
        }
    }

    /// Uniform-random pick among usable+available resolvers; falls back to
    /// any usable resolver (ignoring pacing) if none are currently
    /// available, so a run of unlucky timing never stalls the pool.
    async fn select_slot(&self) -> Result<Arc<ResolverSlot>, ResolveError> {
        let usable: Vec<Arc<ResolverSlot>> = self
            .slots
            .iter()
            .filter(|s| s.is_usable())
            .cloned()
            .collect();
        if usable.is_empty() {
            return Err(ResolveError::PoolExhausted);
        }

        let available: Vec<&Arc<ResolverSlot>> =
            usable.iter().filter(|s| s.is_available()).collect();
        if let Some(slot) = available.choose(&mut rand::thread_rng()) {
            return Ok(Arc::clone(slot));
        }

        let slot = usable
            .choose(&mut rand::thread_rng())
            .expect("usable is non-empty");
        Ok(Arc::clone(slot))
    }

    /// Resolves `name` under `priority`'s retry policy. `Critical`/`High`
    /// queries are first offered to [`ResolverPool::resolve_with_election`]
    /// when at least three resolvers are usable.
    pub async fn resolve(
        &self,
        name: &str,
        record_type: RecordType,
        priority: Priority,
    ) -> Result<Vec<DnsAnswer>, ResolveError> {
        if priority != Priority::Low {
            if let Some(result) = self.resolve_with_election(name, record_type).await {
                return result;
            }
        }

        let (max_attempts, max_servfails, grace_secs) = priority.retry_limits();
        let mut first_error: Option<ResolveError> = None;
        let mut servfail_count = 0u32;
        let mut servfail_window_start: Option<i64> = None;

        let mut attempt: u64 = 0;
        while attempt < max_attempts as u64 {
            attempt += 1;

            let slot = match self.select_slot().await {
                Ok(slot) => slot,
                Err(_) => {
                    let delay = rand::thread_rng().gen_range(100..=1000);
                    sleep(Duration::from_millis(delay)).await;
                    continue;
                }
            };

            slot.mark_sent();
            match query_slot(&slot, name, record_type).await {
                Ok(answers) => {
                    slot.mark_good_rcode();
                    return Ok(answers);
                }
                Err(err) => {
                    match &err {
                        ResolveError::NxDomain { .. } | ResolveError::NoRecords { .. } => {
                            // Authoritative answer: the resolver itself is fine.
                            slot.mark_good_rcode();
                            return Err(err);
                        }
                        ResolveError::Timeout { .. } => {
                            slot.mark_timeout();
                            slot.mark_bad_rcode();
                        }
                        ResolveError::Retryable { .. } => {
                            slot.mark_bad_rcode();
                            let now = now_ms();
                            let window_start = *servfail_window_start.get_or_insert(now);
                            if now - window_start > grace_secs as i64 * 1000 {
                                servfail_window_start = Some(now);
                                servfail_count = 0;
                            }
                            servfail_count += 1;
                            if servfail_count > max_servfails {
                                return Err(err);
                            }
                            // Halfway to the SERVFAIL limit, back off hard
                            // instead of hammering a server that is likely
                            // rate-limiting or load-shedding us.
                            if max_servfails > 0 && servfail_count == max_servfails / 2 {
                                let jitter_ms = rand::thread_rng().gen_range(3000..=5000);
                                sleep(Duration::from_millis(jitter_ms)).await;
                            }
                        }
                        _ => {
                            slot.mark_bad_rcode();
                            return Err(err);
                        }
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        Err(first_error.unwrap_or(ResolveError::PoolExhausted))
    }

    /// Queries three distinct usable resolvers in parallel and accepts
    /// whichever answer at least two of them agree on, penalizing any
    /// resolver whose answer was the lone outlier. Returns `None` when
    /// fewer than three resolvers are usable, so the caller falls back to
    /// [`ResolverPool::resolve`]'s single-resolver retry path.
    async fn resolve_with_election(
        &self,
        name: &str,
        record_type: RecordType,
    ) -> Option<Result<Vec<DnsAnswer>, ResolveError>> {
        let usable: Vec<Arc<ResolverSlot>> = self
            .slots
            .iter()
            .filter(|s| s.is_usable())
            .cloned()
            .collect();
        if usable.len() < 3 {
            return None;
        }

        let chosen: Vec<Arc<ResolverSlot>> = usable
            .choose_multiple(&mut rand::thread_rng(), 3)
            .cloned()
            .collect();

        let results = futures::future::join_all(chosen.iter().map(|slot| {
            let slot = Arc::clone(slot);
            let name = name.to_string();
            async move {
                slot.mark_sent();
                let res = query_slot(&slot, &name, record_type).await;
                (slot, res)
            }
        }))
        .await;

        let answer_sets: Vec<&[DnsAnswer]> = results
            .iter()
            .map(|(_, res)| res.as_deref().unwrap_or(&[]))
            .collect();
        let datum_counts = tally_answer_data(&answer_sets);
        let accepted = accepted_data(&answer_sets, &datum_counts);

        if accepted.is_empty() {
            for (slot, _) in &results {
                slot.mark_bad_rcode();
            }
            return Some(
                results
                    .into_iter()
                    .map(|(_, r)| r)
                    .find(|r| r.is_ok())
                    .unwrap_or(Err(ResolveError::AllFailed {
                        name: name.to_string(),
                        first: "no consensus among election resolvers".to_string(),
                    })),
            );
        }

        for (slot, res) in &results {
            let Ok(answers) = res else { continue };
            let all_in_consensus = !answers.is_empty()
                && answers
                    .iter()
                    .all(|a| datum_counts.get(a.data.as_str()).copied().unwrap_or(0) >= 2);
            if all_in_consensus || answers.is_empty() {
                slot.mark_good_rcode();
            } else {
                slot.mark_bad_rcode();
                slot.penalize(false);
            }
        }
        Some(Ok(accepted))
    }

    /// Reverse lookup. Returns the formatted PTR query name alongside the
    /// resolved host name, per the `(ptr-name, name)` pair the reverse
    /// sweep source needs to attribute a PTR answer back to its query.
    pub async fn reverse_dns(&self, addr: IpAddr) -> Result<(String, String), ResolveError> {
        let ptr_name = ptr_query_name(addr);
        let slot = self.select_slot().await?;
        slot.mark_sent();
        match slot.udp.reverse_lookup(addr).await {
            Ok(lookup) => {
                slot.mark_good_rcode();
                lookup
                    .iter()
                    .next()
                    .map(|name| (ptr_name.clone(), name.to_string().trim_end_matches('.').to_string()))
                    .ok_or(ResolveError::PtrNotFound { addr })
            }
            Err(err) => {
                slot.mark_bad_rcode();
                Err(classify_error(&addr.to_string(), &err))
            }
        }
    }

    /// AXFR zone transfer against a specific resolver. Always goes over
    /// TCP, as AXFR requires.
    pub async fn zone_transfer(&self, domain: &str) -> Result<Vec<DnsAnswer>, ResolveError> {
        let slot = self.select_slot().await?;
        slot.mark_sent();
        let result = query_slot_tcp(&slot, domain, RecordType::AXFR).await;
        match &result {
            Ok(_) => slot.mark_good_rcode(),
            Err(_) => slot.mark_bad_rcode(),
        }
        result
    }

    /// Walks an NSEC chain starting at `domain`, stopping when the chain
    /// cycles back to an already-visited owner name.
    pub async fn nsec_walk(&self, domain: &str) -> Result<Vec<DnsAnswer>, ResolveError> {
        let slot = self.select_slot().await?;
        let mut collected = Vec::new();
        let mut current = domain.to_string();
        let mut seen = HashSet::new();

        loop {
            if !seen.insert(current.clone()) {
                break;
            }
            slot.mark_sent();
            let answers = match query_slot(&slot, &current, RecordType::NSEC).await {
                Ok(answers) => {
                    slot.mark_good_rcode();
                    answers
                }
                Err(_) => {
                    slot.mark_bad_rcode();
                    break;
                }
            };
            if answers.is_empty() {
                break;
            }
            let next = answers[0].data.split_whitespace().next().map(str::to_string);
            collected.extend(answers);
            match next {
                Some(n) if n != current => current = n,
                _ => break,
            }
        }
        Ok(collected)
    }
}

/// Counts, across all resolvers' answer sets, how many sets each distinct
/// `data` value appears in. A datum repeated within one resolver's own
/// answer set only counts once for that resolver.
fn tally_answer_data<'a>(answer_sets: &[&'a [DnsAnswer]]) -> HashMap<&'a str, usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for answers in answer_sets {
        let mut seen_in_set = HashSet::new();
        for answer in *answers {
            if seen_in_set.insert(answer.data.as_str()) {
                *counts.entry(answer.data.as_str()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Accepts every datum that reached consensus (count >= 2), keeping the
/// first `DnsAnswer` carrying it. Order of the accepted data is otherwise
/// unspecified.
fn accepted_data(answer_sets: &[&[DnsAnswer]], counts: &HashMap<&str, usize>) -> Vec<DnsAnswer> {
    let mut accepted = Vec::new();
    let mut taken = HashSet::new();
    for answers in answer_sets {
        for answer in *answers {
            let data = answer.data.as_str();
            if counts.get(data).copied().unwrap_or(0) >= 2 && taken.insert(data) {
                accepted.push(answer.clone());
            }
        }
    }
    accepted
}

/// Formats the reverse-DNS query name for `addr`: dotted-reversed octets
/// under `in-addr.arpa` for IPv4, 32 reversed nibbles under `ip6.arpa` for
/// IPv6. Matches the reverse-lookup owner names a nameserver would be
/// asked for `PTR` directly.
fn ptr_query_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            )
        }
        IpAddr::V6(v6) => {
            let segments = v6.octets();
            let nibbles: Vec<String> = segments
                .iter()
                .rev()
                .flat_map(|byte| vec![format!("{:x}", byte & 0x0f), format!("{:x}", byte >> 4)])
                .collect();
            format!("{}.ip6.arpa", nibbles.join("."))
        }
    }
}

fn new_slot(addr: SocketAddr) -> ResolverSlot {
    let mut opts = ResolverOpts::default();
    opts.timeout = Duration::from_secs(2);
    opts.attempts = 1;

    let udp = TokioAsyncResolver::tokio(name_server_config(addr, Protocol::Udp), opts.clone());
    let tcp = TokioAsyncResolver::tokio(name_server_config(addr, Protocol::Tcp), opts);
    ResolverSlot::new(addr, udp, tcp)
}

fn name_server_config(addr: SocketAddr, protocol: Protocol) -> ResolverConfig {
    let mut cfg = ResolverConfig::new();
    cfg.add_name_server(NameServerConfig {
        socket_addr: addr,
        protocol,
        tls_dns_name: None,
        trust_negative_responses: true,
        bind_addr: None,
    });
    cfg
}

async fn sanity_check(candidate: &ResolverSlot) -> bool {
    for host in SANITY_WELL_KNOWN {
        if query_slot(candidate, host, RecordType::A).await.is_err() {
            return false;
        }
    }
    for _ in 0..SANITY_INVENTED_COUNT {
        let invented = format!("{}.invalid-sanity-check.test.", uuid::Uuid::new_v4().simple());
        match query_slot(candidate, &invented, RecordType::A).await {
            Err(ResolveError::NxDomain { .. }) => {}
            _ => return false,
        }
    }
    true
}

async fn query_slot(
    slot: &ResolverSlot,
    name: &str,
    record_type: RecordType,
) -> Result<Vec<DnsAnswer>, ResolveError> {
    match slot.udp.lookup(name, record_type).await {
        Ok(lookup) => Ok(answers_from_lookup(lookup)),
        Err(err) => Err(classify_error(name, &err)),
    }
}

async fn query_slot_tcp(
    slot: &ResolverSlot,
    name: &str,
    record_type: RecordType,
) -> Result<Vec<DnsAnswer>, ResolveError> {
    match slot.tcp.lookup(name, record_type).await {
        Ok(lookup) => Ok(answers_from_lookup(lookup)),
        Err(err) => Err(classify_error(name, &err)),
    }
}

fn answers_from_lookup(lookup: trust_dns_resolver::lookup::Lookup) -> Vec<DnsAnswer> {
    lookup
        .record_iter()
        .map(|r| DnsAnswer {
            name: r.name().to_string(),
            record_type: r.record_type(),
            ttl: r.ttl(),
            data: r
                .data()
                .map(|d| d.to_string())
                .unwrap_or_default(),
        })
        .collect()
}

fn classify_error(name: &str, err: &trust_dns_resolver::error::ResolveError) -> ResolveError {
    use trust_dns_resolver::error::ResolveErrorKind;
    use trust_dns_resolver::proto::op::ResponseCode;

    match err.kind() {
        ResolveErrorKind::Timeout => ResolveError::Timeout {
            name: name.to_string(),
        },
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match *response_code {
            ResponseCode::NXDomain => ResolveError::NxDomain {
                name: name.to_string(),
            },
            ResponseCode::ServFail | ResponseCode::Refused | ResponseCode::NotImp => {
                ResolveError::Retryable {
                    name: name.to_string(),
                    rcode: format!("{response_code:?}"),
                }
            }
            ResponseCode::NoError => ResolveError::NoRecords {
                name: name.to_string(),
            },
            other => ResolveError::Terminal {
                name: name.to_string(),
                rcode: format!("{other:?}"),
            },
        },
        _ => ResolveError::Terminal {
            name: name.to_string(),
            rcode: err.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanity_lists_are_nonempty_and_distinct_in_spirit() {
        assert_eq!(SANITY_WELL_KNOWN.len(), 4);
        assert_eq!(SANITY_INVENTED_COUNT, 8);
        assert!(SANITY_WELL_KNOWN.iter().all(|h| h.ends_with('.')));
    }

    #[test]
    fn ptr_query_name_formats_ipv4_reversed_octets() {
        let addr: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(ptr_query_name(addr), "7.2.0.192.in-addr.arpa");
    }

    #[test]
    fn ptr_query_name_formats_ipv6_as_32_reversed_nibbles() {
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        let name = ptr_query_name(addr);
        assert!(name.ends_with(".ip6.arpa"));
        let nibbles: Vec<&str> = name.trim_end_matches(".ip6.arpa").split('.').collect();
        assert_eq!(nibbles.len(), 32);
        assert_eq!(nibbles[0], "1");
        assert_eq!(nibbles[31], "2");
    }

    fn answer(data: &str) -> DnsAnswer {
        DnsAnswer {
            name: "host.example.com".to_string(),
            record_type: RecordType::A,
            ttl: 300,
            data: data.to_string(),
        }
    }

    #[test]
    fn election_accepts_data_in_at_least_two_of_three_answer_sets() {
        let r1 = vec![answer("X"), answer("Y")];
        let r2 = vec![answer("Y"), answer("Z")];
        let r3 = vec![answer("Y")];
        let answer_sets: Vec<&[DnsAnswer]> = vec![&r1, &r2, &r3];

        let counts = tally_answer_data(&answer_sets);
        assert_eq!(counts.get("X"), Some(&1));
        assert_eq!(counts.get("Y"), Some(&3));
        assert_eq!(counts.get("Z"), Some(&1));

        let accepted = accepted_data(&answer_sets, &counts);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].data, "Y");
    }

    #[test]
    fn election_finds_no_consensus_when_every_answer_is_unique() {
        let r1 = vec![answer("X")];
        let r2 = vec![answer("Y")];
        let r3 = vec![answer("Z")];
        let answer_sets: Vec<&[DnsAnswer]> = vec![&r1, &r2, &r3];

        let counts = tally_answer_data(&answer_sets);
        let accepted = accepted_data(&answer_sets, &counts);
        assert!(accepted.is_empty());
    }
}
