//! Per-resolver scoring, pacing, and liveness state
//!
//! Everything that a resolver needs to remember between queries: its score,
//! its adaptive pacing interval, and the rolling counters the 5-second
//! scoring tick and the 1-minute reset tick read and clear.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use trust_dns_resolver::TokioAsyncResolver;

/// Initial and floor/ceiling values from the resolver pool's state machine.
pub const INITIAL_SCORE: i64 = 100;
pub const USABLE_SCORE_FLOOR: i64 = 50;
pub const INITIAL_INTERVAL_MS: u64 = 55;
pub const MIN_INTERVAL_MS: u64 = 15;
pub const MAX_INTERVAL_MS: u64 = 500;
pub const RESET_INTERVAL_CAP_MS: u64 = 50;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One nameserver in the pool, along with the UDP and TCP-fallback client
/// handles used to query it.
pub struct ResolverSlot {
    pub address: SocketAddr,
    pub udp: TokioAsyncResolver,
    pub tcp: TokioAsyncResolver,

    score: AtomicI64,
    interval_ms: AtomicU64,
    last_send_ms: AtomicI64,

    attempts: AtomicU64,
    timeouts: AtomicU64,
    good_rcodes: AtomicU64,
    bad_rcodes: AtomicU64,
}

impl ResolverSlot {
    pub fn new(address: SocketAddr, udp: TokioAsyncResolver, tcp: TokioAsyncResolver) -> Self {
        Self {
            address,
            udp,
            tcp,
            score: AtomicI64::new(INITIAL_SCORE),
            interval_ms: AtomicU64::new(INITIAL_INTERVAL_MS),
            last_send_ms: AtomicI64::new(0),
            attempts: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            good_rcodes: AtomicU64::new(0),
            bad_rcodes: AtomicU64::new(0),
        }
    }

    pub fn score(&self) -> i64 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn is_usable(&self) -> bool {
        self.score() > USABLE_SCORE_FLOOR
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// A resolver is available when `now >= last_send + interval`, with a 5%
    /// random allowance to pick it anyway so the pool can never deadlock if
    /// every resolver is currently pacing.
    pub fn is_available(&self) -> bool {
        let last = self.last_send_ms.load(Ordering::Relaxed);
        let elapsed = now_ms() - last;
        if elapsed >= self.interval().as_millis() as i64 {
            return true;
        }
        rand::random::<f64>() < 0.05
    }

    pub fn mark_sent(&self) {
        self.last_send_ms.store(now_ms(), Ordering::Relaxed);
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_good_rcode(&self) {
        self.good_rcodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_bad_rcode(&self) {
        self.bad_rcodes.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the score unless `sole_usable` is set, in which case the
    /// soft floor applies and the resolver is left untouched.
    pub fn penalize(&self, sole_usable: bool) {
        if sole_usable {
            return;
        }
        self.score.fetch_sub(1, Ordering::Relaxed);
    }

    fn bump_interval(&self, delta_ms: i64) {
        let current = self.interval_ms.load(Ordering::Relaxed) as i64;
        let next = (current + delta_ms).clamp(MIN_INTERVAL_MS as i64, MAX_INTERVAL_MS as i64);
        self.interval_ms.store(next as u64, Ordering::Relaxed);
    }

    /// The 5-second scoring tick: compute the success ratio over the window
    /// and adjust score/interval per the pool's adaptive pacing rule.
    pub fn apply_scoring_tick(&self, sole_usable: bool) {
        let attempts = self.attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return;
        }
        let successes = self.good_rcodes.load(Ordering::Relaxed);
        let ratio = successes as f64 / attempts as f64;
        let interval_ms = self.interval_ms.load(Ordering::Relaxed);

        if ratio < 0.25 || interval_ms > MAX_INTERVAL_MS {
            self.penalize(sole_usable);
            self.bump_interval(25);
        } else if ratio > 0.75 && interval_ms >= MIN_INTERVAL_MS {
            self.bump_interval(-10);
        } else {
            self.bump_interval(10);
        }
    }

    /// The 1-minute tick: clear rolling counters and cap the interval.
    pub fn apply_minute_reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.good_rcodes.store(0, Ordering::Relaxed);
        self.bad_rcodes.store(0, Ordering::Relaxed);
        let capped = self.interval_ms.load(Ordering::Relaxed).min(RESET_INTERVAL_CAP_MS);
        self.interval_ms.store(capped, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slot() -> ResolverSlot {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let resolver = trust_dns_resolver::TokioAsyncResolver::tokio(
            trust_dns_resolver::config::ResolverConfig::default(),
            trust_dns_resolver::config::ResolverOpts::default(),
        );
        ResolverSlot::new(addr, resolver.clone(), resolver)
    }

    #[test]
    fn score_never_drops_below_floor_rule_when_sole_usable() {
        let slot = make_slot();
        for _ in 0..10 {
            slot.penalize(true);
        }
        assert_eq!(slot.score(), INITIAL_SCORE);
    }

    #[test]
    fn score_drops_when_not_sole_usable() {
        let slot = make_slot();
        slot.penalize(false);
        assert_eq!(slot.score(), INITIAL_SCORE - 1);
    }

    #[test]
    fn usable_iff_score_above_fifty() {
        let slot = make_slot();
        assert!(slot.is_usable());
        for _ in 0..51 {
            slot.penalize(false);
        }
        assert!(!slot.is_usable());
    }

    #[test]
    fn minute_reset_caps_interval() {
        let slot = make_slot();
        slot.interval_ms.store(200, Ordering::Relaxed);
        slot.apply_minute_reset();
        assert!(slot.interval().as_millis() as u64 <= RESET_INTERVAL_CAP_MS);
    }
}
