//! Typed error taxonomy for the enumeration engine
//!
//! The engine's propagation policy (see the error handling design) draws a
//! hard line between errors that stay inside the resolver and get retried,
//! and errors that cross an API boundary. `thiserror` models that line as
//! data instead of string matching on `anyhow` chains.

use std::net::IpAddr;
use thiserror::Error;

/// Errors produced while resolving a single query against the resolver pool.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// Timed out waiting for a response; retryable under the caller's priority.
    #[error("DNS query for {name} timed out")]
    Timeout { name: String },

    /// Server declined to answer (REFUSED/SERVFAIL/NOTIMP); retryable.
    #[error("DNS server returned {rcode} for {name}")]
    Retryable { name: String, rcode: String },

    /// Authoritative negative answer; not retryable.
    #[error("NXDOMAIN for {name}")]
    NxDomain { name: String },

    /// Answer section was empty for the requested type; not retryable.
    #[error("no records of the requested type for {name}")]
    NoRecords { name: String },

    /// Any other non-success rcode not covered above; not retryable.
    #[error("DNS server returned {rcode} for {name}")]
    Terminal { name: String, rcode: String },

    /// No usable resolver was available in the pool.
    #[error("no usable resolvers remain in the pool")]
    PoolExhausted,

    /// A reverse lookup found no PTR record.
    #[error("PTR record not found for {addr}")]
    PtrNotFound { addr: IpAddr },

    /// All resolvers consulted for a parallel/wildcard-election query failed.
    #[error("all resolvers failed for {name}: {first}")]
    AllFailed { name: String, first: String },
}

impl ResolveError {
    /// Whether this error is retryable under the resolver's own retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolveError::Timeout { .. } | ResolveError::Retryable { .. }
        )
    }
}

/// Errors that prevent the controller from starting at all. The only error
/// family permitted to abort an enumeration run.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("passive mode is incompatible with brute forcing")]
    PassiveWithBruteForce,

    #[error("passive mode is incompatible with active (AXFR) probing")]
    PassiveWithActive,

    #[error("passive mode is incompatible with a data-operations writer source")]
    PassiveWithDataOpsWriter,

    #[error("no domains were configured")]
    NoDomains,

    #[error("no resolvers remained after the sanity check")]
    EmptyResolverPool,

    #[error("invalid resolver address {0:?}")]
    InvalidResolver(String),

    #[error("invalid scope CIDR {0:?}")]
    InvalidCidr(String),
}

/// Top-level error type returned by fallible engine operations that are not
/// already covered by [`ResolveError`] or [`ConfigError`].
#[derive(Debug, Error)]
pub enum EnumError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("name {0:?} is out of scope")]
    OutOfScope(String),

    #[error("source error: {0}")]
    SourceLocal(String),

    #[error("graph error: {0}")]
    Graph(String),
}
