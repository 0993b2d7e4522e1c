//! Shared request/result types that flow across the event bus
//!
//! These are the typed payloads carried by the well-known bus topics. They
//! are intentionally plain data: cloneable, serializable, and free of any
//! reference back into the graph or the resolver pool (ownership of those
//! stays with the controller, see the concurrency and resource model).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use trust_dns_resolver::proto::rr::RecordType;

/// Priority band attached to a resolve request. Governs retry behavior and
/// whether wildcard election is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Low,
}

impl Priority {
    /// `(max_attempts, max_servfails, servfail_grace_secs)` per the resolver
    /// pool's retry policy. `Critical` retries indefinitely, represented by
    /// `u32::MAX`.
    pub fn retry_limits(self) -> (u32, u32, u64) {
        match self {
            Priority::Critical => (u32::MAX, u32::MAX, 0),
            Priority::High => (50, 10, 60),
            Priority::Low => (25, 6, 60),
        }
    }
}

/// Tags attached to every finding, identifying how it was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Alt,
    Archive,
    Api,
    Axfr,
    Brute,
    Cert,
    Dns,
    Scrape,
}

impl Tag {
    /// Whether this tag's origin is trusted enough to accept over wildcard
    /// DNS, i.e. the set `{archive, axfr, cert, dns}` from the glossary.
    pub fn is_trusted(self) -> bool {
        matches!(self, Tag::Archive | Tag::Axfr | Tag::Cert | Tag::Dns)
    }
}

/// A single DNS resource record returned by a resolve operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub name: String,
    #[serde(with = "record_type_as_u16")]
    pub record_type: RecordType,
    pub ttl: u32,
    pub data: String,
}

mod record_type_as_u16 {
    use serde::{Deserialize, Deserializer, Serializer};
    use trust_dns_resolver::proto::rr::RecordType;

    pub fn serialize<S: Serializer>(rt: &RecordType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(u16::from(*rt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<RecordType, D::Error> {
        let raw = u16::deserialize(d)?;
        Ok(RecordType::from(raw))
    }
}

/// A name discovered or resolved by a data source, carried on `new-name` and
/// `resolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsRequest {
    pub name: String,
    pub domain: String,
    pub records: Vec<DnsAnswer>,
    pub tag: Tag,
    pub source: String,
}

impl DnsRequest {
    pub fn new(name: impl Into<String>, domain: impl Into<String>, tag: Tag, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            domain: domain.into(),
            records: Vec::new(),
            tag,
            source: source.into(),
        }
    }

    pub fn with_records(mut self, records: Vec<DnsAnswer>) -> Self {
        self.records = records;
        self
    }
}

/// A fresh IP address to be attributed to a netblock/ASN, carried on
/// `new-address`, `sweep`, and `active-cert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrRequest {
    pub address: IpAddr,
    pub domain: String,
    pub tag: Tag,
    pub source: String,
}

/// ASN/prefix assignment observed by a source, carried on `new-asn`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnRequest {
    pub asn: u32,
    pub prefix: ipnetwork::IpNetwork,
    pub country_code: String,
    pub description: String,
    pub netblocks: Vec<ipnetwork::IpNetwork>,
    pub tag: Tag,
    pub source: String,
}

/// New domains associated with an existing one, discovered via WHOIS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoisRequest {
    pub domain: String,
    pub new_domains: Vec<String>,
    pub tag: Tag,
    pub source: String,
}

/// Per-address attribution attached to an [`Output`] record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: IpAddr,
    pub netblock: ipnetwork::IpNetwork,
    pub asn: u32,
    pub description: String,
}

/// A single, fully-attributed finding, emitted once per subdomain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub timestamp: u64,
    pub name: String,
    pub domain: String,
    pub addresses: Vec<AddressInfo>,
    pub tag: Tag,
    pub source: String,
}
