//! Scope predicate: which names are in-scope, and which are blacklisted
//!
//! Scope is checked in exactly one place in this port: at the moment a
//! `new-name` request is about to be published onto the bus (see
//! [`crate::worker`] and the controller's seeding path). Several variants of
//! the original tool check scope at publication in some sources and at graph
//! insertion in others; this port picks publication time and enforces it
//! everywhere, resolving the open question in the design notes.

use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// Scope filters derived from the engine configuration: root domains, a
/// blacklist, and the optional address/CIDR/ASN scope restrictions used by
/// reverse-sweep and ASN-attribution sources.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    domains: Vec<String>,
    blacklist: Vec<String>,
    addresses: Vec<IpAddr>,
    cidrs: Vec<IpNetwork>,
    asns: Vec<u32>,
}

impl ScopeFilter {
    pub fn new(
        domains: Vec<String>,
        blacklist: Vec<String>,
        addresses: Vec<IpAddr>,
        cidrs: Vec<IpNetwork>,
        asns: Vec<u32>,
    ) -> Self {
        Self {
            domains: domains.into_iter().map(|d| d.to_lowercase()).collect(),
            blacklist: blacklist.into_iter().map(|d| d.to_lowercase()).collect(),
            addresses,
            cidrs,
            asns,
        }
    }

    /// A name is in-scope iff it equals some configured root domain or has
    /// one of them as a proper DNS suffix (full-label match, case-insensitive).
    pub fn in_scope(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        self.domains.iter().any(|root| is_suffix_match(&name, root))
    }

    /// Blacklist membership is a suffix match on the lower-cased name; it
    /// wins over scope wherever both are checked.
    pub fn blacklisted(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.').to_lowercase();
        self.blacklist.iter().any(|bad| is_suffix_match(&name, bad))
    }

    /// A name passes the scope gate iff it is in scope and not blacklisted.
    pub fn admits(&self, name: &str) -> bool {
        self.in_scope(name) && !self.blacklisted(name)
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn address_in_scope(&self, addr: IpAddr) -> bool {
        self.addresses.contains(&addr) || self.cidrs.iter().any(|c| c.contains(addr))
    }

    pub fn asn_in_scope(&self, asn: u32) -> bool {
        self.asns.contains(&asn)
    }

    pub fn has_address_scope(&self) -> bool {
        !self.addresses.is_empty() || !self.cidrs.is_empty() || !self.asns.is_empty()
    }
}

/// True iff `name == root` or `name` ends with `.` + `root`, matched on full
/// labels (not a bare string suffix: `evilexample.com` must not match
/// `example.com`).
fn is_suffix_match(name: &str, root: &str) -> bool {
    if name == root {
        return true;
    }
    match name.strip_suffix(root) {
        Some(prefix) => prefix.ends_with('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(domains: &[&str], blacklist: &[&str]) -> ScopeFilter {
        ScopeFilter::new(
            domains.iter().map(|s| s.to_string()).collect(),
            blacklist.iter().map(|s| s.to_string()).collect(),
            vec![],
            vec![],
            vec![],
        )
    }

    #[test]
    fn exact_and_suffix_match() {
        let f = filter(&["example.com"], &[]);
        assert!(f.in_scope("example.com"));
        assert!(f.in_scope("EXAMPLE.COM"));
        assert!(f.in_scope("www.example.com"));
        assert!(f.in_scope("a.b.example.com"));
    }

    #[test]
    fn label_boundary_is_enforced() {
        let f = filter(&["example.com"], &[]);
        assert!(!f.in_scope("evilexample.com"));
        assert!(!f.in_scope("notexample.com"));
        assert!(!f.in_scope("example.com.evil.net"));
    }

    #[test]
    fn blacklist_wins_over_scope() {
        let f = filter(&["example.com"], &["internal.example.com"]);
        assert!(f.in_scope("host.internal.example.com"));
        assert!(f.blacklisted("host.internal.example.com"));
        assert!(!f.admits("host.internal.example.com"));
        assert!(f.admits("www.example.com"));
    }

    #[test]
    fn trailing_dot_is_ignored() {
        let f = filter(&["example.com"], &[]);
        assert!(f.in_scope("www.example.com."));
    }
}
