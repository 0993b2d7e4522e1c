//! Finding graph: the in-memory relationship store and its incremental
//! output derivation
//!
//! Nodes and edges are append-only, each carrying a monotonic integer id
//! that is never reused. A coarse lock guards structural changes (node and
//! edge creation, the typed name/address/cidr/number indexes, adjacency);
//! each node's own [`std::sync::Mutex`] entry in `nodes` guards its
//! properties (including the "sent" emission flag), so `get_new_output`
//! never has to hold the structural lock across a per-node write it
//! doesn't also need for adjacency.
//!
//! Cyclic structure (domain/subdomain dual-labeling, CNAME chains that loop
//! back on themselves) is handled by indexing nodes by integer id rather
//! than holding back-references, and by the CNAME walk's `next == current`
//! stop condition.

use crate::model::{AddressInfo, Output, Tag};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    RootOf,
    CnameTo,
    ATo,
    AaaaTo,
    PtrTo,
    NsTo,
    MxTo,
    ServiceFor,
    SrvTo,
    Contains,
    HasPrefix,
}

struct Edge {
    #[allow(dead_code)]
    id: u64,
    #[allow(dead_code)]
    from: u64,
    #[allow(dead_code)]
    to: u64,
    #[allow(dead_code)]
    label: EdgeLabel,
}

/// Per-node data. `Subdomain` also represents `Domain` nodes (`is_domain`
/// set) and NS/MX owner names, matching the spec's dual-labeling of those
/// as both a role-specific type and a plain subdomain.
enum NodePayload {
    Subdomain {
        name: String,
        domain: String,
        #[allow(dead_code)]
        is_domain: bool,
        tag: Tag,
        source: String,
        sent: bool,
    },
    Address {
        addr: IpAddr,
    },
    Ptr {
        #[allow(dead_code)]
        name: String,
        #[allow(dead_code)]
        domain: String,
    },
    Netblock {
        cidr: IpNetwork,
    },
    Asn {
        number: u32,
        description: String,
        #[allow(dead_code)]
        country_code: String,
    },
}

#[derive(Default)]
struct Structural {
    edges: Vec<Edge>,
    out_adj: HashMap<u64, HashSet<(u64, EdgeLabel)>>,
    in_adj: HashMap<u64, HashSet<(u64, EdgeLabel)>>,
    domains: HashMap<String, u64>,
    subdomains: HashMap<String, u64>,
    addresses: HashMap<IpAddr, u64>,
    ptrs: HashMap<String, u64>,
    netblocks: HashMap<IpNetwork, u64>,
    asns: HashMap<u32, u64>,
    next_node_id: u64,
    next_edge_id: u64,
}

/// The in-memory labeled multigraph of domains, subdomains, addresses,
/// PTRs, netblocks, and ASNs, plus the incremental output it derives.
pub struct FindingGraph {
    structural: Mutex<Structural>,
    nodes: DashMap<u64, Mutex<NodePayload>>,
}

impl Default for FindingGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl FindingGraph {
    pub fn new() -> Self {
        Self {
            structural: Mutex::new(Structural::default()),
            nodes: DashMap::new(),
        }
    }

    fn alloc_node(&self, structural: &mut Structural, payload: NodePayload) -> u64 {
        let id = structural.next_node_id;
        structural.next_node_id += 1;
        self.nodes.insert(id, Mutex::new(payload));
        id
    }

    fn add_edge(&self, structural: &mut Structural, from: u64, to: u64, label: EdgeLabel) {
        let exists = structural
            .out_adj
            .get(&from)
            .map(|adj| adj.contains(&(to, label)))
            .unwrap_or(false);
        if exists {
            return;
        }
        structural.out_adj.entry(from).or_default().insert((to, label));
        structural.in_adj.entry(to).or_default().insert((from, label));
        let id = structural.next_edge_id;
        structural.next_edge_id += 1;
        structural.edges.push(Edge { id, from, to, label });
    }

    fn ensure_domain(&self, structural: &mut Structural, domain: &str, tag: Tag, source: &str) -> u64 {
        if let Some(&id) = structural.domains.get(domain) {
            return id;
        }
        let id = self.alloc_node(
            structural,
            NodePayload::Subdomain {
                name: domain.to_string(),
                domain: domain.to_string(),
                is_domain: true,
                tag,
                source: source.to_string(),
                sent: false,
            },
        );
        structural.domains.insert(domain.to_string(), id);
        structural.subdomains.insert(domain.to_string(), id);
        id
    }

    fn ensure_subdomain(&self, structural: &mut Structural, name: &str, domain: &str, tag: Tag, source: &str) -> u64 {
        if let Some(&id) = structural.subdomains.get(name) {
            return id;
        }
        let id = self.alloc_node(
            structural,
            NodePayload::Subdomain {
                name: name.to_string(),
                domain: domain.to_string(),
                is_domain: false,
                tag,
                source: source.to_string(),
                sent: false,
            },
        );
        structural.subdomains.insert(name.to_string(), id);
        id
    }

    fn ensure_address(&self, structural: &mut Structural, addr: IpAddr) -> u64 {
        if let Some(&id) = structural.addresses.get(&addr) {
            return id;
        }
        let id = self.alloc_node(structural, NodePayload::Address { addr });
        structural.addresses.insert(addr, id);
        id
    }

    fn ensure_ptr(&self, structural: &mut Structural, name: &str, domain: &str) -> u64 {
        if let Some(&id) = structural.ptrs.get(name) {
            return id;
        }
        let id = self.alloc_node(
            structural,
            NodePayload::Ptr {
                name: name.to_string(),
                domain: domain.to_string(),
            },
        );
        structural.ptrs.insert(name.to_string(), id);
        id
    }

    fn ensure_netblock(&self, structural: &mut Structural, cidr: IpNetwork) -> u64 {
        if let Some(&id) = structural.netblocks.get(&cidr) {
            return id;
        }
        let id = self.alloc_node(structural, NodePayload::Netblock { cidr });
        structural.netblocks.insert(cidr, id);
        id
    }

    fn ensure_asn(&self, structural: &mut Structural, number: u32, description: &str, country_code: &str) -> u64 {
        if let Some(&id) = structural.asns.get(&number) {
            return id;
        }
        let id = self.alloc_node(
            structural,
            NodePayload::Asn {
                number,
                description: description.to_string(),
                country_code: country_code.to_string(),
            },
        );
        structural.asns.insert(number, id);
        id
    }

    pub fn insert_domain(&self, domain: &str, tag: Tag, source: &str) -> u64 {
        let mut structural = self.structural.lock().unwrap();
        self.ensure_domain(&mut structural, domain, tag, source)
    }

    pub fn insert_subdomain(&self, name: &str, domain: &str, tag: Tag, source: &str) -> u64 {
        let mut structural = self.structural.lock().unwrap();
        let domain_id = self.ensure_domain(&mut structural, domain, tag, source);
        let sub_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        self.add_edge(&mut structural, domain_id, sub_id, EdgeLabel::RootOf);
        sub_id
    }

    pub fn insert_cname(
        &self,
        name: &str,
        domain: &str,
        target: &str,
        target_domain: &str,
        tag: Tag,
        source: &str,
    ) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let t_id = self.ensure_subdomain(&mut structural, target, target_domain, tag, source);
        self.add_edge(&mut structural, n_id, t_id, EdgeLabel::CnameTo);
        (n_id, t_id)
    }

    pub fn insert_a(&self, name: &str, domain: &str, addr: Ipv4Addr, tag: Tag, source: &str) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let a_id = self.ensure_address(&mut structural, IpAddr::V4(addr));
        self.add_edge(&mut structural, n_id, a_id, EdgeLabel::ATo);
        (n_id, a_id)
    }

    pub fn insert_aaaa(&self, name: &str, domain: &str, addr: Ipv6Addr, tag: Tag, source: &str) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let a_id = self.ensure_address(&mut structural, IpAddr::V6(addr));
        self.add_edge(&mut structural, n_id, a_id, EdgeLabel::AaaaTo);
        (n_id, a_id)
    }

    pub fn insert_ptr(
        &self,
        name: &str,
        domain: &str,
        target: &str,
        target_domain: &str,
        tag: Tag,
        source: &str,
    ) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let ptr_id = self.ensure_ptr(&mut structural, name, domain);
        let target_id = self.ensure_subdomain(&mut structural, target, target_domain, tag, source);
        self.add_edge(&mut structural, ptr_id, target_id, EdgeLabel::PtrTo);
        (ptr_id, target_id)
    }

    pub fn insert_ns(
        &self,
        name: &str,
        domain: &str,
        ns: &str,
        ns_domain: &str,
        tag: Tag,
        source: &str,
    ) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let ns_id = self.ensure_subdomain(&mut structural, ns, ns_domain, tag, source);
        self.add_edge(&mut structural, n_id, ns_id, EdgeLabel::NsTo);
        if ns_domain != domain {
            let ns_domain_id = self.ensure_domain(&mut structural, ns_domain, tag, source);
            self.add_edge(&mut structural, ns_domain_id, ns_id, EdgeLabel::RootOf);
        }
        (n_id, ns_id)
    }

    pub fn insert_mx(
        &self,
        name: &str,
        domain: &str,
        mx: &str,
        mx_domain: &str,
        tag: Tag,
        source: &str,
    ) -> (u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let mx_id = self.ensure_subdomain(&mut structural, mx, mx_domain, tag, source);
        self.add_edge(&mut structural, n_id, mx_id, EdgeLabel::MxTo);
        if mx_domain != domain {
            let mx_domain_id = self.ensure_domain(&mut structural, mx_domain, tag, source);
            self.add_edge(&mut structural, mx_domain_id, mx_id, EdgeLabel::RootOf);
        }
        (n_id, mx_id)
    }

    /// `service` is the SRV owner name (e.g. `_sip._tcp.example.com`);
    /// `name` is the name the service was requested for; `target` is the
    /// SRV record's target host.
    pub fn insert_srv(
        &self,
        name: &str,
        domain: &str,
        service: &str,
        target: &str,
        target_domain: &str,
        tag: Tag,
        source: &str,
    ) -> (u64, u64, u64) {
        let mut structural = self.structural.lock().unwrap();
        let domain_id = self.ensure_domain(&mut structural, domain, tag, source);
        let n_id = self.ensure_subdomain(&mut structural, name, domain, tag, source);
        let service_id = self.ensure_subdomain(&mut structural, service, domain, tag, source);
        let target_id = self.ensure_subdomain(&mut structural, target, target_domain, tag, source);
        self.add_edge(&mut structural, domain_id, service_id, EdgeLabel::RootOf);
        self.add_edge(&mut structural, service_id, n_id, EdgeLabel::ServiceFor);
        self.add_edge(&mut structural, service_id, target_id, EdgeLabel::SrvTo);
        (service_id, n_id, target_id)
    }

    /// Fails if `addr` has not already been inserted via
    /// [`FindingGraph::insert_a`]/[`FindingGraph::insert_aaaa`]; the caller
    /// logs the error and abandons the insertion, per the error handling
    /// design's treatment of graph edge-target-missing errors.
    pub fn insert_infrastructure(
        &self,
        addr: IpAddr,
        asn: u32,
        cidr: IpNetwork,
        description: &str,
        country_code: &str,
    ) -> Result<(u64, u64), String> {
        let mut structural = self.structural.lock().unwrap();
        let addr_id = match structural.addresses.get(&addr) {
            Some(&id) => id,
            None => return Err(format!("address {addr} not yet present in graph")),
        };
        let netblock_id = self.ensure_netblock(&mut structural, cidr);
        let asn_id = self.ensure_asn(&mut structural, asn, description, country_code);
        self.add_edge(&mut structural, netblock_id, addr_id, EdgeLabel::Contains);
        self.add_edge(&mut structural, asn_id, netblock_id, EdgeLabel::HasPrefix);
        Ok((netblock_id, asn_id))
    }

    /// Walks outgoing `A_TO`/`AAAA_TO` edges at every hop of a `CNAME_TO`
    /// chain starting at `start`, stopping when the chain has no further
    /// `CNAME_TO` edge or loops back on an already-visited node.
    fn terminal_addresses(structural: &Structural, start: u64) -> Vec<u64> {
        let mut addrs = Vec::new();
        let mut current = start;
        let mut visited = HashSet::new();

        loop {
            if !visited.insert(current) {
                break;
            }
            let adj = match structural.out_adj.get(&current) {
                Some(adj) => adj,
                None => break,
            };
            for (to, label) in adj {
                if *label == EdgeLabel::ATo || *label == EdgeLabel::AaaaTo {
                    addrs.push(*to);
                }
            }
            let next = adj
                .iter()
                .find(|(_, label)| *label == EdgeLabel::CnameTo)
                .map(|(to, _)| *to);
            match next {
                Some(next) if next != current => current = next,
                _ => break,
            }
        }
        addrs
    }

    /// Returns one [`Output`] per subdomain newly satisfying the
    /// completeness predicate: reachable `A`/`AAAA` address, that address's
    /// containing netblock, and that netblock's ASN attribution. Already-
    /// emitted subdomains (tracked by the node-local `sent` flag) are
    /// skipped, so repeated calls only return genuinely new findings.
    pub fn get_new_output(&self) -> Vec<Output> {
        let structural = self.structural.lock().unwrap();
        let mut results = Vec::new();

        let candidate_ids: Vec<u64> = structural.subdomains.values().copied().collect();

        for id in candidate_ids {
            let Some(entry) = self.nodes.get(&id) else { continue };
            let (name, domain, tag, source, already_sent) = {
                let payload = entry.lock().unwrap();
                match &*payload {
                    NodePayload::Subdomain {
                        name,
                        domain,
                        tag,
                        source,
                        sent,
                        ..
                    } => (name.clone(), domain.clone(), *tag, source.clone(), *sent),
                    _ => continue,
                }
            };
            drop(entry);

            if already_sent {
                continue;
            }

            let addr_ids = Self::terminal_addresses(&structural, id);
            if addr_ids.is_empty() {
                continue;
            }

            let mut infos = Vec::new();
            for addr_id in addr_ids {
                let addr = match self.nodes.get(&addr_id) {
                    Some(e) => match &*e.lock().unwrap() {
                        NodePayload::Address { addr } => *addr,
                        _ => continue,
                    },
                    None => continue,
                };

                let netblock_ids: Vec<u64> = structural
                    .in_adj
                    .get(&addr_id)
                    .into_iter()
                    .flatten()
                    .filter(|(_, label)| *label == EdgeLabel::Contains)
                    .map(|(from, _)| *from)
                    .collect();

                for netblock_id in netblock_ids {
                    let cidr = match self.nodes.get(&netblock_id) {
                        Some(e) => match &*e.lock().unwrap() {
                            NodePayload::Netblock { cidr } => *cidr,
                            _ => continue,
                        },
                        None => continue,
                    };

                    let asn_ids: Vec<u64> = structural
                        .in_adj
                        .get(&netblock_id)
                        .into_iter()
                        .flatten()
                        .filter(|(_, label)| *label == EdgeLabel::HasPrefix)
                        .map(|(from, _)| *from)
                        .collect();

                    for asn_id in asn_ids {
                        if let Some(e) = self.nodes.get(&asn_id) {
                            if let NodePayload::Asn { number, description, .. } = &*e.lock().unwrap() {
                                infos.push(AddressInfo {
                                    address: addr,
                                    netblock: cidr,
                                    asn: *number,
                                    description: description.clone(),
                                });
                            }
                        }
                    }
                }
            }

            if infos.is_empty() {
                continue;
            }

            if let Some(entry) = self.nodes.get(&id) {
                if let NodePayload::Subdomain { sent, .. } = &mut *entry.lock().unwrap() {
                    *sent = true;
                }
            }

            results.push(Output {
                timestamp: now_ms(),
                name,
                domain,
                addresses: infos,
                tag,
                source,
            });
        }

        results
    }

    /// Addresses already known to the graph that fall within `cidr`, used to
    /// retroactively attribute a newly observed ASN/prefix assignment to
    /// addresses inserted before the assignment arrived.
    pub fn addresses_matching(&self, cidr: IpNetwork) -> Vec<IpAddr> {
        let structural = self.structural.lock().unwrap();
        structural
            .addresses
            .keys()
            .filter(|addr| cidr.contains(**addr))
            .copied()
            .collect()
    }

    /// No-op: the graph holds no external resources. Present to satisfy the
    /// storage contract so a persistent implementation can be swapped in.
    pub fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use std::net::Ipv4Addr;

    #[test]
    fn duplicate_edges_are_suppressed() {
        let graph = FindingGraph::new();
        graph.insert_domain("example.com", Tag::Dns, "test");
        graph.insert_subdomain("www.example.com", "example.com", Tag::Dns, "test");
        graph.insert_subdomain("www.example.com", "example.com", Tag::Dns, "test");

        let structural = graph.structural.lock().unwrap();
        let domain_id = structural.domains["example.com"];
        let edge_count = structural
            .out_adj
            .get(&domain_id)
            .map(|adj| adj.len())
            .unwrap_or(0);
        assert_eq!(edge_count, 1);
    }

    #[test]
    fn cname_cycle_terminates() {
        let graph = FindingGraph::new();
        graph.insert_domain("example.com", Tag::Dns, "test");
        graph.insert_cname("a.example.com", "example.com", "b.example.com", "example.com", Tag::Dns, "test");
        graph.insert_cname("b.example.com", "example.com", "a.example.com", "example.com", Tag::Dns, "test");

        // Should terminate rather than loop forever; no addresses means no output.
        assert!(graph.get_new_output().is_empty());
    }

    #[test]
    fn output_completeness_and_no_repeat_emission() {
        let graph = FindingGraph::new();
        graph.insert_domain("example.com", Tag::Dns, "test");
        graph.insert_a(
            "www.example.com",
            "example.com",
            Ipv4Addr::new(1, 2, 3, 4),
            Tag::Dns,
            "test",
        );
        let cidr: IpNetwork = "1.2.3.0/24".parse().unwrap();
        graph
            .insert_infrastructure(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 64500, cidr, "AS-TEST", "US")
            .unwrap();

        let first = graph.get_new_output();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].name, "www.example.com");
        assert_eq!(first[0].addresses.len(), 1);
        assert_eq!(first[0].addresses[0].asn, 64500);

        let second = graph.get_new_output();
        assert!(second.is_empty());
    }

    #[test]
    fn infrastructure_before_address_is_rejected() {
        let graph = FindingGraph::new();
        let cidr: IpNetwork = "1.2.3.0/24".parse().unwrap();
        let result = graph.insert_infrastructure(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 1, cidr, "x", "US");
        assert!(result.is_err());
    }
}
