//! Per-instance state tracked by the balancers.

use std::collections::HashMap;
use std::time::Duration;

// Fixed-point exponential moving average, 11 fractional bits. EXP_5 is
// exp(-1/5) in that representation, giving a decay horizon of roughly five
// samples.
const FSHIFT: u32 = 11;
const FIXED_1: u64 = 1 << FSHIFT;
const EXP_5: u64 = 2014;

fn weighted_average(last: u64, exp: u64, cur: u64) -> u64 {
    (last * exp + cur * (FIXED_1 - exp)) >> FSHIFT
}

/// Response-time statistics of one node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RttStats {
    /// Most recent sample.
    pub(crate) current: Duration,
    /// Moving average over roughly the last five samples.
    pub(crate) average: Duration,
}

impl RttStats {
    /// Folds one response-time sample into the average.
    pub(crate) fn add(&mut self, rtt: Duration) {
        self.current = rtt;
        if self.average.is_zero() {
            self.average = rtt;
        } else {
            let avg = weighted_average(
                u64::try_from(self.average.as_nanos()).unwrap_or(u64::MAX),
                EXP_5,
                u64::try_from(rtt.as_nanos()).unwrap_or(u64::MAX),
            );
            self.average = Duration::from_nanos(avg);
        }
    }
}

/// Extracts a dialable `host:port` address from a registered endpoint.
///
/// Accepts bare `host:port` or any `scheme://host:port`; anything without an
/// explicit numeric port resolves to the empty string, which health checks
/// report as an error.
pub(crate) fn resolve_address(endpoint: &str) -> String {
    let rest = match endpoint.find("://") {
        Some(i) => &endpoint[i + 3..],
        None => endpoint,
    };
    match rest.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            rest.to_string()
        }
        _ => String::new(),
    }
}

/// One balanced service instance.
#[derive(Clone, Debug)]
pub(crate) struct Node {
    /// Instance key the node is registered under.
    pub(crate) key: String,
    /// Endpoint as registered, handed out to callers.
    pub(crate) url: String,
    /// Dialable address derived from the endpoint; empty if underivable.
    pub(crate) address: String,
    /// Selection weight; meaningful only to the weighted balancer.
    pub(crate) weight: u64,
    /// Health-check response times.
    pub(crate) stats: RttStats,
    /// Result of the most recent health check.
    pub(crate) healthy: bool,
    /// Times this node has been selected.
    pub(crate) hit_count: u64,
}

impl Node {
    pub(crate) fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let address = resolve_address(&url);
        Self {
            key: key.into(),
            url,
            address,
            weight: 1,
            stats: RttStats::default(),
            healthy: true,
            hit_count: 0,
        }
    }
}

/// Ordered set of nodes with by-key lookup.
///
/// Order is selection order: insertion appends, removal shifts (no swapping),
/// so rotation positions stay meaningful across membership changes.
#[derive(Debug, Default)]
pub(crate) struct NodeSet {
    nodes: Vec<Node>,
    by_key: HashMap<String, usize>,
}

impl NodeSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Node> {
        self.by_key.get(key).map(|&i| &self.nodes[i])
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.by_key.get(key).map(|&i| &mut self.nodes[i])
    }

    pub(crate) fn at(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub(crate) fn at_mut(&mut self, index: usize) -> &mut Node {
        &mut self.nodes[index]
    }

    /// Appends a node; replaces in place if the key is already present.
    pub(crate) fn push(&mut self, node: Node) {
        if let Some(&i) = self.by_key.get(&node.key) {
            self.nodes[i] = node;
        } else {
            self.by_key.insert(node.key.clone(), self.nodes.len());
            self.nodes.push(node);
        }
    }

    /// Removes a node, preserving the order of the remaining ones.
    pub(crate) fn remove(&mut self, key: &str) -> Option<Node> {
        let i = self.by_key.remove(key)?;
        let node = self.nodes.remove(i);
        for index in self.by_key.values_mut() {
            if *index > i {
                *index -= 1;
            }
        }
        Some(node)
    }

    /// Moves an existing node to the end of the order.
    pub(crate) fn move_to_end(&mut self, key: &str) {
        if let Some(node) = self.remove(key) {
            self.push(node);
        }
    }

    /// Sorts nodes by ascending average response time.
    pub(crate) fn sort_by_average(&mut self) {
        self.nodes.sort_by_key(|n| n.stats.average);
        self.by_key = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.key.clone(), i))
            .collect();
    }
}
