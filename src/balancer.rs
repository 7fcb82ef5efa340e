//! Common surface shared by all balancers.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::locator::{EndpointType, LocationFilter};
use crate::node::Node;

/// Returned by [`LoadBalancer::next`] when no instance can be handed out.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{balancer}: no service available")]
pub struct NoServiceAvailable {
    /// Name of the balancer that had nothing to offer.
    pub balancer: String,
}

/// Selection algorithm to run for a balanced service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BalancerType {
    /// Equal-share rotation.
    #[default]
    RoundRobin,
    /// Response-time-weighted rotation driven by health checks.
    WeightedRoundRobin,
}

/// Timing knobs of a balancer's background work.
#[derive(Clone, Debug)]
pub struct BalancerTiming {
    /// How long [`LoadBalancer::next`] waits for the first discovery data
    /// before giving up on initialization and answering with whatever is
    /// known (usually nothing).
    pub init_timeout: Duration,
    /// Pause between health-check rounds.
    pub healthcheck_interval: Duration,
    /// Timeout of one health-check probe.
    pub healthcheck_timeout: Duration,
    /// Response time charged to a node whose probe failed. Large enough to
    /// push the node's weight to the floor.
    pub max_response_time: Duration,
}

impl Default for BalancerTiming {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_millis(500),
            healthcheck_interval: Duration::from_secs(1),
            healthcheck_timeout: Duration::from_millis(500),
            max_response_time: Duration::from_secs(60),
        }
    }
}

/// Configuration of a single balancer.
#[derive(Clone, Debug)]
pub struct LoadBalancerOptions {
    /// Name of the service to balance.
    pub service_name: String,
    /// Which registered endpoint to hand out.
    pub endpoint_type: EndpointType,
    /// Which instances of the service to consider.
    pub filter: LocationFilter,
    /// Background timing.
    pub timing: BalancerTiming,
}

impl LoadBalancerOptions {
    /// Options for balancing the main endpoint of an application service,
    /// stable rollout, shared owner, common cluster.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint_type: EndpointType::AppMain,
            filter: LocationFilter::default(),
            timing: BalancerTiming::default(),
        }
    }

    /// Balances a different registered endpoint of the service.
    #[must_use]
    pub fn with_endpoint_type(mut self, endpoint_type: EndpointType) -> Self {
        self.endpoint_type = endpoint_type;
        self
    }

    /// Narrows the balanced instance set.
    #[must_use]
    pub fn with_filter(mut self, filter: LocationFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Overrides the background timing.
    #[must_use]
    pub fn with_timing(mut self, timing: BalancerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Name used in logs and errors: the service plus the rollout type it is
    /// balanced for.
    #[must_use]
    pub(crate) fn log_name(&self) -> String {
        format!("{} {}", self.service_name, self.filter.rollout_type)
    }
}

/// A point-in-time view of one balanced node, for diagnostics endpoints.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeStat {
    /// Instance key the node is registered under.
    pub key: String,
    /// Endpoint handed out for this node.
    pub value: String,
    /// Rollout cohort the node serves.
    pub rollout_type: String,
    /// Result of the most recent health check.
    pub healthy: bool,
    /// Fraction of selections this node currently receives, `0..=1`.
    pub hit_probability: f64,
    /// Times this node has been selected.
    pub hit_count: u64,
    /// Most recent health-check response time.
    pub rtt: Duration,
    /// Moving average of health-check response times.
    pub rtt_average: Duration,
}

pub(crate) fn node_stat(node: &Node, rollout_type: &str, hit_probability: f64) -> NodeStat {
    NodeStat {
        key: node.key.clone(),
        value: node.url.clone(),
        rollout_type: rollout_type.to_string(),
        healthy: node.healthy,
        hit_probability,
        hit_count: node.hit_count,
        rtt: node.stats.current,
        rtt_average: node.stats.average,
    }
}

/// Picks a backend address for each outgoing call.
#[async_trait]
pub trait LoadBalancer: Send + Sync + 'static {
    /// Returns the next address to call.
    ///
    /// Waits for discovery initialization (bounded by the init timeout) before
    /// the first answer; after that it never blocks.
    async fn next(&self) -> Result<String, NoServiceAvailable>;

    /// Name of the balanced service.
    fn service_name(&self) -> &str;

    /// Current per-node statistics.
    fn stats(&self) -> Vec<NodeStat>;

    /// Stops background work. Stopping is terminal: every subsequent
    /// [`Self::next`] call fails fast.
    fn stop(&self);
}

/// Lifecycle of a balancer's discovery loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// No discovery data seen yet; `next()` callers wait.
    Initializing,
    /// First data (or the init timeout) arrived.
    Ready,
    /// `stop()` was called or the discovery stream ended for good.
    Stopped,
}

/// Blocks until the balancer leaves [`State::Initializing`].
pub(crate) async fn wait_ready(state: &watch::Receiver<State>) -> State {
    let mut rx = state.clone();
    match rx.wait_for(|s| *s != State::Initializing).await {
        Ok(state) => *state,
        // Sender gone before becoming ready; nothing will ever arrive.
        Err(_) => State::Stopped,
    }
}

// Lock helpers that ride through poisoning: a panicked background task must
// not take `next()` down with it.

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Balancer with a fixed answer set, for composing in tests.
    pub(crate) struct StaticBalancer {
        name: String,
        addresses: Vec<String>,
        stats: Vec<NodeStat>,
        position: AtomicUsize,
        stopped: AtomicBool,
        fail: AtomicBool,
    }

    impl StaticBalancer {
        pub(crate) fn new(name: &str, addresses: &[&str]) -> Self {
            Self {
                name: name.to_string(),
                addresses: addresses.iter().map(ToString::to_string).collect(),
                stats: Vec::new(),
                position: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                fail: AtomicBool::new(false),
            }
        }

        pub(crate) fn with_stats(mut self, stats: Vec<NodeStat>) -> Self {
            self.stats = stats;
            self
        }

        /// Makes every subsequent `next()` call fail.
        pub(crate) fn break_it(&self) {
            self.fail.store(true, Ordering::SeqCst);
        }

        pub(crate) fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LoadBalancer for StaticBalancer {
        async fn next(&self) -> Result<String, NoServiceAvailable> {
            if self.fail.load(Ordering::SeqCst) || self.addresses.is_empty() {
                return Err(NoServiceAvailable {
                    balancer: self.name.clone(),
                });
            }
            let i = self.position.fetch_add(1, Ordering::SeqCst);
            Ok(self.addresses[i % self.addresses.len()].clone())
        }

        fn service_name(&self) -> &str {
            &self.name
        }

        fn stats(&self) -> Vec<NodeStat> {
            self.stats.clone()
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

}
