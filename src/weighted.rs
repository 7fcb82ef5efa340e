//! Response-time-weighted rotation driven by periodic health checks.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, join_all};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time;

use crate::balancer::{
    self, LoadBalancer, LoadBalancerOptions, NoServiceAvailable, NodeStat, State, wait_ready,
};
use crate::locator::{Event, Locate};
use crate::node::{Node, NodeSet};
use crate::store::{BoxError, EventKind};

/// Probe run against one node per health-check round.
///
/// Receives the node's dialable address and the probe timeout; an `Ok` return
/// marks the node healthy and its duration becomes the response-time sample.
pub type HealthChecker =
    Arc<dyn Fn(String, Duration) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Default health check: a TCP dial of the node's address.
pub fn dial_check(address: String, timeout: Duration) -> BoxFuture<'static, Result<(), BoxError>> {
    Box::pin(async move {
        if address.is_empty() {
            return Err("no dialable address".into());
        }
        let stream = time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| format!("dial {address} timed out"))??;
        drop(stream);
        Ok(())
    })
}

/// Smooth weighted rotation state.
///
/// Nodes are kept sorted fastest-first; each node's weight is the rounded
/// ratio of the summed average response time to its own, so a node twice as
/// fast gets twice the calls. Selection walks the ring with a single
/// current-weight accumulator that decays once per full pass, interleaving
/// heavy nodes with light ones instead of bursting.
struct Rotor {
    nodes: NodeSet,
    index: Option<usize>,
    current_weight: u64,
    max_weight: u64,
}

impl Rotor {
    fn new() -> Self {
        Self {
            nodes: NodeSet::new(),
            index: None,
            current_weight: 0,
            max_weight: 0,
        }
    }

    fn decay(&mut self) {
        self.current_weight = if self.current_weight <= 1 {
            self.max_weight
        } else {
            self.current_weight - 1
        };
    }

    /// Selects the next node and counts the hit.
    fn advance(&mut self) -> Option<&mut Node> {
        let n = self.nodes.len();
        if n == 0 {
            return None;
        }
        let mut i = match self.index {
            None => 0,
            Some(i) => (i + 1) % n,
        };
        if i == 0 {
            self.decay();
        }
        if self.nodes.at(i).weight < self.current_weight {
            i = 0;
            self.decay();
        }
        self.index = Some(i);
        let node = self.nodes.at_mut(i);
        node.hit_count += 1;
        Some(node)
    }

    /// Recomputes weights from the accumulated response-time averages.
    ///
    /// Until every node has at least one sample, all weights stay 1 and the
    /// rotation degenerates to plain round robin.
    fn update_weights(&mut self) {
        if self.nodes.is_empty() {
            self.index = None;
            self.current_weight = 0;
            self.max_weight = 0;
            return;
        }
        self.nodes.sort_by_average();

        let unmeasured = self
            .nodes
            .nodes()
            .iter()
            .any(|n| n.stats.average.is_zero());
        if unmeasured {
            for i in 0..self.nodes.len() {
                self.nodes.at_mut(i).weight = 1;
            }
            self.max_weight = 1;
        } else {
            let sum: f64 = self
                .nodes
                .nodes()
                .iter()
                .map(|n| n.stats.average.as_secs_f64())
                .sum();
            for i in 0..self.nodes.len() {
                let avg = self.nodes.at(i).stats.average.as_secs_f64();
                self.nodes.at_mut(i).weight = (sum / avg + 0.5) as u64;
            }
            self.max_weight = self.nodes.at(0).weight;
        }

        // A stale accumulator above the new ceiling would starve every node;
        // restart the pass.
        if self.current_weight > self.max_weight {
            self.index = None;
            self.current_weight = 0;
        }
    }
}

/// Weighted round-robin balancer: faster instances get proportionally more
/// calls, based on periodic health-check response times.
pub struct WeightedRoundRobin {
    options: LoadBalancerOptions,
    name: String,
    rotor: RwLock<Rotor>,
    state: watch::Sender<State>,
    checker: HealthChecker,
}

impl WeightedRoundRobin {
    /// Starts balancing with the default TCP-dial health check.
    pub fn spawn(locator: &dyn Locate, options: LoadBalancerOptions) -> Arc<Self> {
        Self::spawn_with_checker(locator, options, Arc::new(|address, timeout| {
            dial_check(address, timeout)
        }))
    }

    /// Starts balancing with a custom health check, for protocols where a TCP
    /// dial is not a meaningful probe.
    pub fn spawn_with_checker(
        locator: &dyn Locate,
        options: LoadBalancerOptions,
        checker: HealthChecker,
    ) -> Arc<Self> {
        let mut events = locator.watch(
            &options.service_name,
            options.endpoint_type,
            &options.filter,
        );
        let name = options.log_name();
        let (state, _) = watch::channel(State::Initializing);
        let init_timeout = options.timing.init_timeout;
        let interval = options.timing.healthcheck_interval;

        let balancer = Arc::new(Self {
            options,
            name,
            rotor: RwLock::new(Rotor::new()),
            state,
            checker,
        });

        let this = Arc::clone(&balancer);
        tokio::spawn(async move {
            time::sleep(init_timeout).await;
            let timed_out = this
                .state
                .send_if_modified(|s| matches!(s, State::Initializing) && {
                    *s = State::Ready;
                    true
                });
            if timed_out {
                tracing::warn!("{}: initialization timed out", this.name);
            }
        });

        let this = Arc::clone(&balancer);
        tokio::spawn(async move {
            let mut stop = this.state.subscribe();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            this.handle_event(event);
                            this.mark_ready();
                        }
                        None => break,
                    },
                    _ = stop.wait_for(|s| matches!(s, State::Stopped)) => break,
                }
            }
            tracing::debug!("{}: discovery loop finished", this.name);
        });

        // The check loop starts once initialization ends, whether data or the
        // timeout ended it; a service that appears late still gets probed.
        let this = Arc::clone(&balancer);
        tokio::spawn(async move {
            let rx = this.state.subscribe();
            if wait_ready(&rx).await == State::Stopped {
                return;
            }
            let mut stop = this.state.subscribe();
            loop {
                this.run_checks().await;
                tokio::select! {
                    () = time::sleep(interval) => {}
                    _ = stop.wait_for(|s| matches!(s, State::Stopped)) => return,
                }
            }
        });

        balancer
    }

    fn mark_ready(&self) {
        let became_ready = self
            .state
            .send_if_modified(|s| matches!(s, State::Initializing) && {
                *s = State::Ready;
                true
            });
        if became_ready {
            tracing::debug!("{}: ready", self.name);
        }
    }

    fn handle_event(&self, event: Event) {
        let mut rotor = balancer::write(&self.rotor);
        let mut changed = false;
        for location in event.locations {
            let key = location.service.instance_key();
            match event.kind {
                EventKind::Put => {
                    if let Some(existing) = rotor.nodes.get(key) {
                        if existing.url == location.endpoint {
                            continue;
                        }
                        // A relocated instance starts over with fresh stats.
                        tracing::debug!(
                            "{}: node {key} moved to {}",
                            self.name,
                            location.endpoint
                        );
                        rotor.nodes.remove(key);
                        rotor.nodes.push(Node::new(key, location.endpoint.clone()));
                    } else {
                        tracing::debug!("{}: put node {key} -> {}", self.name, location.endpoint);
                        rotor.nodes.push(Node::new(key, location.endpoint.clone()));
                    }
                    changed = true;
                }
                EventKind::Delete => {
                    if rotor.nodes.remove(key).is_some() {
                        tracing::debug!("{}: removed node {key}", self.name);
                        changed = true;
                    }
                }
            }
        }
        // A stale weight ceiling must not outlive the set it was computed
        // from, so membership changes recompute right away instead of waiting
        // out the check interval.
        if changed {
            rotor.update_weights();
        }
    }

    /// Probes every node once and folds the results into the weights.
    async fn run_checks(&self) {
        let targets: Vec<(String, String)> = {
            let rotor = balancer::read(&self.rotor);
            rotor
                .nodes
                .nodes()
                .iter()
                .map(|n| (n.key.clone(), n.address.clone()))
                .collect()
        };

        let timeout = self.options.timing.healthcheck_timeout;
        let max_rtt = self.options.timing.max_response_time;
        let probes = targets.into_iter().map(|(key, address)| {
            let checker = Arc::clone(&self.checker);
            async move {
                let start = time::Instant::now();
                let outcome = time::timeout(timeout, (checker)(address, timeout)).await;
                match outcome {
                    Ok(Ok(())) => (key, true, start.elapsed()),
                    Ok(Err(e)) => {
                        tracing::debug!("health check of {key} failed: {e}");
                        (key, false, max_rtt)
                    }
                    Err(_) => {
                        tracing::debug!("health check of {key} timed out");
                        (key, false, max_rtt)
                    }
                }
            }
        });
        let results = join_all(probes).await;

        let mut rotor = balancer::write(&self.rotor);
        for (key, healthy, rtt) in results {
            // The node may have been removed or replaced while the probe ran.
            if let Some(node) = rotor.nodes.get_mut(&key) {
                node.healthy = healthy;
                node.stats.add(rtt);
            }
        }
        rotor.update_weights();
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobin {
    async fn next(&self) -> Result<String, NoServiceAvailable> {
        let state = self.state.subscribe();
        if wait_ready(&state).await == State::Stopped {
            return Err(NoServiceAvailable {
                balancer: self.name.clone(),
            });
        }

        let mut rotor = balancer::write(&self.rotor);
        match rotor.advance() {
            Some(node) => Ok(node.url.clone()),
            None => Err(NoServiceAvailable {
                balancer: self.name.clone(),
            }),
        }
    }

    fn service_name(&self) -> &str {
        &self.options.service_name
    }

    fn stats(&self) -> Vec<NodeStat> {
        let rotor = balancer::read(&self.rotor);
        let sum: u64 = rotor.nodes.nodes().iter().map(|n| n.weight).sum();
        rotor
            .nodes
            .nodes()
            .iter()
            .map(|n| {
                let probability = if sum == 0 {
                    0.0
                } else {
                    n.weight as f64 / sum as f64
                };
                balancer::node_stat(n, &self.options.filter.rollout_type, probability)
            })
            .collect()
    }

    fn stop(&self) {
        tracing::debug!("{}: stopping", self.name);
        self.state.send_replace(State::Stopped);
    }
}
