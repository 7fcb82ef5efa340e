//! Equal-share rotation over a service's live instance set.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time;

use crate::balancer::{
    self, LoadBalancer, LoadBalancerOptions, NoServiceAvailable, NodeStat, State, wait_ready,
};
use crate::locator::{Event, Locate};
use crate::node::{Node, NodeSet};
use crate::store::EventKind;

/// Round-robin balancer: every known instance gets the same share of calls,
/// in registration order.
///
/// No health checking; instances leave the rotation only when deregistered.
pub struct RoundRobin {
    options: LoadBalancerOptions,
    name: String,
    inner: RwLock<Rotation>,
    state: watch::Sender<State>,
}

struct Rotation {
    nodes: NodeSet,
    position: usize,
}

impl RoundRobin {
    /// Starts balancing the service described by `options`.
    ///
    /// Spawns the discovery-consuming task; the balancer is usable right away,
    /// with `next()` waiting (bounded by the init timeout) for the first data.
    pub fn spawn(locator: &dyn Locate, options: LoadBalancerOptions) -> Arc<Self> {
        let mut events = locator.watch(
            &options.service_name,
            options.endpoint_type,
            &options.filter,
        );
        let name = options.log_name();
        let (state, _) = watch::channel(State::Initializing);
        let init_timeout = options.timing.init_timeout;

        let balancer = Arc::new(Self {
            options,
            name,
            inner: RwLock::new(Rotation {
                nodes: NodeSet::new(),
                position: 0,
            }),
            state,
        });

        // Initialization must end even if no discovery data ever arrives;
        // otherwise every next() caller would hang on an empty service.
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
        let mut inner = balancer::write(&self.inner);
        for location in event.locations {
            let key = location.service.instance_key();
            match event.kind {
                EventKind::Put => {
                    // Re-announcements with an unchanged endpoint are no-ops;
                    // a changed endpoint replaces the node in place, resetting
                    // its counters.
                    if inner
                        .nodes
                        .get(key)
                        .is_some_and(|n| n.url == location.endpoint)
                    {
                        continue;
                    }
                    tracing::debug!("{}: put node {key} -> {}", self.name, location.endpoint);
                    inner.nodes.push(Node::new(key, location.endpoint.clone()));
                }
                EventKind::Delete => {
                    if inner.nodes.remove(key).is_some() {
                        tracing::debug!("{}: removed node {key}", self.name);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl LoadBalancer for RoundRobin {
    async fn next(&self) -> Result<String, NoServiceAvailable> {
        let state = self.state.subscribe();
        if wait_ready(&state).await == State::Stopped {
            return Err(NoServiceAvailable {
                balancer: self.name.clone(),
            });
        }

        let mut inner = balancer::write(&self.inner);
        if inner.nodes.is_empty() {
            return Err(NoServiceAvailable {
                balancer: self.name.clone(),
            });
        }
        let i = inner.position % inner.nodes.len();
        inner.position = inner.position.wrapping_add(1);
        let node = inner.nodes.at_mut(i);
        node.hit_count += 1;
        Ok(node.url.clone())
    }

    fn service_name(&self) -> &str {
        &self.options.service_name
    }

    fn stats(&self) -> Vec<NodeStat> {
        let inner = balancer::read(&self.inner);
        if inner.nodes.is_empty() {
            return Vec::new();
        }
        let probability = 1.0 / inner.nodes.len() as f64;
        inner
            .nodes
            .nodes()
            .iter()
            .map(|n| balancer::node_stat(n, &self.options.filter.rollout_type, probability))
            .collect()
    }

    fn stop(&self) {
        tracing::debug!("{}: stopping", self.name);
        self.state.send_replace(State::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::locator::testing::{ChannelLocator, location};

    async fn settle() {
        // Paused-clock runs: a short sleep lets spawned tasks process queued
        // events.
        time::sleep(Duration::from_millis(10)).await;
    }

    fn put(locations: Vec<crate::locator::Location>) -> Event {
        Event {
            kind: EventKind::Put,
            locations,
        }
    }

    fn delete(locations: Vec<crate::locator::Location>) -> Event {
        Event {
            kind: EventKind::Delete,
            locations,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cycles_through_nodes_in_order() {
        let locator = ChannelLocator::new();
        let tx = locator.add_watch();
        let balancer = RoundRobin::spawn(&locator, LoadBalancerOptions::new("bob_api"));

        tx.send(put(vec![
            location("bob_api", "go1.dc:80", "go1.dc:80"),
            location("bob_api", "go2.dc:80", "go2.dc:80"),
            location("bob_api", "go3.dc:80", "go3.dc:80"),
        ]))
        .await
        .unwrap();

        let mut got = Vec::new();
        for _ in 0..6 {
            got.push(balancer.next().await.unwrap());
        }
        assert_eq!(
            got,
            [
                "go1.dc:80",
                "go2.dc:80",
                "go3.dc:80",
                "go1.dc:80",
                "go2.dc:80",
                "go3.dc:80"
            ]
        );
        assert_eq!(locator.watched(), ["bob_api"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_service_errors_after_init_timeout() {
        let locator = ChannelLocator::new();
        let _tx = locator.add_watch();
        let balancer = RoundRobin::spawn(&locator, LoadBalancerOptions::new("bob_api"));

        let start = time::Instant::now();
        let err = balancer.next().await.unwrap_err();
        assert_eq!(err.to_string(), "bob_api stable: no service available");
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_put_with_same_endpoint_is_a_noop() {
        let locator = ChannelLocator::new();
        let tx = locator.add_watch();
        let balancer = RoundRobin::spawn(&locator, LoadBalancerOptions::new("bob_api"));

        tx.send(put(vec![
            location("bob_api", "go1.dc:80", "go1.dc:80"),
            location("bob_api", "go2.dc:80", "go2.dc:80"),
        ]))
        .await
        .unwrap();
        settle().await;

        // Accumulate some hits, then re-announce the same endpoint.
        balancer.next().await.unwrap();
        balancer.next().await.unwrap();
        tx.send(put(vec![location("bob_api", "go1.dc:80", "go1.dc:80")]))
            .await
            .unwrap();
        settle().await;

        let stats = balancer.stats();
        assert_eq!(stats[0].hit_count, 1);

        // A changed endpoint replaces the node and resets its counters.
        tx.send(put(vec![location("bob_api", "go1.dc:80", "go1-new.dc:80")]))
            .await
            .unwrap();
        settle().await;

        let stats = balancer.stats();
        assert_eq!(stats[0].value, "go1-new.dc:80");
        assert_eq!(stats[0].hit_count, 0);
        // Position in the rotation is unchanged.
        assert_eq!(stats[1].value, "go2.dc:80");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_preserves_rotation_order() {
        let locator = ChannelLocator::new();
        let tx = locator.add_watch();
        let balancer = RoundRobin::spawn(&locator, LoadBalancerOptions::new("bob_api"));

        tx.send(put(vec![
            location("bob_api", "go1.dc:80", "go1.dc:80"),
            location("bob_api", "go2.dc:80", "go2.dc:80"),
            location("bob_api", "go3.dc:80", "go3.dc:80"),
            location("bob_api", "go4.dc:80", "go4.dc:80"),
        ]))
        .await
        .unwrap();
        settle().await;

        tx.send(delete(vec![location("bob_api", "go2.dc:80", "")]))
            .await
            .unwrap();
        settle().await;

        let values: Vec<_> = balancer.stats().into_iter().map(|s| s.value).collect();
        assert_eq!(values, ["go1.dc:80", "go3.dc:80", "go4.dc:80"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_report_equal_probability() {
        let locator = ChannelLocator::new();
        let tx = locator.add_watch();
        let mut options = LoadBalancerOptions::new("bob_api");
        options.filter.rollout_type = "unstable2".to_string();
        let balancer = RoundRobin::spawn(&locator, options);

        tx.send(put(vec![
            location("bob_api", "go1.dc:80", "go1.dc:80"),
            location("bob_api", "go2.dc:80", "go2.dc:80"),
        ]))
        .await
        .unwrap();
        settle().await;

        let stats = balancer.stats();
        assert_eq!(stats.len(), 2);
        for stat in &stats {
            assert!((stat.hit_probability - 0.5).abs() < f64::EPSILON);
            assert_eq!(stat.rollout_type, "unstable2");
            assert!(stat.healthy);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_terminal_and_next_fails_fast() {
        let locator = ChannelLocator::new();
        let tx = locator.add_watch();
        let balancer = RoundRobin::spawn(&locator, LoadBalancerOptions::new("bob_api"));

        tx.send(put(vec![location("bob_api", "go1.dc:80", "go1.dc:80")]))
            .await
            .unwrap();
        settle().await;
        assert_eq!(balancer.next().await.unwrap(), "go1.dc:80");

        balancer.stop();
        settle().await;

        // Events after stop are ignored, and selection is over for good.
        let _ = tx.send(put(vec![location("bob_api", "go2.dc:80", "go2.dc:80")])).await;
        settle().await;

        let err = balancer.next().await.unwrap_err();
        assert_eq!(err.to_string(), "bob_api stable: no service available");
    }
}
