//! Priority composition of balancers.

use std::sync::Arc;

use async_trait::async_trait;

use crate::balancer::{LoadBalancer, NoServiceAvailable, NodeStat};

/// Tries a list of balancers in priority order.
///
/// Each call starts from the first balancer again, so a recovered primary is
/// picked back up immediately. Useful during migrations, with the new
/// discovery path first and the legacy one behind it.
pub struct FallbackBalancer {
    name: String,
    balancers: Vec<Arc<dyn LoadBalancer>>,
}

impl FallbackBalancer {
    /// Composes `balancers` in the given priority order.
    pub fn new(balancers: Vec<Arc<dyn LoadBalancer>>) -> Self {
        let name = balancers
            .iter()
            .map(|b| b.service_name())
            .find(|n| !n.is_empty())
            .unwrap_or_default()
            .to_string();
        Self { name, balancers }
    }
}

#[async_trait]
impl LoadBalancer for FallbackBalancer {
    async fn next(&self) -> Result<String, NoServiceAvailable> {
        for balancer in &self.balancers {
            match balancer.next().await {
                Ok(address) => return Ok(address),
                Err(e) => {
                    tracing::debug!("{}: falling through: {e}", self.name);
                }
            }
        }
        Err(NoServiceAvailable {
            balancer: self.name.clone(),
        })
    }

    fn service_name(&self) -> &str {
        &self.name
    }

    /// Statistics of the first balancer that has any.
    fn stats(&self) -> Vec<NodeStat> {
        self.balancers
            .iter()
            .map(|b| b.stats())
            .find(|s| !s.is_empty())
            .unwrap_or_default()
    }

    fn stop(&self) {
        for balancer in &self.balancers {
            balancer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::balancer::node_stat;
    use crate::balancer::testing::StaticBalancer;
    use crate::node::Node;

    fn stat(key: &str) -> NodeStat {
        node_stat(&Node::new(key, format!("{key}:80")), "stable", 1.0)
    }

    #[tokio::test]
    async fn prefers_the_first_balancer() {
        let primary = Arc::new(StaticBalancer::new("bob_api", &["1", "2"]));
        let backup = Arc::new(StaticBalancer::new("bob_api legacy", &["9"]));
        let fallback = FallbackBalancer::new(vec![primary as _, backup as _]);

        assert_eq!(fallback.next().await.unwrap(), "1");
        assert_eq!(fallback.next().await.unwrap(), "2");
        assert_eq!(fallback.next().await.unwrap(), "1");
    }

    #[tokio::test]
    async fn falls_through_on_failure_and_recovers() {
        let primary = Arc::new(StaticBalancer::new("bob_api", &["1", "2", "3"]));
        let backup = Arc::new(StaticBalancer::new("bob_api legacy", &["4", "5", "6"]));
        let fallback = FallbackBalancer::new(vec![Arc::clone(&primary) as _, backup as _]);

        primary.break_it();
        assert_eq!(fallback.next().await.unwrap(), "4");
        assert_eq!(fallback.next().await.unwrap(), "5");
        assert_eq!(fallback.next().await.unwrap(), "6");
    }

    #[tokio::test]
    async fn errors_when_every_balancer_fails() {
        let a = Arc::new(StaticBalancer::new("bob_api", &[]));
        let b = Arc::new(StaticBalancer::new("bob_api legacy", &[]));
        let fallback = FallbackBalancer::new(vec![a as _, b as _]);

        let err = fallback.next().await.unwrap_err();
        assert_eq!(err.to_string(), "bob_api: no service available");
    }

    #[test]
    fn name_is_the_first_nonempty_one() {
        let anonymous = Arc::new(StaticBalancer::new("", &["1"]));
        let named = Arc::new(StaticBalancer::new("bob_api", &["2"]));
        let fallback = FallbackBalancer::new(vec![anonymous as _, named as _]);

        assert_eq!(fallback.service_name(), "bob_api");
    }

    #[test]
    fn stats_come_from_the_first_populated_balancer() {
        let empty = Arc::new(StaticBalancer::new("a", &["1"]));
        let populated =
            Arc::new(StaticBalancer::new("b", &["2"]).with_stats(vec![stat("go1.dc:80")]));
        let fallback = FallbackBalancer::new(vec![empty as _, populated as _]);

        let stats = fallback.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].key, "go1.dc:80");
        assert_eq!(stats[0].rtt, Duration::ZERO);
    }

    #[test]
    fn stop_reaches_every_balancer() {
        let a = Arc::new(StaticBalancer::new("a", &["1"]));
        let b = Arc::new(StaticBalancer::new("b", &["2"]));
        let fallback = FallbackBalancer::new(vec![Arc::clone(&a) as _, Arc::clone(&b) as _]);

        fallback.stop();
        assert!(a.is_stopped());
        assert!(b.is_stopped());
    }
}
