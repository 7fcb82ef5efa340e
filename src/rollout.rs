//! Progressive rollout: routing callers to rollout cohorts.
//!
//! A deployment can run several versions of a service side by side: the
//! `stable` cohort plus up to [`UNSTABLE_ROLLOUT_COUNT`] `unstableN` cohorts.
//! Which cohort a caller lands in is keyed by its segregation id, a small
//! integer derived from the caller's identity; the id-to-cohort map lives in
//! the store under [`ROLLOUT_KEY_PREFIX`] and changes as a rollout advances.
//!
//! [`RolloutWatcher`] mirrors that map locally; [`RolloutBalancer`] combines
//! it with one balancer per cohort, falling back to stable whenever a cohort
//! cannot answer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::watch;

use crate::balancer::{
    self, BalancerType, LoadBalancer, LoadBalancerOptions, NoServiceAvailable, NodeStat,
};
use crate::fallback::FallbackBalancer;
use crate::key::{KvEvent, NAMESPACE_ROLLOUT, ROLLOUT_TYPE_STABLE};
use crate::locator::Locate;
use crate::round_robin::RoundRobin;
use crate::store::{EventKind, KvStore};
use crate::watch::{WatchConfig, watch_prefix};
use crate::weighted::WeightedRoundRobin;

/// Store prefix of the segregation-id-to-cohort map.
pub const ROLLOUT_KEY_PREFIX: &str = "/rollout/segregation/";

/// Number of unstable cohorts (`unstable1` through `unstable20`).
pub const UNSTABLE_ROLLOUT_COUNT: usize = 20;

/// Expected order of magnitude of the segregation map.
const SEGREGATION_MAP_CAPACITY: usize = 1000;

/// A segregation id the caller handed in could not be used.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SegregationIdError {
    /// The id was empty.
    #[error("empty segregation id")]
    Empty,
    /// The id was not an integer.
    #[error("invalid segregation id {value:?}")]
    Invalid {
        /// The offending id.
        value: String,
    },
}

fn parse_segregation_id(id: &str) -> Result<i64, SegregationIdError> {
    if id.is_empty() {
        return Err(SegregationIdError::Empty);
    }
    id.parse()
        .map_err(|_| SegregationIdError::Invalid {
            value: id.to_string(),
        })
}

/// Local mirror of the segregation-id-to-cohort map.
///
/// One watcher serves any number of [`RolloutBalancer`]s; lookups never touch
/// the store.
pub struct RolloutWatcher {
    map: RwLock<HashMap<i64, String>>,
    stop: watch::Sender<bool>,
}

impl RolloutWatcher {
    /// Starts mirroring the rollout map with default watch timing.
    pub fn spawn<S: KvStore>(store: Arc<S>) -> Arc<Self> {
        Self::spawn_with_config(store, WatchConfig::default())
    }

    /// Starts mirroring the rollout map with custom watch timing.
    pub fn spawn_with_config<S: KvStore>(store: Arc<S>, config: WatchConfig) -> Arc<Self> {
        let mut events = watch_prefix(store, ROLLOUT_KEY_PREFIX, config);
        let (stop, mut stopped) = watch::channel(false);

        let watcher = Arc::new(Self {
            map: RwLock::new(HashMap::with_capacity(SEGREGATION_MAP_CAPACITY)),
            stop,
        });

        let this = Arc::clone(&watcher);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => this.apply(event),
                        None => break,
                    },
                    _ = stopped.wait_for(|s| *s) => break,
                }
            }
            tracing::debug!("rollout watcher finished");
        });

        watcher
    }

    /// Returns the cohort the given segregation id belongs to.
    ///
    /// Ids absent from the map belong to the stable cohort; an unusable id is
    /// the caller's error.
    pub fn rollout_type(&self, segregation_id: &str) -> Result<String, SegregationIdError> {
        let id = parse_segregation_id(segregation_id)?;
        let map = balancer::read(&self.map);
        Ok(map
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ROLLOUT_TYPE_STABLE.to_string()))
    }

    /// Stops mirroring. Lookups keep answering from the last known map.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    fn apply(&self, event: KvEvent) {
        let mut map = balancer::write(&self.map);
        for kv in event.kvs {
            if kv.namespace != NAMESPACE_ROLLOUT {
                continue;
            }
            let id = kv
                .raw_key
                .strip_prefix(ROLLOUT_KEY_PREFIX)
                .and_then(|s| s.parse::<i64>().ok());
            let Some(id) = id else {
                tracing::warn!("skipping unusable rollout key {:?}", kv.raw_key);
                continue;
            };
            match event.kind {
                EventKind::Put => {
                    tracing::debug!("segregation {id} -> {}", kv.value);
                    map.insert(id, kv.value);
                }
                EventKind::Delete => {
                    tracing::debug!("segregation {id} -> stable");
                    map.remove(&id);
                }
            }
        }
    }
}

/// Configuration of a [`RolloutBalancer`].
#[derive(Clone)]
pub struct RolloutBalancerOptions {
    /// Base options for every cohort balancer; the rollout type of the filter
    /// is overridden per cohort.
    pub balancer: LoadBalancerOptions,
    /// Selection algorithm to run per cohort.
    pub balancer_type: BalancerType,
    /// Extra balancer behind the stable cohort, for example a legacy
    /// discovery path during a migration.
    pub fallback: Option<Arc<dyn LoadBalancer>>,
}

impl RolloutBalancerOptions {
    /// Round-robin cohorts with default balancer options and no fallback.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            balancer: LoadBalancerOptions::new(service_name),
            balancer_type: BalancerType::default(),
            fallback: None,
        }
    }
}

/// Cohort-aware balancer: picks an address for a caller based on which
/// rollout cohort its segregation id maps to.
///
/// Keeps one balancer per cohort (stable plus every unstable cohort) so a
/// caller moved to a new cohort is served without any warm-up on the calling
/// path. Any cohort failure falls back to the stable cohort silently.
pub struct RolloutBalancer {
    service_name: String,
    stable: Arc<dyn LoadBalancer>,
    cohorts: HashMap<String, Arc<dyn LoadBalancer>>,
    watcher: Arc<RolloutWatcher>,
}

impl RolloutBalancer {
    /// Starts one balancer per cohort, stable first.
    pub fn spawn(
        locator: &dyn Locate,
        watcher: Arc<RolloutWatcher>,
        options: RolloutBalancerOptions,
    ) -> Self {
        let service_name = options.balancer.service_name.clone();

        let stable_inner = Self::cohort_balancer(locator, &options, ROLLOUT_TYPE_STABLE);
        let stable: Arc<dyn LoadBalancer> = match options.fallback.clone() {
            Some(fallback) => Arc::new(FallbackBalancer::new(vec![stable_inner, fallback])),
            None => stable_inner,
        };

        let mut cohorts: HashMap<String, Arc<dyn LoadBalancer>> =
            HashMap::with_capacity(UNSTABLE_ROLLOUT_COUNT);
        for i in 1..=UNSTABLE_ROLLOUT_COUNT {
            let cohort = format!("unstable{i}");
            let balancer = Self::cohort_balancer(locator, &options, &cohort);
            cohorts.insert(cohort, balancer);
        }

        Self {
            service_name,
            stable,
            cohorts,
            watcher,
        }
    }

    fn cohort_balancer(
        locator: &dyn Locate,
        options: &RolloutBalancerOptions,
        cohort: &str,
    ) -> Arc<dyn LoadBalancer> {
        let mut opts = options.balancer.clone();
        opts.filter.rollout_type = cohort.to_string();
        match options.balancer_type {
            BalancerType::RoundRobin => RoundRobin::spawn(locator, opts),
            BalancerType::WeightedRoundRobin => WeightedRoundRobin::spawn(locator, opts),
        }
    }

    /// Returns the next address for the caller with the given segregation id.
    ///
    /// Cohort resolution never fails the call: an unusable id, an unknown
    /// cohort name, or a cohort with nothing to offer all route to the stable
    /// cohort. The only error is the stable cohort itself having no instance.
    pub async fn next(&self, segregation_id: &str) -> Result<String, NoServiceAvailable> {
        match self.watcher.rollout_type(segregation_id) {
            Ok(rollout_type) if rollout_type != ROLLOUT_TYPE_STABLE => {
                if let Some(cohort) = self.cohorts.get(&rollout_type) {
                    match cohort.next().await {
                        Ok(address) => return Ok(address),
                        Err(e) => {
                            tracing::debug!("{}: {e}, falling back to stable", self.service_name);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("{}: {e}, falling back to stable", self.service_name);
            }
        }
        self.stable.next().await
    }

    /// Name of the balanced service.
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Per-node statistics, each row tagged with its cohort.
    ///
    /// With a cohort given, only that cohort's rows; otherwise all cohorts,
    /// stable first.
    pub fn stats(&self, rollout_type: Option<&str>) -> Vec<NodeStat> {
        match rollout_type {
            Some(ROLLOUT_TYPE_STABLE) => self.stable.stats(),
            Some(cohort) => self
                .cohorts
                .get(cohort)
                .map(|b| b.stats())
                .unwrap_or_default(),
            None => {
                let mut stats = self.stable.stats();
                for i in 1..=UNSTABLE_ROLLOUT_COUNT {
                    if let Some(cohort) = self.cohorts.get(&format!("unstable{i}")) {
                        stats.extend(cohort.stats());
                    }
                }
                stats
            }
        }
    }

    /// Stops every cohort balancer. The shared watcher is left running.
    pub fn stop(&self) {
        self.stable.stop();
        for cohort in self.cohorts.values() {
            cohort.stop();
        }
    }
}
