#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

//! Service discovery and client-side load balancing over a watchable key-value store.
//!
//! Services register themselves as keys in a shared key-value store (etcd-like:
//! `Get` by prefix plus revision-cursor `Watch`). This crate consumes that data on
//! the client side: it watches a service's live endpoint set and, from that
//! dynamically-changing set, deterministically picks a backend address for each
//! outgoing call.
//!
//! # Features
//!
//! - **Resilient watch**: one ordered event stream per key prefix, with revision
//!   resumption, staleness detection, and automatic reconnection
//! - **Selection algorithms**: round robin and health-check-driven weighted round
//!   robin, with live node upserts and removals
//! - **Priority fallback**: compose balancers so a legacy discovery path backs up
//!   a new one during migrations
//! - **Progressive rollout**: route a caller's segregation id to its rollout
//!   cohort, falling back to the stable cohort on any failure
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use discovery_lb::{KvLocator, LoadBalancerOptions, WeightedRoundRobin};
//!
//! // `store` implements discovery_lb::KvStore for your key-value store client.
//! let locator = Arc::new(KvLocator::new(store));
//!
//! let balancer = WeightedRoundRobin::spawn(
//!     locator.as_ref(),
//!     LoadBalancerOptions::new("customer_api"),
//! );
//!
//! let address = balancer.next().await?;
//! // hand `address` to your connection layer
//! ```

mod balancer;
mod fallback;
mod key;
mod locator;
mod node;
mod rollout;
mod round_robin;
mod store;
mod watch;
mod weighted;

pub use balancer::{
    BalancerTiming, BalancerType, LoadBalancer, LoadBalancerOptions, NoServiceAvailable, NodeStat,
};
pub use fallback::FallbackBalancer;
pub use key::{
    DEFAULT_CLUSTER_TYPE, DEFAULT_OWNER, KeyFilter, Kv, KvEvent, NAMESPACE_ADMIN,
    NAMESPACE_DISCOVERY, NAMESPACE_EXPORTED_ENTITIES, NAMESPACE_METRICS, NAMESPACE_ROLLOUT,
    ParseError, ROLLOUT_TYPE_STABLE, Service, ServiceType, decode_kv, storage_key,
};
pub use locator::{EndpointType, Event, KvLocator, Locate, Location, LocationFilter};
pub use rollout::{
    ROLLOUT_KEY_PREFIX, RolloutBalancer, RolloutBalancerOptions, RolloutWatcher,
    SegregationIdError, UNSTABLE_ROLLOUT_COUNT,
};
pub use round_robin::RoundRobin;
pub use store::{
    BoxError, EventKind, KvSnapshot, KvStore, RawKv, WatchBatch, WatchItem, WatchStream,
};
pub use watch::{WatchConfig, watch_prefix};
pub use weighted::{HealthChecker, WeightedRoundRobin, dial_check};
