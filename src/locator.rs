//! Locating service endpoints in the store.
//!
//! A locator answers one question: "where is service X right now?", either as
//! a one-shot snapshot ([`Locate::get`]) or as a live stream of changes
//! ([`Locate::watch`]). Balancers consume the stream; the snapshot is for
//! callers that manage their own connection state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time;

use crate::key::{KeyFilter, Kv, KvEvent, NAMESPACE_DISCOVERY, Service, ServiceType};
use crate::store::{BoxError, EventKind, KvStore};
use crate::watch::{WatchConfig, watch_prefix};

/// Which of a service's registered endpoints to resolve.
///
/// Instances register a main endpoint and optionally an additional one (for
/// example a gRPC port next to the primary HTTP port). The endpoint type picks
/// both the service-type key segment to search under and which of the two
/// registered addresses to hand out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    /// Main endpoint of an application service.
    AppMain,
    /// Additional endpoint of an application service.
    AppAdditional,
    /// Main endpoint of a system service.
    SystemMain,
    /// Additional endpoint of a system service.
    SystemAdditional,
    /// Endpoint of an external resource.
    External,
}

impl EndpointType {
    /// The service-type key segment this endpoint type lives under.
    #[must_use]
    pub fn service_type(self) -> ServiceType {
        match self {
            Self::AppMain | Self::AppAdditional => ServiceType::App,
            Self::SystemMain | Self::SystemAdditional => ServiceType::System,
            Self::External => ServiceType::External,
        }
    }

    fn reads_main(self) -> bool {
        !matches!(self, Self::AppAdditional | Self::SystemAdditional)
    }
}

impl std::fmt::Display for EndpointType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AppMain => f.write_str("app_main"),
            Self::AppAdditional => f.write_str("app_additional"),
            Self::SystemMain => f.write_str("system_main"),
            Self::SystemAdditional => f.write_str("system_additional"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Narrows a lookup to a subset of a service's instances.
///
/// Any field may be left empty to widen the search; the search prefix is
/// truncated at the first empty field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocationFilter {
    /// Rollout type to select, `stable` by default.
    pub rollout_type: String,
    /// Owner to select, `shared` by default.
    pub owner: String,
    /// Cluster type to select, `common` by default.
    pub cluster_type: String,
}

impl Default for LocationFilter {
    fn default() -> Self {
        Self {
            rollout_type: crate::key::ROLLOUT_TYPE_STABLE.to_string(),
            owner: crate::key::DEFAULT_OWNER.to_string(),
            cluster_type: crate::key::DEFAULT_CLUSTER_TYPE.to_string(),
        }
    }
}

/// A resolved service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    /// Identity parsed out of the storage key.
    pub service: Service,
    /// The selected endpoint address; may be empty, notably on deletes.
    pub endpoint: String,
    /// Login registered alongside the endpoint, if any.
    pub login: Option<String>,
    /// Password registered alongside the endpoint, if any.
    pub password: Option<String>,
}

/// A change to the set of locations of a watched service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Whether the locations appeared/changed or disappeared.
    pub kind: EventKind,
    /// The affected locations.
    pub locations: Vec<Location>,
}

/// Resolves and watches service locations.
#[async_trait]
pub trait Locate: Send + Sync + 'static {
    /// Returns the current locations of `service`.
    async fn get(
        &self,
        service: &str,
        endpoint_type: EndpointType,
        filter: &LocationFilter,
    ) -> Result<Vec<Location>, BoxError>;

    /// Watches `service` for location changes.
    ///
    /// The stream starts with one `Put` event carrying the current locations
    /// (omitted when there are none) and stays open until the receiver is
    /// dropped.
    fn watch(
        &self,
        service: &str,
        endpoint_type: EndpointType,
        filter: &LocationFilter,
    ) -> mpsc::Receiver<Event>;
}

/// Shape of a registered instance value.
#[derive(Debug, Default, Deserialize)]
struct LocationValue {
    #[serde(default)]
    endpoint_main: String,
    #[serde(default)]
    endpoint_additional: String,
    #[serde(default)]
    login: String,
    #[serde(default)]
    pass: String,
}

/// Decodes one pair into a location, or `None` if the pair isn't a usable
/// instance registration.
fn decode_location(kv: &Kv, endpoint_type: EndpointType) -> Option<Location> {
    let service = kv.service.as_ref()?.clone();

    // An empty value is a valid registration without endpoint data, seen on
    // deletes and on bare registrations.
    let value = if kv.value.is_empty() {
        LocationValue::default()
    } else {
        match serde_json::from_str::<LocationValue>(&kv.value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("skipping {:?}: undecodable value: {e}", kv.raw_key);
                return None;
            }
        }
    };

    let endpoint = if endpoint_type.reads_main() {
        value.endpoint_main
    } else {
        value.endpoint_additional
    };

    Some(Location {
        service,
        endpoint,
        login: (!value.login.is_empty()).then_some(value.login),
        password: (!value.pass.is_empty()).then_some(value.pass),
    })
}

fn decode_locations(kvs: &[Kv], endpoint_type: EndpointType) -> Vec<Location> {
    kvs.iter()
        .filter_map(|kv| decode_location(kv, endpoint_type))
        .collect()
}

fn search_prefix(service: &str, endpoint_type: EndpointType, filter: &LocationFilter) -> String {
    KeyFilter {
        prefix: None,
        namespace: NAMESPACE_DISCOVERY.to_string(),
        service_type: Some(endpoint_type.service_type()),
        name: service.to_string(),
        rollout_type: filter.rollout_type.clone(),
        owner: filter.owner.clone(),
        cluster_type: filter.cluster_type.clone(),
    }
    .storage_prefix()
}

/// [`Locate`] implementation backed by a [`KvStore`].
pub struct KvLocator<S> {
    store: Arc<S>,
    config: WatchConfig,
}

impl<S: KvStore> KvLocator<S> {
    /// Creates a locator over the given store with default watch timing.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, WatchConfig::default())
    }

    /// Creates a locator with custom watch timing.
    pub fn with_config(store: Arc<S>, config: WatchConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl<S: KvStore> Locate for KvLocator<S> {
    async fn get(
        &self,
        service: &str,
        endpoint_type: EndpointType,
        filter: &LocationFilter,
    ) -> Result<Vec<Location>, BoxError> {
        let prefix = search_prefix(service, endpoint_type, filter);
        let snapshot = time::timeout(self.config.get_timeout, self.store.get(&prefix))
            .await
            .map_err(|_| format!("get {prefix:?} timed out"))??;

        let mut kvs = Vec::with_capacity(snapshot.kvs.len());
        for raw in &snapshot.kvs {
            match crate::key::decode_kv(raw) {
                Ok(kv) => kvs.push(kv),
                Err(e) => tracing::warn!("skipping undecodable pair: {e}"),
            }
        }
        Ok(decode_locations(&kvs, endpoint_type))
    }

    fn watch(
        &self,
        service: &str,
        endpoint_type: EndpointType,
        filter: &LocationFilter,
    ) -> mpsc::Receiver<Event> {
        let prefix = search_prefix(service, endpoint_type, filter);
        let mut kv_rx = watch_prefix(Arc::clone(&self.store), prefix, self.config.clone());

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        tokio::spawn(async move {
            while let Some(KvEvent { kind, kvs }) = kv_rx.recv().await {
                let locations = decode_locations(&kvs, endpoint_type);
                if locations.is_empty() {
                    continue;
                }
                if tx.send(Event { kind, locations }).await.is_err() {
                    return;
                }
            }
        });
        rx
    }
}
