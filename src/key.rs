//! Storage-key and value translation between the raw store and domain types.
//!
//! Discovery keys have a fixed shape:
//!
//! ```text
//! /{namespace}/{serviceType}/{serviceName}/{rolloutType}/{owner}/{clusterType}/{instanceKey}
//! ```
//!
//! for example `/discovery/app/bob_api/stable/shared/common/go1.dc:5031`.
//! A few namespaces hold free-form keys instead (the rollout cohort map among
//! them); for those only the namespace is extracted and the rest of the key is
//! left opaque.

use thiserror::Error;

use crate::store::{EventKind, RawKv};

/// Namespace for administrative data.
pub const NAMESPACE_ADMIN: &str = "admin";
/// Namespace where services register their endpoints.
pub const NAMESPACE_DISCOVERY: &str = "discovery";
/// Namespace for metrics registration data.
pub const NAMESPACE_METRICS: &str = "metrics";
/// Namespace holding the progressive-rollout cohort map.
pub const NAMESPACE_ROLLOUT: &str = "rollout";
/// Namespace for exported entity data.
pub const NAMESPACE_EXPORTED_ENTITIES: &str = "exported_entities";

/// Rollout type of stable (non-cohort) service instances.
pub const ROLLOUT_TYPE_STABLE: &str = "stable";
/// Default service owner.
pub const DEFAULT_OWNER: &str = "shared";
/// Default cluster type.
pub const DEFAULT_CLUSTER_TYPE: &str = "common";

/// Namespaces whose keys don't follow the service-key shape.
const UNSTRUCTURED_NAMESPACES: &[&str] = &[NAMESPACE_ROLLOUT, NAMESPACE_EXPORTED_ENTITIES];

const KEY_SEPARATOR: char = '/';
const SERVICE_KEY_PARTS: usize = 8;

/// Error decoding a storage key.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The key doesn't split into the expected number of parts.
    #[error("can't parse key {key:?}: parts number mismatch")]
    PartsMismatch {
        /// The offending key.
        key: String,
    },
    /// One of the key segments is empty.
    #[error("can't parse key {key:?}: empty part found")]
    EmptyPart {
        /// The offending key.
        key: String,
    },
    /// The service type segment is not a known service type.
    #[error("can't parse key {key:?}: invalid service type {value:?}")]
    InvalidServiceType {
        /// The offending key.
        key: String,
        /// The unrecognized segment.
        value: String,
    },
}

/// Coarse service classification, the second key segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceType {
    /// A regular application.
    App,
    /// An infrastructure system service.
    System,
    /// An external resource.
    External,
}

impl ServiceType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "app" => Some(Self::App),
            "system" => Some(Self::System),
            "external" => Some(Self::External),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::App => f.write_str("app"),
            Self::System => f.write_str("system"),
            Self::External => f.write_str("external"),
        }
    }
}

/// Identity of one registered service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    /// Service name, e.g. `customer_api`.
    pub name: String,
    /// Service classification.
    pub service_type: ServiceType,
    /// Owning application, or `shared`.
    pub owner: String,
    /// Rollout type: `stable` or `unstableN`.
    pub rollout_type: String,
    /// Cluster type, e.g. `common`, `master`, `slave`.
    pub cluster_type: String,
    /// Instance identity, typically `host:port`.
    pub instance_name: String,
}

impl Service {
    /// Returns the instance key identifying this instance within its service.
    #[must_use]
    pub fn instance_key(&self) -> &str {
        &self.instance_name
    }
}

/// A decoded store pair: namespace plus, for structured keys, the service
/// identity parsed out of the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Kv {
    /// The key's namespace.
    pub namespace: String,
    /// Parsed service identity; `None` for unstructured namespaces.
    pub service: Option<Service>,
    /// The full raw key as stored.
    pub raw_key: String,
    /// The raw value as stored.
    pub value: String,
}

/// A translated watch event: one or more decoded pairs of the same kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvEvent {
    /// Put or delete.
    pub kind: EventKind,
    /// The affected pairs.
    pub kvs: Vec<Kv>,
}

/// Key-defining filter used to build a watch/get prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyFilter {
    /// Raw key prefix; when set, overrides all other fields.
    pub prefix: Option<String>,
    /// Namespace to search in, e.g. `discovery`.
    pub namespace: String,
    /// Service type segment, if known.
    pub service_type: Option<ServiceType>,
    /// Service name, if known.
    pub name: String,
    /// Rollout type, if known.
    pub rollout_type: String,
    /// Owner, if known.
    pub owner: String,
    /// Cluster type, if known.
    pub cluster_type: String,
}

impl KeyFilter {
    /// Builds the storage prefix this filter selects.
    ///
    /// Segments are joined in key order and the prefix is truncated at the
    /// first empty segment, so a filter with only a namespace still yields a
    /// usable namespace-wide prefix.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        if let Some(prefix) = &self.prefix {
            return prefix.clone();
        }

        let service_type = self.service_type.map(|t| t.to_string()).unwrap_or_default();
        let segments = [
            self.namespace.as_str(),
            service_type.as_str(),
            self.name.as_str(),
            self.rollout_type.as_str(),
            self.owner.as_str(),
            self.cluster_type.as_str(),
        ];

        let mut prefix = String::from("/");
        for segment in segments {
            if segment.is_empty() {
                break;
            }
            prefix.push_str(segment);
            prefix.push(KEY_SEPARATOR);
        }
        prefix
    }
}

/// Formats the storage key for a service instance in the given namespace.
#[must_use]
pub fn storage_key(namespace: &str, service: &Service) -> String {
    format!(
        "/{namespace}/{}/{}/{}/{}/{}/{}",
        service.service_type,
        service.name,
        service.rollout_type,
        service.owner,
        service.cluster_type,
        service.instance_key(),
    )
}

/// Parses a structured service key.
fn parse_service_key(key: &str) -> Result<(String, Service), ParseError> {
    let parts: Vec<&str> = key.split(KEY_SEPARATOR).collect();
    if parts.len() != SERVICE_KEY_PARTS {
        return Err(ParseError::PartsMismatch {
            key: key.to_string(),
        });
    }
    // The leading separator makes the first part empty; every other part must
    // be non-empty.
    if !parts[0].is_empty() || parts[1..].iter().any(|p| p.is_empty()) {
        return Err(ParseError::EmptyPart {
            key: key.to_string(),
        });
    }

    let service_type =
        ServiceType::parse(parts[2]).ok_or_else(|| ParseError::InvalidServiceType {
            key: key.to_string(),
            value: parts[2].to_string(),
        })?;

    let service = Service {
        name: parts[3].to_string(),
        service_type,
        rollout_type: parts[4].to_string(),
        owner: parts[5].to_string(),
        cluster_type: parts[6].to_string(),
        instance_name: parts[7].to_string(),
    };
    Ok((parts[1].to_string(), service))
}

/// Extracts the namespace of a key if it belongs to an unstructured namespace.
fn unstructured_namespace(key: &str) -> Option<&str> {
    let mut parts = key.splitn(3, KEY_SEPARATOR);
    // A namespaced key starts with the separator.
    if !parts.next()?.is_empty() {
        return None;
    }
    let namespace = parts.next()?;
    UNSTRUCTURED_NAMESPACES
        .contains(&namespace)
        .then_some(namespace)
}

/// Decodes a raw store pair into a domain [`Kv`].
///
/// Structured keys must parse fully; keys under an unstructured namespace are
/// passed through with only the namespace extracted.
pub fn decode_kv(raw: &RawKv) -> Result<Kv, ParseError> {
    match parse_service_key(&raw.key) {
        Ok((namespace, service)) => Ok(Kv {
            namespace,
            service: Some(service),
            raw_key: raw.key.clone(),
            value: raw.value.clone(),
        }),
        Err(err) => match unstructured_namespace(&raw.key) {
            Some(namespace) => Ok(Kv {
                namespace: namespace.to_string(),
                service: None,
                raw_key: raw.key.clone(),
                value: raw.value.clone(),
            }),
            None => Err(err),
        },
    }
}
