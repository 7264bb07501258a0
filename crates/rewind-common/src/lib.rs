//! Common types for Rewind: CRDs, errors, labels, and cluster clients

#![deny(missing_docs)]

pub mod clusters;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod labels;
pub mod telemetry;

pub use clusters::{ClusterClients, ClusterCredentials, ClusterRole};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the operator runs in and watches by default
pub const DEFAULT_NAMESPACE: &str = "velero";

/// Field manager used for every patch issued by the operator
pub const FIELD_MANAGER: &str = "rewind-operator";

/// API group shared by all Rewind resources
pub const API_GROUP: &str = "velero.io";
