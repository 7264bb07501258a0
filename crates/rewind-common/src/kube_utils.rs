//! Kubernetes utility functions shared by the Rewind controllers

use std::path::Path;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};

use crate::Error;

/// Default connection timeout for kube clients (5s is plenty for local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Load a client configuration from an optional kubeconfig path with default timeouts
///
/// Without a path the configuration is inferred (in-cluster service account
/// or `KUBECONFIG`).
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config("kubeconfig", format!("failed to read kubeconfig: {}", e))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::config("kubeconfig", format!("failed to load kubeconfig: {}", e))
                })?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config("local", format!("failed to infer config: {}", e)))?,
    };
    apply_default_timeouts(&mut config);
    Ok(config)
}

/// Set the default connect and read timeouts on a configuration
pub fn apply_default_timeouts(config: &mut Config) {
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
}

/// Build a client from a fully resolved configuration
pub fn client_from_config(config: Config) -> Result<Client, Error> {
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    client_from_config(load_config(kubeconfig).await?)
}

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch.
///
/// Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<T, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await
}

/// Fetch a namespaced resource, mapping 404 to `None`
pub async fn get_opt<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> std::result::Result<Option<T>, kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    api.get_opt(name).await
}

/// True when a kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Split a queue key of the form `namespace/name`
///
/// A key without a slash is treated as a bare name in the default namespace.
/// Keys with more than one slash are rejected.
pub fn split_key(key: &str) -> Result<(&str, &str), Error> {
    let mut parts = key.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) if !name.is_empty() => Ok(("", name)),
        (Some(ns), Some(name), None) if !name.is_empty() => Ok((ns, name)),
        _ => Err(Error::validation_for(
            key,
            format!("unexpected key format: {:?}", key),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_key_accepts_namespaced_keys() {
        assert_eq!(split_key("velero/foo").unwrap(), ("velero", "foo"));
        assert_eq!(split_key("foo").unwrap(), ("", "foo"));
    }

    #[test]
    fn split_key_rejects_malformed_keys() {
        assert!(split_key("foo/bar/baz").is_err());
        assert!(split_key("velero/").is_err());
        assert!(split_key("").is_err());
    }

    #[test]
    fn not_found_detection() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(is_not_found(&err));

        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(!is_not_found(&err));
    }

    #[test]
    fn default_timeouts_are_applied() {
        let mut config = Config::new("https://127.0.0.1:6443".parse().unwrap());
        apply_default_timeouts(&mut config);
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.read_timeout, Some(DEFAULT_READ_TIMEOUT));
    }
}
