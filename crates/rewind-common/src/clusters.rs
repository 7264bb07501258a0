//! Multi-cluster client resolution
//!
//! Backups may be taken on a source cluster and restored on a destination
//! cluster that differ from the cluster the operator runs in. Credentials for
//! those clusters live in secrets in the operator namespace:
//!
//! - `remotecluster`: shared by both roles, checked first
//! - `srccluster` / `destcluster`: role-specific
//!
//! When neither is present the local cluster configuration is used. Secrets
//! are re-read on every resolution so rotated credentials take effect without
//! a restart.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use parking_lot::RwLock;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::kube_utils::{apply_default_timeouts, client_from_config, load_config};
use crate::Error;

/// Secret shared by the source and destination roles
pub const SHARED_CLUSTER_SECRET: &str = "remotecluster";
/// Secret holding source cluster credentials
pub const SOURCE_CLUSTER_SECRET: &str = "srccluster";
/// Secret holding destination cluster credentials
pub const DESTINATION_CLUSTER_SECRET: &str = "destcluster";

/// Secret key holding the API server URL
pub const HOST_KEY: &str = "host";
/// Secret key holding the service account bearer token
pub const TOKEN_KEY: &str = "sa-token";
/// Secret key holding a complete kubeconfig document
pub const KUBECONFIG_KEY: &str = "kubeconfig";
/// Secret key holding an HTTPS proxy URL
pub const HTTPS_PROXY_KEY: &str = "https_proxy";

/// Which cluster a client should talk to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    /// The cluster the operator runs in
    Local,
    /// The cluster backups are taken from
    Source,
    /// The cluster restores are applied to
    Destination,
}

impl ClusterRole {
    /// Role-specific secret name, `None` for the local cluster
    pub fn secret_name(&self) -> Option<&'static str> {
        match self {
            Self::Local => None,
            Self::Source => Some(SOURCE_CLUSTER_SECRET),
            Self::Destination => Some(DESTINATION_CLUSTER_SECRET),
        }
    }
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Source => write!(f, "source"),
            Self::Destination => write!(f, "destination"),
        }
    }
}

/// Raw credential fields read from a cluster secret
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretCredentials {
    /// API server URL
    pub host: String,
    /// Service account bearer token
    pub token: String,
    /// Complete kubeconfig document
    pub kubeconfig: String,
    /// HTTPS proxy URL
    pub https_proxy: String,
}

impl std::fmt::Debug for SecretCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCredentials")
            .field("host", &self.host)
            .field("token", &redact(&self.token))
            .field("kubeconfig", &redact(&self.kubeconfig))
            .field("https_proxy", &self.https_proxy)
            .finish()
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl SecretCredentials {
    /// Extract credential fields from secret data; missing keys are empty
    pub fn from_secret_data(
        secret_name: &str,
        data: &BTreeMap<String, ByteString>,
    ) -> Result<Self, Error> {
        let field = |key: &str| -> Result<String, Error> {
            match data.get(key) {
                Some(bytes) => String::from_utf8(bytes.0.clone()).map_err(|_| {
                    Error::config(secret_name, format!("key {} is not valid UTF-8", key))
                }),
                None => Ok(String::new()),
            }
        };

        Ok(Self {
            host: field(HOST_KEY)?,
            token: field(TOKEN_KEY)?,
            kubeconfig: field(KUBECONFIG_KEY)?,
            https_proxy: field(HTTPS_PROXY_KEY)?,
        })
    }

    /// A secret whose fields are all empty counts as absent
    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
            && self.token.is_empty()
            && self.kubeconfig.is_empty()
            && self.https_proxy.is_empty()
    }
}

/// Resolved connection shape for a cluster
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterCredentials {
    /// A full kubeconfig; TLS settings come from the document
    Kubeconfig {
        /// The kubeconfig YAML
        kubeconfig: String,
    },
    /// Direct API server access with a bearer token
    ///
    /// Certificate validation is disabled for this shape. Operators who need
    /// TLS verification must supply a kubeconfig instead.
    BearerToken {
        /// API server URL
        host: String,
        /// Service account token
        token: String,
    },
    /// The local cluster configuration
    Local,
}

impl std::fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kubeconfig { .. } => f.write_str("Kubeconfig { <redacted> }"),
            Self::BearerToken { host, .. } => f
                .debug_struct("BearerToken")
                .field("host", host)
                .field("token", &"<redacted>")
                .finish(),
            Self::Local => f.write_str("Local"),
        }
    }
}

impl ClusterCredentials {
    /// Pick the connection shape for a selected secret
    ///
    /// A kubeconfig wins over host/token. No secret means local.
    pub fn from_secret(creds: Option<&SecretCredentials>) -> Self {
        match creds {
            Some(c) if !c.kubeconfig.is_empty() => Self::Kubeconfig {
                kubeconfig: c.kubeconfig.clone(),
            },
            Some(c) => Self::BearerToken {
                host: c.host.clone(),
                token: c.token.clone(),
            },
            None => Self::Local,
        }
    }
}

/// Three-way credential priority: shared secret, then role secret, then local
///
/// Empty secrets are treated as absent.
pub fn select_credentials(
    shared: Option<SecretCredentials>,
    role: Option<SecretCredentials>,
) -> Option<SecretCredentials> {
    shared
        .filter(|c| !c.is_empty())
        .or_else(|| role.filter(|c| !c.is_empty()))
}

/// Operator-level proxy wins over the one in the secret
pub fn effective_proxy<'a>(operator: Option<&'a str>, secret: Option<&'a str>) -> Option<&'a str> {
    operator
        .filter(|p| !p.is_empty())
        .or_else(|| secret.filter(|p| !p.is_empty()))
}

/// Reads secret data from the operator namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Data of the named secret, `None` if it does not exist
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, ByteString>>, Error>;
}

/// Real secret reader backed by the local cluster
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader using the given local client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, ByteString>>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get_opt(name).await?;
        Ok(secret.map(|s| s.data.unwrap_or_default()))
    }
}

#[derive(Debug, Default)]
struct ClusterHosts {
    source: Option<String>,
    destination: Option<String>,
}

/// Builds clients for the local, source and destination clusters
pub struct ClusterClients {
    namespace: String,
    kubeconfig: Option<PathBuf>,
    https_proxy: Option<String>,
    secrets: Arc<dyn SecretReader>,
    hosts: RwLock<ClusterHosts>,
}

impl ClusterClients {
    /// Create a resolver that reads credential secrets through `local_client`
    pub fn new(
        local_client: Client,
        namespace: impl Into<String>,
        kubeconfig: Option<PathBuf>,
        https_proxy: Option<String>,
    ) -> Self {
        Self::with_secret_reader(
            Arc::new(KubeSecretReader::new(local_client)),
            namespace,
            kubeconfig,
            https_proxy,
        )
    }

    /// Create a resolver with a custom secret reader
    pub fn with_secret_reader(
        secrets: Arc<dyn SecretReader>,
        namespace: impl Into<String>,
        kubeconfig: Option<PathBuf>,
        https_proxy: Option<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kubeconfig,
            https_proxy: https_proxy.filter(|p| !p.is_empty()),
            secrets,
            hosts: RwLock::new(ClusterHosts::default()),
        }
    }

    /// Namespace the credential secrets are read from
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Operator-level HTTPS proxy override
    pub fn https_proxy(&self) -> Option<&str> {
        self.https_proxy.as_deref()
    }

    /// Host of the source cluster as of the last resolution
    pub fn source_cluster_host(&self) -> Option<String> {
        self.hosts.read().source.clone()
    }

    /// Host of the destination cluster as of the last resolution
    pub fn destination_cluster_host(&self) -> Option<String> {
        self.hosts.read().destination.clone()
    }

    async fn read_credentials(&self, name: &str) -> Result<Option<SecretCredentials>, Error> {
        match self.secrets.read_secret(&self.namespace, name).await? {
            Some(data) => Ok(Some(SecretCredentials::from_secret_data(name, &data)?)),
            None => Ok(None),
        }
    }

    async fn select(&self, role: ClusterRole) -> Result<Option<SecretCredentials>, Error> {
        let Some(role_secret) = role.secret_name() else {
            return Ok(None);
        };

        let shared = self.read_credentials(SHARED_CLUSTER_SECRET).await?;
        if shared.as_ref().is_some_and(|c| !c.is_empty()) {
            return Ok(select_credentials(shared, None));
        }
        let specific = self.read_credentials(role_secret).await?;
        Ok(select_credentials(shared, specific))
    }

    fn record_host(&self, role: ClusterRole, host: Option<String>) {
        let mut hosts = self.hosts.write();
        match role {
            ClusterRole::Source => hosts.source = host,
            ClusterRole::Destination => hosts.destination = host,
            ClusterRole::Local => {}
        }
    }

    /// Resolve the connection shape for a role without building a config
    pub async fn credentials(&self, role: ClusterRole) -> Result<ClusterCredentials, Error> {
        let selected = self.select(role).await?;
        Ok(ClusterCredentials::from_secret(selected.as_ref()))
    }

    /// Resolve a client configuration for a role
    pub async fn config(&self, role: ClusterRole) -> Result<Config, Error> {
        let selected = self.select(role).await?;
        let credentials = ClusterCredentials::from_secret(selected.as_ref());
        self.record_host(role, selected.as_ref().map(|c| c.host.clone()));

        let context = role.secret_name().unwrap_or("local");
        debug!(role = %role, credentials = ?credentials, "resolved cluster credentials");

        let mut config = match &credentials {
            ClusterCredentials::Local => return load_config(self.kubeconfig.as_deref()).await,
            ClusterCredentials::Kubeconfig { kubeconfig } => {
                kubeconfig_config(context, kubeconfig).await?
            }
            ClusterCredentials::BearerToken { host, token } => {
                bearer_token_config(context, host, token)?
            }
        };

        let secret_proxy = selected.as_ref().map(|c| c.https_proxy.as_str());
        if let Some(proxy) = effective_proxy(self.https_proxy.as_deref(), secret_proxy) {
            config.proxy_url = Some(parse_proxy(context, proxy)?);
        }

        Ok(config)
    }

    /// Build a client for a role
    pub async fn client(&self, role: ClusterRole) -> Result<Client, Error> {
        let config = self.config(role).await?;
        info!(role = %role, cluster_url = %config.cluster_url, "created cluster client");
        client_from_config(config)
    }

    /// Build a client for the local cluster
    pub async fn local_client(&self) -> Result<Client, Error> {
        self.client(ClusterRole::Local).await
    }

    /// Local kubeconfig path, if one was configured
    pub fn kubeconfig(&self) -> Option<&Path> {
        self.kubeconfig.as_deref()
    }
}

async fn kubeconfig_config(context: &str, kubeconfig: &str) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
        .map_err(|e| Error::config(context, format!("invalid kubeconfig: {}", e)))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(context, format!("failed to load kubeconfig: {}", e)))?;
    apply_default_timeouts(&mut config);
    Ok(config)
}

fn bearer_token_config(context: &str, host: &str, token: &str) -> Result<Config, Error> {
    let cluster_url: http::Uri = host
        .parse()
        .map_err(|e| Error::config(context, format!("invalid host {:?}: {}", host, e)))?;
    let mut config = Config::new(cluster_url);
    config.auth_info.token = Some(token.to_string().into());
    config.accept_invalid_certs = true;
    apply_default_timeouts(&mut config);
    Ok(config)
}

fn parse_proxy(context: &str, proxy: &str) -> Result<http::Uri, Error> {
    let uri: http::Uri = proxy
        .parse()
        .map_err(|e| Error::config(context, format!("invalid proxy URL {:?}: {}", proxy, e)))?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(Error::config(
            context,
            format!("invalid proxy URL {:?}: scheme and host are required", proxy),
        ));
    }
    Ok(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: remote
  cluster:
    server: https://remote.example.com:6443
contexts:
- name: remote
  context:
    cluster: remote
    user: admin
current-context: remote
users:
- name: admin
  user:
    token: kubeconfig-token
"#;

    fn creds(host: &str, token: &str) -> SecretCredentials {
        SecretCredentials {
            host: host.to_string(),
            token: token.to_string(),
            ..Default::default()
        }
    }

    fn secret_data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    /// Mock that serves the given secrets and reports the rest as missing
    fn reader(secrets: Vec<(&'static str, BTreeMap<String, ByteString>)>) -> MockSecretReader {
        let mut mock = MockSecretReader::new();
        let secrets: BTreeMap<&'static str, _> = secrets.into_iter().collect();
        mock.expect_read_secret()
            .with(eq("velero"), mockall::predicate::always())
            .returning(move |_, name| Ok(secrets.get(name).cloned()));
        mock
    }

    fn clients(mock: MockSecretReader, proxy: Option<&str>) -> ClusterClients {
        ClusterClients::with_secret_reader(
            Arc::new(mock),
            "velero",
            None,
            proxy.map(str::to_string),
        )
    }

    // =========================================================================
    // Priority
    // =========================================================================

    #[test]
    fn shared_secret_wins_over_role_secret() {
        let selected = select_credentials(
            Some(creds("https://shared", "a")),
            Some(creds("https://role", "b")),
        );
        assert_eq!(selected.map(|c| c.host), Some("https://shared".to_string()));
    }

    #[test]
    fn empty_shared_secret_falls_through_to_role_secret() {
        let selected = select_credentials(
            Some(SecretCredentials::default()),
            Some(creds("https://role", "b")),
        );
        assert_eq!(selected.map(|c| c.host), Some("https://role".to_string()));
    }

    #[test]
    fn nothing_usable_falls_back_to_local() {
        let selected = select_credentials(None, Some(SecretCredentials::default()));
        assert!(selected.is_none());
        assert_eq!(
            ClusterCredentials::from_secret(selected.as_ref()),
            ClusterCredentials::Local
        );
    }

    #[test]
    fn kubeconfig_wins_over_token() {
        let c = SecretCredentials {
            host: "https://remote".to_string(),
            token: "t".to_string(),
            kubeconfig: KUBECONFIG.to_string(),
            https_proxy: String::new(),
        };
        assert!(matches!(
            ClusterCredentials::from_secret(Some(&c)),
            ClusterCredentials::Kubeconfig { .. }
        ));
    }

    #[test]
    fn operator_proxy_overrides_secret_proxy() {
        assert_eq!(
            effective_proxy(Some("http://op:3128"), Some("http://secret:3128")),
            Some("http://op:3128")
        );
        assert_eq!(
            effective_proxy(Some(""), Some("http://secret:3128")),
            Some("http://secret:3128")
        );
        assert_eq!(effective_proxy(None, Some("")), None);
    }

    // =========================================================================
    // Secret parsing
    // =========================================================================

    #[test]
    fn secret_data_missing_keys_are_empty() {
        let data = secret_data(&[(HOST_KEY, "https://remote:6443")]);
        let c = SecretCredentials::from_secret_data("srccluster", &data).unwrap();
        assert_eq!(c.host, "https://remote:6443");
        assert!(c.token.is_empty());
        assert!(!c.is_empty());
        assert!(SecretCredentials::default().is_empty());
    }

    #[test]
    fn secret_data_rejects_invalid_utf8() {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_KEY.to_string(), ByteString(vec![0xff, 0xfe]));
        let err = SecretCredentials::from_secret_data("srccluster", &data).unwrap_err();
        assert_eq!(err.context(), Some("srccluster"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let c = creds("https://remote", "super-secret-token");
        assert!(!format!("{:?}", c).contains("super-secret-token"));

        let shape = ClusterCredentials::from_secret(Some(&c));
        let rendered = format!("{:?}", shape);
        assert!(rendered.contains("https://remote"));
        assert!(!rendered.contains("super-secret-token"));
    }

    // =========================================================================
    // Resolution through the secret reader
    // =========================================================================

    #[tokio::test]
    async fn source_uses_role_secret_with_bearer_token() {
        let mock = reader(vec![(
            SOURCE_CLUSTER_SECRET,
            secret_data(&[(HOST_KEY, "https://src.example.com:6443"), (TOKEN_KEY, "tok")]),
        )]);
        let clients = clients(mock, None);

        let config = clients.config(ClusterRole::Source).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("src.example.com"));
        assert!(config.accept_invalid_certs);
        assert!(config.proxy_url.is_none());
        assert_eq!(
            clients.source_cluster_host(),
            Some("https://src.example.com:6443".to_string())
        );
        assert!(clients.destination_cluster_host().is_none());
    }

    #[tokio::test]
    async fn shared_secret_serves_both_roles() {
        let mock = reader(vec![
            (
                SHARED_CLUSTER_SECRET,
                secret_data(&[(HOST_KEY, "https://shared:6443"), (TOKEN_KEY, "tok")]),
            ),
            (
                DESTINATION_CLUSTER_SECRET,
                secret_data(&[(HOST_KEY, "https://dest:6443"), (TOKEN_KEY, "tok")]),
            ),
        ]);
        let clients = clients(mock, None);

        clients.config(ClusterRole::Destination).await.unwrap();
        assert_eq!(
            clients.destination_cluster_host(),
            Some("https://shared:6443".to_string())
        );
    }

    #[tokio::test]
    async fn kubeconfig_secret_keeps_descriptor_tls_settings() {
        let mock = reader(vec![(
            DESTINATION_CLUSTER_SECRET,
            secret_data(&[(KUBECONFIG_KEY, KUBECONFIG)]),
        )]);
        let clients = clients(mock, None);

        let config = clients.config(ClusterRole::Destination).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("remote.example.com"));
        assert!(!config.accept_invalid_certs);
    }

    #[tokio::test]
    async fn secret_proxy_is_applied_unless_overridden() {
        let data = secret_data(&[
            (HOST_KEY, "https://src:6443"),
            (TOKEN_KEY, "tok"),
            (HTTPS_PROXY_KEY, "http://secret-proxy:3128"),
        ]);

        let clients_a = clients(reader(vec![(SOURCE_CLUSTER_SECRET, data.clone())]), None);
        let config = clients_a.config(ClusterRole::Source).await.unwrap();
        assert_eq!(
            config.proxy_url.as_ref().and_then(|u| u.host()),
            Some("secret-proxy")
        );

        let clients_b = clients(
            reader(vec![(SOURCE_CLUSTER_SECRET, data)]),
            Some("http://operator-proxy:3128"),
        );
        let config = clients_b.config(ClusterRole::Source).await.unwrap();
        assert_eq!(
            config.proxy_url.as_ref().and_then(|u| u.host()),
            Some("operator-proxy")
        );
    }

    #[tokio::test]
    async fn malformed_proxy_is_a_config_error() {
        let mock = reader(vec![(
            SOURCE_CLUSTER_SECRET,
            secret_data(&[
                (HOST_KEY, "https://src:6443"),
                (TOKEN_KEY, "tok"),
                (HTTPS_PROXY_KEY, "not a url"),
            ]),
        )]);
        let clients = clients(mock, None);

        let err = clients.config(ClusterRole::Source).await.unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[tokio::test]
    async fn secret_read_failure_propagates() {
        let mut mock = MockSecretReader::new();
        mock.expect_read_secret()
            .returning(|_, _| Err(Error::internal_with_context("test", "apiserver unavailable")));
        let clients = clients(mock, None);

        assert!(clients.credentials(ClusterRole::Source).await.is_err());
    }

    #[tokio::test]
    async fn local_role_never_reads_secrets() {
        let mut mock = MockSecretReader::new();
        mock.expect_read_secret().never();
        let clients = clients(mock, None);

        assert_eq!(
            clients.credentials(ClusterRole::Local).await.unwrap(),
            ClusterCredentials::Local
        );
    }

    #[tokio::test]
    async fn secrets_are_reread_on_every_resolution() {
        let mut mock = MockSecretReader::new();
        mock.expect_read_secret()
            .with(eq("velero"), eq(SHARED_CLUSTER_SECRET))
            .times(2)
            .returning(|_, _| {
                Ok(Some(secret_data(&[
                    (HOST_KEY, "https://shared:6443"),
                    (TOKEN_KEY, "tok"),
                ])))
            });
        let clients = clients(mock, None);

        clients.credentials(ClusterRole::Source).await.unwrap();
        clients.credentials(ClusterRole::Source).await.unwrap();
    }
}
