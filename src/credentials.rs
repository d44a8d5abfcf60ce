//! Credential broker
//!
//! Turns a [`ClusterHandle`] into a [`ClientContext`] that the cluster API
//! client and the package installer both understand. Two auth shapes are
//! supported: static key material (bearer token or client certificate) and an
//! exec plugin that mints a short-lived token per request.
//!
//! Secret strings live in [`Secret`], which wipes its buffer on drop and never
//! prints or serializes its contents. The broker keeps the contexts it issued
//! so [`CredentialBroker::scrub`] can release all of them at the end of a run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Serialize, Serializer};
use tracing::debug;
use zeroize::Zeroizing;

use crate::cluster::{AuthDescriptor, ClusterHandle};
use crate::{Error, Result};

/// API version of the exec credential plugin protocol
pub const EXEC_API_VERSION: &str = "client.authentication.k8s.io/v1beta1";

const PEM_CERTIFICATE_HEADER: &str = "-----BEGIN CERTIFICATE-----";

/// A secret string, zeroized on drop and redacted in output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the secret value
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("<redacted>")
    }
}

/// Resolved authentication for a client context
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    /// Token minted by running a command per request
    Exec {
        /// Program to run
        command: String,
        /// Program arguments
        args: Vec<String>,
        /// Extra environment for the program
        env: BTreeMap<String, String>,
    },
    /// Static bearer token
    Token(Secret),
    /// Static client certificate (both base64 PEM)
    ClientCertificate {
        /// Certificate
        certificate: String,
        /// Private key
        key: Secret,
    },
}

/// A runnable client context for one cluster
#[derive(Debug, PartialEq, Eq)]
pub struct ClientContext {
    name: String,
    endpoint: String,
    ca_bundle: String,
    auth: ClientAuth,
}

impl ClientContext {
    /// Context name (also used as the kubeconfig cluster and user name)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// API server URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Resolved authentication
    pub fn auth(&self) -> &ClientAuth {
        &self.auth
    }

    /// The same cluster, authenticated with a static bearer token
    pub fn with_token(&self, token: Secret) -> ClientContext {
        ClientContext {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            ca_bundle: self.ca_bundle.clone(),
            auth: ClientAuth::Token(token),
        }
    }

    /// True when every request runs an external token command
    pub fn uses_exec(&self) -> bool {
        matches!(self.auth, ClientAuth::Exec { .. })
    }

    /// Render a single-context kubeconfig for this cluster
    ///
    /// The output contains secret material for static auth, so it is handed
    /// back in a zeroizing buffer.
    pub fn to_kubeconfig_yaml(&self) -> Result<Zeroizing<String>> {
        let user = match &self.auth {
            ClientAuth::Exec { command, args, env } => KubeconfigUser {
                exec: Some(KubeconfigExec {
                    api_version: EXEC_API_VERSION.to_string(),
                    command: command.clone(),
                    args: args.clone(),
                    env: env
                        .iter()
                        .map(|(name, value)| KubeconfigEnv {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect(),
                    interactive_mode: "Never".to_string(),
                }),
                ..Default::default()
            },
            ClientAuth::Token(token) => KubeconfigUser {
                token: Some(token.expose()),
                ..Default::default()
            },
            ClientAuth::ClientCertificate { certificate, key } => KubeconfigUser {
                client_certificate_data: Some(certificate.as_str()),
                client_key_data: Some(key.expose()),
                ..Default::default()
            },
        };

        let kubeconfig = Kubeconfig {
            api_version: "v1",
            kind: "Config",
            clusters: vec![KubeconfigNamed {
                name: &self.name,
                cluster: KubeconfigCluster {
                    server: &self.endpoint,
                    certificate_authority_data: &self.ca_bundle,
                },
            }],
            users: vec![KubeconfigNamedUser {
                name: &self.name,
                user,
            }],
            contexts: vec![KubeconfigNamedContext {
                name: &self.name,
                context: KubeconfigContext {
                    cluster: &self.name,
                    user: &self.name,
                },
            }],
            current_context: &self.name,
        };

        serde_yaml::to_string(&kubeconfig)
            .map(Zeroizing::new)
            .map_err(|e| Error::serialization(format!("failed to render kubeconfig: {}", e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig<'a> {
    #[serde(rename = "apiVersion")]
    api_version: &'a str,
    kind: &'a str,
    clusters: Vec<KubeconfigNamed<'a>>,
    users: Vec<KubeconfigNamedUser<'a>>,
    contexts: Vec<KubeconfigNamedContext<'a>>,
    current_context: &'a str,
}

#[derive(Serialize)]
struct KubeconfigNamed<'a> {
    name: &'a str,
    cluster: KubeconfigCluster<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigCluster<'a> {
    server: &'a str,
    certificate_authority_data: &'a str,
}

#[derive(Serialize)]
struct KubeconfigNamedUser<'a> {
    name: &'a str,
    user: KubeconfigUser<'a>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigUser<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_certificate_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_key_data: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec: Option<KubeconfigExec>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeconfigExec {
    api_version: String,
    command: String,
    args: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env: Vec<KubeconfigEnv>,
    interactive_mode: String,
}

#[derive(Serialize)]
struct KubeconfigEnv {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct KubeconfigNamedContext<'a> {
    name: &'a str,
    context: KubeconfigContext<'a>,
}

#[derive(Serialize)]
struct KubeconfigContext<'a> {
    cluster: &'a str,
    user: &'a str,
}

/// Issues client contexts for the duration of one run
#[derive(Debug, Default)]
pub struct CredentialBroker {
    issued: Mutex<Vec<Arc<ClientContext>>>,
}

impl CredentialBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a handle into a client context
    ///
    /// The endpoint, CA bundle and key material are validated here so that a
    /// broken handle fails its branch before anything is installed.
    pub fn resolve(&self, handle: &ClusterHandle) -> Result<Arc<ClientContext>> {
        if !handle.endpoint.starts_with("https://") {
            return Err(Error::credential(format!(
                "cluster {} endpoint '{}' is not an https URL",
                handle.cluster_name, handle.endpoint
            )));
        }
        validate_pem_bundle(&handle.ca_bundle, "CA bundle", &handle.cluster_name)?;

        let auth = match &handle.auth {
            AuthDescriptor::Exec { command, args, env } => {
                if command.trim().is_empty() {
                    return Err(Error::credential(format!(
                        "cluster {} exec auth has no command",
                        handle.cluster_name
                    )));
                }
                ClientAuth::Exec {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                }
            }
            AuthDescriptor::Token { token } => {
                if token.expose().is_empty() {
                    return Err(Error::credential(format!(
                        "cluster {} token is empty",
                        handle.cluster_name
                    )));
                }
                ClientAuth::Token(token.clone())
            }
            AuthDescriptor::ClientCertificate { certificate, key } => {
                validate_pem_bundle(certificate, "client certificate", &handle.cluster_name)?;
                ClientAuth::ClientCertificate {
                    certificate: certificate.clone(),
                    key: key.clone(),
                }
            }
        };

        let context = Arc::new(ClientContext {
            name: handle.cluster_name.clone(),
            endpoint: handle.endpoint.clone(),
            ca_bundle: handle.ca_bundle.clone(),
            auth,
        });

        debug!(
            cluster = %handle.cluster_name,
            exec = context.uses_exec(),
            "Resolved client context"
        );
        self.lock().push(context.clone());
        Ok(context)
    }

    /// Number of contexts currently held
    pub fn issued(&self) -> usize {
        self.lock().len()
    }

    /// Drop every issued context, returning how many were released
    ///
    /// Secret material is wiped once the last holder of a context lets go.
    pub fn scrub(&self) -> usize {
        let mut issued = self.lock();
        let count = issued.len();
        issued.clear();
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ClientContext>>> {
        self.issued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_pem_bundle(encoded: &str, what: &str, cluster: &str) -> Result<()> {
    let decoded = Zeroizing::new(STANDARD.decode(encoded.trim()).map_err(|e| {
        Error::credential(format!("cluster {} {} is not base64: {}", cluster, what, e))
    })?);
    let text = String::from_utf8_lossy(&decoded);
    if !text.contains(PEM_CERTIFICATE_HEADER) {
        return Err(Error::credential(format!(
            "cluster {} {} does not contain a PEM certificate",
            cluster, what
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pem_b64() -> String {
        STANDARD.encode("-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n")
    }

    fn handle(auth: AuthDescriptor) -> ClusterHandle {
        ClusterHandle {
            cluster_name: "mesh-west".to_string(),
            endpoint: "https://34.1.2.3".to_string(),
            ca_bundle: pem_b64(),
            auth,
            kubernetes_version: None,
            node_count: None,
        }
    }

    #[test]
    fn test_resolve_token_context_renders_kubeconfig() {
        let broker = CredentialBroker::new();
        let ctx = broker
            .resolve(&handle(AuthDescriptor::Token {
                token: Secret::new("ya29.token"),
            }))
            .unwrap();

        assert_eq!(ctx.name(), "mesh-west");
        assert!(!ctx.uses_exec());

        let yaml = ctx.to_kubeconfig_yaml().unwrap();
        assert!(yaml.contains("server: https://34.1.2.3"));
        assert!(yaml.contains("token: ya29.token"));
        assert!(yaml.contains("current-context: mesh-west"));
        assert!(yaml.contains("certificate-authority-data:"));
    }

    #[test]
    fn test_resolve_exec_context_renders_plugin() {
        let broker = CredentialBroker::new();
        let mut env = BTreeMap::new();
        env.insert("AWS_PROFILE".to_string(), "mesh".to_string());
        let ctx = broker
            .resolve(&handle(AuthDescriptor::Exec {
                command: "aws".to_string(),
                args: vec!["eks".into(), "get-token".into()],
                env,
            }))
            .unwrap();

        assert!(ctx.uses_exec());
        let yaml = ctx.to_kubeconfig_yaml().unwrap();
        assert!(yaml.contains(EXEC_API_VERSION));
        assert!(yaml.contains("command: aws"));
        assert!(yaml.contains("AWS_PROFILE"));
        assert!(!yaml.contains("token:"));
    }

    #[test]
    fn test_resolve_rejects_plain_http_endpoint() {
        let broker = CredentialBroker::new();
        let mut h = handle(AuthDescriptor::Token {
            token: Secret::new("t"),
        });
        h.endpoint = "http://34.1.2.3".to_string();
        assert!(matches!(broker.resolve(&h), Err(Error::Credential(_))));
        assert_eq!(broker.issued(), 0);
    }

    #[test]
    fn test_resolve_rejects_malformed_ca() {
        let broker = CredentialBroker::new();
        let mut h = handle(AuthDescriptor::Token {
            token: Secret::new("t"),
        });
        h.ca_bundle = "not base64!".to_string();
        assert!(matches!(broker.resolve(&h), Err(Error::Credential(_))));

        h.ca_bundle = STANDARD.encode("just text");
        let err = broker.resolve(&h).unwrap_err();
        assert!(err.to_string().contains("PEM"));
    }

    #[test]
    fn test_resolve_rejects_empty_exec_command() {
        let broker = CredentialBroker::new();
        let h = handle(AuthDescriptor::Exec {
            command: " ".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        });
        assert!(broker.resolve(&h).is_err());
    }

    #[test]
    fn test_scrub_releases_issued_contexts() {
        let broker = CredentialBroker::new();
        let ctx = broker
            .resolve(&handle(AuthDescriptor::Token {
                token: Secret::new("t"),
            }))
            .unwrap();
        assert_eq!(broker.issued(), 1);
        assert_eq!(Arc::strong_count(&ctx), 2);

        assert_eq!(broker.scrub(), 1);
        assert_eq!(broker.issued(), 0);
        assert_eq!(Arc::strong_count(&ctx), 1);
    }

    #[test]
    fn test_with_token_keeps_cluster_and_swaps_auth() {
        let broker = CredentialBroker::new();
        let ctx = broker
            .resolve(&handle(AuthDescriptor::Exec {
                command: "aws".to_string(),
                args: vec![],
                env: BTreeMap::new(),
            }))
            .unwrap();

        let remote = ctx.with_token(Secret::new("sa-token"));
        assert_eq!(remote.name(), ctx.name());
        assert_eq!(remote.endpoint(), ctx.endpoint());
        assert!(!remote.uses_exec());
        assert!(remote.to_kubeconfig_yaml().unwrap().contains("token: sa-token"));
        assert_eq!(broker.issued(), 1);
    }

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"<redacted>\"");
        assert_eq!(secret.expose(), "hunter2");
    }
}
