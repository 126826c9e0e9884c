//! Kubernetes API access settings, from a kubeconfig file or explicit flags.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose;
use base64::Engine;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Everything needed to build an authenticated API client.
#[derive(Debug, Clone, Default)]
pub struct ClusterAccess {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub token: Option<String>,
    /// Client certificate followed by its private key, PEM encoded.
    pub identity_pem: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct KubeConfigFile {
    #[serde(rename = "current-context", default)]
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<Named<ContextEntry>>,
    #[serde(default)]
    clusters: Vec<Named<ClusterEntry>>,
    #[serde(default)]
    users: Vec<Named<UserEntry>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "context", alias = "cluster", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_key: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
}

impl ClusterAccess {
    /// Reads a kubeconfig and resolves its current context.
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading kubeconfig {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse_kubeconfig(&text, base)
    }

    /// Parses kubeconfig YAML. Relative file references resolve against `base`.
    pub fn parse_kubeconfig(text: &str, base: &Path) -> Result<Self> {
        let doc: KubeConfigFile = serde_yaml::from_str(text).context("parsing kubeconfig")?;

        let context = match doc.current_context.as_deref().filter(|c| !c.is_empty()) {
            Some(name) => doc
                .contexts
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| anyhow!("current-context {} is not defined", name))?,
            None => doc
                .contexts
                .first()
                .ok_or_else(|| anyhow!("kubeconfig defines no contexts"))?,
        };
        let cluster = doc
            .clusters
            .iter()
            .find(|c| c.name == context.value.cluster)
            .map(|c| &c.value)
            .ok_or_else(|| anyhow!("cluster {} is not defined", context.value.cluster))?;
        let user = doc
            .users
            .iter()
            .find(|u| u.name == context.value.user)
            .map(|u| &u.value)
            .ok_or_else(|| anyhow!("user {} is not defined", context.value.user))?;

        let ca_pem = match (&cluster.certificate_authority_data, &cluster.certificate_authority) {
            (Some(data), _) => Some(decode_data(data)?),
            (None, Some(file)) => Some(read_relative(base, file)?),
            (None, None) => None,
        };

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(file)) => Some(read_token(&base.join(file))?),
            (None, None) => None,
        };

        let cert = match (&user.client_certificate_data, &user.client_certificate) {
            (Some(data), _) => Some(decode_data(data)?),
            (None, Some(file)) => Some(read_relative(base, file)?),
            (None, None) => None,
        };
        let key = match (&user.client_key_data, &user.client_key) {
            (Some(data), _) => Some(decode_data(data)?),
            (None, Some(file)) => Some(read_relative(base, file)?),
            (None, None) => None,
        };
        let identity_pem = match (cert, key) {
            (Some(mut cert), Some(key)) => {
                cert.push(b'\n');
                cert.extend_from_slice(&key);
                Some(cert)
            }
            _ => None,
        };

        Ok(Self {
            server: cluster.server.clone(),
            ca_pem,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            token,
            identity_pem,
        })
    }

    /// Access settings given directly on the command line.
    pub fn explicit(
        server: &str,
        token: Option<String>,
        token_file: Option<&Path>,
        ca: Option<&Path>,
        insecure_skip_tls_verify: bool,
    ) -> Result<Self> {
        let token = match (token, token_file) {
            (Some(token), _) => Some(token),
            (None, Some(file)) => Some(read_token(file)?),
            (None, None) => None,
        };
        let ca_pem = match ca {
            Some(path) => Some(
                fs::read(path).with_context(|| format!("reading CA {}", path.display()))?,
            ),
            None => None,
        };

        Ok(Self {
            server: server.to_string(),
            ca_pem,
            insecure_skip_tls_verify,
            token,
            identity_pem: None,
        })
    }
}

fn decode_data(data: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data.trim())
        .context("decoding base64 kubeconfig data")
}

fn read_relative(base: &Path, file: &Path) -> Result<Vec<u8>> {
    let path = base.join(file);
    fs::read(&path).with_context(|| format!("reading {}", path.display()))
}

fn read_token(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)
        .with_context(|| format!("reading token file {}", path.display()))?
        .trim()
        .to_string())
}
