//! Kubernetes source.
//!
//! An app maps to a `NodePort` service of the same name. Its backends are
//! the host IPs of the service's running pods, paired with the service's
//! node port. Changes are detected by watching the namespace's `Endpoints`
//! collection.

use super::kubeconfig::ClusterAccess;
use super::lines::LineBuffer;
use super::DiscoverySource;
use crate::error::DiscoveryError;
use crate::registry::AppDescriptor;
use crate::types::{BackendSet, ChangeEvent, Endpoint};
use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct KubernetesSource {
    /// `<server>/api/v1/namespaces/<namespace>`
    base_url: String,
    client: Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Service {
    spec: ServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ServiceSpec {
    #[serde(default)]
    ports: Vec<ServicePort>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePort {
    node_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct Endpoints {
    #[serde(default)]
    subsets: Option<Vec<EndpointSubset>>,
}

#[derive(Debug, Deserialize)]
struct EndpointSubset {
    #[serde(default)]
    addresses: Option<Vec<EndpointAddress>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointAddress {
    target_ref: Option<ObjectReference>,
}

#[derive(Debug, Deserialize)]
struct ObjectReference {
    kind: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Pod {
    pub status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    pub phase: Option<String>,
    #[serde(rename = "hostIP")]
    pub host_ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListMeta {
    #[serde(rename = "resourceVersion")]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
struct EndpointsList {
    metadata: ListMeta,
}

#[derive(Debug, Deserialize)]
struct WatchEvent {
    #[serde(rename = "type")]
    kind: String,
    object: WatchObject,
}

#[derive(Debug, Default, Deserialize)]
struct WatchObject {
    #[serde(default)]
    metadata: ObjectMeta,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ObjectMeta {
    name: Option<String>,
}

impl KubernetesSource {
    pub fn new(access: &ClusterAccess, namespace: &str, timeout: Duration) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(access.insecure_skip_tls_verify);

        if let Some(ca) = &access.ca_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(ca)?);
        }
        if let Some(identity) = &access.identity_pem {
            builder = builder.identity(Identity::from_pem(identity)?);
        }
        if let Some(token) = &access.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            value.set_sensitive(true);
            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        info!("Using Kubernetes API at {} (namespace {})", access.server, namespace);
        Ok(Self {
            base_url: format!(
                "{}/api/v1/namespaces/{}",
                access.server.trim_end_matches('/'),
                namespace
            ),
            client: builder.build()?,
            timeout,
        })
    }

    /// GETs `<namespace>/<path>`. `Ok(None)` means HTTP 404.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, DiscoveryError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self.client.get(&url).timeout(self.timeout).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DiscoveryError::Unavailable(format!(
                "GET {} returned HTTP {}: {}",
                url, status, body
            )));
        }
        Ok(Some(response.json().await?))
    }
}

#[async_trait]
impl DiscoverySource for KubernetesSource {
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        let service: Service = self
            .get(&format!("services/{}", app.name))
            .await?
            .ok_or_else(|| DiscoveryError::NotFound(app.name.clone()))?;

        // Only the first declared port is load balanced.
        let node_port = service
            .spec
            .ports
            .first()
            .and_then(|p| p.node_port)
            .unwrap_or(0);
        if node_port == 0 {
            warn!("Service {} does not have a node port", app.name);
            return Ok(BackendSet::new());
        }

        let endpoints: Endpoints = self
            .get(&format!("endpoints/{}", app.name))
            .await?
            .unwrap_or_default();

        let mut pods = Vec::new();
        for name in pod_names(&endpoints) {
            match self.get::<Pod>(&format!("pods/{}", name)).await? {
                Some(pod) => pods.push(pod),
                None => debug!("Pod {} of {} disappeared", name, app.name),
            }
        }

        Ok(backends_from_pods(node_port, &pods))
    }

    async fn watch(
        &self,
        app: &AppDescriptor,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        let list: EndpointsList = self
            .get("endpoints")
            .await?
            .ok_or_else(|| DiscoveryError::Unavailable("endpoints collection not found".into()))?;
        let cursor = list.metadata.resource_version;

        let url = format!(
            "{}/endpoints?watch=true&resourceVersion={}",
            self.base_url, cursor
        );
        let response = self.client.get(&url).send().await?.error_for_status()?;
        info!("Watching endpoints for app {} from version {}", app.name, cursor);
        if events.send(ChangeEvent::subscribed(&app.name)).await.is_err() {
            return Ok(());
        }

        let mut lines = LineBuffer::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for line in lines.push(&chunk?) {
                if let Some(change) = classify_line(&app.name, &line)? {
                    if events.send(change).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }
}

/// Distinct pod names referenced by any subset of an Endpoints object.
fn pod_names(endpoints: &Endpoints) -> BTreeSet<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .filter_map(|addr| addr.target_ref.as_ref())
        .filter(|r| r.kind.as_deref().map_or(true, |k| k == "Pod"))
        .filter_map(|r| r.name.clone())
        .collect()
}

/// `(hostIP, node_port)` for every running pod.
pub fn backends_from_pods(node_port: u16, pods: &[Pod]) -> BackendSet {
    pods.iter()
        .filter(|pod| pod.status.phase.as_deref() == Some("Running"))
        .filter_map(|pod| pod.status.host_ip.as_ref())
        .map(|host| Endpoint::new(host.clone(), node_port))
        .collect()
}

/// Parses one watch line. An `ERROR` event ends the watch so that the
/// caller restarts it from a fresh resource version.
fn classify_line(app: &str, line: &str) -> Result<Option<ChangeEvent>, DiscoveryError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let event: WatchEvent = serde_json::from_str(line)?;
    if event.kind == "ERROR" {
        return Err(DiscoveryError::Unavailable(format!(
            "watch error: {}",
            event.object.message.unwrap_or_default()
        )));
    }
    if event.object.metadata.name.as_deref() != Some(app) {
        return Ok(None);
    }
    Ok(Some(ChangeEvent::relevant(
        app,
        format!("endpoints {}", event.kind.to_lowercase()),
    )))
}
