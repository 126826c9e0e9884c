use super::DiscoverySource;
use crate::error::DiscoveryError;
use crate::registry::AppDescriptor;
use crate::types::{BackendSet, ChangeEvent, Endpoint};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, EventMessage};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Container actions that can change an app's published endpoints.
const WATCHED_ACTIONS: [&str; 3] = ["start", "kill", "die"];
const CLOCK_SLACK: Duration = Duration::from_secs(5);

/// Connection settings for the Docker / Swarm API.
#[derive(Debug, Clone, Default)]
pub struct SwarmOptions {
    pub url: String,
    pub tls_ca_cert: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub allow_insecure: bool,
    pub timeout_secs: u64,
}

/// Discovers app backends from running containers labelled
/// `<appkey>=<app name>`.
pub struct SwarmSource {
    docker: Docker,
    appkey: String,
}

impl SwarmSource {
    pub fn connect(opts: &SwarmOptions, appkey: impl Into<String>) -> Result<Self> {
        let docker = if opts.url.starts_with("unix://") {
            Docker::connect_with_unix(&opts.url, opts.timeout_secs, API_DEFAULT_VERSION)?
        } else if opts.allow_insecure {
            Docker::connect_with_http(&opts.url, opts.timeout_secs, API_DEFAULT_VERSION)?
        } else {
            match (&opts.tls_key, &opts.tls_cert, &opts.tls_ca_cert) {
                (Some(key), Some(cert), Some(ca)) => Docker::connect_with_ssl(
                    &opts.url,
                    key,
                    cert,
                    ca,
                    opts.timeout_secs,
                    API_DEFAULT_VERSION,
                )?,
                _ => {
                    return Err(anyhow!(
                        "Swarm URL {} needs --swarm-tls-ca-cert, --swarm-tls-cert and \
                         --swarm-tls-key, or --swarm-allow-insecure",
                        opts.url
                    ))
                }
            }
        };
        info!("Using swarm API at {}", opts.url);

        Ok(Self {
            docker,
            appkey: appkey.into(),
        })
    }

    fn label(&self, app: &AppDescriptor) -> String {
        format!("{}={}", self.appkey, app.name)
    }
}

#[async_trait]
impl DiscoverySource for SwarmSource {
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        let label = self.label(app);
        debug!("Listing running containers with label {}", label);

        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);
        filters.insert("label".to_string(), vec![label]);
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(backends_from_containers(&containers))
    }

    async fn watch(
        &self,
        app: &AppDescriptor,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert(
            "event".to_string(),
            WATCHED_ACTIONS.iter().map(|s| s.to_string()).collect(),
        );
        filters.insert("label".to_string(), vec![self.label(app)]);
        let opts = EventsOptions::<String> {
            since: Some(events_since(SystemTime::now())),
            filters,
            ..Default::default()
        };

        // The daemon replays everything after `since`, so the stream is
        // effectively in place before the request goes out.
        if events.send(ChangeEvent::subscribed(&app.name)).await.is_err() {
            return Ok(());
        }
        let mut stream = self.docker.events(Some(opts));
        info!("Listening for container events for app {}", app.name);
        while let Some(msg) = stream.next().await {
            let change = classify_event(&app.name, &msg?);
            if events.send(change).await.is_err() {
                // Watcher went away.
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Published host endpoints of the given containers.
///
/// Ports without a published host port are skipped. A container that
/// publishes several host ports contributes only the first one.
pub fn backends_from_containers(containers: &[ContainerSummary]) -> BackendSet {
    let mut published = Vec::new();

    for container in containers {
        let ports = container.ports.as_deref().unwrap_or_default();
        let mut chosen = None;
        for port in ports {
            if let (Some(ip), Some(public)) = (&port.ip, port.public_port) {
                if chosen.is_none() {
                    chosen = Some(Endpoint::new(ip.clone(), public));
                } else {
                    debug!(
                        "Container {} publishes more than one port, ignoring {}",
                        container.id.as_deref().unwrap_or("?"),
                        public
                    );
                }
            }
        }
        if let Some(endpoint) = chosen {
            published.push(endpoint);
        }
    }

    published.into_iter().collect()
}

/// `since` filter for the events API, backdated to absorb clock skew with
/// the daemon. Replayed events only cause an extra pass.
fn events_since(now: SystemTime) -> String {
    let since = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .saturating_sub(CLOCK_SLACK);
    since.as_secs().to_string()
}

fn classify_event(app: &str, event: &EventMessage) -> ChangeEvent {
    let action = event.action.as_deref().unwrap_or_default();
    let container = event
        .actor
        .as_ref()
        .and_then(|a| a.id.as_deref())
        .unwrap_or_default();
    let reason = format!("container {:.12} {}", container, action);

    if WATCHED_ACTIONS.contains(&action) {
        ChangeEvent::relevant(app, reason)
    } else {
        ChangeEvent::ignored(app, reason)
    }
}
