//! Backend discovery over the supported orchestrators.
//!
//! Every orchestrator is exposed through [`DiscoverySource`]. The concrete
//! source is picked once at startup from the command line and wrapped in
//! the closed [`Discovery`] enum.

use crate::cli::Args;
use crate::config::Config;
use crate::error::DiscoveryError;
use crate::registry::{AppDescriptor, AppRegistry};
use crate::types::{BackendSet, ChangeEvent};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod kubeconfig;
pub mod kubernetes;
mod lines;
pub mod marathon;
pub mod static_file;
pub mod swarm;

pub use kubeconfig::ClusterAccess;
pub use kubernetes::KubernetesSource;
pub use marathon::{MarathonOptions, MarathonSource};
pub use static_file::StaticFileSource;
pub use swarm::{SwarmOptions, SwarmSource};

#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Current backends of `app`.
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError>;

    /// Streams change notifications for `app` into `events` until the
    /// underlying connection ends. The first event is
    /// [`ChangeEvent::subscribed`], sent once changes from that moment on
    /// are guaranteed to be delivered. A clean close returns `Ok`; the
    /// caller calls `watch` again to resume.
    async fn watch(
        &self,
        _app: &AppDescriptor,
        _events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        Ok(())
    }

    /// Whether `watch` produces events at all.
    fn is_live(&self) -> bool {
        true
    }
}

pub enum Discovery {
    Swarm(SwarmSource),
    Marathon(MarathonSource),
    Kubernetes(KubernetesSource),
    Static(StaticFileSource),
}

impl Discovery {
    /// Builds the source selected on the command line.
    pub fn from_args(args: &Args, registry: &AppRegistry, config: &Config) -> Result<Self> {
        if let Some(url) = &args.swarm_url {
            let appkey = registry
                .appkey()
                .ok_or_else(|| anyhow!("APP_INFO must define appkey for the swarm backend"))?;
            let opts = SwarmOptions {
                url: url.clone(),
                tls_ca_cert: args.swarm_tls_ca_cert.clone(),
                tls_cert: args.swarm_tls_cert.clone(),
                tls_key: args.swarm_tls_key.clone(),
                allow_insecure: args.swarm_allow_insecure,
                timeout_secs: config.request_timeout_secs,
            };
            return Ok(Discovery::Swarm(SwarmSource::connect(&opts, appkey)?));
        }

        if let Some(url) = &args.marathon_url {
            let opts = MarathonOptions {
                url: url.clone(),
                username: args.marathon_user.clone(),
                password: args.marathon_password.clone(),
                timeout: config.request_timeout(),
            };
            return Ok(Discovery::Marathon(MarathonSource::new(&opts)?));
        }

        let access = match (&args.kubeconfig, &args.kube_server) {
            (Some(path), _) => {
                let mut access = ClusterAccess::from_kubeconfig(path)?;
                access.insecure_skip_tls_verify |= args.kube_insecure_skip_tls_verify;
                Some(access)
            }
            (None, Some(server)) => Some(ClusterAccess::explicit(
                server,
                args.kube_token.clone(),
                args.kube_token_file.as_deref(),
                args.kube_ca.as_deref(),
                args.kube_insecure_skip_tls_verify,
            )?),
            (None, None) => None,
        };
        if let Some(access) = access {
            return Ok(Discovery::Kubernetes(KubernetesSource::new(
                &access,
                &args.kube_namespace,
                config.request_timeout(),
            )?));
        }

        if let Some(path) = &args.cfg_file {
            return Ok(Discovery::Static(StaticFileSource::load(path)?));
        }

        Err(anyhow!("no discovery backend selected"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Discovery::Swarm(_) => "swarm",
            Discovery::Marathon(_) => "marathon",
            Discovery::Kubernetes(_) => "kubernetes",
            Discovery::Static(_) => "static file",
        }
    }

    fn source(&self) -> &dyn DiscoverySource {
        match self {
            Discovery::Swarm(s) => s,
            Discovery::Marathon(s) => s,
            Discovery::Kubernetes(s) => s,
            Discovery::Static(s) => s,
        }
    }
}

#[async_trait]
impl DiscoverySource for Discovery {
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        self.source().resolve(app).await
    }

    async fn watch(
        &self,
        app: &AppDescriptor,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        self.source().watch(app, events).await
    }

    fn is_live(&self) -> bool {
        self.source().is_live()
    }
}
