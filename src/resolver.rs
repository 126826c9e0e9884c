//! Host name resolution for backends reported by DNS name.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: hickory_resolver::error::ResolveError,
    },
    #[error("{0} has no addresses")]
    NoAddress(String),
}

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<IpAddr, ResolveError>;
}

/// Resolver using the system's resolv.conf.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> anyhow::Result<Self> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| anyhow::anyhow!("Failed to load system resolv.conf: {}", e))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    /// First IPv4 address of `host`, else its first IPv6 address.
    async fn lookup(&self, host: &str) -> Result<IpAddr, ResolveError> {
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;

        let addrs: Vec<IpAddr> = lookup.iter().collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
    }
}
