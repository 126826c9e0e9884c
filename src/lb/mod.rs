//! Load-balancer control plane.
//!
//! The reconciler only talks to the load balancer through these two
//! traits. All operations are idempotent; a session must be released with
//! [`LbSession::logout`] whatever the outcome of the calls made with it.

use async_trait::async_trait;

use crate::error::LbError;
use crate::types::{BackendSet, Endpoint};

pub mod nitro;

pub use nitro::NitroClient;

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn login(&self) -> Result<Box<dyn LbSession>, LbError>;
}

#[async_trait]
pub trait LbSession: Send + Sync {
    /// Creates the virtual server unless it exists. An existing server with
    /// a different VIP or port is reported as [`LbError::Conflict`].
    async fn ensure_virtual_server(
        &self,
        name: &str,
        vip: &str,
        port: u16,
        method: &str,
    ) -> Result<(), LbError>;

    async fn ensure_service_group(&self, name: &str) -> Result<(), LbError>;

    async fn bind_group_to_server(&self, server: &str, group: &str) -> Result<(), LbError>;

    async fn list_group_members(&self, group: &str) -> Result<BackendSet, LbError>;

    async fn add_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError>;

    async fn remove_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError>;

    async fn logout(self: Box<Self>) -> Result<(), LbError>;
}
