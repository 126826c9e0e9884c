//! Convergence of load-balancer state onto discovered backends.
//!
//! A pass resolves DNS names in the desired set, reads the service group's
//! current members, and applies the difference. Every pass re-reads the
//! actual state, so anything left unapplied shows up again in the next diff.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::error::DiscoveryError;
use crate::lb::{LbSession, LoadBalancer};
use crate::locks::KeyedLocks;
use crate::registry::AppDescriptor;
use crate::resolver::HostResolver;
use crate::types::{BackendSet, Endpoint};

/// Partition of `desired ∪ actual`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub to_add: BackendSet,
    pub to_remove: BackendSet,
    pub to_keep: BackendSet,
}

impl ReconciliationPlan {
    pub fn diff(desired: &BackendSet, actual: &BackendSet) -> Self {
        Self {
            to_add: desired.difference(actual),
            to_remove: actual.difference(desired),
            to_keep: desired.intersection(actual),
        }
    }

    /// True when applying the plan would not change anything.
    pub fn is_converged(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Discovery was unavailable; the load balancer was not touched.
    Skipped,
    /// No session, or the current members could not be read.
    Aborted,
    Applied {
        added: usize,
        removed: usize,
        kept: usize,
        failed: usize,
    },
}

pub struct Reconciler {
    lb: Arc<dyn LoadBalancer>,
    resolver: Arc<dyn HostResolver>,
    lb_method: String,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(
        lb: Arc<dyn LoadBalancer>,
        resolver: Arc<dyn HostResolver>,
        lb_method: impl Into<String>,
    ) -> Self {
        Self {
            lb,
            resolver,
            lb_method: lb_method.into(),
            locks: KeyedLocks::new(),
        }
    }

    /// Runs one pass for `app` given the outcome of discovery.
    ///
    /// `NotFound` converges to an empty service group. `Unavailable` skips
    /// the pass. Passes for the same app never overlap.
    pub async fn reconcile(
        &self,
        app: &AppDescriptor,
        discovered: Result<BackendSet, DiscoveryError>,
    ) -> PassOutcome {
        let desired = match discovered {
            Ok(backends) => backends,
            Err(DiscoveryError::NotFound(_)) => {
                warn!(
                    "App {} not found by discovery, removing all of its backends",
                    app.name
                );
                BackendSet::new()
            }
            Err(e @ DiscoveryError::Unavailable(_)) => {
                error!("Skipping reconciliation of {}: {}", app.name, e);
                return PassOutcome::Skipped;
            }
        };
        debug!("Backends for {} are {}", app.name, desired);
        let desired = self.resolve_hosts(app, desired).await;

        let lock = self.locks.get(&app.name);
        let _guard = lock.lock().await;

        let session = match self.lb.login().await {
            Ok(session) => session,
            Err(e) => {
                error!("Cannot open LB session for {}: {}", app.name, e);
                return PassOutcome::Aborted;
            }
        };
        let outcome = self.apply(session.as_ref(), app, &desired).await;
        if let Err(e) = session.logout().await {
            warn!("LB logout after reconciling {} failed: {}", app.name, e);
        }
        outcome
    }

    /// Rewrites DNS names to IP literals. Names that do not resolve are
    /// dropped from this pass.
    async fn resolve_hosts(&self, app: &AppDescriptor, desired: BackendSet) -> BackendSet {
        let mut resolved = Vec::with_capacity(desired.len());
        for endpoint in desired {
            if endpoint.ip().is_some() {
                resolved.push(endpoint.canonical());
                continue;
            }
            match self.resolver.lookup(&endpoint.host).await {
                Ok(ip) => resolved.push(Endpoint::from_ip(ip, endpoint.port)),
                Err(e) => warn!(
                    "Dropping backend {} of {} for this pass: {}",
                    endpoint, app.name, e
                ),
            }
        }
        resolved.into_iter().collect()
    }

    async fn apply(
        &self,
        session: &dyn LbSession,
        app: &AppDescriptor,
        desired: &BackendSet,
    ) -> PassOutcome {
        let lb_name = app.lb_name();
        let sg_name = app.sg_name();

        if let Some(frontend) = &app.frontend {
            if let Err(e) = session
                .ensure_virtual_server(&lb_name, &frontend.vip, frontend.port, &self.lb_method)
                .await
            {
                error!("LB {} for {}: {}", lb_name, app.name, e);
            }
        }
        if let Err(e) = session.ensure_service_group(&sg_name).await {
            warn!("Service group {} for {}: {}", sg_name, app.name, e);
        }
        if let Err(e) = session.bind_group_to_server(&lb_name, &sg_name).await {
            warn!("Binding {} to {}: {}", sg_name, lb_name, e);
        }

        let actual = match session.list_group_members(&sg_name).await {
            Ok(actual) => actual,
            Err(e) => {
                error!("Cannot read members of {}: {}", sg_name, e);
                return PassOutcome::Aborted;
            }
        };

        let plan = ReconciliationPlan::diff(desired, &actual);
        if plan.is_converged() {
            info!(
                "{} already converged ({} backends)",
                app.name,
                plan.to_keep.len()
            );
        } else {
            info!(
                "Reconciling {}: add {}, remove {}, keep {}",
                app.name, plan.to_add, plan.to_remove, plan.to_keep
            );
        }

        let mut failed = 0;
        for member in &plan.to_remove {
            info!("Unbinding {} from service group {}", member, sg_name);
            if let Err(e) = session.remove_group_member(&sg_name, member).await {
                warn!("Unbinding {} from {} failed: {}", member, sg_name, e);
                failed += 1;
            }
        }
        for member in &plan.to_add {
            info!("Binding {} to service group {}", member, sg_name);
            if let Err(e) = session.add_group_member(&sg_name, member).await {
                warn!("Binding {} to {} failed: {}", member, sg_name, e);
                failed += 1;
            }
        }

        PassOutcome::Applied {
            added: plan.to_add.len(),
            removed: plan.to_remove.len(),
            kept: plan.to_keep.len(),
            failed,
        }
    }
}
