//! In-memory stand-ins for the load balancer, DNS and discovery.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::discovery::DiscoverySource;
use crate::error::{DiscoveryError, LbError};
use crate::lb::{LbSession, LoadBalancer};
use crate::registry::AppDescriptor;
use crate::resolver::{HostResolver, ResolveError};
use crate::types::{BackendSet, ChangeEvent, Endpoint};

#[derive(Debug, Default)]
pub struct FakeLbState {
    pub vservers: HashMap<String, (String, u16)>,
    pub groups: HashMap<String, BTreeSet<Endpoint>>,
    pub bindings: HashSet<(String, String)>,
    pub logins: usize,
    pub logouts: usize,
    /// Members whose add or remove call fails.
    pub failing: HashSet<Endpoint>,
    pub fail_login: bool,
    pub fail_list: bool,
    pub mutations: usize,
    /// Sessions currently open, and the most ever open at once.
    pub open_sessions: usize,
    pub max_open_sessions: usize,
    /// Delay applied to every member listing.
    pub slow_list: Option<Duration>,
}

#[derive(Clone, Default)]
pub struct FakeLb {
    state: Arc<Mutex<FakeLbState>>,
}

impl FakeLb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeLbState> {
        self.state.lock().unwrap()
    }

    pub fn members(&self, group: &str) -> BackendSet {
        self.state()
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn seed_group(&self, group: &str, members: &[(&str, u16)]) {
        self.state().groups.insert(
            group.to_string(),
            members.iter().map(|(h, p)| Endpoint::new(*h, *p)).collect(),
        );
    }
}

#[async_trait]
impl LoadBalancer for FakeLb {
    async fn login(&self) -> Result<Box<dyn LbSession>, LbError> {
        let mut state = self.state();
        if state.fail_login {
            return Err(LbError::Session("login refused".into()));
        }
        state.logins += 1;
        state.open_sessions += 1;
        state.max_open_sessions = state.max_open_sessions.max(state.open_sessions);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl LbSession for FakeLb {
    async fn ensure_virtual_server(
        &self,
        name: &str,
        vip: &str,
        port: u16,
        _method: &str,
    ) -> Result<(), LbError> {
        let mut state = self.state();
        match state.vservers.get(name) {
            Some((v, p)) if v == vip && *p == port => Ok(()),
            Some(_) => Err(LbError::Conflict(format!("LB {} differs", name))),
            None => {
                state.mutations += 1;
                state
                    .vservers
                    .insert(name.to_string(), (vip.to_string(), port));
                Ok(())
            }
        }
    }

    async fn ensure_service_group(&self, name: &str) -> Result<(), LbError> {
        self.state().groups.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_group_to_server(&self, server: &str, group: &str) -> Result<(), LbError> {
        self.state()
            .bindings
            .insert((server.to_string(), group.to_string()));
        Ok(())
    }

    async fn list_group_members(&self, group: &str) -> Result<BackendSet, LbError> {
        let slow = self.state().slow_list;
        if let Some(delay) = slow {
            sleep(delay).await;
        }
        if self.state().fail_list {
            return Err(LbError::Api {
                code: 1,
                message: "list failed".into(),
            });
        }
        Ok(self.members(group))
    }

    async fn add_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError> {
        let mut state = self.state();
        if state.failing.contains(member) {
            return Err(LbError::Api {
                code: 1,
                message: format!("cannot add {}", member),
            });
        }
        state.mutations += 1;
        state
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(member.clone());
        Ok(())
    }

    async fn remove_group_member(&self, group: &str, member: &Endpoint) -> Result<(), LbError> {
        let mut state = self.state();
        if state.failing.contains(member) {
            return Err(LbError::Api {
                code: 1,
                message: format!("cannot remove {}", member),
            });
        }
        state.mutations += 1;
        if let Some(members) = state.groups.get_mut(group) {
            members.remove(member);
        }
        Ok(())
    }

    async fn logout(self: Box<Self>) -> Result<(), LbError> {
        let mut state = self.state();
        state.logouts += 1;
        state.open_sessions -= 1;
        Ok(())
    }
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, ip: &str) -> Self {
        self.hosts.insert(host.to_string(), ip.parse().unwrap());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<IpAddr, ResolveError> {
        self.hosts
            .get(host)
            .copied()
            .ok_or_else(|| ResolveError::NoAddress(host.to_string()))
    }
}

/// Discovery source with a settable backend set and scripted watch
/// sessions. Every `watch` call subscribes first, then plays the next
/// script with a short pause before each event. Once the scripts run out,
/// `watch` never returns.
#[derive(Default)]
pub struct FakeSource {
    pub backends: Mutex<BackendSet>,
    /// Backends swapped in by the next `watch` call just before it
    /// subscribes.
    pub change_on_watch: Mutex<Option<BackendSet>>,
    pub sessions: Mutex<VecDeque<Vec<ChangeEvent>>>,
    pub watch_calls: Mutex<usize>,
    /// Fails `watch` before subscribing.
    pub fail_watch: bool,
    pub live: bool,
}

impl FakeSource {
    pub fn live(sessions: Vec<Vec<ChangeEvent>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            live: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl DiscoverySource for FakeSource {
    async fn resolve(&self, _app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        Ok(self.backends.lock().unwrap().clone())
    }

    async fn watch(
        &self,
        app: &AppDescriptor,
        events: mpsc::Sender<ChangeEvent>,
    ) -> Result<(), DiscoveryError> {
        *self.watch_calls.lock().unwrap() += 1;
        if self.fail_watch {
            return Err(DiscoveryError::Unavailable("event stream refused".into()));
        }
        let changed = self.change_on_watch.lock().unwrap().take();
        if let Some(changed) = changed {
            *self.backends.lock().unwrap() = changed;
        }
        let _ = events.send(ChangeEvent::subscribed(&app.name)).await;

        let script = self.sessions.lock().unwrap().pop_front();
        match script {
            Some(script) => {
                for event in script {
                    sleep(Duration::from_millis(20)).await;
                    let _ = events.send(event).await;
                }
                Ok(())
            }
            None => std::future::pending().await,
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}
