//! Data structures shared by discovery, reconciliation and the LB client.
//!
//! An [`Endpoint`] is one backend address as reported by an orchestrator
//! or by the load balancer.  A [`BackendSet`] is an immutable snapshot of
//! the endpoints believed to serve one application; a fresh one is built
//! on every reconciliation pass and never mutated afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// One backend address.
///
/// `host` is either an IP literal or a DNS name.  Before diffing, the
/// reconciler rewrites every host to its canonical IP literal so that two
/// endpoints compare equal exactly when they point at the same IP and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self::new(ip.to_string(), port)
    }

    /// The host parsed as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// Same endpoint with an IP-literal host rewritten to its canonical
    /// textual form (`::0001` becomes `::1`). DNS names are left untouched.
    pub fn canonical(&self) -> Self {
        match self.ip() {
            Some(ip) => Self::from_ip(ip, self.port),
            None => self.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Snapshot of the endpoints serving one application.
///
/// Backed by an ordered set so that log output and LB calls happen in a
/// stable order from one pass to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendSet(BTreeSet<Endpoint>);

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.0.contains(endpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.0.iter()
    }

    /// Endpoints in `self` but not in `other`.
    pub fn difference(&self, other: &BackendSet) -> BackendSet {
        self.0.difference(&other.0).cloned().collect()
    }

    /// Endpoints present in both sets.
    pub fn intersection(&self, other: &BackendSet) -> BackendSet {
        self.0.intersection(&other.0).cloned().collect()
    }
}

impl FromIterator<Endpoint> for BackendSet {
    fn from_iter<I: IntoIterator<Item = Endpoint>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for BackendSet {
    type Item = Endpoint;
    type IntoIter = std::collections::btree_set::IntoIter<Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a BackendSet {
    type Item = &'a Endpoint;
    type IntoIter = std::collections::btree_set::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for BackendSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, endpoint) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", endpoint)?;
        }
        f.write_str("}")
    }
}

const SUBSCRIBED_REASON: &str = "watch established";

/// A notification produced by a discovery source's watch stream.
///
/// Sources emit one event per orchestrator notification concerning the
/// watched application; `relevant` records whether that notification can
/// change the app's backend set.  The watcher consumes each event once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Registry name of the affected application.
    pub app: String,
    pub relevant: bool,
    /// Short human-readable cause, used for logging.
    pub reason: String,
}

impl ChangeEvent {
    pub fn relevant(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            relevant: true,
            reason: reason.into(),
        }
    }

    /// Sent by a source once its subscription is in place. Anything that
    /// changes after this point reaches the stream, so a pass triggered by
    /// it cannot miss a change.
    pub fn subscribed(app: impl Into<String>) -> Self {
        Self::relevant(app, SUBSCRIBED_REASON)
    }

    pub fn is_subscription(&self) -> bool {
        self.relevant && self.reason == SUBSCRIBED_REASON
    }

    pub fn ignored(app: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            relevant: false,
            reason: reason.into(),
        }
    }
}
