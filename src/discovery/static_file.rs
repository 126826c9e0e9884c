use super::DiscoverySource;
use crate::error::DiscoveryError;
use crate::registry::AppDescriptor;
use crate::types::{BackendSet, Endpoint};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Backends read once from a JSON file:
///
/// ```json
/// [{"servicename": "foo", "backends": [{"host": "10.0.0.1", "port": 8080}]}]
/// ```
///
/// There is nothing to watch; apps are reconciled once at startup.
#[derive(Debug)]
pub struct StaticFileSource {
    services: HashMap<String, BackendSet>,
}

#[derive(Debug, Deserialize)]
struct ServiceEntry {
    servicename: String,
    #[serde(default)]
    backends: Vec<Endpoint>,
}

impl StaticFileSource {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading backend file {}", path.display()))?;
        let source = Self::parse(&text)
            .with_context(|| format!("parsing backend file {}", path.display()))?;
        info!(
            "Loaded {} services from {}",
            source.services.len(),
            path.display()
        );
        Ok(source)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let entries: Vec<ServiceEntry> = serde_json::from_str(text)?;
        let mut services: HashMap<String, BackendSet> = HashMap::new();
        for entry in entries {
            // A repeated service name adds to the earlier entry.
            let merged = services
                .remove(&entry.servicename)
                .unwrap_or_default()
                .into_iter()
                .chain(entry.backends)
                .collect();
            services.insert(entry.servicename, merged);
        }
        Ok(Self { services })
    }
}

#[async_trait]
impl DiscoverySource for StaticFileSource {
    async fn resolve(&self, app: &AppDescriptor) -> Result<BackendSet, DiscoveryError> {
        self.services
            .get(&app.name)
            .cloned()
            .ok_or_else(|| DiscoveryError::NotFound(app.name.clone()))
    }

    fn is_live(&self) -> bool {
        false
    }
}
