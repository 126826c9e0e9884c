//! lbsync daemon entry point.

use std::sync::Arc;

use clap::Parser;
use futures_util::future::join_all;
use log::{error, info};
use tokio::signal;

mod backoff;
mod cli;
mod config;
mod discovery;
mod error;
mod lb;
mod locks;
mod reconcile;
mod registry;
mod resolver;
#[cfg(test)]
mod testing;
mod types;
mod watcher;

use backoff::Backoff;
use cli::Args;
use config::Config;
use discovery::Discovery;
use lb::NitroClient;
use reconcile::Reconciler;
use registry::AppRegistry;
use resolver::SystemResolver;
use watcher::Watcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let cfg = Config::load()?;

    let registry = AppRegistry::parse(cfg.app_info.as_deref().unwrap_or_default())?;
    info!(
        "Managing {} apps: {}",
        registry.apps().len(),
        registry.names().collect::<Vec<_>>().join(", ")
    );

    let discovery = Arc::new(Discovery::from_args(&args, &registry, &cfg)?);
    info!("Using {} discovery", discovery.kind());

    let nitro = NitroClient::new(
        &cfg.nitro_base_url(),
        &cfg.ns_user,
        &cfg.ns_password,
        cfg.request_timeout(),
        cfg.ns_verify_tls,
    )?;
    let resolver = SystemResolver::from_system_conf()?;
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(nitro),
        Arc::new(resolver),
        cfg.lb_method.clone(),
    ));
    let backoff = Backoff::new(cfg.backoff_base_ms, cfg.backoff_max_ms);

    let handles: Vec<_> = registry
        .apps()
        .iter()
        .cloned()
        .map(|app| {
            let watcher = Watcher::new(
                app,
                Arc::clone(&discovery),
                Arc::clone(&reconciler),
                backoff,
            );
            tokio::spawn(watcher.run())
        })
        .collect();
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

    tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            for abort in &aborts {
                abort.abort();
            }
        }
        results = join_all(handles) => {
            for res in results {
                if let Err(e) = res {
                    error!("Watcher task failed: {}", e);
                }
            }
            info!("All watchers finished");
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
