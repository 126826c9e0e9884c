//! Per-application event loop.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::backoff::Backoff;
use crate::discovery::DiscoverySource;
use crate::reconcile::{PassOutcome, Reconciler};
use crate::registry::AppDescriptor;

const EVENT_BUFFER: usize = 128;

/// Drives one application: a pass once the watch stream is in place, then
/// a pass per relevant change event, reconnecting whenever the stream ends.
pub struct Watcher<S> {
    app: AppDescriptor,
    source: Arc<S>,
    reconciler: Arc<Reconciler>,
    backoff: Backoff,
}

impl<S: DiscoverySource + 'static> Watcher<S> {
    pub fn new(
        app: AppDescriptor,
        source: Arc<S>,
        reconciler: Arc<Reconciler>,
        backoff: Backoff,
    ) -> Self {
        Self {
            app,
            source,
            reconciler,
            backoff,
        }
    }

    async fn sync(&self) -> PassOutcome {
        let discovered = self.source.resolve(&self.app).await;
        let outcome = self.reconciler.reconcile(&self.app, discovered).await;
        debug!("Pass for {} finished: {:?}", self.app.name, outcome);
        outcome
    }

    /// Runs until the process stops. Returns after a single pass when the
    /// source has no live stream.
    ///
    /// With a live source every pass follows a subscription, so no change
    /// can slip in between resolving and watching. A stream that fails
    /// before subscribing still gets a pass from a plain resolve.
    pub async fn run(self) {
        if !self.source.is_live() {
            info!("Initial reconciliation of {}", self.app.name);
            self.sync().await;
            info!("No change stream for {}, not watching", self.app.name);
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
            let source = Arc::clone(&self.source);
            let app = self.app.clone();
            let feeder = tokio::spawn(async move { source.watch(&app, event_tx).await });

            let mut subscribed = false;
            let mut delivered = false;
            while let Some(event) = event_rx.recv().await {
                if event.is_subscription() {
                    subscribed = true;
                    info!("Watching {}, reconciling", self.app.name);
                } else {
                    delivered = true;
                    if !event.relevant {
                        debug!("Ignoring event for {}: {}", event.app, event.reason);
                        continue;
                    }
                    info!("Change for {}: {}", event.app, event.reason);
                }

                // Fold whatever queued up behind this event into one pass.
                let mut folded = 0;
                while let Ok(next) = event_rx.try_recv() {
                    if next.relevant {
                        folded += 1;
                    }
                }
                if folded > 0 {
                    debug!("Coalesced {} further events for {}", folded, self.app.name);
                }
                self.sync().await;
            }

            let clean = match feeder.await {
                Ok(Ok(())) => {
                    info!("Watch stream for {} closed", self.app.name);
                    true
                }
                Ok(Err(e)) => {
                    warn!("Watch stream for {} failed: {}", self.app.name, e);
                    false
                }
                Err(e) => {
                    error!("Watch task for {} aborted: {}", self.app.name, e);
                    false
                }
            };

            if !subscribed {
                self.sync().await;
            }

            // A stream that carried events or closed cleanly was healthy.
            attempt = if delivered || clean { 1 } else { attempt.saturating_add(1) };
            let delay = self.backoff.delay(attempt);
            info!(
                "Reconnecting watch for {} in {:?} (attempt {})",
                self.app.name, delay, attempt
            );
            sleep(delay).await;
        }
    }
}
