use crate::error::StoreError;
use crate::store::ImageStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Fails records left pending by an interrupted upload
pub struct Reconciler {
    store: Arc<dyn ImageStore>,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ImageStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    /// Mark every record pending since before `now - stale_after` as failed
    ///
    /// Returns how many records were moved. A record that finished in the
    /// meantime is skipped.
    #[instrument(skip(self))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let stale_after = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let stale = self.store.stale_pending(now - stale_after).await?;

        let mut reconciled = 0;
        for record in stale {
            match self.store.mark_failed(record.id).await {
                Ok(()) => {
                    warn!(image_id = %record.id, created_at = %record.created_at, "Stale pending image marked failed");
                    reconciled += 1;
                }
                Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if reconciled > 0 {
            metrics::counter!("images.reconciled").increment(reconciled as u64);
            info!(reconciled, "Reconciliation pass completed");
        }

        Ok(reconciled)
    }

    /// Run a pass every `interval` until the task is aborted
    pub async fn run(self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "Starting reconciler");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Reconciliation pass failed");
            }
        }
    }
}
