//! Dirty-flag autosave loop.
//!
//! Every interval, each registry collection and the state store are written
//! out if something changed since their last save. The loop is stopped
//! explicitly during shutdown, which then performs the final unconditional
//! saves itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::MAX_AUTOSAVE_INTERVAL_SECS;
use crate::database::Database;
use crate::error::BridgeError;
use crate::registry::{Collection, Registry};
use crate::state_store::StateStore;

/// What one autosave pass did.
#[derive(Debug, Default)]
pub struct SavePass {
    /// Collections written, with their record counts.
    pub saved: Vec<(Collection, usize)>,
    pub state_store_saved: bool,
    /// Number of targets whose save failed; their dirty flags stay set.
    pub failures: usize,
}

/// Save every dirty target once. Blocking; run it off the async workers.
pub fn save_dirty(registry: &Registry, state_store: &StateStore, db: &dyn Database) -> SavePass {
    let mut pass = SavePass::default();

    for collection in Collection::ALL {
        match registry.save_if_dirty(collection, db) {
            Ok(Some(count)) => {
                tracing::debug!(collection = collection.name(), count, "Autosaved");
                pass.saved.push((collection, count));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(collection = collection.name(), error = %e, "Autosave failed");
                pass.failures += 1;
            }
        }
    }

    match state_store.save_if_dirty() {
        Ok(saved) => pass.state_store_saved = saved,
        Err(e) => {
            tracing::error!(error = %e, "Autosave of state store failed");
            pass.failures += 1;
        }
    }

    pass
}

/// Handle to a running autosave loop.
pub struct SaveLoop {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl SaveLoop {
    /// Spawn the loop. The first pass runs one `period` after spawning.
    /// Periods longer than a day are shortened to a day.
    pub fn spawn(
        registry: Arc<Registry>,
        state_store: Arc<StateStore>,
        db: Arc<dyn Database>,
        period: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = period.min(Duration::from_secs(MAX_AUTOSAVE_INTERVAL_SECS));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let registry = Arc::clone(&registry);
                        let state_store = Arc::clone(&state_store);
                        let db = Arc::clone(&db);
                        let pass = tokio::task::spawn_blocking(move || {
                            save_dirty(&registry, &state_store, db.as_ref())
                        })
                        .await;
                        if pass.is_err() {
                            tracing::error!("Autosave pass panicked");
                        }
                    }
                }
            }
            tracing::debug!("Autosave loop stopped");
        });

        Self { stop_tx, handle }
    }

    /// Stop the loop and wait for it to exit. A pass already in progress
    /// completes first.
    pub async fn stop(self) -> Result<(), BridgeError> {
        let _ = self.stop_tx.send(());
        self.handle
            .await
            .map_err(|_| BridgeError::TaskJoin { task: "autosave" })
    }
}
