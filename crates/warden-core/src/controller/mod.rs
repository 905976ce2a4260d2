//! Level-triggered reconciliation of declarative snapshot and restore resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use warden_common::Result;

pub mod resource;
pub mod restore;
pub mod snapshot;
pub mod store;

pub use resource::{
    DeletionPolicy, EntityRestore, EntitySnapshot, LocalObjectReference, ObjectKey, ObjectMeta,
    Resource, RestoreSource, SnapshotSource, StatusError,
};
pub use restore::RestoreReconciler;
pub use snapshot::{SnapshotReconciler, SNAPSHOT_FINALIZER};
pub use store::{FileStore, MemoryStore, ResourceStore};

/// What the loop should do with a key after a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileAction {
    pub requeue_after: Option<Duration>,
}

impl ReconcileAction {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    type Object: Resource;

    /// `Err` asks the loop to retry with backoff.
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction>;
}

/// Writes the resource back whatever the outcome, so state accumulated before a
/// failure (finalizers in particular) is never lost. The reconcile error wins over
/// a persistence error.
pub(crate) async fn persist<R: Resource>(
    store: &dyn ResourceStore<R>,
    resource: &R,
    outcome: Result<ReconcileAction>,
) -> Result<ReconcileAction> {
    let patched = store.patch(resource).await;
    match (outcome, patched) {
        (Ok(action), Ok(_)) => Ok(action),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(patch_err)) => {
            warn!(error = %patch_err, "Failed to persist resource after reconcile error");
            Err(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub interval: Duration,
    pub concurrency: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            concurrency: 4,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5 * 60),
        }
    }
}

/// Exponential backoff for the `failures`-th consecutive failure.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(max)
}

#[derive(Debug, Default, Clone, Copy)]
struct KeyState {
    failures: u32,
    not_before: Option<Instant>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub reconciled: usize,
    pub failed: usize,
    pub deferred: usize,
}

/// Periodically lists a store and reconciles every due key. Each key is handled at
/// most once per pass, so no key is ever reconciled concurrently with itself.
/// Cancellation stops the loop between passes; a pass already under way runs to
/// completion.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    store: Arc<dyn ResourceStore<R::Object>>,
    config: ControllerConfig,
    keys: HashMap<ObjectKey, KeyState>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        store: Arc<dyn ResourceStore<R::Object>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            reconciler,
            store,
            config,
            keys: HashMap::new(),
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            kind = <R::Object as Resource>::KIND,
            interval = ?self.config.interval,
            concurrency = self.config.concurrency,
            "Controller started"
        );
        while !cancel.is_cancelled() {
            // Not raced against `cancel`: every started reconcile gets to persist.
            if let Err(e) = self.pass().await {
                error!(error = %e, "Failed to list resources");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }
        }
        info!(kind = <R::Object as Resource>::KIND, "Controller stopped");
        Ok(())
    }

    /// Reconciles every key that is due now.
    pub async fn pass(&mut self) -> Result<PassSummary> {
        let listed = self.store.list().await?;
        self.keys.retain(|k, _| listed.contains(k));

        let now = Instant::now();
        let mut summary = PassSummary::default();
        let mut due = Vec::new();
        for key in listed {
            let state = self.keys.get(&key).copied().unwrap_or_default();
            match state.not_before {
                Some(at) if at > now => summary.deferred += 1,
                _ => due.push(key),
            }
        }

        let reconciler = self.reconciler.clone();
        let results: Vec<_> = stream::iter(due)
            .map(|key| {
                let reconciler = reconciler.clone();
                async move {
                    let result = reconciler.reconcile(&key).await;
                    (key, result)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (key, result) in results {
            let state = self.keys.entry(key.clone()).or_default();
            match result {
                Ok(action) => {
                    summary.reconciled += 1;
                    state.failures = 0;
                    state.not_before = action.requeue_after.map(|d| Instant::now() + d);
                }
                Err(e) => {
                    summary.failed += 1;
                    state.failures += 1;
                    let delay =
                        backoff_delay(self.config.backoff_base, self.config.backoff_max, state.failures);
                    state.not_before = Some(Instant::now() + delay);
                    warn!(%key, error = %e, failures = state.failures, retry_in = ?delay, "Reconcile failed");
                }
            }
        }
        debug!(?summary, "Reconcile pass finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::Notify;

    use super::*;

    struct Gated {
        started: Arc<Notify>,
        release: Arc<Notify>,
        finished: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Reconciler for Gated {
        type Object = EntitySnapshot;

        async fn reconcile(&self, _key: &ObjectKey) -> Result<ReconcileAction> {
            self.started.notify_one();
            self.release.notified().await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(ReconcileAction::done())
        }
    }

    #[tokio::test]
    async fn test_cancel_waits_for_in_flight_reconcile() {
        let store = Arc::new(MemoryStore::<EntitySnapshot>::new());
        store
            .create(EntitySnapshot::new("default", "a", SnapshotSource::default()))
            .await
            .unwrap();
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let controller = Controller::new(
            Arc::new(Gated {
                started: started.clone(),
                release: release.clone(),
                finished: finished.clone(),
            }),
            store,
            ControllerConfig {
                interval: Duration::from_millis(5),
                ..Default::default()
            },
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(controller.run(cancel.clone()));
        started.notified().await;
        cancel.cancel();
        sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        release.notify_one();
        handle.await.unwrap().unwrap();
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(300);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(16));
        assert_eq!(backoff_delay(base, max, 9), Duration::from_secs(256));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, 200), max);
    }
}
