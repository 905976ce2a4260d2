use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use warden_common::{
    EntityId, Params, ProtectedEntityManager, Result, SnapshotId, WardenError,
};

use super::resource::{DeletionPolicy, EntitySnapshot, ObjectKey, SnapshotSource, StatusError};
use super::store::ResourceStore;
use super::{persist, ReconcileAction, Reconciler};

pub const SNAPSHOT_FINALIZER: &str = "warden.io/snapshot-finalizer";

/// Drives `EntitySnapshot` resources of one backend type to a taken snapshot, and
/// releases the snapshot again when the resource is deleted.
pub struct SnapshotReconciler {
    store: Arc<dyn ResourceStore<EntitySnapshot>>,
    manager: Arc<dyn ProtectedEntityManager>,
    type_name: String,
}

impl SnapshotReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore<EntitySnapshot>>,
        manager: Arc<dyn ProtectedEntityManager>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            manager,
            type_name: type_name.into(),
        }
    }

    async fn reconcile_resource(&self, snap: &mut EntitySnapshot) -> Result<ReconcileAction> {
        if snap.metadata.is_deleting() {
            if snap.metadata.has_finalizer(SNAPSHOT_FINALIZER) {
                self.release(snap).await?;
                snap.metadata.remove_finalizer(SNAPSHOT_FINALIZER);
                info!("Released snapshot, finalizer removed");
            }
            return Ok(ReconcileAction::done());
        }

        if snap.metadata.add_finalizer(SNAPSHOT_FINALIZER) {
            debug!("Added finalizer");
        }

        if snap.status.snapshot_id.is_some() {
            return Ok(ReconcileAction::done());
        }

        let target = match target_id(&self.type_name, &snap.spec.source) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Invalid snapshot source");
                snap.status.error = Some(StatusError::now(&e));
                return Ok(ReconcileAction::done());
            }
        };

        match self.take_snapshot(&target).await {
            Ok(snapshot_id) => {
                info!(entity = %target, snapshot = %snapshot_id, "Snapshot taken");
                snap.status.snapshot_id = Some(snapshot_id.to_string());
                snap.status.ready_to_use = Some(true);
                snap.status.error = None;
                Ok(ReconcileAction::done())
            }
            Err(e) => {
                snap.status.error = Some(StatusError::now(&e));
                if e.is_retryable() {
                    Err(e)
                } else {
                    warn!(error = %e, "Snapshot failed permanently");
                    Ok(ReconcileAction::done())
                }
            }
        }
    }

    async fn take_snapshot(&self, target: &EntityId) -> Result<SnapshotId> {
        let entity = self.manager.entity(target).await?;
        entity.snapshot(&Params::new()).await
    }

    /// Deletes the physical snapshot unless the policy retains it. A snapshot that is
    /// already gone counts as released.
    async fn release(&self, snap: &EntitySnapshot) -> Result<()> {
        if snap.spec.deletion_policy == DeletionPolicy::Retain {
            return Ok(());
        }
        let Some(snapshot_id) = &snap.status.snapshot_id else {
            return Ok(());
        };
        let Ok(target) = target_id(&self.type_name, &snap.spec.source) else {
            return Ok(());
        };
        let type_manager = self.manager.type_manager(target.type_name()).ok_or_else(|| {
            WardenError::NotFound(format!("no type manager registered for {}", target.type_name()))
        })?;
        let snapshot = target.with_snapshot(SnapshotId::new(snapshot_id.as_str()));
        match type_manager.delete(&snapshot).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(snapshot = %snapshot, "Snapshot already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for SnapshotReconciler {
    type Object = EntitySnapshot;

    #[instrument(skip(self), fields(kind = "EntitySnapshot", key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let Some(mut snap) = self.store.get(key).await? else {
            debug!("Resource gone, nothing to do");
            return Ok(ReconcileAction::done());
        };
        let outcome = self.reconcile_resource(&mut snap).await;
        persist(self.store.as_ref(), &snap, outcome).await
    }
}

/// Resolves the declared source to an entity id of `type_name`. Input errors are
/// terminal and reported as `InvalidFormat`.
pub fn target_id(type_name: &str, source: &SnapshotSource) -> Result<EntityId> {
    match (&source.name, &source.peid) {
        (Some(reference), None) => EntityId::new(type_name, &reference.name),
        (None, Some(peid)) => match EntityId::parse(peid) {
            Ok(id) if id.type_name() == type_name => Ok(id),
            Ok(id) => Err(WardenError::InvalidFormat(format!(
                "source {id} is not a {type_name} entity"
            ))),
            Err(_) if !peid.is_empty() => EntityId::new(type_name, peid),
            Err(e) => Err(e),
        },
        (Some(_), Some(_)) => Err(WardenError::InvalidFormat(
            "spec.source.name and spec.source.peid are both set".to_string(),
        )),
        (None, None) => Err(WardenError::InvalidFormat(
            "one of spec.source.name or spec.source.peid must be set".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::resource::LocalObjectReference;

    fn peid(value: &str) -> SnapshotSource {
        SnapshotSource {
            name: None,
            peid: Some(value.to_string()),
        }
    }

    #[test]
    fn test_target_id_forms() {
        assert_eq!(
            target_id("psql", &peid("psql:4a1f")).unwrap().to_string(),
            "psql:4a1f"
        );
        assert_eq!(
            target_id("psql", &peid("4a1f")).unwrap().to_string(),
            "psql:4a1f"
        );
        let by_name = SnapshotSource {
            name: Some(LocalObjectReference {
                name: "acid-main".into(),
            }),
            peid: None,
        };
        assert_eq!(
            target_id("psql", &by_name).unwrap().to_string(),
            "psql:acid-main"
        );
    }

    #[test]
    fn test_target_id_rejects_bad_input() {
        assert!(matches!(
            target_id("psql", &peid("fs:a.txt")),
            Err(WardenError::InvalidFormat(_))
        ));
        assert!(target_id("psql", &SnapshotSource::default()).is_err());
        let colon_name = SnapshotSource {
            name: Some(LocalObjectReference { name: "a:b".into() }),
            peid: None,
        };
        assert!(matches!(
            target_id("psql", &colon_name),
            Err(WardenError::InvalidFormat(_))
        ));
        let both = SnapshotSource {
            name: Some(LocalObjectReference { name: "a".into() }),
            peid: Some("psql:a".into()),
        };
        assert!(!target_id("psql", &both).unwrap_err().is_retryable());
    }
}
