use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use warden_common::{
    CopyCreateOptions, EntityId, Params, ProtectedEntityManager, Result, SnapshotId, WardenError,
};

use super::resource::{EntityRestore, EntitySnapshot, ObjectKey, StatusError};
use super::store::ResourceStore;
use super::{persist, ReconcileAction, Reconciler};

/// Drives `EntityRestore` resources to a newly allocated entity holding the
/// referenced snapshot's content.
pub struct RestoreReconciler {
    store: Arc<dyn ResourceStore<EntityRestore>>,
    snapshots: Arc<dyn ResourceStore<EntitySnapshot>>,
    manager: Arc<dyn ProtectedEntityManager>,
    type_name: String,
}

impl RestoreReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore<EntityRestore>>,
        snapshots: Arc<dyn ResourceStore<EntitySnapshot>>,
        manager: Arc<dyn ProtectedEntityManager>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            snapshots,
            manager,
            type_name: type_name.into(),
        }
    }

    async fn reconcile_resource(&self, restore: &mut EntityRestore) -> Result<ReconcileAction> {
        if restore.metadata.is_deleting() || restore.status.restored_id.is_some() {
            return Ok(ReconcileAction::done());
        }

        let source = match self.source_id(restore).await {
            Ok(id) => id,
            Err(e) => {
                restore.status.error = Some(StatusError::now(&e));
                if e.is_retryable() {
                    return Err(e);
                }
                warn!(error = %e, "Invalid restore source");
                return Ok(ReconcileAction::done());
            }
        };

        match self.restore_from(&source).await {
            Ok(restored) => {
                info!(source = %source, restored = %restored, "Restore complete");
                restore.status.restored_id = Some(restored.to_string());
                restore.status.error = None;
                Ok(ReconcileAction::done())
            }
            Err(e) => {
                restore.status.error = Some(StatusError::now(&e));
                if e.is_retryable() {
                    Err(e)
                } else {
                    warn!(error = %e, "Restore failed permanently");
                    Ok(ReconcileAction::done())
                }
            }
        }
    }

    async fn source_id(&self, restore: &EntityRestore) -> Result<EntityId> {
        if restore.spec.name.is_empty() {
            return Err(WardenError::InvalidFormat(
                "spec.name must name the snapshotted entity".to_string(),
            ));
        }
        let snapshot_id = match (&restore.spec.source.name, &restore.spec.source.snapshot_id) {
            (None, Some(id)) if !id.is_empty() => id.clone(),
            (Some(reference), None) => {
                let key = ObjectKey::new(&restore.metadata.namespace, &reference.name);
                let snapshot = self
                    .snapshots
                    .get(&key)
                    .await?
                    .ok_or_else(|| WardenError::NotFound(format!("EntitySnapshot {key}")))?;
                snapshot.status.snapshot_id.ok_or_else(|| {
                    WardenError::NotFound(format!("EntitySnapshot {key} has no snapshot yet"))
                })?
            }
            _ => {
                return Err(WardenError::InvalidFormat(
                    "exactly one of spec.source.name or spec.source.snapshotId must be set"
                        .to_string(),
                ))
            }
        };
        EntityId::with_snapshot_parts(
            &self.type_name,
            &restore.spec.name,
            SnapshotId::new(snapshot_id),
        )
    }

    async fn restore_from(&self, source: &EntityId) -> Result<EntityId> {
        let type_manager = self.manager.type_manager(source.type_name()).ok_or_else(|| {
            WardenError::NotFound(format!("no type manager registered for {}", source.type_name()))
        })?;
        let info = self.manager.entity(source).await?.info().await?;
        let restored = type_manager
            .copy_from_info(&info, &Params::new(), CopyCreateOptions::AllocateNewObject)
            .await?;
        Ok(restored.id().clone())
    }
}

#[async_trait]
impl Reconciler for RestoreReconciler {
    type Object = EntityRestore;

    #[instrument(skip(self), fields(kind = "EntityRestore", key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileAction> {
        let Some(mut restore) = self.store.get(key).await? else {
            debug!("Resource gone, nothing to do");
            return Ok(ReconcileAction::done());
        };
        let outcome = self.reconcile_resource(&mut restore).await;
        persist(self.store.as_ref(), &restore, outcome).await
    }
}
