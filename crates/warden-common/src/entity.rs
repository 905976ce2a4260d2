//! Capability contracts shared by every backend.
//!
//! A backend is a `ProtectedEntityTypeManager` registered under its type name. Entities
//! are handed out as `Arc<dyn ProtectedEntity>`; dispatch happens purely through these
//! traits. Optional capabilities default to `WardenError::Unsupported`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::id::{EntityId, SnapshotId};
use crate::info::EntityInfo;
use crate::{Result, WardenError};

/// Byte stream handed out by entities. Dropping it releases everything behind it,
/// including any process producing the bytes.
pub type DataReader = Pin<Box<dyn AsyncRead + Send>>;

/// Per-backend operation parameters, keyed by backend type name.
pub type Params = HashMap<String, HashMap<String, serde_json::Value>>;

/// How a type manager should place a copied entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyCreateOptions {
    /// Overwrite the object carrying the source's instance id.
    UpdateExistingObject,
    /// Create a new object; the source id is only a naming hint.
    AllocateNewObject,
    /// Create an object with exactly the source's instance id.
    AllocateObjectWithId,
}

#[async_trait]
pub trait ProtectedEntity: Send + Sync {
    fn id(&self) -> &EntityId;

    async fn info(&self) -> Result<EntityInfo>;

    async fn combined_info(&self) -> Result<Vec<EntityInfo>> {
        Err(WardenError::Unsupported(format!(
            "combined info for {}",
            self.id()
        )))
    }

    /// Takes a point-in-time snapshot. Illegal on an id that already has a snapshot.
    async fn snapshot(&self, params: &Params) -> Result<SnapshotId>;

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>>;

    /// Returns `false` when the snapshot did not exist.
    async fn delete_snapshot(&self, snapshot: &SnapshotId, _params: &Params) -> Result<bool> {
        Err(WardenError::Unsupported(format!(
            "delete snapshot {snapshot} of {}",
            self.id()
        )))
    }

    async fn info_for_snapshot(&self, snapshot: &SnapshotId) -> Result<EntityInfo> {
        Err(WardenError::Unsupported(format!(
            "info for snapshot {snapshot} of {}",
            self.id()
        )))
    }

    async fn components(&self) -> Result<Vec<Arc<dyn ProtectedEntity>>> {
        Ok(Vec::new())
    }

    async fn data_reader(&self) -> Result<DataReader>;

    async fn metadata_reader(&self) -> Result<DataReader>;

    async fn overwrite(
        &self,
        source: &dyn ProtectedEntity,
        _params: &Params,
        _overwrite_components: bool,
    ) -> Result<()> {
        Err(WardenError::Unsupported(format!(
            "overwrite {} from {}",
            self.id(),
            source.id()
        )))
    }
}

#[async_trait]
pub trait ProtectedEntityTypeManager: Send + Sync {
    fn type_name(&self) -> &str;

    /// Ids of every live entity of this type.
    async fn entities(&self) -> Result<Vec<EntityId>>;

    async fn entity(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>>;

    async fn copy(
        &self,
        source: &dyn ProtectedEntity,
        params: &Params,
        options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>>;

    async fn copy_from_info(
        &self,
        info: &EntityInfo,
        _params: &Params,
        _options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        Err(WardenError::Unsupported(format!(
            "{} cannot copy from info {}",
            self.type_name(),
            info.id
        )))
    }

    async fn delete(&self, id: &EntityId) -> Result<()>;
}

/// Process-wide lookup from type name to backend.
#[async_trait]
pub trait ProtectedEntityManager: Send + Sync {
    fn type_managers(&self) -> Vec<Arc<dyn ProtectedEntityTypeManager>>;

    fn type_manager(&self, type_name: &str) -> Option<Arc<dyn ProtectedEntityTypeManager>>;

    async fn entity(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>> {
        let manager = self.type_manager(id.type_name()).ok_or_else(|| {
            WardenError::NotFound(format!("no type manager registered for {}", id.type_name()))
        })?;
        manager.entity(id).await
    }
}
