//! Filesystem backend (type `fs`): each regular file directly under a root
//! directory is one entity. Snapshots live in a [`LocalSnapshotRepo`].

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};
use warden_common::{
    CopyCreateOptions, DataReader, EntityId, EntityInfo, Params, ProtectedEntity,
    ProtectedEntityTypeManager, Result, S3Config, SnapshotId, WardenError, ID_DELIMITER,
};

use crate::config::parse_type_config;
use crate::localsnap::{require_live, LocalSnapshotRepo};
use crate::registry::TypeManagerFactory;

pub const FS_TYPE: &str = "fs";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsConfig {
    pub root: PathBuf,
    pub snapshots_dir: PathBuf,
}

/// Metadata stream of a live file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

pub struct FsFactory;

#[async_trait]
impl TypeManagerFactory for FsFactory {
    fn type_name(&self) -> &str {
        FS_TYPE
    }

    async fn create(
        &self,
        config: &serde_json::Value,
        s3: Option<&S3Config>,
    ) -> Result<Arc<dyn ProtectedEntityTypeManager>> {
        let config: FsConfig = parse_type_config(FS_TYPE, config)?;
        Ok(Arc::new(FsTypeManager::new(config, s3.cloned()).await?))
    }
}

#[derive(Debug, Clone)]
struct FsShared {
    root: PathBuf,
    repo: LocalSnapshotRepo,
    s3: Option<S3Config>,
}

pub struct FsTypeManager {
    shared: Arc<FsShared>,
}

impl FsTypeManager {
    pub async fn new(config: FsConfig, s3: Option<S3Config>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        let repo = LocalSnapshotRepo::new(FS_TYPE, &config.snapshots_dir).await?;
        Ok(Self {
            shared: Arc::new(FsShared {
                root: config.root,
                repo,
                s3,
            }),
        })
    }

    fn entity_handle(&self, id: &EntityId) -> Result<FsEntity> {
        if id.type_name() != FS_TYPE {
            return Err(WardenError::InvalidFormat(format!("{id} is not an fs entity")));
        }
        validate_file_name(id.instance_id())?;
        Ok(FsEntity {
            id: id.clone(),
            path: self.shared.root.join(id.instance_id()),
            shared: self.shared.clone(),
        })
    }

    /// Writes `source`'s data into `<root>/<name>` and returns the resulting entity.
    async fn write_entity_file(
        &self,
        name: &str,
        source: &dyn ProtectedEntity,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        let id = EntityId::new(FS_TYPE, name)?;
        let handle = self.entity_handle(&id)?;
        let bytes = write_staged(&handle.path, source.data_reader().await?).await?;
        info!(source = %source.id(), dest = %id, bytes, "Copied entity into file");
        Ok(Arc::new(handle))
    }

    async fn unique_name(&self, hint: &str) -> Result<String> {
        let (stem, ext) = match hint.rfind('.') {
            Some(dot) if dot > 0 => hint.split_at(dot),
            _ => (hint, ""),
        };
        let mut candidate = hint.to_string();
        let mut n = 0;
        while tokio::fs::try_exists(self.shared.root.join(&candidate)).await? {
            n += 1;
            candidate = format!("{stem}-{n}{ext}");
        }
        Ok(candidate)
    }
}

#[async_trait]
impl ProtectedEntityTypeManager for FsTypeManager {
    fn type_name(&self) -> &str {
        FS_TYPE
    }

    async fn entities(&self) -> Result<Vec<EntityId>> {
        let mut dir = tokio::fs::read_dir(&self.shared.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }
            match EntityId::new(FS_TYPE, &name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(file = %name, error = %e, "Skipping file that cannot be addressed"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn entity(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>> {
        let handle = self.entity_handle(id)?;
        let exists = if id.has_snapshot() {
            self.shared.repo.snapshot_exists(id).await?
        } else {
            tokio::fs::metadata(&handle.path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)
        };
        if !exists {
            return Err(WardenError::NotFound(format!("entity {id}")));
        }
        Ok(Arc::new(handle))
    }

    #[instrument(skip(self, source, _params), fields(source = %source.id()))]
    async fn copy(
        &self,
        source: &dyn ProtectedEntity,
        _params: &Params,
        options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        let source_name = source.id().instance_id().to_string();
        match options {
            CopyCreateOptions::AllocateNewObject => {
                let info = source.info().await?;
                let hint = Path::new(&info.name)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .filter(|n| validate_file_name(n).is_ok())
                    .unwrap_or(source_name);
                let name = self.unique_name(&hint).await?;
                self.write_entity_file(&name, source).await
            }
            CopyCreateOptions::UpdateExistingObject => {
                self.write_entity_file(&source_name, source).await
            }
            CopyCreateOptions::AllocateObjectWithId => {
                validate_file_name(&source_name)?;
                if tokio::fs::try_exists(self.shared.root.join(&source_name)).await? {
                    return Err(WardenError::AlreadyExists(format!("fs file {source_name}")));
                }
                self.write_entity_file(&source_name, source).await
            }
        }
    }

    async fn copy_from_info(
        &self,
        info: &EntityInfo,
        params: &Params,
        options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        if info.id.type_name() != FS_TYPE {
            return Err(WardenError::Unsupported(format!(
                "fs cannot copy from {} info",
                info.id.type_name()
            )));
        }
        let source = self.entity(&info.id).await?;
        self.copy(source.as_ref(), params, options).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &EntityId) -> Result<()> {
        let handle = self.entity_handle(id)?;
        if id.has_snapshot() {
            if !self.shared.repo.delete_snapshot(id).await? {
                return Err(WardenError::NotFound(format!("snapshot {id}")));
            }
            return Ok(());
        }
        match tokio::fs::remove_file(&handle.path).await {
            Ok(()) => {
                info!("Deleted file entity");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WardenError::NotFound(format!("entity {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub struct FsEntity {
    id: EntityId,
    path: PathBuf,
    shared: Arc<FsShared>,
}

impl FsEntity {
    async fn file_metadata(&self) -> Result<FileMetadata> {
        let meta = tokio::fs::metadata(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WardenError::NotFound(format!("entity {}", self.id))
            } else {
                e.into()
            }
        })?;
        Ok(FileMetadata {
            name: self.id.instance_id().to_string(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[async_trait]
impl ProtectedEntity for FsEntity {
    fn id(&self) -> &EntityId {
        &self.id
    }

    async fn info(&self) -> Result<EntityInfo> {
        let info = if self.id.has_snapshot() {
            self.shared.repo.info_for_snapshot(&self.id).await?
        } else {
            let meta = self.file_metadata().await?;
            EntityInfo::new(self.id.clone(), meta.name, Some(meta.size))
        };
        Ok(info.with_s3_transports(self.shared.s3.as_ref()))
    }

    #[instrument(skip(self, _params), fields(entity = %self.id))]
    async fn snapshot(&self, _params: &Params) -> Result<SnapshotId> {
        require_live(&self.id, "snapshot")?;
        let snapshot_id = SnapshotId::new_random();
        self.shared.repo.write_entity(self, &snapshot_id).await?;
        Ok(snapshot_id)
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        require_live(&self.id, "list snapshots")?;
        self.shared.repo.list_snapshots(&self.id).await
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotId, _params: &Params) -> Result<bool> {
        require_live(&self.id, "delete snapshots")?;
        self.shared
            .repo
            .delete_snapshot(&self.id.with_snapshot(snapshot.clone()))
            .await
    }

    async fn info_for_snapshot(&self, snapshot: &SnapshotId) -> Result<EntityInfo> {
        let info = self
            .shared
            .repo
            .info_for_snapshot(&self.id.with_snapshot(snapshot.clone()))
            .await?;
        Ok(info.with_s3_transports(self.shared.s3.as_ref()))
    }

    async fn data_reader(&self) -> Result<DataReader> {
        if self.id.has_snapshot() {
            return self.shared.repo.data_reader(&self.id).await;
        }
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WardenError::NotFound(format!("entity {}", self.id))
            } else {
                e.into()
            }
        })?;
        Ok(Box::pin(file))
    }

    async fn metadata_reader(&self) -> Result<DataReader> {
        if self.id.has_snapshot() {
            return self.shared.repo.metadata_reader(&self.id).await;
        }
        let meta = self.file_metadata().await?;
        Ok(Box::pin(Cursor::new(serde_json::to_vec(&meta)?)))
    }

    #[instrument(skip(self, source, _params), fields(entity = %self.id, source = %source.id()))]
    async fn overwrite(
        &self,
        source: &dyn ProtectedEntity,
        _params: &Params,
        _overwrite_components: bool,
    ) -> Result<()> {
        require_live(&self.id, "overwrite")?;
        let bytes = write_staged(&self.path, source.data_reader().await?).await?;
        info!(bytes, "Overwrote file entity");
        Ok(())
    }
}

fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', ID_DELIMITER])
    {
        return Err(WardenError::InvalidFormat(format!(
            "{name:?} is not a valid fs instance id"
        )));
    }
    Ok(())
}

/// Streams `reader` into a hidden sibling of `target`, then renames it into place.
async fn write_staged(target: &Path, mut reader: DataReader) -> Result<u64> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging = dir.join(format!(".{file_name}.{}.partial", uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&staging).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(&staging, target).await?;
        Ok::<_, WardenError>(n)
    }
    .await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, path = %staging.display(), "Failed to remove staging file");
            }
        }
    }
    result
}
