//! Copy/transfer between files and entities on any manager.
//!
//! | source | destination | path |
//! |---|---|---|
//! | file | file | byte copy |
//! | entity | file | archive written to the file |
//! | file | entity | archive read, then overwrite or allocate |
//! | entity | entity | snapshot if live, then overwrite or allocate |
//!
//! File destinations are written to `<dest>.partial` and only renamed on success.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use warden_common::{
    CopyCreateOptions, DataReader, EntityId, EntityInfo, Params, ProtectedEntity,
    ProtectedEntityManager, Result, SnapshotId, WardenError,
};

use crate::archive::{read_archive, write_archive};

const PARTIAL_SUFFIX: &str = ".partial";

/// One side of a transfer.
#[derive(Clone)]
pub enum Locator {
    File(PathBuf),
    Entity {
        manager: Arc<dyn ProtectedEntityManager>,
        id: EntityId,
    },
}

impl Locator {
    /// Interprets a command-line argument. Arguments starting with `/` or `.` are
    /// always files, as is anything that does not parse as an entity id.
    pub fn parse(arg: &str, manager: &Arc<dyn ProtectedEntityManager>) -> Self {
        if arg.starts_with('/') || arg.starts_with('.') {
            return Locator::File(PathBuf::from(arg));
        }
        match EntityId::parse(arg) {
            Ok(id) => Locator::Entity {
                manager: manager.clone(),
                id,
            },
            Err(_) => Locator::File(PathBuf::from(arg)),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Locator::File(_))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Entity { id, .. } => write!(f, "{id}"),
        }
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => f.debug_tuple("File").field(path).finish(),
            Locator::Entity { id, .. } => f.debug_struct("Entity").field("id", id).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub bytes_copied: u64,
    /// Id actually produced at the destination, which may differ from the one
    /// requested when a new object was allocated.
    pub destination: Option<EntityId>,
}

#[instrument(skip(params), fields(source = %source, destination = %destination))]
pub async fn transfer(
    source: &Locator,
    destination: &Locator,
    params: &Params,
) -> Result<TransferReport> {
    let report = match (source, destination) {
        (Locator::File(src), Locator::File(dest)) => {
            let bytes = write_file(dest, |partial| copy_file(src, partial)).await?;
            TransferReport {
                bytes_copied: bytes,
                destination: None,
            }
        }
        (Locator::Entity { manager, id }, Locator::File(dest)) => {
            let entity = manager.entity(id).await?;
            let bytes = write_file(dest, |partial| archive_to(entity, partial)).await?;
            TransferReport {
                bytes_copied: bytes,
                destination: None,
            }
        }
        (Locator::File(src), Locator::Entity { manager, id }) => {
            let archived = read_archive(src).await?;
            let bytes = archived.payload_len();
            let produced = place(&archived, manager, id, params).await?;
            TransferReport {
                bytes_copied: bytes,
                destination: Some(produced),
            }
        }
        (
            Locator::Entity {
                manager: src_manager,
                id: src_id,
            },
            Locator::Entity {
                manager: dest_manager,
                id: dest_id,
            },
        ) => {
            let source = snapshot_source(src_manager, src_id, params).await?;
            let bytes = source.info().await?.size.unwrap_or(0);
            let produced = place(source.as_ref(), dest_manager, dest_id, params).await?;
            TransferReport {
                bytes_copied: bytes,
                destination: Some(produced),
            }
        }
    };
    info!(
        bytes = report.bytes_copied,
        produced = ?report.destination.as_ref().map(ToString::to_string),
        "Transfer complete"
    );
    Ok(report)
}

/// Resolves the source entity, taking a snapshot first when `id` names a live entity.
async fn snapshot_source(
    manager: &Arc<dyn ProtectedEntityManager>,
    id: &EntityId,
    params: &Params,
) -> Result<Arc<dyn ProtectedEntity>> {
    let entity = manager.entity(id).await?;
    if id.has_snapshot() {
        return Ok(entity);
    }
    let snapshot = entity.snapshot(params).await?;
    debug!(snapshot = %snapshot, "Took source snapshot for transfer");
    manager.entity(&id.with_snapshot(snapshot)).await
}

/// Overwrites the destination if it exists, otherwise allocates a new object using
/// the requested id as a naming hint. Returns the id that holds the data.
async fn place(
    source: &dyn ProtectedEntity,
    manager: &Arc<dyn ProtectedEntityManager>,
    dest_id: &EntityId,
    params: &Params,
) -> Result<EntityId> {
    match manager.entity(dest_id).await {
        Ok(existing) => {
            existing.overwrite(source, params, true).await?;
            Ok(dest_id.clone())
        }
        Err(e) if e.is_not_found() => {
            let type_manager = manager.type_manager(dest_id.type_name()).ok_or_else(|| {
                WardenError::NotFound(format!(
                    "no type manager registered for {}",
                    dest_id.type_name()
                ))
            })?;
            let hinted = NamingHint {
                inner: source,
                id: dest_id.clone(),
            };
            let created = type_manager
                .copy(&hinted, params, CopyCreateOptions::AllocateNewObject)
                .await?;
            Ok(created.id().clone())
        }
        Err(e) => Err(e),
    }
}

/// Writes a file destination through `<dest>.partial`. On failure the partial file
/// is removed and the error reports how many bytes had reached it.
async fn write_file<F, Fut>(dest: &Path, write: F) -> Result<u64>
where
    F: FnOnce(PathBuf) -> Fut,
    Fut: std::future::Future<Output = Result<u64>>,
{
    let mut partial = dest.as_os_str().to_owned();
    partial.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial);

    let result = match write(partial.clone()).await {
        Ok(bytes) => tokio::fs::rename(&partial, dest)
            .await
            .map(|_| bytes)
            .map_err(WardenError::from),
        Err(e) => Err(e),
    };

    match result {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            let bytes_copied = tokio::fs::metadata(&partial)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if let Err(rm) = tokio::fs::remove_file(&partial).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!(error = %rm, path = %partial.display(), "Failed to remove partial file");
                }
            }
            Err(WardenError::Transfer {
                bytes_copied,
                source: Box::new(e),
            })
        }
    }
}

async fn copy_file(src: &Path, partial: PathBuf) -> Result<u64> {
    let mut input = tokio::fs::File::open(src).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            WardenError::NotFound(format!("file {}", src.display()))
        } else {
            e.into()
        }
    })?;
    let mut output = tokio::fs::File::create(&partial).await?;
    let bytes = tokio::io::copy(&mut input, &mut output).await?;
    output.flush().await?;
    output.sync_all().await?;
    Ok(bytes)
}

async fn archive_to(entity: Arc<dyn ProtectedEntity>, partial: PathBuf) -> Result<u64> {
    let file = tokio::fs::File::create(&partial).await?.into_std().await;
    write_archive(entity.as_ref(), file).await
}

/// Presents a source entity under the destination id so that allocating backends
/// can derive the new object's name from it.
struct NamingHint<'a> {
    inner: &'a dyn ProtectedEntity,
    id: EntityId,
}

#[async_trait]
impl ProtectedEntity for NamingHint<'_> {
    fn id(&self) -> &EntityId {
        &self.id
    }

    async fn info(&self) -> Result<EntityInfo> {
        let mut info = self.inner.info().await?;
        info.id = self.id.clone();
        info.name = self.id.instance_id().to_string();
        Ok(info)
    }

    async fn snapshot(&self, params: &Params) -> Result<SnapshotId> {
        self.inner.snapshot(params).await
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        self.inner.list_snapshots().await
    }

    async fn components(&self) -> Result<Vec<Arc<dyn ProtectedEntity>>> {
        self.inner.components().await
    }

    async fn data_reader(&self) -> Result<DataReader> {
        self.inner.data_reader().await
    }

    async fn metadata_reader(&self) -> Result<DataReader> {
        self.inner.metadata_reader().await
    }
}
