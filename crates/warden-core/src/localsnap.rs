//! Filesystem-backed snapshot repository for backends without a native snapshot primitive.
//!
//! Layout: `<root>/<type>/<instance>/<snapshot>/{info.json, metadata, data}`. Snapshots
//! are assembled in a hidden staging directory and renamed into place once complete, so
//! a reader never observes a half-written snapshot.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};
use warden_common::{
    DataReader, EntityId, EntityInfo, ProtectedEntity, Result, SnapshotId, WardenError,
};

const INFO_FILE: &str = "info.json";
const METADATA_FILE: &str = "metadata";
const DATA_FILE: &str = "data";
const STAGING_PREFIX: &str = ".staging-";

/// Persisted description of one stored snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub info: EntityInfo,
    pub created_at: DateTime<Utc>,
    pub metadata_size: u64,
    pub data_size: u64,
    pub data_sha256: String,
}

#[derive(Debug, Clone)]
pub struct LocalSnapshotRepo {
    type_name: String,
    root: PathBuf,
}

impl LocalSnapshotRepo {
    pub async fn new(type_name: impl Into<String>, snapshots_dir: impl AsRef<Path>) -> Result<Self> {
        let type_name = type_name.into();
        let root = snapshots_dir.as_ref().join(&type_name);
        fs::create_dir_all(&root).await?;
        Ok(Self { type_name, root })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn instance_dir(&self, id: &EntityId) -> PathBuf {
        self.root.join(encode_component(id.instance_id()))
    }

    fn snapshot_dir(&self, id: &EntityId) -> Result<PathBuf> {
        let snap = require_snapshot(id)?;
        Ok(self.instance_dir(id).join(encode_component(snap.as_str())))
    }

    fn check_type(&self, id: &EntityId) -> Result<()> {
        if id.type_name() != self.type_name {
            return Err(WardenError::InvalidFormat(format!(
                "{id} does not belong to the {} repository",
                self.type_name
            )));
        }
        Ok(())
    }

    /// Copies the entity's metadata and data streams into a new snapshot.
    pub async fn write_entity(
        &self,
        entity: &dyn ProtectedEntity,
        snapshot_id: &SnapshotId,
    ) -> Result<SnapshotRecord> {
        let live_id = entity.id().without_snapshot();
        self.write_entity_as(entity, &live_id, snapshot_id).await
    }

    /// Like [`write_entity`](Self::write_entity), but files the snapshot under
    /// `live_id` instead of the source's own id.
    #[instrument(skip(self, entity), fields(entity = %entity.id(), snapshot = %snapshot_id))]
    pub async fn write_entity_as(
        &self,
        entity: &dyn ProtectedEntity,
        live_id: &EntityId,
        snapshot_id: &SnapshotId,
    ) -> Result<SnapshotRecord> {
        let live_id = live_id.without_snapshot();
        self.check_type(&live_id)?;
        let snap_id = live_id.with_snapshot(snapshot_id.clone());
        let final_dir = self.snapshot_dir(&snap_id)?;
        if fs::try_exists(&final_dir).await? {
            return Err(WardenError::AlreadyExists(format!("snapshot {snap_id}")));
        }

        let instance_dir = self.instance_dir(&live_id);
        fs::create_dir_all(&instance_dir).await?;
        let staging = instance_dir.join(format!(
            "{STAGING_PREFIX}{}",
            encode_component(snapshot_id.as_str())
        ));

        match self.stage(entity, &snap_id, &staging).await {
            Ok(record) => {
                fs::rename(&staging, &final_dir).await?;
                info!(
                    data_size = record.data_size,
                    sha256 = %record.data_sha256,
                    "Stored snapshot"
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                    warn!(error = %cleanup, path = %staging.display(), "Failed to remove staging directory");
                }
                Err(e)
            }
        }
    }

    async fn stage(
        &self,
        entity: &dyn ProtectedEntity,
        snap_id: &EntityId,
        staging: &Path,
    ) -> Result<SnapshotRecord> {
        fs::create_dir_all(staging).await?;

        let source_info = entity.info().await?;

        let metadata = entity.metadata_reader().await?;
        let (metadata_size, _) = copy_hashed(metadata, &staging.join(METADATA_FILE)).await?;

        let data = entity.data_reader().await?;
        let (data_size, data_sha256) = copy_hashed(data, &staging.join(DATA_FILE)).await?;

        let mut info = source_info;
        info.id = snap_id.clone();
        info.size = Some(data_size);

        let record = SnapshotRecord {
            info,
            created_at: Utc::now(),
            metadata_size,
            data_size,
            data_sha256,
        };
        fs::write(staging.join(INFO_FILE), serde_json::to_vec_pretty(&record)?).await?;
        Ok(record)
    }

    /// Snapshot ids stored for a live entity, oldest first.
    pub async fn list_snapshots(&self, id: &EntityId) -> Result<Vec<SnapshotId>> {
        self.check_type(id)?;
        let dir = self.instance_dir(id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(STAGING_PREFIX) || !entry.file_type().await?.is_dir() {
                continue;
            }
            match read_record(&entry.path()).await {
                Ok(record) => records.push(record),
                Err(e) => debug!(error = %e, dir = %name, "Skipping unreadable snapshot"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records
            .into_iter()
            .filter_map(|r| r.info.id.snapshot_id().cloned())
            .collect())
    }

    pub async fn snapshot_exists(&self, id: &EntityId) -> Result<bool> {
        self.check_type(id)?;
        let dir = self.snapshot_dir(id)?;
        Ok(fs::try_exists(dir.join(INFO_FILE)).await?)
    }

    pub async fn record(&self, id: &EntityId) -> Result<SnapshotRecord> {
        self.check_type(id)?;
        let dir = self.snapshot_dir(id)?;
        read_record(&dir).await.map_err(|e| not_found_as(e, id))
    }

    pub async fn info_for_snapshot(&self, id: &EntityId) -> Result<EntityInfo> {
        Ok(self.record(id).await?.info)
    }

    pub async fn data_reader(&self, id: &EntityId) -> Result<DataReader> {
        self.open(id, DATA_FILE).await
    }

    pub async fn metadata_reader(&self, id: &EntityId) -> Result<DataReader> {
        self.open(id, METADATA_FILE).await
    }

    async fn open(&self, id: &EntityId, file: &str) -> Result<DataReader> {
        self.check_type(id)?;
        let path = self.snapshot_dir(id)?.join(file);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_as(e.into(), id))?;
        Ok(Box::pin(file))
    }

    /// Returns `false` when there was nothing to delete.
    #[instrument(skip(self), fields(snapshot = %id))]
    pub async fn delete_snapshot(&self, id: &EntityId) -> Result<bool> {
        self.check_type(id)?;
        let dir = self.snapshot_dir(id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Deleted snapshot");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Rejects ids that do not carry a snapshot component.
pub fn require_snapshot(id: &EntityId) -> Result<&SnapshotId> {
    id.snapshot_id()
        .ok_or_else(|| WardenError::IllegalOperation(format!("{id} does not name a snapshot")))
}

/// Rejects ids that already carry a snapshot component.
pub fn require_live(id: &EntityId, operation: &str) -> Result<()> {
    if id.has_snapshot() {
        return Err(WardenError::IllegalOperation(format!(
            "{id} is a snapshot, cannot {operation}"
        )));
    }
    Ok(())
}

async fn read_record(dir: &Path) -> Result<SnapshotRecord> {
    let raw = fs::read(dir.join(INFO_FILE)).await?;
    Ok(serde_json::from_slice(&raw)?)
}

fn not_found_as(err: WardenError, id: &EntityId) -> WardenError {
    match err {
        WardenError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
            WardenError::NotFound(format!("snapshot {id}"))
        }
        other => other,
    }
}

/// Streams `reader` into a new file, returning the byte count and SHA-256 digest.
async fn copy_hashed(mut reader: DataReader, path: &Path) -> Result<(u64, String)> {
    let mut file = fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((total, format!("{:x}", hasher.finalize())))
}

/// Makes an id segment safe to use as a single path component.
pub(crate) fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Cursor;
    use tempfile::tempdir;
    use warden_common::Params;

    struct StaticEntity {
        id: EntityId,
        data: Vec<u8>,
    }

    #[async_trait]
    impl ProtectedEntity for StaticEntity {
        fn id(&self) -> &EntityId {
            &self.id
        }
        async fn info(&self) -> Result<EntityInfo> {
            Ok(EntityInfo::new(self.id.clone(), "static", Some(self.data.len() as u64)))
        }
        async fn snapshot(&self, _params: &Params) -> Result<SnapshotId> {
            unimplemented!()
        }
        async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
            Ok(Vec::new())
        }
        async fn data_reader(&self) -> Result<DataReader> {
            Ok(Box::pin(Cursor::new(self.data.clone())))
        }
        async fn metadata_reader(&self) -> Result<DataReader> {
            Ok(Box::pin(Cursor::new(b"{\"kind\":\"static\"}".to_vec())))
        }
    }

    #[tokio::test]
    async fn test_write_list_read_delete() {
        let dir = tempdir().unwrap();
        let repo = LocalSnapshotRepo::new("fs", dir.path()).await.unwrap();
        let entity = StaticEntity {
            id: EntityId::new("fs", "db/main").unwrap(),
            data: b"hello snapshot".to_vec(),
        };

        let snap = SnapshotId::new("s-1");
        let record = repo.write_entity(&entity, &snap).await.unwrap();
        assert_eq!(record.data_size, 14);
        assert_eq!(record.info.id.to_string(), "fs:db/main:s-1");

        let listed = repo.list_snapshots(&entity.id).await.unwrap();
        assert_eq!(listed, vec![snap.clone()]);

        let snap_id = entity.id.with_snapshot(snap.clone());
        let mut data = Vec::new();
        repo.data_reader(&snap_id)
            .await
            .unwrap()
            .read_to_end(&mut data)
            .await
            .unwrap();
        assert_eq!(data, b"hello snapshot");

        assert!(repo.delete_snapshot(&snap_id).await.unwrap());
        assert!(!repo.delete_snapshot(&snap_id).await.unwrap());
        assert!(repo.list_snapshots(&entity.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_snapshot_id_rejected() {
        let dir = tempdir().unwrap();
        let repo = LocalSnapshotRepo::new("fs", dir.path()).await.unwrap();
        let entity = StaticEntity {
            id: EntityId::new("fs", "a").unwrap(),
            data: vec![1, 2, 3],
        };
        let snap = SnapshotId::new("dup");
        repo.write_entity(&entity, &snap).await.unwrap();
        let err = repo.write_entity(&entity, &snap).await.unwrap_err();
        assert!(matches!(err, WardenError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let repo = LocalSnapshotRepo::new("fs", dir.path()).await.unwrap();
        let id = EntityId::parse("fs:a:nope").unwrap();
        assert!(repo.data_reader(&id).await.err().unwrap().is_not_found());
        assert!(!repo.snapshot_exists(&id).await.unwrap());
        let live = EntityId::new("fs", "a").unwrap();
        assert!(matches!(
            repo.data_reader(&live).await.err().unwrap(),
            WardenError::IllegalOperation(_)
        ));
    }

    #[test]
    fn test_encode_component() {
        assert_eq!(encode_component("ns/name"), "ns%2Fname");
        assert_eq!(encode_component(".."), "%2E.");
        assert_eq!(encode_component("uid-1_a.b"), "uid-1_a.b");
    }
}
