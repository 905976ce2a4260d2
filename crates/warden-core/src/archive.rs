//! Self-describing tar container for moving an entity through a file.
//!
//! ```text
//! entity.json          EntityInfo of the archived entity
//! metadata             metadata stream
//! data                 data stream
//! components/<n>/...   same layout for component n
//! ```

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use warden_common::{
    DataReader, EntityId, EntityInfo, Params, ProtectedEntity, Result, SnapshotId, WardenError,
};

pub const INFO_ENTRY: &str = "entity.json";
pub const METADATA_ENTRY: &str = "metadata";
pub const DATA_ENTRY: &str = "data";
pub const COMPONENTS_DIR: &str = "components";

/// Writes `entity` and its components into a tar stream on `writer`.
///
/// Streams are staged through a temporary directory first so payloads of any size
/// can be archived. Returns the number of metadata and data bytes archived.
#[instrument(skip(entity, writer), fields(entity = %entity.id()))]
pub async fn write_archive<W>(entity: &dyn ProtectedEntity, writer: W) -> Result<u64>
where
    W: Write + Send + 'static,
{
    let staging = tempfile::tempdir()?;
    let mut entries = Vec::new();
    let total = stage_entity(entity, staging.path().to_path_buf(), String::new(), &mut entries).await?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut builder = tar::Builder::new(writer);
        for name in &entries {
            builder.append_path_with_name(staging.path().join(name), name)?;
        }
        let mut writer = builder.into_inner()?;
        writer.flush()?;
        Ok(())
    })
    .await
    .map_err(|e| WardenError::backend("write archive", entity.id(), e))??;

    debug!(bytes = total, "Archive written");
    Ok(total)
}

fn stage_entity<'a>(
    entity: &'a dyn ProtectedEntity,
    root: PathBuf,
    prefix: String,
    entries: &'a mut Vec<String>,
) -> BoxFuture<'a, Result<u64>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(root.join(&prefix)).await?;

        let info = entity.info().await?;
        let info_name = format!("{prefix}{INFO_ENTRY}");
        tokio::fs::write(root.join(&info_name), serde_json::to_vec_pretty(&info)?).await?;
        entries.push(info_name);

        let metadata_name = format!("{prefix}{METADATA_ENTRY}");
        let mut total = spool(entity.metadata_reader().await?, &root.join(&metadata_name)).await?;
        entries.push(metadata_name);

        let data_name = format!("{prefix}{DATA_ENTRY}");
        total += spool(entity.data_reader().await?, &root.join(&data_name)).await?;
        entries.push(data_name);

        for (n, component) in entity.components().await?.iter().enumerate() {
            let child_prefix = format!("{prefix}{COMPONENTS_DIR}/{n}/");
            total += stage_entity(component.as_ref(), root.clone(), child_prefix, entries).await?;
        }
        Ok(total)
    })
}

async fn spool(mut reader: DataReader, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let n = tokio::io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(n)
}

/// Reads an archive written by [`write_archive`].
pub async fn read_archive(path: impl AsRef<Path>) -> Result<ArchivedEntity> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        decode_archive(file)
    })
    .await
    .map_err(|e| WardenError::backend("read archive", "archive", e))?
}

/// Decodes an archive from any byte source.
pub fn decode_archive<R: Read>(reader: R) -> Result<ArchivedEntity> {
    let mut archive = tar::Archive::new(reader);
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        files.insert(name, buf);
    }
    assemble(&mut files, "")
}

fn assemble(files: &mut HashMap<String, Vec<u8>>, prefix: &str) -> Result<ArchivedEntity> {
    let mut take = |name: &str| {
        let key = format!("{prefix}{name}");
        files
            .remove(&key)
            .ok_or_else(|| WardenError::InvalidFormat(format!("archive is missing {key}")))
    };
    let info: EntityInfo = serde_json::from_slice(&take(INFO_ENTRY)?)?;
    let metadata = take(METADATA_ENTRY)?;
    let data = take(DATA_ENTRY)?;

    let mut components = Vec::new();
    for n in 0.. {
        let child = format!("{prefix}{COMPONENTS_DIR}/{n}/");
        if !files.contains_key(&format!("{child}{INFO_ENTRY}")) {
            break;
        }
        components.push(Arc::new(assemble(files, &child)?));
    }

    Ok(ArchivedEntity {
        info,
        metadata,
        data,
        components,
    })
}

/// Entity reconstructed from an archive, held in memory.
#[derive(Debug, Clone)]
pub struct ArchivedEntity {
    info: EntityInfo,
    metadata: Vec<u8>,
    data: Vec<u8>,
    components: Vec<Arc<ArchivedEntity>>,
}

impl ArchivedEntity {
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Metadata and data bytes of this entity and every component below it,
    /// counted the same way [`write_archive`] counts them.
    pub fn payload_len(&self) -> u64 {
        let own = (self.metadata.len() + self.data.len()) as u64;
        own + self.components.iter().map(|c| c.payload_len()).sum::<u64>()
    }
}

#[async_trait]
impl ProtectedEntity for ArchivedEntity {
    fn id(&self) -> &EntityId {
        &self.info.id
    }

    async fn info(&self) -> Result<EntityInfo> {
        Ok(self.info.clone())
    }

    async fn snapshot(&self, _params: &Params) -> Result<SnapshotId> {
        Err(WardenError::Unsupported(format!(
            "snapshot of archived entity {}",
            self.info.id
        )))
    }

    async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        Ok(Vec::new())
    }

    async fn components(&self) -> Result<Vec<Arc<dyn ProtectedEntity>>> {
        Ok(self
            .components
            .iter()
            .map(|c| c.clone() as Arc<dyn ProtectedEntity>)
            .collect())
    }

    async fn data_reader(&self) -> Result<DataReader> {
        Ok(Box::pin(Cursor::new(self.data.clone())))
    }

    async fn metadata_reader(&self) -> Result<DataReader> {
        Ok(Box::pin(Cursor::new(self.metadata.clone())))
    }
}
