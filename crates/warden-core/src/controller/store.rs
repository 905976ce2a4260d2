//! Persistence for declarative resources.
//!
//! A store deletes an object as soon as deletion has been requested and its
//! finalizer set is empty, either in `request_deletion` or in a later `patch`.
//!
//! `patch` applies only what a reconciler owns (finalizers and status) onto the
//! stored object. Spec edits and deletion requests made while a reconcile was in
//! flight survive its write-back.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use warden_common::{Result, WardenError};

use super::resource::{ObjectKey, Resource};
use crate::localsnap::encode_component;

#[async_trait]
pub trait ResourceStore<R: Resource>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<Option<R>>;

    async fn list(&self) -> Result<Vec<ObjectKey>>;

    /// Assigns a uid and generation. Fails with `AlreadyExists` on a taken key.
    async fn create(&self, resource: R) -> Result<R>;

    /// Persists the finalizers and status of `resource` and returns the stored
    /// object, or `None` when the write completed its deletion.
    async fn patch(&self, resource: &R) -> Result<Option<R>>;

    async fn request_deletion(&self, key: &ObjectKey) -> Result<()>;
}

fn prepare_create<R: Resource>(mut resource: R) -> R {
    let meta = resource.meta_mut();
    if meta.uid.is_empty() {
        meta.uid = uuid::Uuid::new_v4().to_string();
    }
    if meta.generation == 0 {
        meta.generation = 1;
    }
    resource
}

/// Finalizers and status come from `patch`; spec comes from `stored`. A deletion
/// request is never cleared.
fn merge_patch<R: Resource>(mut stored: R, patch: &R) -> R {
    stored.copy_status_from(patch);
    let meta = stored.meta_mut();
    meta.finalizers = patch.meta().finalizers.clone();
    if meta.deletion_timestamp.is_none() {
        meta.deletion_timestamp = patch.meta().deletion_timestamp;
    }
    stored
}

fn deletion_complete<R: Resource>(resource: &R) -> bool {
    resource.meta().is_deleting() && resource.meta().finalizers.is_empty()
}

/// In-memory store, mostly for tests.
pub struct MemoryStore<R: Resource> {
    objects: Arc<RwLock<BTreeMap<ObjectKey, R>>>,
}

impl<R: Resource> Default for MemoryStore<R> {
    fn default() -> Self {
        Self {
            objects: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<R: Resource> MemoryStore<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for MemoryStore<R> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<R>> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<ObjectKey>> {
        Ok(self.objects.read().await.keys().cloned().collect())
    }

    async fn create(&self, resource: R) -> Result<R> {
        let mut objects = self.objects.write().await;
        let key = resource.key();
        if objects.contains_key(&key) {
            return Err(WardenError::AlreadyExists(format!("{} {key}", R::KIND)));
        }
        let resource = prepare_create(resource);
        objects.insert(key, resource.clone());
        Ok(resource)
    }

    async fn patch(&self, resource: &R) -> Result<Option<R>> {
        let mut objects = self.objects.write().await;
        let key = resource.key();
        let Some(stored) = objects.get(&key).cloned() else {
            return Err(WardenError::NotFound(format!("{} {key}", R::KIND)));
        };
        let merged = merge_patch(stored, resource);
        if deletion_complete(&merged) {
            objects.remove(&key);
            debug!(kind = R::KIND, %key, "Resource deleted");
            return Ok(None);
        }
        objects.insert(key, merged.clone());
        Ok(Some(merged))
    }

    async fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        let mut objects = self.objects.write().await;
        let Some(resource) = objects.get_mut(key) else {
            return Err(WardenError::NotFound(format!("{} {key}", R::KIND)));
        };
        if resource.meta().deletion_timestamp.is_none() {
            resource.meta_mut().deletion_timestamp = Some(Utc::now());
        }
        if resource.meta().finalizers.is_empty() {
            objects.remove(key);
        }
        Ok(())
    }
}

/// One JSON file per resource at `<dir>/<namespace>/<name>.json`.
pub struct FileStore<R: Resource> {
    dir: PathBuf,
    write_lock: Mutex<()>,
    _kind: PhantomData<fn() -> R>,
}

impl<R: Resource> FileStore<R> {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            _kind: PhantomData,
        })
    }

    fn path(&self, key: &ObjectKey) -> PathBuf {
        self.dir
            .join(encode_component(&key.namespace))
            .join(format!("{}.json", encode_component(&key.name)))
    }

    async fn read(&self, key: &ObjectKey) -> Result<Option<R>> {
        match tokio::fs::read(self.path(key)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, resource: &R) -> Result<()> {
        let path = self.path(&resource.key());
        let parent = path.parent().unwrap_or(&self.dir).to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;
        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(resource)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, key: &ObjectKey) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for FileStore<R> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<R>> {
        self.read(key).await
    }

    async fn list(&self) -> Result<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        let mut namespaces = tokio::fs::read_dir(&self.dir).await?;
        while let Some(ns) = namespaces.next_entry().await? {
            if !ns.file_type().await?.is_dir() {
                continue;
            }
            keys.extend(list_namespace::<R>(&ns.path()).await?);
        }
        keys.sort();
        Ok(keys)
    }

    async fn create(&self, resource: R) -> Result<R> {
        let _guard = self.write_lock.lock().await;
        let key = resource.key();
        if self.read(&key).await?.is_some() {
            return Err(WardenError::AlreadyExists(format!("{} {key}", R::KIND)));
        }
        let resource = prepare_create(resource);
        self.write(&resource).await?;
        Ok(resource)
    }

    async fn patch(&self, resource: &R) -> Result<Option<R>> {
        let _guard = self.write_lock.lock().await;
        let key = resource.key();
        let Some(stored) = self.read(&key).await? else {
            return Err(WardenError::NotFound(format!("{} {key}", R::KIND)));
        };
        let merged = merge_patch(stored, resource);
        if deletion_complete(&merged) {
            self.remove(&key).await?;
            debug!(kind = R::KIND, %key, "Resource deleted");
            return Ok(None);
        }
        self.write(&merged).await?;
        Ok(Some(merged))
    }

    async fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let Some(mut resource) = self.read(key).await? else {
            return Err(WardenError::NotFound(format!("{} {key}", R::KIND)));
        };
        if resource.meta().deletion_timestamp.is_none() {
            resource.meta_mut().deletion_timestamp = Some(Utc::now());
        }
        if resource.meta().finalizers.is_empty() {
            return self.remove(key).await;
        }
        self.write(&resource).await
    }
}

/// Keys are read back from the files so that encoded names round-trip.
async fn list_namespace<R: Resource>(dir: &Path) -> Result<Vec<ObjectKey>> {
    let mut keys = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !name.ends_with(".json") {
            continue;
        }
        let raw = tokio::fs::read(entry.path()).await?;
        match serde_json::from_slice::<R>(&raw) {
            Ok(resource) => keys.push(resource.key()),
            Err(e) => debug!(file = %name, error = %e, "Skipping unreadable resource file"),
        }
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::resource::{DeletionPolicy, EntitySnapshot, SnapshotSource};

    fn snapshot(name: &str) -> EntitySnapshot {
        EntitySnapshot::new(
            "default",
            name,
            SnapshotSource {
                name: None,
                peid: Some("fs:a.txt".into()),
            },
        )
    }

    async fn exercise(store: &dyn ResourceStore<EntitySnapshot>) {
        let created = store.create(snapshot("nightly")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.generation, 1);
        assert!(matches!(
            store.create(snapshot("nightly")).await.unwrap_err(),
            WardenError::AlreadyExists(_)
        ));

        let key = created.key();
        let mut with_finalizer = created.clone();
        with_finalizer.metadata.add_finalizer("test/finalizer");
        store.patch(&with_finalizer).await.unwrap();

        store.request_deletion(&key).await.unwrap();
        let deleting = store.get(&key).await.unwrap().unwrap();
        assert!(deleting.metadata.is_deleting());

        let mut released = deleting.clone();
        released.metadata.remove_finalizer("test/finalizer");
        assert!(store.patch(&released).await.unwrap().is_none());
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.create(snapshot("plain")).await.unwrap();
        store
            .request_deletion(&ObjectKey::new("default", "plain"))
            .await
            .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    async fn deletion_survives_stale_write_back(store: &dyn ResourceStore<EntitySnapshot>) {
        let mut created = store.create(snapshot("weekly")).await.unwrap();
        created.metadata.add_finalizer("test/finalizer");
        store.patch(&created).await.unwrap();
        let key = created.key();

        let mut in_flight = store.get(&key).await.unwrap().unwrap();
        store.request_deletion(&key).await.unwrap();
        in_flight.status.snapshot_id = Some("5e0d".into());
        in_flight.status.ready_to_use = Some(true);
        in_flight.spec.deletion_policy = DeletionPolicy::Retain;

        let stored = store.patch(&in_flight).await.unwrap().unwrap();
        assert!(stored.metadata.is_deleting());
        assert_eq!(stored.status.snapshot_id.as_deref(), Some("5e0d"));
        assert_eq!(stored.spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(store.get(&key).await.unwrap().unwrap(), stored);

        let mut released = stored.clone();
        released.metadata.remove_finalizer("test/finalizer");
        released.metadata.deletion_timestamp = None;
        assert!(store.patch(&released).await.unwrap().is_none());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_survives_stale_write_back() {
        deletion_survives_stale_write_back(&MemoryStore::new()).await;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        deletion_survives_stale_write_back(&store).await;
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_store_lists_across_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let store: FileStore<EntitySnapshot> = FileStore::open(dir.path()).await.unwrap();
        store.create(snapshot("b")).await.unwrap();
        let mut other = snapshot("a");
        other.metadata.namespace = "team/x".into();
        store.create(other).await.unwrap();

        let keys = store.list().await.unwrap();
        assert_eq!(
            keys,
            vec![ObjectKey::new("default", "b"), ObjectKey::new("team/x", "a")]
        );
    }
}
