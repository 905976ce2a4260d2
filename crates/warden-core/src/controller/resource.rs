use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespaced name of a declarative resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generation: i64,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns `true` when the finalizer was not present before.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

/// A declarative resource kept in a [`ResourceStore`](super::store::ResourceStore).
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Replaces this object's status with `other`'s.
    fn copy_status_from(&mut self, other: &Self);

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Timestamped failure recorded for upstream controllers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusError {
    pub time: DateTime<Utc>,
    pub message: String,
}

impl StatusError {
    pub fn now(message: impl fmt::Display) -> Self {
        Self {
            time: Utc::now(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Release the physical snapshot when the resource is deleted.
    #[default]
    Delete,
    Retain,
}

/// Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshotSpec {
    pub source: SnapshotSource,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

/// Request to take and track one snapshot of a protected entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub metadata: ObjectMeta,
    pub spec: EntitySnapshotSpec,
    #[serde(default)]
    pub status: EntitySnapshotStatus,
}

impl EntitySnapshot {
    pub fn new(namespace: &str, name: &str, source: SnapshotSource) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: EntitySnapshotSpec {
                source,
                deletion_policy: DeletionPolicy::Delete,
            },
            status: EntitySnapshotStatus::default(),
        }
    }
}

impl Resource for EntitySnapshot {
    const KIND: &'static str = "EntitySnapshot";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

/// Exactly one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSource {
    /// An `EntitySnapshot` in the same namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRestoreSpec {
    /// Instance id of the entity the snapshot was taken from.
    pub name: String,
    pub source: RestoreSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRestoreStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

/// Request to materialise a snapshot as a new live entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRestore {
    pub metadata: ObjectMeta,
    pub spec: EntityRestoreSpec,
    #[serde(default)]
    pub status: EntityRestoreStatus,
}

impl EntityRestore {
    pub fn new(namespace: &str, name: &str, entity: &str, source: RestoreSource) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: EntityRestoreSpec {
                name: entity.to_string(),
                source,
            },
            status: EntityRestoreStatus::default(),
        }
    }
}

impl Resource for EntityRestore {
    const KIND: &'static str = "EntityRestore";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn copy_status_from(&mut self, other: &Self) {
        self.status = other.status.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_helpers() {
        let mut meta = ObjectMeta::new("default", "nightly");
        assert!(meta.add_finalizer("warden.io/snapshot-finalizer"));
        assert!(!meta.add_finalizer("warden.io/snapshot-finalizer"));
        assert_eq!(meta.finalizers.len(), 1);
        assert!(meta.remove_finalizer("warden.io/snapshot-finalizer"));
        assert!(!meta.remove_finalizer("warden.io/snapshot-finalizer"));
    }

    #[test]
    fn test_snapshot_resource_schema() {
        let raw = r#"{
            "metadata": {"name": "nightly"},
            "spec": {"source": {"peid": "psql:4a1f"}, "deletionPolicy": "Retain"}
        }"#;
        let snap: EntitySnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snap.key().to_string(), "default/nightly");
        assert_eq!(snap.spec.deletion_policy, DeletionPolicy::Retain);
        assert_eq!(snap.status, EntitySnapshotStatus::default());

        let mut done = snap.clone();
        done.status.snapshot_id = Some("9b2c".into());
        done.status.ready_to_use = Some(true);
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["status"]["snapshotId"], "9b2c");
        assert_eq!(json["status"]["readyToUse"], true);
        assert!(json["status"].get("error").is_none());
    }
}
