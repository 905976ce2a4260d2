//! Orchestration API seam: the few cluster objects the backend reads and writes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use warden_common::WardenError;

pub const POSTGRESQL_API_VERSION: &str = "acid.zalan.do/v1";
pub const POSTGRESQL_KIND: &str = "postgresql";

/// Metadata fields assigned by the API server; cleared before re-creating an object.
const SERVER_ASSIGNED: &[&str] = &[
    "resourceVersion",
    "creationTimestamp",
    "generation",
    "selfLink",
    "managedFields",
];

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("cluster API call failed: {0}")]
    Api(String),

    #[error("I/O error talking to the cluster: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected cluster response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn not_found(kind: &str, name: impl Into<String>) -> Self {
        ClusterError::NotFound {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub fn already_exists(kind: &str, name: impl Into<String>) -> Self {
        ClusterError::AlreadyExists {
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// Converts into the shared taxonomy, attaching the failed operation.
    pub fn into_warden(self, operation: &str, target: impl ToString) -> WardenError {
        match self {
            ClusterError::NotFound { kind, name } => {
                WardenError::NotFound(format!("{kind} {name}"))
            }
            ClusterError::AlreadyExists { kind, name } => {
                WardenError::AlreadyExists(format!("{kind} {name}"))
            }
            other => WardenError::backend(operation, target, other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KubeMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Self::default()
        }
    }

    pub fn clear_server_assigned(&mut self) {
        self.uid = None;
        for key in SERVER_ASSIGNED {
            self.extra.remove(*key);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresqlSpec {
    #[serde(default)]
    pub team_id: String,
    /// Database users and their role flags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A database cluster declared as a custom object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Postgresql {
    #[serde(default = "postgresql_api_version")]
    pub api_version: String,
    #[serde(default = "postgresql_kind")]
    pub kind: String,
    pub metadata: KubeMeta,
    #[serde(default)]
    pub spec: PostgresqlSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

fn postgresql_api_version() -> String {
    POSTGRESQL_API_VERSION.to_string()
}

fn postgresql_kind() -> String {
    POSTGRESQL_KIND.to_string()
}

impl Postgresql {
    pub fn new(namespace: &str, name: &str, team_id: &str) -> Self {
        Self {
            api_version: postgresql_api_version(),
            kind: postgresql_kind(),
            metadata: KubeMeta::new(namespace, name),
            spec: PostgresqlSpec {
                team_id: team_id.to_string(),
                ..PostgresqlSpec::default()
            },
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// `namespace/name`.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }

    /// Name of the first pod of the cluster's stateful set.
    pub fn primary_pod(&self) -> String {
        format!("{}-0", self.metadata.name)
    }
}

/// Name of the secret holding `user`'s credentials for `cluster`.
pub fn credentials_secret_name(user: &str, cluster: &str) -> String {
    format!("{user}.{cluster}.credentials")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    #[serde(default = "secret_api_version")]
    pub api_version: String,
    #[serde(default = "secret_kind")]
    pub kind: String,
    pub metadata: KubeMeta,
    /// Base64-encoded values.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub secret_type: Option<String>,
}

fn secret_api_version() -> String {
    "v1".to_string()
}

fn secret_kind() -> String {
    "Secret".to_string()
}

impl Secret {
    pub fn with_credentials(namespace: &str, name: &str, username: &str, password: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert("username".to_string(), BASE64.encode(username));
        data.insert("password".to_string(), BASE64.encode(password));
        Self {
            api_version: secret_api_version(),
            kind: secret_kind(),
            metadata: KubeMeta::new(namespace, name),
            data,
            secret_type: Some("Opaque".to_string()),
        }
    }

    pub fn decoded(&self, key: &str) -> Option<String> {
        let raw = self.data.get(key)?;
        let bytes = BASE64.decode(raw.trim()).ok()?;
        String::from_utf8(bytes).ok()
    }

    /// Copy of this secret under a new name, without server-assigned fields.
    pub fn cloned_as(&self, namespace: &str, name: &str) -> Self {
        let mut clone = self.clone();
        clone.metadata.name = name.to_string();
        clone.metadata.namespace = namespace.to_string();
        clone.metadata.clear_server_assigned();
        clone.metadata.extra.remove("ownerReferences");
        clone
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: KubeMeta,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

impl Pod {
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.phase.as_deref()
    }
}

/// Calls against the orchestration API. Implementations report missing and
/// duplicate objects as `NotFound` and `AlreadyExists`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, ClusterError>;

    async fn list_postgresqls(&self, namespace: &str) -> Result<Vec<Postgresql>, ClusterError>;

    async fn create_postgresql(&self, postgresql: &Postgresql) -> Result<Postgresql, ClusterError>;

    async fn delete_postgresql(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    async fn create_secret(&self, secret: &Secret) -> Result<Secret, ClusterError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgresql_keeps_unknown_fields() {
        let raw = serde_json::json!({
            "apiVersion": "acid.zalan.do/v1",
            "kind": "postgresql",
            "metadata": {
                "name": "acid-minimal-cluster",
                "namespace": "default",
                "uid": "5e0c",
                "resourceVersion": "1234",
                "labels": {"team": "acid"}
            },
            "spec": {
                "teamId": "acid",
                "numberOfInstances": 2,
                "users": {"zalando": ["superuser", "createdb"]},
                "postgresql": {"version": "15"}
            },
            "status": {"PostgresClusterStatus": "Running"}
        });
        let mut pg: Postgresql = serde_json::from_value(raw).unwrap();
        assert_eq!(pg.spec.team_id, "acid");
        assert_eq!(pg.spec.users["zalando"], vec!["superuser", "createdb"]);
        assert_eq!(pg.qualified_name(), "default/acid-minimal-cluster");

        pg.metadata.clear_server_assigned();
        let back = serde_json::to_value(&pg).unwrap();
        assert!(back["metadata"].get("uid").is_none());
        assert!(back["metadata"].get("resourceVersion").is_none());
        assert_eq!(back["metadata"]["labels"]["team"], "acid");
        assert_eq!(back["spec"]["numberOfInstances"], 2);
    }

    #[test]
    fn test_secret_credentials() {
        let secret = Secret::with_credentials("default", "postgres.a.credentials", "postgres", "s3cr3t");
        assert_eq!(secret.data["username"], "cG9zdGdyZXM=");
        assert_eq!(secret.decoded("password").as_deref(), Some("s3cr3t"));
        assert_eq!(secret.decoded("missing"), None);

        let clone = secret.cloned_as("prod", "postgres.b.credentials");
        assert_eq!(clone.metadata.namespace, "prod");
        assert_eq!(clone.decoded("username").as_deref(), Some("postgres"));
    }

    #[test]
    fn test_cluster_error_mapping() {
        let err = ClusterError::not_found("secret", "default/x").into_warden("get secret", "x");
        assert!(err.is_not_found());
        let err = ClusterError::Api("connection refused".into()).into_warden("list", "namespaces");
        assert!(matches!(err, WardenError::Backend { .. }));
    }
}
