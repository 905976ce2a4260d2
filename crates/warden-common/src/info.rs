use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::EntityId;

/// Descriptive information about a protected entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityInfo {
    pub id: EntityId,
    pub name: String,
    /// `None` when the backend cannot tell the size up front.
    pub size: Option<u64>,
    #[serde(default)]
    pub data_transports: Vec<DataTransport>,
    #[serde(default)]
    pub metadata_transports: Vec<DataTransport>,
    #[serde(default)]
    pub combined_transports: Vec<DataTransport>,
    #[serde(default)]
    pub component_ids: Vec<EntityId>,
}

impl EntityInfo {
    pub fn new(id: EntityId, name: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            id,
            name: name.into(),
            size,
            data_transports: Vec::new(),
            metadata_transports: Vec::new(),
            combined_transports: Vec::new(),
            component_ids: Vec::new(),
        }
    }

    /// Attaches the S3 transports for this entity when an object store is configured.
    pub fn with_s3_transports(mut self, s3: Option<&S3Config>) -> Self {
        if let Some(s3) = s3 {
            self.data_transports = vec![DataTransport::s3_data(&self.id, s3)];
            self.metadata_transports = vec![DataTransport::s3_metadata(&self.id, s3)];
            self.combined_transports = vec![DataTransport::s3_combined(&self.id, s3)];
        }
        self
    }
}

/// Endpoint from which an entity's payload can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransport {
    pub transport_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl DataTransport {
    pub const S3: &'static str = "s3";

    fn s3(id: &EntityId, s3: &S3Config, suffix: &str) -> Self {
        let key = format!(
            "{}/{}/{}{suffix}",
            s3.prefix.trim_end_matches('/'),
            id.type_name(),
            id.to_string().replace(crate::ID_DELIMITER, "_"),
        );
        let mut params = BTreeMap::new();
        params.insert("region".to_string(), s3.region.clone());
        params.insert("bucket".to_string(), s3.bucket.clone());
        params.insert("key".to_string(), key.clone());
        params.insert("url".to_string(), format!("s3://{}/{key}", s3.bucket));
        if let Some(base) = &s3.url_base {
            params.insert("endpoint".to_string(), base.clone());
        }
        Self {
            transport_type: Self::S3.to_string(),
            params,
        }
    }

    pub fn s3_data(id: &EntityId, s3: &S3Config) -> Self {
        Self::s3(id, s3, "")
    }

    pub fn s3_metadata(id: &EntityId, s3: &S3Config) -> Self {
        Self::s3(id, s3, ".md")
    }

    pub fn s3_combined(id: &EntityId, s3: &S3Config) -> Self {
        Self::s3(id, s3, ".zip")
    }
}

/// Object store location used to describe transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub url_base: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_transports() {
        let s3 = S3Config {
            region: "us-west-2".to_string(),
            bucket: "backups".to_string(),
            prefix: "warden/".to_string(),
            url_base: None,
        };
        let info = EntityInfo::new(EntityId::new("psql", "uid-1").unwrap(), "acid-db", None)
            .with_s3_transports(Some(&s3));

        assert_eq!(info.data_transports.len(), 1);
        assert_eq!(
            info.data_transports[0].params["url"],
            "s3://backups/warden/psql/psql_uid-1"
        );
        assert_eq!(
            info.metadata_transports[0].params["key"],
            "warden/psql/psql_uid-1.md"
        );
        assert!(info.combined_transports[0].params["url"].ends_with(".zip"));
    }

    #[test]
    fn test_info_without_s3_has_no_transports() {
        let info = EntityInfo::new(EntityId::new("fs", "a.txt").unwrap(), "a.txt", Some(3))
            .with_s3_transports(None);
        assert!(info.data_transports.is_empty());
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "fs:a.txt");
        assert_eq!(json["size"], 3);
    }
}
