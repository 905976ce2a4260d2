use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use warden_common::{Result, S3Config, WardenError};

/// Suffix of per-type configuration files under `<conf_dir>/pes`.
pub const TYPE_CONFIG_SUFFIX: &str = ".pe.json";
pub const TYPE_CONFIG_DIR: &str = "pes";
pub const S3_CONFIG_FILE: &str = "s3config.json";

/// Backend family selection for one side of an operation.
///
/// Exactly one source may be set; more than one is ambiguous and rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    pub conf_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub s3_repo: Option<String>,
    pub kopia_repo: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

/// The single backend family chosen by a [`BackendConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSource {
    ConfDir(PathBuf),
    Host { url: String, insecure: bool },
    S3Repo(String),
    KopiaRepo(String),
}

impl BackendSource {
    pub fn family(&self) -> &'static str {
        match self {
            BackendSource::ConfDir(_) => "conf-dir",
            BackendSource::Host { .. } => "host",
            BackendSource::S3Repo(_) => "s3-repo",
            BackendSource::KopiaRepo(_) => "kopia-repo",
        }
    }
}

impl BackendConfig {
    pub fn conf_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conf_dir.is_none()
            && self.host.is_none()
            && self.s3_repo.is_none()
            && self.kopia_repo.is_none()
    }

    /// Returns the selected family, `None` when nothing is set.
    pub fn select(&self) -> Result<Option<BackendSource>> {
        let mut chosen = Vec::new();
        if let Some(dir) = &self.conf_dir {
            chosen.push(BackendSource::ConfDir(dir.clone()));
        }
        if let Some(url) = &self.host {
            chosen.push(BackendSource::Host {
                url: url.clone(),
                insecure: self.insecure,
            });
        }
        if let Some(repo) = &self.s3_repo {
            chosen.push(BackendSource::S3Repo(repo.clone()));
        }
        if let Some(repo) = &self.kopia_repo {
            chosen.push(BackendSource::KopiaRepo(repo.clone()));
        }

        match chosen.len() {
            0 => Ok(None),
            1 => Ok(chosen.pop()),
            _ => Err(WardenError::Config(format!(
                "ambiguous backend configuration: {} are all set, choose one",
                chosen
                    .iter()
                    .map(BackendSource::family)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Contents of a local configuration directory.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Raw per-type configuration keyed by type name.
    pub types: BTreeMap<String, serde_json::Value>,
    pub s3: Option<S3Config>,
}

impl LocalConfig {
    pub async fn load(conf_dir: &Path) -> Result<Self> {
        let pes_dir = conf_dir.join(TYPE_CONFIG_DIR);
        let mut entries = tokio::fs::read_dir(&pes_dir).await.map_err(|e| {
            WardenError::Config(format!("cannot read {}: {e}", pes_dir.display()))
        })?;

        let mut types = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(type_name) = file_name.strip_suffix(TYPE_CONFIG_SUFFIX) else {
                debug!(file = %file_name, "Ignoring non type-config file");
                continue;
            };
            let raw = tokio::fs::read(entry.path()).await?;
            let value: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| {
                WardenError::Config(format!("invalid config for type {type_name}: {e}"))
            })?;
            types.insert(type_name.to_string(), value);
        }

        let s3_path = conf_dir.join(S3_CONFIG_FILE);
        let s3 = match tokio::fs::read(&s3_path).await {
            Ok(raw) => Some(serde_json::from_slice(&raw).map_err(|e| {
                WardenError::Config(format!("invalid {}: {e}", s3_path.display()))
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        info!(
            conf_dir = %conf_dir.display(),
            types = ?types.keys().collect::<Vec<_>>(),
            s3 = s3.is_some(),
            "Loaded local configuration"
        );
        Ok(Self { types, s3 })
    }
}

/// Deserializes one type's configuration object, mapping failures to `Config`.
pub fn parse_type_config<T: serde::de::DeserializeOwned>(
    type_name: &str,
    value: &serde_json::Value,
) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| WardenError::Config(format!("invalid config for type {type_name}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_single_source() {
        assert_eq!(BackendConfig::default().select().unwrap(), None);
        let cfg = BackendConfig::conf_dir("/etc/warden");
        assert_eq!(
            cfg.select().unwrap(),
            Some(BackendSource::ConfDir(PathBuf::from("/etc/warden")))
        );
        let cfg = BackendConfig {
            host: Some("https://pem:1323".into()),
            insecure: true,
            ..Default::default()
        };
        assert_eq!(
            cfg.select().unwrap(),
            Some(BackendSource::Host {
                url: "https://pem:1323".into(),
                insecure: true
            })
        );
    }

    #[test]
    fn test_multiple_sources_are_ambiguous() {
        let cfg = BackendConfig {
            conf_dir: Some("/etc/warden".into()),
            s3_repo: Some("backups".into()),
            ..Default::default()
        };
        let err = cfg.select().unwrap_err();
        assert!(matches!(&err, WardenError::Config(msg) if msg.contains("conf-dir, s3-repo")));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_load_local_config() {
        let dir = tempfile::tempdir().unwrap();
        let pes = dir.path().join(TYPE_CONFIG_DIR);
        tokio::fs::create_dir_all(&pes).await.unwrap();
        tokio::fs::write(pes.join("fs.pe.json"), r#"{"root":"/data"}"#)
            .await
            .unwrap();
        tokio::fs::write(pes.join("README"), "ignored").await.unwrap();
        tokio::fs::write(
            dir.path().join(S3_CONFIG_FILE),
            r#"{"region":"us-east-1","bucket":"b","prefix":"p"}"#,
        )
        .await
        .unwrap();

        let cfg = LocalConfig::load(dir.path()).await.unwrap();
        assert_eq!(cfg.types.len(), 1);
        assert_eq!(cfg.types["fs"]["root"], "/data");
        assert_eq!(cfg.s3.unwrap().bucket, "b");
    }

    #[tokio::test]
    async fn test_missing_pes_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalConfig::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }
}
