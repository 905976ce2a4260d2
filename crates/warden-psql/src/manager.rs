use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use warden_common::{
    CopyCreateOptions, EntityId, EntityInfo, Params, ProtectedEntity, ProtectedEntityTypeManager,
    Result, S3Config, SnapshotId, WardenError,
};
use warden_core::config::parse_type_config;
use warden_core::{LocalSnapshotRepo, ReadinessConfig, TypeManagerFactory};

use crate::cluster::{ClusterApi, Postgresql};
use crate::entity::PsqlEntity;
use crate::kubectl::{Kubectl, KubectlClusterApi};
use crate::restore;
use crate::runner::{CommandRunner, ProcessRunner};
use crate::PSQL_TYPE;

pub const DEFAULT_DUMP_IMAGE: &str = "dpcpinternal/pg-dump:0.0.5";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// `pes/psql.pe.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsqlConfig {
    pub snapshots_dir: Option<PathBuf>,
    /// Falls back to `KUBECONFIG` when unset.
    pub kubeconfig: Option<PathBuf>,
    pub kubectl: Option<PathBuf>,
    pub dump_image: Option<String>,
    /// Namespace for restored clusters; defaults to the source's namespace.
    pub namespace: Option<String>,
    pub readiness_timeout_secs: Option<u64>,
    pub readiness_interval_secs: Option<u64>,
    pub settle_secs: Option<u64>,
}

/// Resolved backend settings.
#[derive(Clone)]
pub struct PsqlSettings {
    pub snapshots_dir: PathBuf,
    pub kubectl: Kubectl,
    pub dump_image: String,
    pub namespace: Option<String>,
    pub readiness: ReadinessConfig,
    pub clock: Clock,
    /// Cancels readiness waits during restores.
    pub cancel: CancellationToken,
}

impl PsqlSettings {
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
            kubectl: Kubectl::default(),
            dump_image: DEFAULT_DUMP_IMAGE.to_string(),
            namespace: None,
            readiness: ReadinessConfig::default(),
            clock: system_clock(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: PsqlConfig) -> Result<Self> {
        let snapshots_dir = config
            .snapshots_dir
            .ok_or_else(|| WardenError::Config("psql: snapshotsDir is required".to_string()))?;
        let mut settings = Self::new(snapshots_dir);

        settings.kubectl.kubeconfig = config
            .kubeconfig
            .or_else(|| std::env::var_os("KUBECONFIG").map(PathBuf::from));
        if let Some(kubectl) = config.kubectl {
            settings.kubectl.binary = kubectl;
        }
        if let Some(image) = config.dump_image {
            settings.dump_image = image;
        }
        settings.namespace = config.namespace;

        if let Some(secs) = config.readiness_timeout_secs {
            settings.readiness.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = config.readiness_interval_secs {
            settings.readiness.check_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = config.settle_secs {
            settings.readiness.settle = Duration::from_secs(secs);
        }
        Ok(settings)
    }
}

/// Builds the psql type manager from its conf-dir entry, talking to the
/// cluster through `kubectl`.
pub struct PsqlFactory {
    runner: Arc<dyn CommandRunner>,
    cancel: CancellationToken,
}

impl Default for PsqlFactory {
    fn default() -> Self {
        Self {
            runner: Arc::new(ProcessRunner),
            cancel: CancellationToken::new(),
        }
    }
}

impl PsqlFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[async_trait]
impl TypeManagerFactory for PsqlFactory {
    fn type_name(&self) -> &str {
        PSQL_TYPE
    }

    async fn create(
        &self,
        config: &serde_json::Value,
        s3: Option<&S3Config>,
    ) -> Result<Arc<dyn ProtectedEntityTypeManager>> {
        let config: PsqlConfig = parse_type_config(PSQL_TYPE, config)?;
        let mut settings = PsqlSettings::from_config(config)?;
        settings.cancel = self.cancel.clone();
        let cluster = Arc::new(KubectlClusterApi::new(
            settings.kubectl.clone(),
            self.runner.clone(),
        ));
        let manager =
            PsqlTypeManager::new(settings, cluster, self.runner.clone(), s3.cloned()).await?;
        Ok(Arc::new(manager))
    }
}

pub(crate) struct PsqlShared {
    pub(crate) cluster: Arc<dyn ClusterApi>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) repo: LocalSnapshotRepo,
    pub(crate) s3: Option<S3Config>,
    pub(crate) settings: PsqlSettings,
}

impl PsqlShared {
    /// Every postgresql object in every namespace.
    pub(crate) async fn clusters(&self) -> Result<Vec<Postgresql>> {
        let namespaces = self
            .cluster
            .list_namespaces()
            .await
            .map_err(|e| e.into_warden("list namespaces", "cluster"))?;
        let mut all = Vec::new();
        for namespace in namespaces {
            let found = self
                .cluster
                .list_postgresqls(&namespace)
                .await
                .map_err(|e| e.into_warden("list postgresqls", &namespace))?;
            all.extend(found);
        }
        Ok(all)
    }

    /// Resolves an instance id by uid, then `namespace/name`, then bare name.
    pub(crate) async fn find(&self, instance: &str) -> Result<Postgresql> {
        let clusters = self.clusters().await?;
        if let Some(pg) = clusters
            .iter()
            .find(|pg| pg.metadata.uid.as_deref() == Some(instance))
        {
            return Ok(pg.clone());
        }
        if let Some(pg) = clusters.iter().find(|pg| pg.qualified_name() == instance) {
            return Ok(pg.clone());
        }
        let mut by_name = clusters.into_iter().filter(|pg| pg.name() == instance);
        match (by_name.next(), by_name.next()) {
            (Some(pg), None) => Ok(pg),
            (Some(_), Some(_)) => Err(WardenError::InvalidFormat(format!(
                "postgresql {instance} exists in several namespaces, use namespace/name"
            ))),
            (None, _) => Err(WardenError::NotFound(format!("postgresql {instance}"))),
        }
    }
}

/// Canonical instance id of a cluster object.
pub(crate) fn instance_id(pg: &Postgresql) -> String {
    pg.metadata
        .uid
        .clone()
        .unwrap_or_else(|| pg.qualified_name())
}

/// Type manager for `psql` entities: Zalando-operator postgresql clusters.
pub struct PsqlTypeManager {
    shared: Arc<PsqlShared>,
}

impl PsqlTypeManager {
    pub async fn new(
        settings: PsqlSettings,
        cluster: Arc<dyn ClusterApi>,
        runner: Arc<dyn CommandRunner>,
        s3: Option<S3Config>,
    ) -> Result<Self> {
        let repo = LocalSnapshotRepo::new(PSQL_TYPE, &settings.snapshots_dir).await?;
        Ok(Self {
            shared: Arc::new(PsqlShared {
                cluster,
                runner,
                repo,
                s3,
                settings,
            }),
        })
    }

    fn check_type(id: &EntityId) -> Result<()> {
        if id.type_name() != PSQL_TYPE {
            return Err(WardenError::InvalidFormat(format!("{id} is not a psql entity")));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtectedEntityTypeManager for PsqlTypeManager {
    fn type_name(&self) -> &str {
        PSQL_TYPE
    }

    async fn entities(&self) -> Result<Vec<EntityId>> {
        let clusters = self.shared.clusters().await?;
        clusters
            .iter()
            .map(|pg| EntityId::new(PSQL_TYPE, instance_id(pg)))
            .collect()
    }

    async fn entity(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>> {
        Self::check_type(id)?;
        if id.has_snapshot() {
            if !self.shared.repo.snapshot_exists(id).await? {
                return Err(WardenError::NotFound(format!("snapshot {id}")));
            }
        } else {
            self.shared.find(id.instance_id()).await?;
        }
        Ok(Arc::new(PsqlEntity::new(id.clone(), self.shared.clone())))
    }

    /// Restores `source` into a new cluster. Sources that are not snapshots in
    /// this backend's repository are stored there first.
    #[instrument(skip(self, source, params), fields(source = %source.id()))]
    async fn copy(
        &self,
        source: &dyn ProtectedEntity,
        params: &Params,
        options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        let id = source.id();
        let stored = id.type_name() == PSQL_TYPE
            && id.has_snapshot()
            && self.shared.repo.snapshot_exists(id).await?;
        let info = if stored {
            self.shared.repo.info_for_snapshot(id).await?
        } else {
            let live = EntityId::new(PSQL_TYPE, id.instance_id())?;
            let snapshot = SnapshotId::new_random();
            let record = self
                .shared
                .repo
                .write_entity_as(source, &live, &snapshot)
                .await?;
            info!(snapshot = %record.info.id, "Stored copy source in the snapshot repository");
            record.info
        };
        self.copy_from_info(&info, params, options).await
    }

    async fn copy_from_info(
        &self,
        info: &EntityInfo,
        _params: &Params,
        options: CopyCreateOptions,
    ) -> Result<Arc<dyn ProtectedEntity>> {
        let restored = restore::restore(&self.shared, info, options).await?;
        Ok(Arc::new(PsqlEntity::new(restored, self.shared.clone())))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &EntityId) -> Result<()> {
        Self::check_type(id)?;
        if id.has_snapshot() {
            if !self.shared.repo.delete_snapshot(id).await? {
                return Err(WardenError::NotFound(format!("snapshot {id}")));
            }
            return Ok(());
        }
        let pg = self.shared.find(id.instance_id()).await?;
        self.shared
            .cluster
            .delete_postgresql(pg.namespace(), pg.name())
            .await
            .map_err(|e| e.into_warden("delete postgresql", pg.qualified_name()))?;
        warn!(cluster = %pg.qualified_name(), "Deleted postgresql cluster");
        Ok(())
    }
}
