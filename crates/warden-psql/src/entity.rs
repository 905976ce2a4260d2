use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};
use warden_common::{
    DataReader, EntityId, EntityInfo, Params, ProtectedEntity, Result, ResultExt, SnapshotId,
    WardenError,
};
use warden_core::localsnap::require_live;

use crate::cluster::{credentials_secret_name, Postgresql};
use crate::manager::PsqlShared;

/// Superuser whose credentials the dump and load run with.
pub const SUPERUSER: &str = "postgres";

pub struct PsqlEntity {
    id: EntityId,
    shared: Arc<PsqlShared>,
}

impl PsqlEntity {
    pub(crate) fn new(id: EntityId, shared: Arc<PsqlShared>) -> Self {
        Self { id, shared }
    }

    async fn live(&self) -> Result<Postgresql> {
        self.shared.find(self.id.instance_id()).await
    }

    /// Starts a throwaway dump pod next to the cluster and streams its stdout.
    #[instrument(skip(self), fields(entity = %self.id))]
    async fn dump(&self) -> Result<DataReader> {
        let pg = self.live().await?;
        let secret_name = credentials_secret_name(SUPERUSER, pg.name());
        let secret = self
            .shared
            .cluster
            .get_secret(pg.namespace(), &secret_name)
            .await
            .map_err(|e| e.into_warden("get secret", &secret_name))?;
        let username = secret.decoded("username").ok_or_else(|| {
            WardenError::backend("read credentials", &secret_name, "no username")
        })?;
        let password = secret.decoded("password").ok_or_else(|| {
            WardenError::backend("read credentials", &secret_name, "no password")
        })?;

        let pod = format!("snapshot-pg-{}", uuid::Uuid::new_v4());
        let settings = &self.shared.settings;
        let spec = settings.kubectl.command(vec![
            "run".to_string(),
            "-n".to_string(),
            pg.namespace().to_string(),
            pod.clone(),
            format!("--image={}", settings.dump_image),
            "--env".to_string(),
            format!("PGPASSWORD={password}"),
            "--env".to_string(),
            format!("PGHOST={}", pg.name()),
            "--env".to_string(),
            format!("PGUSER={username}"),
            "-i".to_string(),
            "--restart=Never".to_string(),
            "--rm".to_string(),
            "--quiet".to_string(),
        ]);
        let running = self
            .shared
            .runner
            .spawn(&spec)
            .await
            .context_op("start dump", pg.qualified_name())?;
        info!(pod = %pod, cluster = %pg.qualified_name(), "Streaming database dump");
        Ok(running.into_stream())
    }
}

#[async_trait]
impl ProtectedEntity for PsqlEntity {
    fn id(&self) -> &EntityId {
        &self.id
    }

    async fn info(&self) -> Result<EntityInfo> {
        let info = if self.id.has_snapshot() {
            self.shared.repo.info_for_snapshot(&self.id).await?
        } else {
            let pg = self.live().await?;
            EntityInfo::new(self.id.clone(), pg.name(), None)
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
        self.dump().await
    }

    /// The cluster's object descriptor as JSON.
    async fn metadata_reader(&self) -> Result<DataReader> {
        if self.id.has_snapshot() {
            return self.shared.repo.metadata_reader(&self.id).await;
        }
        let pg = self.live().await?;
        Ok(Box::pin(Cursor::new(serde_json::to_vec(&pg)?)))
    }
}
