//! Restoring a stored snapshot into a freshly created cluster.
//!
//! Every step tolerates having run before: secrets and the cluster object are
//! created only when absent, so a retried restore converges on the same
//! destination for the same day.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};
use warden_common::{CopyCreateOptions, EntityId, EntityInfo, Result, ResultExt, WardenError};
use warden_core::localsnap::require_snapshot;
use warden_core::{ProbeOutcome, ReadinessChecker, ReadinessProbe};

use crate::cluster::{
    credentials_secret_name, ClusterApi, Postgresql, ResourceDescription, Resources, Secret,
};
use crate::entity::SUPERUSER;
use crate::manager::{instance_id, PsqlShared};
use crate::PSQL_TYPE;

const DEFAULT_REQUEST_CPU: &str = "100m";
const DEFAULT_REQUEST_MEMORY: &str = "100Mi";
const DEFAULT_LIMIT_CPU: &str = "500m";
const DEFAULT_LIMIT_MEMORY: &str = "500Mi";

/// `<team>-<fragment>-<yyyymmdd>`, where the fragment is the source name without
/// its team prefix and any earlier date suffix.
pub fn destination_name(source: &Postgresql, now: DateTime<Utc>) -> String {
    let team = source.spec.team_id.as_str();
    let name = source.name();
    let fragment = if team.is_empty() {
        name
    } else {
        name.strip_prefix(team)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(name)
    };
    let fragment = strip_date_suffix(fragment);
    let date = now.format("%Y%m%d");
    if team.is_empty() {
        format!("{fragment}-{date}")
    } else {
        format!("{team}-{fragment}-{date}")
    }
}

fn strip_date_suffix(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((head, tail))
            if !head.is_empty() && tail.len() == 8 && tail.bytes().all(|b| b.is_ascii_digit()) =>
        {
            head
        }
        _ => name,
    }
}

/// Descriptor for the cluster a snapshot of `source` is restored into.
pub fn destination_descriptor(
    source: &Postgresql,
    namespace: Option<&str>,
    now: DateTime<Utc>,
) -> Postgresql {
    let mut dest = source.clone();
    dest.metadata.name = destination_name(source, now);
    if let Some(namespace) = namespace {
        dest.metadata.namespace = namespace.to_string();
    }
    dest.metadata.clear_server_assigned();
    dest.status = None;
    fill_resource_defaults(dest.spec.resources.get_or_insert_with(Resources::default));
    dest
}

fn fill_resource_defaults(resources: &mut Resources) {
    let requests = resources
        .requests
        .get_or_insert_with(ResourceDescription::default);
    requests
        .cpu
        .get_or_insert_with(|| DEFAULT_REQUEST_CPU.to_string());
    requests
        .memory
        .get_or_insert_with(|| DEFAULT_REQUEST_MEMORY.to_string());

    let limits = resources
        .limits
        .get_or_insert_with(ResourceDescription::default);
    limits.cpu.get_or_insert_with(|| DEFAULT_LIMIT_CPU.to_string());
    limits
        .memory
        .get_or_insert_with(|| DEFAULT_LIMIT_MEMORY.to_string());
}

/// Ready once the pod reports `Running`; a `Failed` pod counts as a failure.
struct PodRunning<'a> {
    cluster: &'a dyn ClusterApi,
    namespace: &'a str,
    pod: String,
}

#[async_trait]
impl<'a> ReadinessProbe for PodRunning<'a> {
    async fn check(&self) -> ProbeOutcome {
        match self.cluster.get_pod(self.namespace, &self.pod).await {
            Ok(pod) => match pod.phase() {
                Some("Running") => ProbeOutcome::Ready,
                Some("Failed") => ProbeOutcome::Failed(format!("pod {} failed", self.pod)),
                Some(phase) => ProbeOutcome::Pending(format!("pod {} is {phase}", self.pod)),
                None => ProbeOutcome::Pending(format!("pod {} has no phase yet", self.pod)),
            },
            Err(e) if e.is_not_found() => {
                ProbeOutcome::Pending(format!("pod {} not created yet", self.pod))
            }
            Err(e) => ProbeOutcome::Pending(e.to_string()),
        }
    }
}

#[instrument(skip(shared, info), fields(snapshot = %info.id))]
pub(crate) async fn restore(
    shared: &PsqlShared,
    info: &EntityInfo,
    options: CopyCreateOptions,
) -> Result<EntityId> {
    if info.id.type_name() != PSQL_TYPE {
        return Err(WardenError::Unsupported(format!(
            "psql cannot restore from {} info",
            info.id.type_name()
        )));
    }
    if options != CopyCreateOptions::AllocateNewObject {
        return Err(WardenError::Unsupported(format!(
            "psql restores always allocate a new cluster, got {options:?}"
        )));
    }
    require_snapshot(&info.id)?;
    if !shared.repo.snapshot_exists(&info.id).await? {
        return Err(WardenError::NotFound(format!("snapshot {}", info.id)));
    }

    let source = stored_descriptor(shared, &info.id).await?;
    let now = (shared.settings.clock)();
    let dest = destination_descriptor(&source, shared.settings.namespace.as_deref(), now);
    let target = dest.qualified_name();
    info!(source = %source.qualified_name(), dest = %target, "Restoring snapshot");

    let superuser = clone_credentials(shared, SUPERUSER, &source, &dest)
        .await?
        .ok_or_else(|| {
            WardenError::NotFound(format!(
                "secret {}",
                credentials_secret_name(SUPERUSER, source.name())
            ))
        })?;
    for user in source.spec.users.keys().filter(|u| u.as_str() != SUPERUSER) {
        clone_credentials(shared, user, &source, &dest).await?;
    }

    match shared.cluster.create_postgresql(&dest).await {
        Ok(_) => info!(cluster = %target, "Created postgresql"),
        Err(e) if e.is_already_exists() => debug!(cluster = %target, "Postgresql already present"),
        Err(e) => return Err(e.into_warden("create postgresql", &target)),
    }

    let probe = PodRunning {
        cluster: shared.cluster.as_ref(),
        namespace: dest.namespace(),
        pod: dest.primary_pod(),
    };
    let mut checker = ReadinessChecker::new(shared.settings.readiness.clone());
    checker
        .wait_for_ready(&target, &probe, &shared.settings.cancel)
        .await?;

    load(shared, &info.id, &dest).await?;
    verify_credentials(shared, &superuser, &dest).await;

    let created = shared.find(&target).await?;
    EntityId::new(PSQL_TYPE, instance_id(&created))
}

async fn stored_descriptor(shared: &PsqlShared, id: &EntityId) -> Result<Postgresql> {
    let mut raw = Vec::new();
    shared
        .repo
        .metadata_reader(id)
        .await?
        .read_to_end(&mut raw)
        .await?;
    serde_json::from_slice(&raw).map_err(|e| {
        WardenError::InvalidFormat(format!("{id} metadata is not a postgresql descriptor: {e}"))
    })
}

/// Copies `user`'s credentials secret to the destination cluster's name. Returns
/// the source secret, or `None` when a non-superuser has no secret.
async fn clone_credentials(
    shared: &PsqlShared,
    user: &str,
    source: &Postgresql,
    dest: &Postgresql,
) -> Result<Option<Secret>> {
    let source_name = credentials_secret_name(user, source.name());
    let secret = match shared
        .cluster
        .get_secret(source.namespace(), &source_name)
        .await
    {
        Ok(secret) => secret,
        Err(e) if e.is_not_found() && user != SUPERUSER => {
            debug!(secret = %source_name, "No credentials for user, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e.into_warden("get secret", &source_name)),
    };

    let dest_name = credentials_secret_name(user, dest.name());
    let clone = secret.cloned_as(dest.namespace(), &dest_name);
    match shared.cluster.create_secret(&clone).await {
        Ok(_) => info!(secret = %dest_name, "Cloned credentials"),
        Err(e) if e.is_already_exists() => debug!(secret = %dest_name, "Credentials already cloned"),
        Err(e) => return Err(e.into_warden("create secret", &dest_name)),
    }
    Ok(Some(secret))
}

/// Feeds the stored dump into `psql` on the destination's primary pod.
async fn load(shared: &PsqlShared, snapshot: &EntityId, dest: &Postgresql) -> Result<()> {
    let spec = shared.settings.kubectl.command(vec![
        "exec".to_string(),
        "-i".to_string(),
        "-n".to_string(),
        dest.namespace().to_string(),
        dest.primary_pod(),
        "--".to_string(),
        "psql".to_string(),
        "-U".to_string(),
        SUPERUSER.to_string(),
    ]);
    let target = dest.qualified_name();
    let running = shared
        .runner
        .spawn(&spec)
        .await
        .context_op("start restore load", &target)?;
    let data = shared.repo.data_reader(snapshot).await?;
    let bytes = running
        .feed(data)
        .await
        .context_op("load restore data", &target)?;
    info!(cluster = %target, bytes, "Loaded snapshot data");
    Ok(())
}

/// Re-reads the cloned superuser secret and compares it with the source. A
/// mismatch is logged, not fatal.
async fn verify_credentials(shared: &PsqlShared, source: &Secret, dest: &Postgresql) {
    let name = credentials_secret_name(SUPERUSER, dest.name());
    match shared.cluster.get_secret(dest.namespace(), &name).await {
        Ok(cloned)
            if cloned.decoded("username") == source.decoded("username")
                && cloned.decoded("password") == source.decoded("password") =>
        {
            debug!(secret = %name, "Credentials match the source");
        }
        Ok(_) => warn!(secret = %name, "Credentials differ from the source cluster"),
        Err(e) => warn!(secret = %name, error = %e, "Could not re-read credentials"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_destination_name() {
        let pg = Postgresql::new("default", "acid-minimal-cluster", "acid");
        assert_eq!(
            destination_name(&pg, at(2026, 3, 7)),
            "acid-minimal-cluster-20260307"
        );

        let restored = Postgresql::new("default", "acid-minimal-cluster-20260307", "acid");
        assert_eq!(
            destination_name(&restored, at(2026, 3, 9)),
            "acid-minimal-cluster-20260309"
        );

        let foreign = Postgresql::new("default", "orders", "acid");
        assert_eq!(destination_name(&foreign, at(2026, 1, 1)), "acid-orders-20260101");

        let teamless = Postgresql::new("default", "orders", "");
        assert_eq!(destination_name(&teamless, at(2026, 1, 1)), "orders-20260101");
    }

    #[test]
    fn test_descriptor_clears_server_fields_and_fills_resources() {
        let mut pg = Postgresql::new("default", "acid-db", "acid");
        pg.metadata.uid = Some("uid-1".into());
        pg.metadata
            .extra
            .insert("resourceVersion".into(), serde_json::json!("42"));
        pg.status = Some(serde_json::json!({"PostgresClusterStatus": "Running"}));
        pg.spec.resources = Some(Resources {
            requests: Some(ResourceDescription {
                cpu: Some("1".into()),
                memory: None,
            }),
            limits: None,
        });

        let dest = destination_descriptor(&pg, Some("restore"), at(2026, 2, 2));
        assert_eq!(dest.qualified_name(), "restore/acid-db-20260202");
        assert!(dest.metadata.uid.is_none());
        assert!(!dest.metadata.extra.contains_key("resourceVersion"));
        assert!(dest.status.is_none());

        let resources = dest.spec.resources.unwrap();
        let requests = resources.requests.unwrap();
        assert_eq!(requests.cpu.as_deref(), Some("1"));
        assert_eq!(requests.memory.as_deref(), Some("100Mi"));
        let limits = resources.limits.unwrap();
        assert_eq!(limits.cpu.as_deref(), Some("500m"));
        assert_eq!(limits.memory.as_deref(), Some("500Mi"));
    }
}
