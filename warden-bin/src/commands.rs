use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{self, eyre, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use warden_common::{EntityId, Params, ProtectedEntityManager, WardenError};
use warden_core::controller::{
    Controller, ControllerConfig, EntityRestore, EntitySnapshot, FileStore, RestoreReconciler,
    SnapshotReconciler,
};
use warden_core::{configure, configure_destination, transfer, BackendFactories, FsFactory, Locator};
use warden_psql::PsqlFactory;

use crate::{Cli, Commands};

fn factories(cancel: &CancellationToken) -> BackendFactories {
    BackendFactories::new()
        .with_type(Arc::new(FsFactory))
        .with_type(Arc::new(PsqlFactory::new().with_cancellation(cancel.clone())))
}

fn parse_id(raw: &str) -> eyre::Result<EntityId> {
    EntityId::parse(raw).wrap_err_with(|| format!("invalid entity id {raw:?}"))
}

pub async fn run(cli: Cli) -> eyre::Result<()> {
    let cancel = CancellationToken::new();
    let factories = factories(&cancel);
    let manager = configure(&cli.source_config(), &factories)
        .await
        .wrap_err("could not configure the source manager")?;

    match &cli.command {
        Commands::Types => {
            let types = manager.type_managers();
            let mut names: Vec<&str> = types.iter().map(|tm| tm.type_name()).collect();
            names.sort_unstable();
            for name in names {
                println!("{name}");
            }
        }
        Commands::Ls { type_name } => {
            let type_manager = manager
                .type_manager(type_name)
                .ok_or_else(|| eyre!("no type manager registered for {type_name}"))?;
            for id in type_manager.entities().await? {
                println!("{id}");
            }
        }
        Commands::Show { id } => {
            let entity = manager.entity(&parse_id(id)?).await?;
            let info = entity.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
            for component in entity.components().await? {
                println!("component {}", component.id());
            }
        }
        Commands::Lssn { id } => {
            let id = parse_id(id)?;
            let entity = manager.entity(&id).await?;
            for snapshot in entity.list_snapshots().await? {
                println!("{}", id.with_snapshot(snapshot));
            }
        }
        Commands::Snap { id } => {
            let entity = manager.entity(&parse_id(id)?).await?;
            let snapshot = entity.snapshot(&Params::new()).await?;
            println!("{snapshot}");
        }
        Commands::Rmsn { id } => remove_snapshot(&manager, &parse_id(id)?).await?,
        Commands::Cp { source, dest } => {
            let dest_manager = configure_destination(&cli.dest_config(), &factories, &manager)
                .await
                .wrap_err("could not configure the destination manager")?;
            let report = transfer(
                &Locator::parse(source, &manager),
                &Locator::parse(dest, &dest_manager),
                &Params::new(),
            )
            .await?;
            println!("Copied {} bytes", report.bytes_copied);
            if let Some(id) = report.destination {
                println!("{id}");
            }
        }
        Commands::Controller {
            resources,
            type_name,
            interval,
            concurrency,
        } => {
            let config = ControllerConfig {
                interval: Duration::from_secs(*interval),
                concurrency: *concurrency,
                ..Default::default()
            };
            run_controllers(manager, resources, type_name, config, cancel).await?;
        }
    }
    Ok(())
}

async fn remove_snapshot(
    manager: &Arc<dyn ProtectedEntityManager>,
    id: &EntityId,
) -> eyre::Result<()> {
    let snapshot = id.snapshot_id().cloned().ok_or_else(|| {
        WardenError::IllegalOperation(format!("{id} does not name a snapshot"))
    })?;
    let live = manager.entity(&id.without_snapshot()).await?;
    if !live.delete_snapshot(&snapshot, &Params::new()).await? {
        return Err(WardenError::NotFound(format!("snapshot {id}")).into());
    }
    println!("Deleted {id}");
    Ok(())
}

async fn run_controllers(
    manager: Arc<dyn ProtectedEntityManager>,
    resources: &std::path::Path,
    type_name: &str,
    config: ControllerConfig,
    cancel: CancellationToken,
) -> eyre::Result<()> {
    if manager.type_manager(type_name).is_none() {
        return Err(eyre!("no type manager registered for {type_name}"));
    }
    let snapshots = Arc::new(FileStore::<EntitySnapshot>::open(resources.join("snapshots")).await?);
    let restores = Arc::new(FileStore::<EntityRestore>::open(resources.join("restores")).await?);

    let snapshot_controller = Controller::new(
        Arc::new(SnapshotReconciler::new(
            snapshots.clone(),
            manager.clone(),
            type_name,
        )),
        snapshots.clone(),
        config.clone(),
    );
    let restore_controller = Controller::new(
        Arc::new(RestoreReconciler::new(
            restores.clone(),
            snapshots,
            manager,
            type_name,
        )),
        restores,
        config,
    );

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
        interrupt.cancel();
    });

    info!(resources = %resources.display(), type_name, "Controllers started");
    let (snapshots_done, restores_done) = tokio::join!(
        snapshot_controller.run(cancel.clone()),
        restore_controller.run(cancel),
    );
    snapshots_done?;
    restores_done?;
    Ok(())
}
