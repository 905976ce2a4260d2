//! End-to-end transfers through a conf-dir configured filesystem backend.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use warden_common::{EntityId, Params, ProtectedEntityManager};
use warden_core::fs::FileMetadata;
use warden_core::{configure, transfer, BackendConfig, BackendFactories, FsFactory, Locator};

async fn fs_manager(base: &Path, name: &str) -> Result<Arc<dyn ProtectedEntityManager>> {
    let conf_dir = base.join(format!("{name}-conf"));
    tokio::fs::create_dir_all(conf_dir.join("pes")).await?;
    let config = serde_json::json!({
        "root": base.join(format!("{name}-files")),
        "snapshotsDir": base.join(format!("{name}-snapshots")),
    });
    tokio::fs::write(conf_dir.join("pes/fs.pe.json"), config.to_string()).await?;

    let factories = BackendFactories::new().with_type(Arc::new(FsFactory));
    Ok(configure(&BackendConfig::conf_dir(conf_dir), &factories).await?)
}

async fn read_metadata(
    manager: &Arc<dyn ProtectedEntityManager>,
    id: &EntityId,
) -> Result<FileMetadata> {
    let mut raw = Vec::new();
    manager
        .entity(id)
        .await?
        .metadata_reader()
        .await?
        .read_to_end(&mut raw)
        .await?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn read_data(manager: &Arc<dyn ProtectedEntityManager>, id: &EntityId) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    manager
        .entity(id)
        .await?
        .data_reader()
        .await?
        .read_to_end(&mut buf)
        .await?;
    Ok(buf)
}

#[tokio::test]
async fn test_entity_to_file_to_entity_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = fs_manager(dir.path(), "src").await?;
    let dest = fs_manager(dir.path(), "dst").await?;
    tokio::fs::write(dir.path().join("src-files/orders.csv"), "id,total\n1,9.50\n").await?;

    let archive = dir.path().join("orders.tar");
    let out = transfer(
        &Locator::parse("fs:orders.csv", &source),
        &Locator::File(archive.clone()),
        &Params::new(),
    )
    .await?;
    assert!(out.bytes_copied > 16);
    assert!(archive.exists());

    let back = transfer(
        &Locator::File(archive),
        &Locator::parse("fs:restored.csv", &dest),
        &Params::new(),
    )
    .await?;
    let produced = back.destination.expect("destination id");
    assert_eq!(produced.to_string(), "fs:restored.csv");
    assert_eq!(read_data(&dest, &produced).await?, b"id,total\n1,9.50\n");
    // Both legs count the same metadata and data bytes.
    assert_eq!(back.bytes_copied, out.bytes_copied);

    let original = read_metadata(&source, &EntityId::new("fs", "orders.csv")?).await?;
    let restored = read_metadata(&dest, &produced).await?;
    assert_eq!(original.name, "orders.csv");
    assert_eq!(restored.name, "restored.csv");
    assert_eq!(restored.size, original.size);
    assert_eq!(restored.size, 16);
    assert!(restored.modified.is_some());
    Ok(())
}

#[tokio::test]
async fn test_file_into_existing_entity_overwrites() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = fs_manager(dir.path(), "one").await?;
    tokio::fs::write(dir.path().join("one-files/a.txt"), "new content").await?;
    tokio::fs::write(dir.path().join("one-files/b.txt"), "old").await?;

    let archive = dir.path().join("a.tar");
    transfer(
        &Locator::parse("fs:a.txt", &manager),
        &Locator::File(archive.clone()),
        &Params::new(),
    )
    .await?;
    let report = transfer(
        &Locator::File(archive),
        &Locator::parse("fs:b.txt", &manager),
        &Params::new(),
    )
    .await?;

    let b = EntityId::new("fs", "b.txt")?;
    assert_eq!(report.destination, Some(b.clone()));
    assert_eq!(read_data(&manager, &b).await?, b"new content");
    Ok(())
}

#[tokio::test]
async fn test_entity_to_entity_snapshots_live_source() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = fs_manager(dir.path(), "src").await?;
    let dest = fs_manager(dir.path(), "dst").await?;
    tokio::fs::write(dir.path().join("src-files/config.yaml"), "replicas: 3\n").await?;

    let report = transfer(
        &Locator::parse("fs:config.yaml", &source),
        &Locator::parse("fs:config.yaml", &dest),
        &Params::new(),
    )
    .await?;
    assert_eq!(report.bytes_copied, 12);
    let produced = report.destination.expect("destination id");
    assert_eq!(read_data(&dest, &produced).await?, b"replicas: 3\n");

    let live = source.entity(&EntityId::new("fs", "config.yaml")?).await?;
    assert_eq!(live.list_snapshots().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_entity_to_entity_same_manager_allocates_new_name() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = fs_manager(dir.path(), "one").await?;
    tokio::fs::write(dir.path().join("one-files/report.txt"), "q3").await?;
    let live = manager.entity(&EntityId::new("fs", "report.txt")?).await?;
    let snap = live.snapshot(&Params::new()).await?;

    let report = transfer(
        &Locator::parse(&format!("fs:report.txt:{snap}"), &manager),
        &Locator::parse("fs:report-copy.txt", &manager),
        &Params::new(),
    )
    .await?;
    assert_eq!(
        report.destination.map(|id| id.to_string()).as_deref(),
        Some("fs:report-copy.txt")
    );
    // The snapshot id was given explicitly, so no extra snapshot is taken.
    assert_eq!(live.list_snapshots().await?, vec![snap]);
    Ok(())
}

#[tokio::test]
async fn test_ambiguous_configuration_is_rejected() -> Result<()> {
    let config = BackendConfig {
        conf_dir: Some("/etc/warden".into()),
        host: Some("http://pem:1323".into()),
        ..Default::default()
    };
    let err = configure(&config, &BackendFactories::new()).await.err().expect("error");
    assert!(matches!(err, warden_common::WardenError::Config(_)));
    Ok(())
}
