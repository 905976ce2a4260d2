pub mod archive;
pub mod config;
pub mod controller;
pub mod fs;
pub mod localsnap;
pub mod readiness;
pub mod registry;
pub mod transfer;

pub use archive::{read_archive, write_archive, ArchivedEntity};
pub use config::{BackendConfig, BackendSource, LocalConfig};
pub use fs::{FsFactory, FsTypeManager, FS_TYPE};
pub use localsnap::LocalSnapshotRepo;
pub use readiness::{ProbeOutcome, ReadinessChecker, ReadinessConfig, ReadinessProbe};
pub use registry::{
    configure, configure_destination, BackendFactories, EntityRegistry, RemoteManagerFactory,
    TypeManagerFactory,
};
pub use transfer::{transfer, Locator, TransferReport};
pub use warden_common as common;
