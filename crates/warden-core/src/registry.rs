//! Manager registry: type name to backend, built once from configuration.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};
use warden_common::{
    EntityId, ProtectedEntity, ProtectedEntityManager, ProtectedEntityTypeManager, Result,
    S3Config, WardenError,
};

use crate::config::{BackendConfig, BackendSource, LocalConfig};

/// Builds a type manager from its section of the local configuration.
#[async_trait]
pub trait TypeManagerFactory: Send + Sync {
    fn type_name(&self) -> &str;

    async fn create(
        &self,
        config: &serde_json::Value,
        s3: Option<&S3Config>,
    ) -> Result<Arc<dyn ProtectedEntityTypeManager>>;
}

/// Connects to a backend family that is not driven by a local configuration
/// directory (remote host, object-store repository, content-addressable repository).
#[async_trait]
pub trait RemoteManagerFactory: Send + Sync {
    async fn connect(&self, source: &BackendSource) -> Result<Arc<dyn ProtectedEntityManager>>;
}

/// Factories available to [`configure`].
#[derive(Default, Clone)]
pub struct BackendFactories {
    types: HashMap<String, Arc<dyn TypeManagerFactory>>,
    host: Option<Arc<dyn RemoteManagerFactory>>,
    s3_repo: Option<Arc<dyn RemoteManagerFactory>>,
    kopia_repo: Option<Arc<dyn RemoteManagerFactory>>,
}

impl BackendFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, factory: Arc<dyn TypeManagerFactory>) -> Self {
        self.types.insert(factory.type_name().to_string(), factory);
        self
    }

    pub fn with_host(mut self, factory: Arc<dyn RemoteManagerFactory>) -> Self {
        self.host = Some(factory);
        self
    }

    pub fn with_s3_repo(mut self, factory: Arc<dyn RemoteManagerFactory>) -> Self {
        self.s3_repo = Some(factory);
        self
    }

    pub fn with_kopia_repo(mut self, factory: Arc<dyn RemoteManagerFactory>) -> Self {
        self.kopia_repo = Some(factory);
        self
    }
}

/// Read-only after construction; share it behind an `Arc`.
#[derive(Default)]
pub struct EntityRegistry {
    managers: BTreeMap<String, Arc<dyn ProtectedEntityTypeManager>>,
    s3: Option<S3Config>,
}

impl EntityRegistry {
    pub fn new(s3: Option<S3Config>) -> Self {
        Self {
            managers: BTreeMap::new(),
            s3,
        }
    }

    /// Adds a type manager. A second manager for the same type is a `Config` error.
    pub fn register(&mut self, manager: Arc<dyn ProtectedEntityTypeManager>) -> Result<()> {
        let type_name = manager.type_name().to_string();
        if self.managers.contains_key(&type_name) {
            return Err(WardenError::Config(format!(
                "type manager {type_name} registered twice"
            )));
        }
        self.managers.insert(type_name, manager);
        Ok(())
    }

    pub fn s3_config(&self) -> Option<&S3Config> {
        self.s3.as_ref()
    }

    pub fn type_names(&self) -> Vec<String> {
        self.managers.keys().cloned().collect()
    }

    pub fn lookup(&self, type_name: &str) -> Result<Arc<dyn ProtectedEntityTypeManager>> {
        self.type_manager(type_name).ok_or_else(|| {
            WardenError::NotFound(format!("no type manager registered for {type_name}"))
        })
    }

    pub async fn resolve(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>> {
        self.lookup(id.type_name())?.entity(id).await
    }
}

impl ProtectedEntityManager for EntityRegistry {
    fn type_managers(&self) -> Vec<Arc<dyn ProtectedEntityTypeManager>> {
        self.managers.values().cloned().collect()
    }

    fn type_manager(&self, type_name: &str) -> Option<Arc<dyn ProtectedEntityTypeManager>> {
        self.managers.get(type_name).cloned()
    }
}

/// Builds the manager selected by `config`.
#[instrument(skip(factories))]
pub async fn configure(
    config: &BackendConfig,
    factories: &BackendFactories,
) -> Result<Arc<dyn ProtectedEntityManager>> {
    let source = config
        .select()?
        .ok_or_else(|| WardenError::Config("no manager configuration".to_string()))?;
    connect(&source, factories).await
}

/// Like [`configure`], but an empty destination config reuses `source`.
pub async fn configure_destination(
    config: &BackendConfig,
    factories: &BackendFactories,
    source: &Arc<dyn ProtectedEntityManager>,
) -> Result<Arc<dyn ProtectedEntityManager>> {
    match config.select()? {
        Some(dest) => connect(&dest, factories).await,
        None => Ok(source.clone()),
    }
}

async fn connect(
    source: &BackendSource,
    factories: &BackendFactories,
) -> Result<Arc<dyn ProtectedEntityManager>> {
    let remote = match source {
        BackendSource::ConfDir(dir) => {
            let local = LocalConfig::load(dir).await?;
            return Ok(Arc::new(build_local(&local, factories).await?));
        }
        BackendSource::Host { .. } => &factories.host,
        BackendSource::S3Repo(_) => &factories.s3_repo,
        BackendSource::KopiaRepo(_) => &factories.kopia_repo,
    };
    match remote {
        Some(factory) => factory.connect(source).await,
        None => Err(WardenError::Config(format!(
            "backend family {} is not available in this build",
            source.family()
        ))),
    }
}

/// Instantiates every configured type that has a registered factory.
pub async fn build_local(
    local: &LocalConfig,
    factories: &BackendFactories,
) -> Result<EntityRegistry> {
    let mut registry = EntityRegistry::new(local.s3.clone());
    for (type_name, value) in &local.types {
        let Some(factory) = factories.types.get(type_name) else {
            warn!(type_name, "No factory for configured type, skipping");
            continue;
        };
        let manager = factory.create(value, local.s3.as_ref()).await?;
        registry.register(manager)?;
        info!(type_name, "Registered type manager");
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::{CopyCreateOptions, Params};

    struct NamedManager(String);

    #[async_trait]
    impl ProtectedEntityTypeManager for NamedManager {
        fn type_name(&self) -> &str {
            &self.0
        }
        async fn entities(&self) -> Result<Vec<EntityId>> {
            Ok(vec![EntityId::new(&self.0, "only")?])
        }
        async fn entity(&self, id: &EntityId) -> Result<Arc<dyn ProtectedEntity>> {
            Err(WardenError::NotFound(id.to_string()))
        }
        async fn copy(
            &self,
            source: &dyn ProtectedEntity,
            _params: &Params,
            _options: CopyCreateOptions,
        ) -> Result<Arc<dyn ProtectedEntity>> {
            Err(WardenError::Unsupported(source.id().to_string()))
        }
        async fn delete(&self, _id: &EntityId) -> Result<()> {
            Ok(())
        }
    }

    struct NamedFactory(&'static str);

    #[async_trait]
    impl TypeManagerFactory for NamedFactory {
        fn type_name(&self) -> &str {
            self.0
        }
        async fn create(
            &self,
            _config: &serde_json::Value,
            _s3: Option<&S3Config>,
        ) -> Result<Arc<dyn ProtectedEntityTypeManager>> {
            Ok(Arc::new(NamedManager(self.0.to_string())))
        }
    }

    #[test]
    fn test_duplicate_type_is_config_error() {
        let mut registry = EntityRegistry::default();
        registry
            .register(Arc::new(NamedManager("psql".into())))
            .unwrap();
        let err = registry
            .register(Arc::new(NamedManager("psql".into())))
            .unwrap_err();
        assert!(matches!(err, WardenError::Config(_)));
    }

    #[tokio::test]
    async fn test_lookup_and_resolve_unknown_type() {
        let mut registry = EntityRegistry::default();
        registry.register(Arc::new(NamedManager("fs".into()))).unwrap();
        assert_eq!(registry.type_names(), vec!["fs".to_string()]);
        assert!(registry.lookup("psql").err().unwrap().is_not_found());
        let err = registry
            .resolve(&EntityId::new("psql", "abc").unwrap())
            .await
            .err()
            .unwrap();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_build_local_skips_unknown_types() {
        let mut local = LocalConfig::default();
        local.types.insert("fs".into(), serde_json::json!({}));
        local.types.insert("ebs".into(), serde_json::json!({}));
        let factories = BackendFactories::new().with_type(Arc::new(NamedFactory("fs")));
        let registry = build_local(&local, &factories).await.unwrap();
        assert_eq!(registry.type_names(), vec!["fs".to_string()]);
    }

    #[tokio::test]
    async fn test_configure_requires_a_source() {
        let factories = BackendFactories::new();
        let err = configure(&BackendConfig::default(), &factories)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WardenError::Config(msg) if msg.contains("no manager")));

        let remote = BackendConfig {
            host: Some("http://pem".into()),
            ..Default::default()
        };
        let err = configure(&remote, &factories).await.err().unwrap();
        assert!(matches!(err, WardenError::Config(msg) if msg.contains("host")));
    }

    #[tokio::test]
    async fn test_destination_defaults_to_source() {
        let source: Arc<dyn ProtectedEntityManager> = Arc::new(EntityRegistry::default());
        let dest = configure_destination(&BackendConfig::default(), &BackendFactories::new(), &source)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&source, &dest));
    }
}
