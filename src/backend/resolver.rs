use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Backend, BackendError, ContainerExecBackend, LaunchSettings, LocalPtyBackend};
use crate::environment::{Environment, EnvironmentKind};

/// Builds a backend for an environment descriptor.
pub trait BackendFactory: Send + Sync {
    fn build(&self, environment: &Environment) -> Result<Arc<dyn Backend>, BackendError>;
}

/// Host environments share one local backend; docker environments get a
/// container-exec backend built from their own settings.
pub struct DefaultBackendFactory {
    settings: LaunchSettings,
    host: Arc<LocalPtyBackend>,
}

impl DefaultBackendFactory {
    pub fn new(settings: LaunchSettings) -> Self {
        Self {
            host: Arc::new(LocalPtyBackend::new(settings.clone())),
            settings,
        }
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn build(&self, environment: &Environment) -> Result<Arc<dyn Backend>, BackendError> {
        match environment.kind {
            EnvironmentKind::Host => Ok(self.host.clone()),
            EnvironmentKind::Docker => Ok(Arc::new(ContainerExecBackend::from_environment(
                environment,
                self.settings.clone(),
            )?)),
            EnvironmentKind::Ssh => Err(BackendError::Unsupported(EnvironmentKind::Ssh)),
        }
    }
}

/// Maps environments to backends, caching one backend per environment id.
///
/// The cache entry must be invalidated whenever an environment's settings
/// change so the next lookup reflects them.
#[derive(Clone)]
pub struct BackendResolver {
    factory: Arc<dyn BackendFactory>,
    cache: Arc<RwLock<HashMap<String, Arc<dyn Backend>>>>,
}

impl BackendResolver {
    pub fn new(factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            factory,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_settings(settings: LaunchSettings) -> Self {
        Self::new(Arc::new(DefaultBackendFactory::new(settings)))
    }

    pub fn resolve(&self, environment: &Environment) -> Result<Arc<dyn Backend>, BackendError> {
        if let Some(backend) = self.cache.read().get(&environment.id) {
            return Ok(backend.clone());
        }

        let mut cache = self.cache.write();
        // Another caller may have built it while we waited for the lock.
        if let Some(backend) = cache.get(&environment.id) {
            return Ok(backend.clone());
        }
        let backend = self.factory.build(environment)?;
        tracing::debug!(environment = %environment.id, kind = %environment.kind, "backend resolved");
        cache.insert(environment.id.clone(), backend.clone());
        Ok(backend)
    }

    /// Drop the cached backend for `environment_id`. Returns whether an
    /// entry was present.
    pub fn invalidate(&self, environment_id: &str) -> bool {
        let removed = self.cache.write().remove(environment_id).is_some();
        if removed {
            tracing::info!(environment = %environment_id, "backend cache invalidated");
        }
        removed
    }

    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::backend::{ProcessHandle, SpawnRequest};

    struct NullBackend;

    impl Backend for NullBackend {
        fn kind(&self) -> EnvironmentKind {
            EnvironmentKind::Host
        }
        fn spawn(&self, _request: &SpawnRequest) -> Result<ProcessHandle, BackendError> {
            Err(BackendError::ProcessGone)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
    }

    impl BackendFactory for CountingFactory {
        fn build(&self, _environment: &Environment) -> Result<Arc<dyn Backend>, BackendError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullBackend))
        }
    }

    #[test]
    fn resolve_caches_per_environment() {
        let factory = Arc::new(CountingFactory::default());
        let resolver = BackendResolver::new(factory.clone());
        let a = Environment::host("a");
        let b = Environment::host("b");

        resolver.resolve(&a).unwrap();
        resolver.resolve(&a).unwrap();
        resolver.resolve(&b).unwrap();

        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.cached(), 2);
    }

    #[test]
    fn invalidate_forces_rebuild() {
        let factory = Arc::new(CountingFactory::default());
        let resolver = BackendResolver::new(factory.clone());
        let env = Environment::host("a");

        resolver.resolve(&env).unwrap();
        assert!(resolver.invalidate("a"));
        assert!(!resolver.invalidate("a"));
        resolver.resolve(&env).unwrap();

        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn default_factory_selects_by_kind() {
        let resolver = BackendResolver::with_settings(LaunchSettings::default());
        assert_eq!(
            resolver.resolve(&Environment::host("local")).unwrap().kind(),
            EnvironmentKind::Host
        );
        assert_eq!(
            resolver
                .resolve(&Environment::docker("box", "/auth"))
                .unwrap()
                .kind(),
            EnvironmentKind::Docker
        );
    }

    #[test]
    fn ssh_is_unsupported() {
        let resolver = BackendResolver::with_settings(LaunchSettings::default());
        let mut env = Environment::host("remote");
        env.kind = EnvironmentKind::Ssh;
        let err = resolver.resolve(&env).err().unwrap();
        assert!(matches!(err, BackendError::Unsupported(EnvironmentKind::Ssh)));
        assert_eq!(resolver.cached(), 0);
    }

    #[test]
    fn misconfigured_docker_is_not_cached() {
        let resolver = BackendResolver::with_settings(LaunchSettings::default());
        let mut env = Environment::docker("box", "/auth");
        env.auth_dir = None;
        assert!(resolver.resolve(&env).is_err());
        assert_eq!(resolver.cached(), 0);
    }
}
