//! Process-scoped build state.
//!
//! A [`BuildContext`] owns everything a build needs beyond the graphs: the
//! validated configuration, transform registry, resolver, cache, worker pool
//! and artifact namer. It is created once with [`BuildContext::init`], shared
//! by reference (`Arc`) between the bundler and the watch coordinator, and
//! closed with [`BuildContext::shutdown`].

use crate::bundler::cache::{CacheStats, IncrementalCache};
use crate::bundler::naming::{ArtifactNamer, PatternNamer};
use crate::bundler::pool::WorkerPool;
use crate::bundler::registry::Registry;
use crate::bundler::resolve::{PackageResolver, Resolver};
use crate::bundler::transform::TransformContext;
use crate::bundler::BuildOutcome;
use crate::config::BuildConfig;
use crate::error::ConfigurationError;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Callback invoked once per successful build.
pub type ArtifactListener = Box<dyn Fn(&BuildOutcome) + Send + Sync>;

type RegistryHook = Box<dyn FnOnce(&mut Registry) -> Result<(), ConfigurationError>>;

/// Shared state of a bundler process.
pub struct BuildContext {
    config: BuildConfig,
    registry: Registry,
    resolver: Resolver,
    cache: Arc<IncrementalCache>,
    pool: WorkerPool,
    namer: Arc<dyn ArtifactNamer>,
    listeners: Mutex<Vec<ArtifactListener>>,
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("root", &self.config.root)
            .field("mode", &self.config.mode)
            .field("rules", &self.registry.len())
            .field("parallelism", &self.pool.parallelism())
            .finish_non_exhaustive()
    }
}

impl BuildContext {
    /// Validate `config` and set up the default registry, resolver, cache
    /// and pool.
    pub fn init(config: BuildConfig) -> Result<Arc<Self>, ConfigurationError> {
        Self::builder(config).init()
    }

    /// Customise the context before initialisation.
    #[must_use]
    pub fn builder(config: BuildConfig) -> BuildContextBuilder {
        BuildContextBuilder {
            config,
            registry: None,
            registry_hooks: Vec::new(),
            packages: None,
            cache: None,
            namer: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<IncrementalCache> {
        &self.cache
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[must_use]
    pub fn namer(&self) -> &dyn ArtifactNamer {
        self.namer.as_ref()
    }

    #[must_use]
    pub fn transform_context(&self) -> TransformContext {
        TransformContext {
            mode: self.config.mode,
        }
    }

    /// Register a callback for successful builds (the dev-server hook).
    pub fn on_artifacts_ready<F>(&self, listener: F)
    where
        F: Fn(&BuildOutcome) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Invoke every listener with `outcome`.
    pub fn notify(&self, outcome: &BuildOutcome) {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(
            generation = outcome.generation,
            listeners = listeners.len(),
            "artifacts ready"
        );
        for listener in listeners.iter() {
            listener(outcome);
        }
    }

    /// Drop the listeners and report final cache counters.
    ///
    /// Persisted cache entries are already on disk; nothing is flushed here.
    pub fn shutdown(&self) -> CacheStats {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let stats = self.cache.stats();
        info!(
            memory_hits = stats.memory_hits,
            disk_hits = stats.disk_hits,
            computed = stats.computed,
            shared = stats.shared,
            disk_errors = stats.disk_errors,
            "build context shut down"
        );
        stats
    }
}

/// Options for [`BuildContext`] beyond the configuration file.
pub struct BuildContextBuilder {
    config: BuildConfig,
    registry: Option<Registry>,
    registry_hooks: Vec<RegistryHook>,
    packages: Option<Arc<dyn PackageResolver>>,
    cache: Option<Arc<IncrementalCache>>,
    namer: Option<Arc<dyn ArtifactNamer>>,
}

impl BuildContextBuilder {
    /// Use `registry` instead of the built-in chains.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Add rules on top of the registry (e.g. an external `.less` chain).
    pub fn configure_registry<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut Registry) -> Result<(), ConfigurationError> + 'static,
    {
        self.registry_hooks.push(Box::new(hook));
        self
    }

    /// Delegate bare-specifier lookup to `packages`.
    pub fn package_resolver(mut self, packages: Arc<dyn PackageResolver>) -> Self {
        self.packages = Some(packages);
        self
    }

    /// Share an existing cache (several contexts over the same store).
    pub fn cache(mut self, cache: Arc<IncrementalCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn namer(mut self, namer: Arc<dyn ArtifactNamer>) -> Self {
        self.namer = Some(namer);
        self
    }

    pub fn init(self) -> Result<Arc<BuildContext>, ConfigurationError> {
        let config = self.config;
        config.validate()?;

        let mut registry = match self.registry {
            Some(registry) => registry,
            None => Registry::with_defaults(&config)?,
        };
        for hook in self.registry_hooks {
            hook(&mut registry)?;
        }

        let mut resolver = Resolver::from_config(&config);
        if let Some(packages) = self.packages {
            resolver = resolver.with_package_resolver(packages);
        }

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(IncrementalCache::from_config(&config)));
        // Entries written under chains that no longer exist are unreachable.
        cache.retain_chains(&registry.chain_ids());

        let pool = WorkerPool::new(config.parallelism)?;
        info!(
            root = %config.root.display(),
            mode = %config.mode,
            entries = config.entries.len(),
            rules = registry.len(),
            parallelism = pool.parallelism(),
            persistent_cache = cache.disk_dir().is_some(),
            "build context ready"
        );

        Ok(Arc::new(BuildContext {
            registry,
            resolver,
            cache,
            pool,
            namer: self.namer.unwrap_or_else(|| Arc::new(PatternNamer)),
            listeners: Mutex::new(Vec::new()),
            config,
        }))
    }
}
