//! Settings-driven engine construction.
//!
//! Provider crates register an [`EngineFactory`] under each API type
//! they serve; callers then build engines from [`StepSettings`] without
//! knowing which providers were compiled in.
//!
//! ```rust,ignore
//! use geppetto::engine::{EngineRegistry, StepSettings};
//!
//! geppetto_openai::register_global();
//! geppetto_anthropic::register_global();
//!
//! let settings: StepSettings = load_settings();
//! let engine = EngineRegistry::global().build(&settings)?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::debug;

use super::{DynEngine, StepSettings};
use crate::error::GeppettoError;

/// Builds engines for one API type.
pub trait EngineFactory: Send + Sync {
    /// The API type name this factory serves (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Builds an engine from fully-resolved settings.
    ///
    /// # Errors
    ///
    /// Returns [`GeppettoError::InvalidRequest`] when credentials or the
    /// model name are missing.
    fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError>;
}

/// Factories by lowercase API type name.
///
/// Registration takes the write lock, lookups the read lock.
pub struct EngineRegistry {
    factories: RwLock<HashMap<String, Arc<dyn EngineFactory>>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry provider crates register into.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(EngineRegistry::new)
    }

    /// Registers a factory, replacing any previous one with that name.
    pub fn register(&self, factory: Box<dyn EngineFactory>) -> &Self {
        self.register_shared(Arc::from(factory))
    }

    /// Registers a shared factory.
    pub fn register_shared(&self, factory: Arc<dyn EngineFactory>) -> &Self {
        let name = factory.name().to_lowercase();
        debug!(provider = %name, "registering engine factory");
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, factory);
        self
    }

    /// Removes a factory; `true` if one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&name.to_lowercase())
            .is_some()
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }

    /// Registered names, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Builds the engine for `settings.chat.api_type` (default `openai`),
    /// wrapped in the cache selected by `settings.chat.cache_type`.
    ///
    /// # Errors
    ///
    /// [`GeppettoError::InvalidRequest`] for an unregistered API type,
    /// invalid settings, or whatever the factory reports.
    pub fn build(&self, settings: &StepSettings) -> Result<Box<dyn DynEngine>, GeppettoError> {
        let provider = settings.api_type();
        let factory = {
            let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
            factories.get(provider.as_str()).cloned().ok_or_else(|| {
                let mut available: Vec<_> = factories.keys().cloned().collect();
                available.sort();
                GeppettoError::InvalidRequest(format!(
                    "unsupported provider {provider}. Supported providers: {}",
                    available.join(", ")
                ))
            })?
        };
        settings.validate().map_err(|e| {
            GeppettoError::InvalidRequest(format!("invalid settings for provider {provider}: {e}"))
        })?;
        let engine = factory.build(settings)?;
        crate::cache::wrap_engine(engine, settings)
    }
}
