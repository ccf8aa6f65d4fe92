use std::sync::{Arc, RwLock};

use crate::callback::CliqueIdCallback;
use crate::config::CollectivesConfig;
use crate::error::{CliqueError, Result};
use crate::id::{CliqueId, CliqueIdGenerator, RandomIdGenerator};

/// What a collectives backend must answer before a clique can be formed.
pub trait CollectivesBackend: Send + Sync {
    /// True if non-local groups share one process-wide callback.
    fn is_global_config(&self) -> bool;

    /// Resolve the callback for one bootstrap request.
    ///
    /// An explicit `candidate` always wins. Otherwise the process-wide
    /// default is used for non-local requests under global config; every
    /// other combination is a `CliqueError::Config`.
    fn clique_id_callback(
        &self,
        candidate: Option<Arc<dyn CliqueIdCallback>>,
        is_local: bool,
    ) -> Result<Arc<dyn CliqueIdCallback>>;

    /// Produce a fresh id for a clique this process originates.
    fn create_unique_clique_id(&self) -> Result<CliqueId>;
}

/// Default `CollectivesBackend`: a global flag, an optional process-wide
/// callback and a pluggable id generator.
pub struct ConfigResolver {
    global: bool,
    default_callback: Option<Arc<dyn CliqueIdCallback>>,
    generator: Arc<dyn CliqueIdGenerator>,
}

impl ConfigResolver {
    pub fn new(global: bool) -> Self {
        Self {
            global,
            default_callback: None,
            generator: Arc::new(RandomIdGenerator),
        }
    }

    pub fn from_config(config: &CollectivesConfig) -> Self {
        Self::new(config.global)
    }

    /// Install the process-wide callback used for non-local groups.
    pub fn with_default_callback(mut self, callback: Arc<dyn CliqueIdCallback>) -> Self {
        self.default_callback = Some(callback);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn CliqueIdGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn has_default_callback(&self) -> bool {
        self.default_callback.is_some()
    }
}

impl CollectivesBackend for ConfigResolver {
    fn is_global_config(&self) -> bool {
        self.global
    }

    fn clique_id_callback(
        &self,
        candidate: Option<Arc<dyn CliqueIdCallback>>,
        is_local: bool,
    ) -> Result<Arc<dyn CliqueIdCallback>> {
        if let Some(candidate) = candidate {
            return Ok(candidate);
        }

        if is_local {
            return Err(CliqueError::config(
                "a local clique requires an explicit clique id callback",
            ));
        }

        if !self.global {
            return Err(CliqueError::config(
                "global config is disabled; non-local devices taking part in a collective \
                 need a clique id callback supplied by the client",
            ));
        }

        self.default_callback.clone().ok_or_else(|| {
            CliqueError::config("global config is enabled but no default callback is installed")
        })
    }

    fn create_unique_clique_id(&self) -> Result<CliqueId> {
        self.generator.generate()
    }
}

static GLOBAL_RESOLVER: RwLock<Option<Arc<ConfigResolver>>> = RwLock::new(None);

/// Install the process-wide resolver. Call once at startup.
///
/// Fails if a resolver is already installed; tear the old one down first.
pub fn install_global_resolver(resolver: ConfigResolver) -> Result<Arc<ConfigResolver>> {
    let mut slot = GLOBAL_RESOLVER
        .write()
        .map_err(|_| CliqueError::LockPoisoned("global resolver"))?;
    if slot.is_some() {
        return Err(CliqueError::config("a global resolver is already installed"));
    }
    let resolver = Arc::new(resolver);
    *slot = Some(Arc::clone(&resolver));
    tracing::info!(
        global = resolver.is_global_config(),
        default_callback = resolver.has_default_callback(),
        "installed global clique resolver"
    );
    Ok(resolver)
}

/// The process-wide resolver installed at startup.
pub fn global_resolver() -> Result<Arc<ConfigResolver>> {
    GLOBAL_RESOLVER
        .read()
        .map_err(|_| CliqueError::LockPoisoned("global resolver"))?
        .clone()
        .ok_or_else(|| CliqueError::config("no global resolver installed"))
}

/// Remove the process-wide resolver, returning it if one was installed.
pub fn teardown_global_resolver() -> Result<Option<Arc<ConfigResolver>>> {
    let mut slot = GLOBAL_RESOLVER
        .write()
        .map_err(|_| CliqueError::LockPoisoned("global resolver"))?;
    Ok(slot.take())
}
