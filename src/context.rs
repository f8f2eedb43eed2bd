use crate::cache::RecordCache;
use crate::config::ResolverConfig;
use crate::delegation::DelegationMap;
use crate::dnssec::TrustAnchorStore;
use crate::error::Result;
use crate::hooks::PropertyRegistry;
use crate::random::RandomPool;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Shared resolver state: everything that outlives a single request.
///
/// Each resource the original kept as a process global lives here by name
/// and is handed to the core by reference. Requests share the delegation
/// map, the cache and the random pool; all per-request state stays in the
/// driver.
pub struct Context {
    pub config: ResolverConfig,
    pub delegations: DelegationMap,
    pub cache: RecordCache,
    pub trust_anchors: TrustAnchorStore,
    pub random: RandomPool,
    pub hooks: PropertyRegistry,
    verbose: AtomicBool,
}

impl Context {
    pub fn new(config: ResolverConfig) -> Self {
        let trust_anchors = TrustAnchorStore::new();
        Context {
            config,
            delegations: DelegationMap::new(),
            cache: RecordCache::new_memory(),
            trust_anchors,
            random: RandomPool::new(),
            hooks: PropertyRegistry::new(),
            verbose: AtomicBool::new(false),
        }
    }

    /// Build a context and load the trust anchor file the config names.
    pub fn from_config(config: ResolverConfig) -> Result<Self> {
        let ctx = Context::new(config);
        if let Some(path) = ctx.config.trust_anchor_file.clone() {
            let count = ctx.trust_anchors.reload_from_file(&path)?;
            info!("loaded {} trust anchors from {}", count, path.display());
        }
        Ok(ctx)
    }

    /// Re-read the trust anchor file; the host calls this from its
    /// SIGHUP-equivalent handler. The swap is atomic: a failed parse leaves
    /// the old anchors in place.
    pub fn reload_trust_anchors(&self) -> Result<usize> {
        match &self.config.trust_anchor_file {
            Some(path) => self.trust_anchors.reload_from_file(path),
            None => Ok(0),
        }
    }

    /// Write the cache to the configured snapshot path.
    pub fn persist_cache(&self) -> Result<usize> {
        self.cache.save_to(&self.config.cache_path)
    }

    /// Restore the cache from the configured snapshot path, if one exists.
    pub fn load_cache(&self) -> Result<usize> {
        if !self.config.cache_path.exists() {
            return Ok(0);
        }
        self.cache.load_from(&self.config.cache_path)
    }

    pub fn verbose_status(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn verbose_set(&self, status: bool) -> bool {
        self.verbose.store(status, Ordering::Relaxed);
        status
    }
}
