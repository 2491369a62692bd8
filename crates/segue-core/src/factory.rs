//! Factories - compiled, reusable representations of DSP programs.

use crate::definition::UnitDefinition;
use crate::error::Result;
use crate::unit::ProcessingUnit;
use dashmap::DashMap;
use std::sync::{Arc, Weak};

/// Owns compiled code for one definition; instances are created from it.
///
/// Factories are shared across windows via `Arc`; the factory dies when the
/// last reference (session or instance) is dropped.
pub trait UnitFactory: Send + Sync {
    fn name(&self) -> &str;

    fn inputs(&self) -> usize;

    fn outputs(&self) -> usize;

    /// Create one live unit. May allocate; runs on the control thread.
    fn instantiate(&self, sample_rate: f64, block_size: usize) -> Result<Box<dyn ProcessingUnit>>;
}

/// The compiler service, treated as a black box.
///
/// Implementations block the calling thread for the duration of the compile.
pub trait UnitCompiler: Send + Sync {
    fn compile(&self, definition: &UnitDefinition) -> Result<Arc<dyn UnitFactory>>;
}

/// Process-wide cache of local factories, keyed by definition content key.
///
/// Holds weak references only: the cache never keeps a factory alive, it just
/// lets windows that load the same program share one compile. Dead entries
/// are evicted lazily on the next lookup for their key.
#[derive(Default)]
pub struct FactoryCache {
    entries: DashMap<String, Weak<dyn UnitFactory>>,
}

impl FactoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the cached factory for `definition`, or compile one and cache it.
    pub fn get_or_compile(
        &self,
        definition: &UnitDefinition,
        compiler: &dyn UnitCompiler,
    ) -> Result<Arc<dyn UnitFactory>> {
        let key = definition.content_key();

        if let Some(entry) = self.entries.get(&key) {
            if let Some(factory) = entry.value().upgrade() {
                tracing::debug!(name = definition.name(), "factory cache hit");
                return Ok(factory);
            }
        }

        tracing::info!(name = definition.name(), "compiling definition");
        let factory = compiler.compile(definition)?;
        self.entries.insert(key, Arc::downgrade(&factory));
        Ok(factory)
    }

    /// Number of live (upgradeable) cached factories.
    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Drop entries whose factory is gone.
    pub fn sweep(&self) {
        self.entries.retain(|_, weak| weak.strong_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::UnitDefinition;
    use crate::units::BuiltinCompiler;

    #[test]
    fn test_cache_shares_factory() {
        let cache = FactoryCache::new();
        let compiler = BuiltinCompiler::new();
        let def = UnitDefinition::local("tone", "sine 440");

        let a = cache.get_or_compile(&def, &compiler).unwrap();
        let b = cache.get_or_compile(&def, &compiler).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.live_count(), 1);
    }

    #[test]
    fn test_cache_releases_dead_factories() {
        let cache = FactoryCache::new();
        let compiler = BuiltinCompiler::new();
        let def = UnitDefinition::local("tone", "sine 220");

        let factory = cache.get_or_compile(&def, &compiler).unwrap();
        drop(factory);
        cache.sweep();
        assert_eq!(cache.live_count(), 0);

        // Next lookup recompiles rather than resurrecting a dead entry.
        let again = cache.get_or_compile(&def, &compiler).unwrap();
        assert_eq!(again.name(), "sine");
    }

    #[test]
    fn test_compile_error_not_cached() {
        let cache = FactoryCache::new();
        let compiler = BuiltinCompiler::new();
        let bad = UnitDefinition::local("bad", "warble 3");

        assert!(cache.get_or_compile(&bad, &compiler).is_err());
        assert_eq!(cache.live_count(), 0);
    }
}
