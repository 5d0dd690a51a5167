//! Reference-counted ownership of the loaded engine.

use super::{Engine, EngineLoader, ENGINE_API_VERSION};
use crate::error::LoadError;
use crate::types::ArchiveFormat;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a consumer of the engine (one per archive handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u64);

#[derive(Default)]
struct State {
    engine: Option<Arc<dyn Engine>>,
    users: HashMap<(ConsumerId, ArchiveFormat), usize>,
    loads: u64,
}

/// Owns the engine and counts who is using it.
///
/// The engine is loaded on the first acquisition and unloaded when the last
/// handle, across every consumer and format, is released. Loading, unloading
/// and handle creation all happen under one lock.
pub struct EngineRegistry {
    loader: Box<dyn EngineLoader>,
    state: Mutex<State>,
    next_consumer: AtomicU64,
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EngineRegistry")
            .field("loaded", &state.engine.is_some())
            .field("users", &state.users.len())
            .finish()
    }
}

impl EngineRegistry {
    pub fn new(loader: impl EngineLoader + 'static) -> Arc<Self> {
        Arc::new(Self {
            loader: Box::new(loader),
            state: Mutex::new(State::default()),
            next_consumer: AtomicU64::new(1),
        })
    }

    /// Registry over the built-in engine.
    pub fn builtin() -> Arc<Self> {
        Self::new(super::BuiltinLoader)
    }

    pub fn new_consumer(&self) -> ConsumerId {
        ConsumerId(self.next_consumer.fetch_add(1, Ordering::Relaxed))
    }

    /// Takes a reference on the engine for `format`, loading it if needed.
    pub fn acquire(
        self: &Arc<Self>,
        consumer: ConsumerId,
        format: ArchiveFormat,
    ) -> Result<DecoderHandle, LoadError> {
        let mut state = self.state.lock();

        let engine = match state.engine.clone() {
            Some(engine) => engine,
            None => {
                let engine = self.loader.load()?;
                if engine.api_version() != ENGINE_API_VERSION {
                    return Err(LoadError::IncompatibleVersion {
                        found: engine.api_version(),
                        expected: ENGINE_API_VERSION,
                    });
                }
                tracing::debug!(engine = engine.name(), "decoder engine loaded");
                state.loads += 1;
                state.engine = Some(Arc::clone(&engine));
                engine
            }
        };

        if !engine.formats().contains(&format) {
            if state.users.is_empty() {
                state.engine = None;
            }
            return Err(LoadError::MissingEntryPoint(format));
        }

        *state.users.entry((consumer, format)).or_insert(0) += 1;

        Ok(DecoderHandle {
            registry: Arc::clone(self),
            engine,
            consumer,
            format,
        })
    }

    /// Gives a handle back. Equivalent to dropping it.
    pub fn release(&self, handle: DecoderHandle) {
        drop(handle);
    }

    fn release_ref(&self, consumer: ConsumerId, format: ArchiveFormat) {
        let mut state = self.state.lock();
        if let Some(count) = state.users.get_mut(&(consumer, format)) {
            *count -= 1;
            if *count == 0 {
                state.users.remove(&(consumer, format));
            }
        }
        if state.users.is_empty() && state.engine.take().is_some() {
            tracing::debug!("decoder engine unloaded");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().engine.is_some()
    }

    /// Outstanding references across every consumer and format.
    pub fn active_references(&self) -> usize {
        self.state.lock().users.values().sum()
    }

    /// How many times the engine has been loaded.
    pub fn load_count(&self) -> u64 {
        self.state.lock().loads
    }
}

/// A counted reference to the engine for one (consumer, format) pair.
pub struct DecoderHandle {
    registry: Arc<EngineRegistry>,
    engine: Arc<dyn Engine>,
    consumer: ConsumerId,
    format: ArchiveFormat,
}

impl fmt::Debug for DecoderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderHandle")
            .field("consumer", &self.consumer)
            .field("format", &self.format)
            .finish()
    }
}

impl DecoderHandle {
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.registry.release_ref(self.consumer, self.format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Decoder, OpenError};
    use std::path::Path;

    struct FakeEngine {
        version: u32,
    }

    impl Engine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }

        fn api_version(&self) -> u32 {
            self.version
        }

        fn formats(&self) -> &[ArchiveFormat] {
            &[ArchiveFormat::Zip]
        }

        fn open(
            &self,
            _format: ArchiveFormat,
            _path: &Path,
            _switches: &[String],
            _password: &mut dyn FnMut() -> Option<String>,
        ) -> Result<Box<dyn Decoder>, OpenError> {
            Err(OpenError::Corrupt("fake".into()))
        }
    }

    struct FakeLoader(Option<u32>);

    impl EngineLoader for FakeLoader {
        fn load(&self) -> Result<Arc<dyn Engine>, LoadError> {
            match self.0 {
                Some(version) => Ok(Arc::new(FakeEngine { version })),
                None => Err(LoadError::Missing("fake.so".into())),
            }
        }
    }

    #[test]
    fn test_loads_on_first_acquire_and_unloads_on_last_release() {
        let registry = EngineRegistry::new(FakeLoader(Some(ENGINE_API_VERSION)));
        let a = registry.new_consumer();
        let b = registry.new_consumer();
        assert!(!registry.is_loaded());

        let h1 = registry.acquire(a, ArchiveFormat::Zip).unwrap();
        let h2 = registry.acquire(b, ArchiveFormat::Zip).unwrap();
        let h3 = registry.acquire(a, ArchiveFormat::Zip).unwrap();
        assert!(registry.is_loaded());
        assert_eq!(registry.active_references(), 3);

        registry.release(h1);
        drop(h2);
        assert!(registry.is_loaded());
        drop(h3);
        assert!(!registry.is_loaded());
        assert_eq!(registry.load_count(), 1);

        // A later consumer loads it again.
        let _h = registry.acquire(b, ArchiveFormat::Zip).unwrap();
        assert_eq!(registry.load_count(), 2);
    }

    #[test]
    fn test_missing_module() {
        let registry = EngineRegistry::new(FakeLoader(None));
        let consumer = registry.new_consumer();
        let err = registry.acquire(consumer, ArchiveFormat::Zip).unwrap_err();
        assert!(matches!(err, LoadError::Missing(_)));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn test_incompatible_version() {
        let registry = EngineRegistry::new(FakeLoader(Some(ENGINE_API_VERSION + 1)));
        let consumer = registry.new_consumer();
        let err = registry.acquire(consumer, ArchiveFormat::Zip).unwrap_err();
        assert!(matches!(err, LoadError::IncompatibleVersion { .. }));
        assert!(!registry.is_loaded());
    }

    #[test]
    fn test_missing_entry_point() {
        let registry = EngineRegistry::new(FakeLoader(Some(ENGINE_API_VERSION)));
        let consumer = registry.new_consumer();
        let err = registry
            .acquire(consumer, ArchiveFormat::SevenZip)
            .unwrap_err();
        assert_eq!(err, LoadError::MissingEntryPoint(ArchiveFormat::SevenZip));
        assert!(!registry.is_loaded());
        assert_eq!(registry.active_references(), 0);
    }
}
