//! Engine registry to ensure each model is loaded once and shared across requests.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use crate::backend::BackendDescriptor;
use crate::catalog::ModelIdentity;
use crate::engine::{EngineFactory, EngineState, InferenceEngine};
use crate::error::{Error, Result};

type EngineCell = Arc<OnceCell<Arc<dyn InferenceEngine>>>;

#[derive(Clone)]
pub struct EngineRegistry {
    backend: BackendDescriptor,
    factory: Arc<dyn EngineFactory>,
    engines: Arc<RwLock<HashMap<ModelIdentity, EngineCell>>>,
}

impl EngineRegistry {
    pub fn new(backend: BackendDescriptor, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            backend,
            factory,
            engines: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &BackendDescriptor {
        &self.backend
    }

    /// Return the ready engine for `identity`, building it on first use.
    ///
    /// Concurrent first callers share one initialization. Callers for other
    /// identities are never blocked by it. A failed initialization is not
    /// cached; the next caller tries again.
    pub async fn get_or_create(&self, identity: &ModelIdentity) -> Result<Arc<dyn InferenceEngine>> {
        if !identity.path().is_file() {
            return Err(Error::ModelNotFound(format!(
                "model file {} does not exist",
                identity
            )));
        }

        let existing = self.engines.read().await.get(identity).cloned();
        let cell = match existing {
            Some(cell) => {
                if let Some(engine) = cell.get() {
                    return Ok(engine.clone());
                }
                cell
            }
            None => {
                let mut guard = self.engines.write().await;
                guard
                    .entry(identity.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        let engine = cell
            .get_or_try_init(|| async {
                info!("Creating engine for {}", identity);
                let engine = self.factory.create(identity, &self.backend)?;
                engine.initialize(identity.path()).await?;
                Ok::<_, Error>(engine)
            })
            .await?;

        Ok(engine.clone())
    }

    /// Ready engine for `identity`, without creating one.
    pub async fn get(&self, identity: &ModelIdentity) -> Option<Arc<dyn InferenceEngine>> {
        let guard = self.engines.read().await;
        guard.get(identity).and_then(|cell| cell.get().cloned())
    }

    /// Identities with a ready engine.
    pub async fn loaded(&self) -> Vec<ModelIdentity> {
        let guard = self.engines.read().await;
        let mut identities: Vec<ModelIdentity> = guard
            .iter()
            .filter(|(_, cell)| {
                cell.get()
                    .map(|engine| engine.state() == EngineState::Ready)
                    .unwrap_or(false)
            })
            .map(|(identity, _)| identity.clone())
            .collect();
        identities.sort();
        identities
    }

    /// Dispose every engine. Used at shutdown.
    pub async fn dispose_all(&self) {
        let cells: Vec<(ModelIdentity, EngineCell)> = {
            let mut guard = self.engines.write().await;
            guard.drain().collect()
        };
        for (identity, cell) in cells {
            if let Some(engine) = cell.get() {
                engine.dispose().await;
                info!("Released engine for {}", identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::engine::testing::ScriptedEngine;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingFactory {
        created: AtomicUsize,
        engines: Mutex<Vec<Arc<ScriptedEngine>>>,
        init_delay: Duration,
    }

    impl CountingFactory {
        fn new(init_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                engines: Mutex::new(Vec::new()),
                init_delay,
            })
        }

        fn total_inits(&self) -> usize {
            self.engines
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.init_count())
                .sum()
        }
    }

    impl EngineFactory for CountingFactory {
        fn create(
            &self,
            identity: &ModelIdentity,
            backend: &BackendDescriptor,
        ) -> Result<Arc<dyn InferenceEngine>> {
            backend.ensure_loaded()?;
            self.created.fetch_add(1, Ordering::SeqCst);
            // Only models named "slow*" take time to initialize.
            let slow = identity
                .path()
                .file_name()
                .map(|name| name.to_string_lossy().starts_with("slow"))
                .unwrap_or(false);
            let engine = Arc::new(ScriptedEngine {
                init_delay: if slow { self.init_delay } else { Duration::ZERO },
                ..ScriptedEngine::generating(&["ok"])
            });
            self.engines.lock().unwrap().push(engine.clone());
            Ok(engine)
        }
    }

    fn backend(loaded: bool) -> BackendDescriptor {
        BackendDescriptor {
            kind: BackendKind::Cpu,
            library_path: PathBuf::from("builtin"),
            loaded,
            fell_back: false,
            failure: None,
        }
    }

    fn model_file(dir: &Path, name: &str) -> ModelIdentity {
        let path = dir.join(name);
        std::fs::write(&path, b"GGUF").unwrap();
        ModelIdentity::for_file(&path)
    }

    #[tokio::test]
    async fn repeated_calls_return_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let identity = model_file(dir.path(), "a.gguf");
        let factory = CountingFactory::new(Duration::ZERO);
        let registry = EngineRegistry::new(backend(true), factory.clone());

        let first = registry.get_or_create(&identity).await.unwrap();
        let second = registry.get_or_create(&identity).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded().await, vec![identity]);
    }

    #[tokio::test]
    async fn cached_lookup_only_needs_the_read_lock() {
        let dir = tempfile::tempdir().unwrap();
        let identity = model_file(dir.path(), "a.gguf");
        let registry = EngineRegistry::new(backend(true), CountingFactory::new(Duration::ZERO));
        let first = registry.get_or_create(&identity).await.unwrap();

        let _reader = registry.engines.read().await;
        let again = tokio::time::timeout(Duration::from_secs(1), registry.get_or_create(&identity))
            .await
            .expect("cached lookup waited for the write lock")
            .unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_callers_share_one_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let identity = model_file(dir.path(), "slow-a.gguf");
        let factory = CountingFactory::new(Duration::from_millis(50));
        let registry = EngineRegistry::new(backend(true), factory.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let identity = identity.clone();
                tokio::spawn(async move { registry.get_or_create(&identity).await.unwrap() })
            })
            .collect();

        let mut engines = Vec::new();
        for handle in handles {
            engines.push(handle.await.unwrap());
        }

        assert_eq!(factory.total_inits(), 1);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert!(engines.iter().all(|e| e.state() == EngineState::Ready));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_models_do_not_wait_on_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let slow = model_file(dir.path(), "slow.gguf");
        let fast = model_file(dir.path(), "fast.gguf");
        let registry =
            EngineRegistry::new(backend(true), CountingFactory::new(Duration::from_secs(2)));

        let background = registry.clone();
        let pending = tokio::spawn(async move { background.get_or_create(&slow).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast_engine = tokio::time::timeout(Duration::from_secs(1), registry.get_or_create(&fast))
            .await
            .expect("fast model blocked behind slow model")
            .unwrap();
        assert_eq!(fast_engine.state(), EngineState::Ready);
        assert!(!pending.is_finished());
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_is_not_found_and_not_cached() {
        let factory = CountingFactory::new(Duration::ZERO);
        let registry = EngineRegistry::new(backend(true), factory.clone());
        let identity = ModelIdentity::new("/nonexistent/model.gguf");

        let err = registry.get_or_create(&identity).await.err().unwrap();
        assert!(matches!(err, Error::ModelNotFound(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
        assert!(registry.get(&identity).await.is_none());
    }

    #[tokio::test]
    async fn failed_construction_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let identity = model_file(dir.path(), "a.gguf");
        let registry = EngineRegistry::new(backend(false), CountingFactory::new(Duration::ZERO));

        for _ in 0..2 {
            let err = registry.get_or_create(&identity).await.err().unwrap();
            assert!(matches!(err, Error::BackendUnavailable(_)));
        }
        assert!(registry.get(&identity).await.is_none());
    }

    #[tokio::test]
    async fn dispose_all_releases_engines() {
        let dir = tempfile::tempdir().unwrap();
        let identity = model_file(dir.path(), "a.gguf");
        let registry = EngineRegistry::new(backend(true), CountingFactory::new(Duration::ZERO));

        let engine = registry.get_or_create(&identity).await.unwrap();
        registry.dispose_all().await;
        assert_eq!(engine.state(), EngineState::Disposed);
        assert!(registry.loaded().await.is_empty());
    }
}
