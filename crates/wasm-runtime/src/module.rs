//! Module loading, compile caching and the lazily created module handle.

use crate::executor::NatInstance;
use crate::output::OutputMux;
use crate::{Result, RuntimeError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};
use wasmtime::{Engine, Module};

/// Where the module binary comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    /// A `.wasm` (or `.wat`) file on the host.
    File(PathBuf),
    /// Module bytes already in memory.
    Bytes(Arc<[u8]>),
}

impl ModuleSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ModuleSource::File(path.into())
    }

    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ModuleSource::Bytes(bytes.into().into())
    }

    async fn load(&self) -> Result<Arc<[u8]>> {
        match self {
            ModuleSource::File(path) => {
                info!(path = %path.display(), "Loading WASM module from file");
                let bytes = tokio::fs::read(path).await?;
                Ok(bytes.into())
            }
            ModuleSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

impl std::fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModuleSource::File(path) => write!(f, "{}", path.display()),
            ModuleSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// Cache of compiled modules keyed by a hash of their bytes.
///
/// Re-instantiating after a reset reuses the compiled code.
pub struct ModuleCache {
    engine: Engine,
    cache: DashMap<String, Module>,
}

impl ModuleCache {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            cache: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get or compile a module from bytes.
    pub fn get_or_compile(&self, wasm_bytes: &[u8]) -> Result<Module> {
        let hash = hash_bytes(wasm_bytes);

        if let Some(module) = self.cache.get(&hash) {
            debug!(hash = %hash, "Module cache hit");
            return Ok(module.clone());
        }

        debug!(hash = %hash, len = wasm_bytes.len(), "Module cache miss, compiling");
        let module = Module::new(&self.engine, wasm_bytes)
            .map_err(|e| RuntimeError::Compilation(e.to_string()))?;
        self.cache.insert(hash, module.clone());

        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn hash_bytes(data: &[u8]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Shared, exclusively-locked module instance.
///
/// The inner lock is never contended while callers go through the
/// [`CallSerializer`](crate::lock::CallSerializer); it exists so the instance
/// can be handed to the blocking thread that runs each call.
pub type ModuleHandle = Arc<Mutex<NatInstance>>;

type InitOutcome = std::result::Result<ModuleHandle, String>;

/// Process-wide slot holding the module instance.
///
/// The first [`acquire`](ModuleSlot::acquire) instantiates the module. Callers
/// that arrive while that is still running wait on the same initialization
/// instead of starting another one. A failed initialization is remembered and
/// returned to every later caller until [`reset`](ModuleSlot::reset) is called.
pub struct ModuleSlot {
    cache: Arc<ModuleCache>,
    source: ModuleSource,
    sandbox: PathBuf,
    output: Arc<OutputMux>,
    cell: Mutex<Arc<OnceCell<InitOutcome>>>,
    attempts: AtomicUsize,
}

impl ModuleSlot {
    pub fn new(
        cache: Arc<ModuleCache>,
        source: ModuleSource,
        sandbox: impl AsRef<Path>,
        output: Arc<OutputMux>,
    ) -> Self {
        Self {
            cache,
            source,
            sandbox: sandbox.as_ref().to_path_buf(),
            output,
            cell: Mutex::new(Arc::new(OnceCell::new())),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Get the module handle, instantiating it on first use.
    pub async fn acquire(&self) -> Result<ModuleHandle> {
        let cell = self.cell.lock().clone();
        match cell.get_or_init(|| self.instantiate()).await {
            Ok(handle) => Ok(handle.clone()),
            Err(msg) => Err(RuntimeError::Init(msg.clone())),
        }
    }

    /// Forget the current instance (or the remembered failure).
    ///
    /// The next [`acquire`](ModuleSlot::acquire) instantiates a fresh module.
    /// Handles already given out stay valid but are no longer shared.
    pub fn reset(&self) {
        info!(source = %self.source, "Resetting module slot");
        *self.cell.lock() = Arc::new(OnceCell::new());
    }

    /// Whether an instance (or a failure) is currently memoized.
    pub fn is_initialized(&self) -> bool {
        self.cell.lock().initialized()
    }

    /// Number of instantiations started so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn instantiate(&self) -> InitOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        info!(source = %self.source, attempt, "Instantiating nat module");

        let result = self.load_and_instantiate().await;

        match result {
            Ok(instance) => {
                info!(attempt, "Module instantiated");
                Ok(Arc::new(Mutex::new(instance)))
            }
            Err(e) => {
                error!(attempt, error = %e, "Module instantiation failed");
                Err(e.to_string())
            }
        }
    }

    async fn load_and_instantiate(&self) -> Result<NatInstance> {
        let bytes = self.source.load().await?;
        let cache = self.cache.clone();
        let module = tokio::task::spawn_blocking(move || cache.get_or_compile(&bytes))
            .await
            .map_err(|e| RuntimeError::Compilation(e.to_string()))??;

        NatInstance::instantiate(self.cache.engine(), &module, &self.sandbox, self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB: &str = include_str!("../tests/fixtures/nat_stub.wat");

    fn slot(source: ModuleSource, sandbox: &Path) -> ModuleSlot {
        let cache = Arc::new(ModuleCache::new(Engine::default()));
        ModuleSlot::new(cache, source, sandbox, Arc::new(OutputMux::new()))
    }

    #[test]
    fn test_hash_bytes() {
        assert_eq!(hash_bytes(b"hello world"), hash_bytes(b"hello world"));
        assert_ne!(hash_bytes(b"hello world"), hash_bytes(b"different data"));
    }

    #[test]
    fn test_cache_reuses_compiled_module() {
        let cache = ModuleCache::new(Engine::default());
        cache.get_or_compile(STUB.as_bytes()).unwrap();
        cache.get_or_compile(STUB.as_bytes()).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_instantiates_once() {
        let dir = tempfile::tempdir().unwrap();
        let slot = slot(ModuleSource::bytes(STUB), dir.path());

        let (a, b) = tokio::join!(slot.acquire(), slot.acquire());
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(slot.attempts(), 1);

        let c = slot.acquire().await.unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(slot.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_memoized_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let slot = slot(ModuleSource::bytes(b"not a module".to_vec()), dir.path());

        assert!(matches!(slot.acquire().await, Err(RuntimeError::Init(_))));
        assert!(matches!(slot.acquire().await, Err(RuntimeError::Init(_))));
        assert_eq!(slot.attempts(), 1);
        assert!(slot.is_initialized());

        slot.reset();
        assert!(!slot.is_initialized());
        assert!(slot.acquire().await.is_err());
        assert_eq!(slot.attempts(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_init_error() {
        let dir = tempfile::tempdir().unwrap();
        let slot = slot(ModuleSource::file(dir.path().join("absent.wasm")), dir.path());

        let err = slot.acquire().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_reset_creates_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let slot = slot(ModuleSource::bytes(STUB), dir.path());

        let first = slot.acquire().await.unwrap();
        slot.reset();
        let second = slot.acquire().await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(slot.attempts(), 2);
    }
}
