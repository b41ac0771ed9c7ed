//! The public runtime: one module, one call lock, many async callers.

use crate::config::RuntimeConfig;
use crate::executor::NatInstance;
use crate::fs::{CoreFile, Vfs};
use crate::generator::Generation;
use crate::lock::CallSerializer;
use crate::module::{ModuleCache, ModuleSlot};
use crate::output::{OutputMux, OutputStream, SubscriptionId};
use crate::response::{Response, Typeset};
use crate::{Result, RuntimeError};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use wasmtime::Engine;

/// Async front end to the nat VM.
///
/// Every operation that reaches the module takes the [`CallSerializer`]
/// first, so concurrent callers are run one at a time in arrival order. The
/// module is instantiated on the first such operation.
pub struct Runtime {
    serializer: CallSerializer,
    module: ModuleSlot,
    output: Arc<OutputMux>,
    vfs: Vfs,
    diagnostics: Arc<Mutex<Vec<String>>>,
    _sandbox: Option<TempDir>,
}

impl Runtime {
    /// Create a runtime. The module is not loaded until first use.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Self::with_cache(config, Arc::new(ModuleCache::new(Engine::default())))
    }

    /// Create a runtime that compiles through a shared module cache.
    pub fn with_cache(config: RuntimeConfig, cache: Arc<ModuleCache>) -> Result<Self> {
        let (vfs, sandbox) = match config.sandbox_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                (Vfs::new(dir), None)
            }
            None => {
                let dir = tempfile::Builder::new().prefix("nat-sandbox-").tempdir()?;
                (Vfs::new(dir.path()), Some(dir))
            }
        };
        info!(sandbox = %vfs.root().display(), module = %config.module, "Creating nat runtime");

        let output = Arc::new(OutputMux::new());
        if config.echo_output {
            output.subscribe(OutputStream::Stdout, |line| {
                info!(target: "nat::stdout", "{}", line)
            });
            output.subscribe(OutputStream::Stderr, |line| {
                warn!(target: "nat::stderr", "{}", line)
            });
        }

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        if config.record_diagnostics {
            let sink = diagnostics.clone();
            output.subscribe(OutputStream::Stderr, move |line| {
                sink.lock().push(line.to_string())
            });
        }

        let module = ModuleSlot::new(cache, config.module, vfs.root(), output.clone());

        Ok(Self {
            serializer: CallSerializer::new(),
            module,
            output,
            vfs,
            diagnostics,
            _sandbox: sandbox,
        })
    }

    /// Host directory backing the virtual filesystem.
    pub fn sandbox_root(&self) -> &Path {
        self.vfs.root()
    }

    pub fn output(&self) -> &Arc<OutputMux> {
        &self.output
    }

    pub fn on_stdout<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.output.subscribe(OutputStream::Stdout, handler)
    }

    pub fn on_stderr<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.output.subscribe(OutputStream::Stderr, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.output.unsubscribe(id)
    }

    /// Diagnostic output recorded so far.
    pub fn errors(&self) -> Vec<String> {
        self.diagnostics.lock().clone()
    }

    /// Drain the recorded diagnostic output.
    pub fn take_errors(&self) -> Vec<String> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    /// Drop the current module instance so the next call instantiates anew.
    ///
    /// This is the recovery path after a fatal initialization failure or a
    /// trapped VM. A call already in flight keeps the old instance.
    pub fn reset_module(&self) {
        self.module.reset();
    }

    /// Run `f` against the module while holding the call lock.
    ///
    /// The VM runs on the blocking pool: WASI calls made by the guest drive
    /// their own futures to completion and cannot do that on an async worker.
    /// The permit moves with the call, so a caller that stops waiting does not
    /// let the next one in before the VM has returned.
    async fn call<R, F>(&self, op: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut NatInstance) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let permit = self.serializer.acquire(op).await;
        let handle = self.module.acquire().await?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut vm = handle.lock();
            f(&mut *vm)
        })
        .await
        .map_err(|e| RuntimeError::Execution(format!("{} did not complete: {}", op, e)))?
    }

    async fn with_fs<R>(&self, op: &'static str, f: impl FnOnce(&Vfs) -> Result<R>) -> Result<R> {
        let _permit = self.serializer.acquire(op).await;
        f(&self.vfs)
    }

    /// Reset the VM to a clean interpretation and generation context.
    pub async fn init(&self) -> Result<()> {
        self.call("init", |vm| vm.init()).await
    }

    /// Evaluate the module at `path` once.
    pub async fn interpret(&self, path: &str) -> Result<Response> {
        let path = path.to_string();
        self.call("interpret", move |vm| vm.interpret(&path)).await
    }

    /// Lazily generate envelopes for `path`.
    ///
    /// Nothing reaches the VM until the first pull.
    pub fn generate(&self, path: &str) -> Generation<'_> {
        Generation::new(self, path)
    }

    /// One pull of the generate entry point. Releases the VM's result buffers
    /// when the stop sentinel comes back.
    pub(crate) async fn generate_step(&self, path: &str) -> Result<Response> {
        let path = path.to_string();
        self.call("generate", move |vm| {
            let response = vm.generate_next(&path)?;
            if response.is_generation_end() {
                if let Err(e) = vm.free_result() {
                    warn!(path = %path, error = %e, "Failed to release generation buffers");
                }
            }
            Ok(response)
        })
        .await
    }

    /// Compile `source` as the module at `path`.
    ///
    /// The result is whatever the module prints while compiling, decoded as
    /// an envelope. `None` when the module reports a non-zero status.
    pub async fn compile(&self, path: &str, source: &str) -> Result<Option<Response>> {
        let (path, source) = (path.to_string(), source.to_string());
        let output = self.output.clone();
        self.call("compile", move |vm| {
            let capture = output.capture(OutputStream::Stdout);
            let status = vm.compile(&path, &source)?;
            let printed = capture.finish();

            if status != 0 {
                debug!(path = %path, status, "Compilation failed");
                return Ok(None);
            }
            Response::from_json(&printed.join("\n")).map(Some)
        })
        .await
    }

    /// Typeset the module at `path`.
    ///
    /// On failure `tex` holds the diagnostics printed during the call.
    pub async fn typeset(&self, path: &str) -> Result<Typeset> {
        let path = path.to_string();
        let output = self.output.clone();
        self.call("typeset", move |vm| {
            let capture = output.capture(OutputStream::Stderr);
            let tex = vm.typeset(&path)?;
            let diagnostics = capture.finish();
            if let Err(e) = vm.free_result() {
                warn!(path = %path, error = %e, "Failed to release typeset buffers");
            }

            Ok(match tex {
                Some(tex) => Typeset { success: true, tex },
                None => Typeset {
                    success: false,
                    tex: diagnostics.join("\n"),
                },
            })
        })
        .await
    }

    /// Release the VM's last result buffers.
    pub async fn free(&self) -> Result<()> {
        self.call("free", |vm| vm.free_result()).await
    }

    /// Flattened pre-order listing of `dir` and its descendants.
    pub async fn list_tree(&self, dir: &str) -> Result<Vec<CoreFile>> {
        self.with_fs("list_tree", |fs| fs.list_tree(dir)).await
    }

    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        self.with_fs("list", |fs| fs.list(dir)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.with_fs("exists", |fs| fs.exists(path)).await
    }

    pub async fn make_dir(&self, path: &str) -> Result<()> {
        self.with_fs("make_dir", |fs| fs.make_dir(path)).await
    }

    pub async fn read_file(&self, path: &str) -> Result<CoreFile> {
        self.with_fs("read_file", |fs| fs.read_file(path)).await
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.with_fs("write_file", |fs| fs.write_file(path, content)).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.with_fs("remove_file", |fs| fs.remove_file(path)).await
    }
}
