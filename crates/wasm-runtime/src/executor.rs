//! The instantiated nat VM and its entry points.
//!
//! All calls here are synchronous and assume the caller already holds the
//! call lock. Pointer results are copied out of linear memory before the next
//! call can overwrite them.

use crate::host::{create_linker, NatHostState};
use crate::memory::{self, GuestMemory};
use crate::output::OutputMux;
use crate::response::Response;
use crate::{Result, RuntimeError};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use wasmtime::{Engine, Instance, Memory, Module, Store, TypedFunc};

/// Export names of the module ABI.
pub mod exports {
    pub const MEMORY: &str = "memory";
    pub const MALLOC: &str = "malloc";
    pub const FREE: &str = "free";
    pub const INIT: &str = "vmInit_wasm";
    pub const INTERPRET: &str = "vmInterpretEntrypoint_wasm";
    pub const GENERATE: &str = "vmGenerate_wasm";
    pub const TYPESET: &str = "vmTypesetModule_wasm";
    pub const COMPILE: &str = "vmCompile_wasm";
    pub const FREE_RESULT: &str = "vmFree_wasm";
}

/// A live module instance.
pub struct NatInstance {
    store: Store<NatHostState>,
    memory: Memory,
    malloc_func: TypedFunc<i32, i32>,
    free_func: TypedFunc<i32, ()>,
    init_func: Option<TypedFunc<(), ()>>,
    interpret_func: Option<TypedFunc<i32, i32>>,
    generate_func: Option<TypedFunc<i32, i32>>,
    typeset_func: Option<TypedFunc<i32, i32>>,
    compile_func: Option<TypedFunc<(i32, i32, i32), i32>>,
    free_result_func: Option<TypedFunc<(), ()>>,
}

impl NatInstance {
    /// Instantiate `module` with its filesystem rooted at `sandbox`.
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        sandbox: &Path,
        output: Arc<OutputMux>,
    ) -> Result<Self> {
        let linker = create_linker(engine)?;
        let mut store = Store::new(engine, NatHostState::new(output, sandbox)?);
        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;

        let memory = instance
            .get_memory(&mut store, exports::MEMORY)
            .ok_or_else(|| RuntimeError::InvalidModule("memory export not found".to_string()))?;

        let malloc_func = required(&instance, &mut store, exports::MALLOC)?;
        let free_func = required(&instance, &mut store, exports::FREE)?;

        let init_func = optional(&instance, &mut store, exports::INIT);
        let interpret_func = optional(&instance, &mut store, exports::INTERPRET);
        let generate_func = optional(&instance, &mut store, exports::GENERATE);
        let typeset_func = optional(&instance, &mut store, exports::TYPESET);
        let compile_func = optional(&instance, &mut store, exports::COMPILE);
        let free_result_func = optional(&instance, &mut store, exports::FREE_RESULT);

        Ok(Self {
            store,
            memory,
            malloc_func,
            free_func,
            init_func,
            interpret_func,
            generate_func,
            typeset_func,
            compile_func,
            free_result_func,
        })
    }

    /// Reset the VM's interpretation and generation state.
    pub fn init(&mut self) -> Result<()> {
        let func = entry(&self.init_func, exports::INIT)?;
        debug!("Calling {}", exports::INIT);
        func.call(&mut self.store, ())?;
        Ok(())
    }

    /// Run the module at `path` once and decode its envelope.
    pub fn interpret(&mut self, path: &str) -> Result<Response> {
        let func = entry(&self.interpret_func, exports::INTERPRET)?;
        let ptr = self.call_with_path(&func, exports::INTERPRET, path)?;
        memory::decode_envelope(self.data(), ptr)
    }

    /// Pull the next generated envelope for `path`.
    pub fn generate_next(&mut self, path: &str) -> Result<Response> {
        let func = entry(&self.generate_func, exports::GENERATE)?;
        let ptr = self.call_with_path(&func, exports::GENERATE, path)?;
        memory::decode_envelope(self.data(), ptr)
    }

    /// Typeset the module at `path`. `None` when the module returns null.
    pub fn typeset(&mut self, path: &str) -> Result<Option<String>> {
        let func = entry(&self.typeset_func, exports::TYPESET)?;
        let ptr = self.call_with_path(&func, exports::TYPESET, path)?;
        if ptr == 0 {
            return Ok(None);
        }
        memory::read_cstring(self.data(), ptr).map(Some)
    }

    /// Compile `source` as the module at `path`, returning the status code.
    ///
    /// The compiled result is written through `nat.print`, not returned.
    pub fn compile(&mut self, path: &str, source: &str) -> Result<i32> {
        let func = entry(&self.compile_func, exports::COMPILE)?;
        let argv = memory::encode_string_array(self, &[path, source])?;
        let path_ptr = argv.get(0).unwrap_or(0);

        debug!(path, argc = argv.len(), "Calling {}", exports::COMPILE);
        let result = func.call(
            &mut self.store,
            (path_ptr as i32, argv.base() as i32, argv.len() as i32),
        );

        if let Err(e) = argv.free(self) {
            warn!(error = %e, "Failed to free compile arguments");
        }
        Ok(result?)
    }

    /// Release the VM's last result buffers.
    pub fn free_result(&mut self) -> Result<()> {
        let func = entry(&self.free_result_func, exports::FREE_RESULT)?;
        debug!("Calling {}", exports::FREE_RESULT);
        func.call(&mut self.store, ())?;
        Ok(())
    }

    /// Size of linear memory in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    fn call_with_path(&mut self, func: &TypedFunc<i32, i32>, name: &str, path: &str) -> Result<u32> {
        let path_ptr = memory::write_cstring(self, path)?;

        debug!(path, "Calling {}", name);
        let result = func.call(&mut self.store, path_ptr as i32);

        if let Err(e) = self.dealloc(path_ptr) {
            warn!(error = %e, "Failed to free path argument");
        }
        Ok(result? as u32)
    }
}

impl std::fmt::Debug for NatInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatInstance")
            .field("memory_size", &self.memory_size())
            .field("init", &self.init_func.is_some())
            .field("interpret", &self.interpret_func.is_some())
            .field("generate", &self.generate_func.is_some())
            .field("typeset", &self.typeset_func.is_some())
            .field("compile", &self.compile_func.is_some())
            .field("free_result", &self.free_result_func.is_some())
            .finish()
    }
}

impl GuestMemory for NatInstance {
    fn data(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }

    fn alloc(&mut self, size: u32) -> Result<u32> {
        let ptr = self.malloc_func.call(&mut self.store, size as i32)?;
        if ptr == 0 {
            return Err(RuntimeError::Memory(format!(
                "module failed to allocate {} bytes",
                size
            )));
        }
        Ok(ptr as u32)
    }

    fn dealloc(&mut self, ptr: u32) -> Result<()> {
        self.free_func.call(&mut self.store, ptr as i32)?;
        Ok(())
    }
}

fn required<P, R>(instance: &Instance, store: &mut Store<NatHostState>, name: &str) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func(store, name)
        .map_err(|e| RuntimeError::InvalidModule(format!("{}: {}", name, e)))
}

fn optional<P, R>(instance: &Instance, store: &mut Store<NatHostState>, name: &str) -> Option<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = instance.get_typed_func(store, name).ok();
    if func.is_none() {
        warn!(function = name, "Entry point not found in WASM module");
    }
    func
}

fn entry<P, R>(func: &Option<TypedFunc<P, R>>, name: &str) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    func.clone()
        .ok_or_else(|| RuntimeError::FunctionNotFound(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputStream;

    const STUB: &str = include_str!("../tests/fixtures/nat_stub.wat");
    const BARE: &str = r#"(module (memory (export "memory") 1))"#;

    fn instance(wat: &str) -> (NatInstance, Arc<OutputMux>, tempfile::TempDir) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let output = Arc::new(OutputMux::new());
        let vm = NatInstance::instantiate(&engine, &module, dir.path(), output.clone()).unwrap();
        (vm, output, dir)
    }

    #[test]
    fn test_missing_allocator_is_invalid() {
        let engine = Engine::default();
        let module = Module::new(&engine, BARE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let result = NatInstance::instantiate(&engine, &module, dir.path(), Arc::new(OutputMux::new()));
        assert!(matches!(result, Err(RuntimeError::InvalidModule(_))));
    }

    #[test]
    fn test_interpret_decodes_envelope_and_prints_path() {
        let (mut vm, output, _dir) = instance(STUB);
        let capture = output.capture(OutputStream::Stdout);

        let resp = vm.interpret("a/b").unwrap();
        assert_eq!(resp, Response::string(true, "success"));
        assert_eq!(capture.finish(), vec!["a/b"]);
    }

    #[test]
    fn test_debug_lists_entry_points() {
        let (vm, _output, _dir) = instance(STUB);
        let shown = format!("{:?}", vm);
        assert!(shown.starts_with("NatInstance"));
        assert!(shown.contains("memory_size: 65536"));
        assert!(shown.contains("compile: true"));
    }

    #[test]
    fn test_typeset_null_result() {
        let (mut vm, _output, _dir) = instance(STUB);
        assert_eq!(vm.typeset("doc").unwrap().as_deref(), Some("$x^2$"));
        assert_eq!(vm.typeset("xfail").unwrap(), None);
    }

    #[test]
    fn test_compile_status() {
        let (mut vm, output, _dir) = instance(STUB);

        let capture = output.capture(OutputStream::Stderr);
        assert_ne!(vm.compile("foo", "let z = [1 3 4;").unwrap(), 0);
        assert_eq!(capture.finish(), vec!["unbalanced brackets"]);

        let capture = output.capture(OutputStream::Stdout);
        assert_eq!(vm.compile("foo", "let z = [1 3 4];").unwrap(), 0);
        assert_eq!(capture.finish().len(), 2);
    }
}
