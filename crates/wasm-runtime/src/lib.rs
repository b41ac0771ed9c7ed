//! Host runtime for the nat virtual machine.
//!
//! The nat VM is compiled to a single wasm32 module. It keeps global state, so
//! it must never be entered twice at once, and it speaks a pointer-based C ABI.
//! This crate owns the module instance and exposes it as typed async
//! operations.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Runtime                            │
//! │  ┌────────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │ CallSerializer │→ │  ModuleSlot  │→ │ NatInstance  │  │
//! │  │  (FIFO lock)   │  │ (lazy, once) │  │ (store+mem)  │  │
//! │  └────────────────┘  └──────────────┘  └──────┬───────┘  │
//! │                                               │          │
//! │  Imports:                                     ▼          │
//! │  - nat.print(ptr, len)     -> OutputMux (stdout)         │
//! │  - nat.print_err(ptr, len) -> OutputMux (stderr)         │
//! │  - wasi_snapshot_preview1  -> Vfs sandbox at /src        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use nat_wasm_runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::from_file("nat.wasm"))?;
//! runtime.write_file("main.nat", "print 1").await?;
//! let response = runtime.interpret("main.nat").await?;
//! ```

pub mod config;
pub mod executor;
pub mod fs;
pub mod generator;
pub mod host;
pub mod lock;
pub mod memory;
pub mod module;
pub mod output;
pub mod response;
pub mod runtime;

pub use config::RuntimeConfig;
pub use executor::NatInstance;
pub use fs::{CoreFile, FileKind, Vfs};
pub use generator::{Generation, GenerationState};
pub use lock::{CallPermit, CallSerializer};
pub use module::{ModuleCache, ModuleHandle, ModuleSlot, ModuleSource};
pub use output::{Capture, OutputMux, OutputStream, SubscriptionId};
pub use response::{Kind, Payload, Response, Typeset, GEN_END, GEN_START};
pub use runtime::Runtime;

use thiserror::Error;

/// Errors that can occur in the nat runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Module initialization failed: {0}")]
    Init(String),

    #[error("Failed to compile WASM module: {0}")]
    Compilation(String),

    #[error("Failed to instantiate WASM module: {0}")]
    Instantiation(String),

    #[error("Failed to call WASM function: {0}")]
    Execution(String),

    #[error("WASM function not found: {0}")]
    FunctionNotFound(String),

    #[error("Invalid WASM module: {0}")]
    InvalidModule(String),

    #[error("Invalid memory access: {0}")]
    Memory(String),

    #[error("Failed to decode module result: {0}")]
    Decode(String),

    #[error("Failed to encode argument: {0}")]
    Encode(String),

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    #[error("Path is outside the sandbox: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether the error came from a missing filesystem entry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Whether the error poisons the module slot until it is reset.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::Init(_)
                | RuntimeError::Compilation(_)
                | RuntimeError::Instantiation(_)
                | RuntimeError::InvalidModule(_)
        )
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(e: anyhow::Error) -> Self {
        RuntimeError::Execution(e.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Decode(e.to_string())
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
