//! Configuration for the runtime.

use crate::module::ModuleSource;
use std::path::PathBuf;

/// Default module file name.
pub const DEFAULT_MODULE: &str = "nat.wasm";

/// Configuration for [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Where to load the module from.
    pub module: ModuleSource,
    /// Host directory used as the sandbox root. A temporary directory owned by
    /// the runtime is created when unset.
    pub sandbox_dir: Option<PathBuf>,
    /// Forward module output to `tracing`.
    pub echo_output: bool,
    /// Keep diagnostic output for [`Runtime::errors`](crate::Runtime::errors).
    pub record_diagnostics: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            module: ModuleSource::file(DEFAULT_MODULE),
            sandbox_dir: None,
            echo_output: true,
            record_diagnostics: true,
        }
    }
}

impl RuntimeConfig {
    /// Load the module from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            module: ModuleSource::file(path),
            ..Default::default()
        }
    }

    /// Use module bytes (binary or text format) already in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            module: ModuleSource::bytes(bytes),
            ..Default::default()
        }
    }

    /// Use `dir` as the sandbox root.
    pub fn with_sandbox_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sandbox_dir = Some(dir.into());
        self
    }

    pub fn with_echo_output(mut self, echo: bool) -> Self {
        self.echo_output = echo;
        self
    }

    pub fn with_record_diagnostics(mut self, record: bool) -> Self {
        self.record_diagnostics = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config = RuntimeConfig::default();
        assert!(matches!(config.module, ModuleSource::File(ref p) if p.as_os_str() == DEFAULT_MODULE));
        assert!(config.sandbox_dir.is_none());

        let config = RuntimeConfig::from_bytes(b"(module)".to_vec())
            .with_sandbox_dir("/tmp/nat")
            .with_echo_output(false);
        assert!(matches!(config.module, ModuleSource::Bytes(ref b) if b.len() == 8));
        assert_eq!(config.sandbox_dir, Some(PathBuf::from("/tmp/nat")));
        assert!(!config.echo_output);
        assert!(config.record_diagnostics);
    }
}
