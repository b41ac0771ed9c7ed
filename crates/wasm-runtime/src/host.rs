//! Host side of the module's imports.
//!
//! The module is linked against:
//! - `nat.print(ptr, len)`: one primary-output emission
//! - `nat.print_err(ptr, len)`: one diagnostic-output emission
//! - `wasi_snapshot_preview1`: file access, with the sandbox root pre-opened
//!   at [`SANDBOX_GUEST_DIR`]
//!
//! WASI stdout and stderr are routed into the same [`OutputMux`] as the
//! `nat` imports, one emission per line.

use crate::memory::read_bytes;
use crate::output::{OutputMux, OutputStream};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;
use wasmtime::{Caller, Engine, Linker};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{
    DirPerms, FilePerms, HostOutputStream, StdoutStream, StreamResult, Subscribe, WasiCtxBuilder,
};

/// Import module name for the output functions.
pub const HOST_MODULE: &str = "nat";

/// Guest path the sandbox root is mounted at.
pub const SANDBOX_GUEST_DIR: &str = "/src";

/// State stored in the wasmtime `Store`.
pub struct NatHostState {
    /// Subscribers for module output.
    pub output: Arc<OutputMux>,
    /// WASI context (sandboxed file access).
    pub wasi: WasiP1Ctx,
}

impl NatHostState {
    /// Create host state whose filesystem view is `sandbox`.
    pub fn new(output: Arc<OutputMux>, sandbox: &Path) -> Result<Self> {
        let mut builder = WasiCtxBuilder::new();
        builder
            .inherit_stdin()
            .stdout(GuestOutput::new(output.clone(), OutputStream::Stdout))
            .stderr(GuestOutput::new(output.clone(), OutputStream::Stderr))
            .allow_blocking_current_thread(true);
        builder
            .preopened_dir(sandbox, SANDBOX_GUEST_DIR, DirPerms::all(), FilePerms::all())
            .map_err(|e| {
                RuntimeError::Instantiation(format!(
                    "failed to mount sandbox {}: {}",
                    sandbox.display(),
                    e
                ))
            })?;

        Ok(Self {
            output,
            wasi: builder.build_p1(),
        })
    }
}

/// WASI output descriptor backed by the [`OutputMux`].
pub struct GuestOutput {
    output: Arc<OutputMux>,
    stream: OutputStream,
}

impl GuestOutput {
    pub fn new(output: Arc<OutputMux>, stream: OutputStream) -> Self {
        Self { output, stream }
    }
}

impl StdoutStream for GuestOutput {
    fn stream(&self) -> Box<dyn HostOutputStream> {
        Box::new(LineWriter {
            output: self.output.clone(),
            stream: self.stream,
            pending: Vec::new(),
        })
    }

    fn isatty(&self) -> bool {
        false
    }
}

/// Splits guest writes into lines. A trailing partial line is held until the
/// next newline, or emitted when the descriptor goes away.
struct LineWriter {
    output: Arc<OutputMux>,
    stream: OutputStream,
    pending: Vec<u8>,
}

impl LineWriter {
    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        trace!(stream = ?self.stream, len = line.len(), "WASI output");
        self.output.emit(self.stream, text.trim_end_matches('\r'));
    }
}

#[async_trait]
impl Subscribe for LineWriter {
    async fn ready(&mut self) {}
}

impl HostOutputStream for LineWriter {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.pending.extend_from_slice(&bytes);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..pos]);
        }
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(64 * 1024)
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.emit(&rest);
        }
    }
}

/// Create a linker with WASI and the nat output imports.
pub fn create_linker(engine: &Engine) -> Result<Linker<NatHostState>> {
    let mut linker = Linker::new(engine);

    preview1::add_to_linker_sync(&mut linker, |state: &mut NatHostState| &mut state.wasi)
        .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;

    add_output_functions(&mut linker)?;

    Ok(linker)
}

fn add_output_functions(linker: &mut Linker<NatHostState>) -> Result<()> {
    for (name, stream) in [
        ("print", OutputStream::Stdout),
        ("print_err", OutputStream::Stderr),
    ] {
        linker
            .func_wrap(
                HOST_MODULE,
                name,
                move |mut caller: Caller<'_, NatHostState>,
                      ptr: i32,
                      len: i32|
                      -> wasmtime::Result<()> {
                    let memory = caller
                        .get_export("memory")
                        .and_then(|e| e.into_memory())
                        .ok_or_else(|| wasmtime::Error::msg("memory export not found"))?;

                    let text = {
                        let bytes = read_bytes(memory.data(&caller), ptr as u32, len as u32)
                            .map_err(|e| wasmtime::Error::msg(e.to_string()))?;
                        String::from_utf8_lossy(bytes).into_owned()
                    };

                    trace!(?stream, len, "Module output");
                    caller.data().output.emit(stream, &text);
                    Ok(())
                },
            )
            .map_err(|e| RuntimeError::Instantiation(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer(output: &Arc<OutputMux>) -> Box<dyn HostOutputStream> {
        GuestOutput::new(output.clone(), OutputStream::Stderr).stream()
    }

    #[test]
    fn test_guest_writes_are_split_into_lines() {
        let output = Arc::new(OutputMux::new());
        let capture = output.capture(OutputStream::Stderr);

        let mut stream = writer(&output);
        stream.write(Bytes::from_static(b"first\nsec")).unwrap();
        stream.write(Bytes::from_static(b"ond\r\nthird")).unwrap();
        stream.flush().unwrap();
        drop(stream);

        assert_eq!(capture.finish(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_guest_output_keeps_streams_apart() {
        let output = Arc::new(OutputMux::new());
        let stdout = output.capture(OutputStream::Stdout);

        let mut stream = writer(&output);
        stream.write(Bytes::from_static(b"to stderr\n")).unwrap();

        assert!(stdout.finish().is_empty());
    }
}
