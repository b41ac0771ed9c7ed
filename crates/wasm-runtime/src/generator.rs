//! Incremental generation on top of the VM's pull convention.
//!
//! The VM has no end-of-stream signal. Each call to the generate entry point
//! returns one envelope, and the stream is over when `out` equals
//! [`GEN_END`]. The VM, not the host, owns generation progress: dropping a
//! [`Generation`] early leaves the VM wherever it was, and a new
//! [`Generation`] for the same path picks up from that point.

use crate::response::Response;
use crate::runtime::Runtime;
use crate::Result;
use futures::stream::{self, Stream};
use tracing::debug;

/// Two-state machine driven by the content of each envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Active,
    Exhausted,
}

impl GenerationState {
    /// Feed one pulled envelope through the machine.
    ///
    /// Returns the envelope if it should be yielded. The stop sentinel is
    /// never yielded. A failed envelope is yielded and ends the sequence, since
    /// it carries nothing to continue from.
    pub fn advance(&mut self, response: Response) -> Option<Response> {
        match self {
            GenerationState::Exhausted => None,
            GenerationState::Active if response.is_generation_end() => {
                *self = GenerationState::Exhausted;
                None
            }
            GenerationState::Active => {
                if !response.success {
                    *self = GenerationState::Exhausted;
                }
                Some(response)
            }
        }
    }
}

/// A lazy, single-pass sequence of generated envelopes.
///
/// Created by [`Runtime::generate`]. Each pull takes the call lock for the
/// duration of one VM call.
pub struct Generation<'rt> {
    runtime: &'rt Runtime,
    path: String,
    state: GenerationState,
    pulled: usize,
}

impl<'rt> Generation<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime, path: impl Into<String>) -> Self {
        Self {
            runtime,
            path: path.into(),
            state: GenerationState::Active,
            pulled: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == GenerationState::Exhausted
    }

    /// Pull the next envelope. `None` once the sequence has ended.
    ///
    /// An error also ends the sequence.
    pub async fn next(&mut self) -> Option<Result<Response>> {
        if self.is_exhausted() {
            return None;
        }

        match self.runtime.generate_step(&self.path).await {
            Ok(response) => {
                self.pulled += 1;
                let item = self.state.advance(response);
                if item.is_none() {
                    debug!(path = %self.path, pulls = self.pulled, "Generation exhausted");
                }
                item.map(Ok)
            }
            Err(e) => {
                self.state = GenerationState::Exhausted;
                Some(Err(e))
            }
        }
    }

    /// Drain the remaining envelopes.
    pub async fn collect(mut self) -> Result<Vec<Response>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Response>> + 'rt {
        stream::unfold(self, |mut generation| async move {
            generation.next().await.map(|item| (item, generation))
        })
    }
}
