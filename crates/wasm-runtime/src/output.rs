//! Fan-out of module output to subscribers.
//!
//! The module writes through two imports, one per [`OutputStream`]. Each
//! emission is delivered synchronously to every handler subscribed to that
//! stream, in subscription order.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// The two broadcast channels the module can write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    /// Primary output (`nat.print`).
    Stdout,
    /// Diagnostic output (`nat.print_err`).
    Stderr,
}

/// Handle returned by [`OutputMux::subscribe`].
///
/// Handles are issued from a monotonic counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A subscriber callback.
pub type OutputHandler = Arc<dyn Fn(&str) + Send + Sync>;

type Registry = Mutex<Vec<(SubscriptionId, OutputHandler)>>;

/// Registry of output subscribers for both streams.
#[derive(Default)]
pub struct OutputMux {
    next_id: AtomicU64,
    stdout: Registry,
    stderr: Registry,
}

impl OutputMux {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self, stream: OutputStream) -> &Registry {
        match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        }
    }

    /// Register `handler` on `stream`.
    pub fn subscribe<F>(&self, stream: OutputStream, handler: F) -> SubscriptionId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry(stream).lock().push((id, Arc::new(handler)));
        trace!(?stream, id = id.0, "Output handler subscribed");
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let mut handlers = self.registry(stream).lock();
            if let Some(pos) = handlers.iter().position(|(h, _)| *h == id) {
                handlers.remove(pos);
                trace!(?stream, id = id.0, "Output handler unsubscribed");
                return true;
            }
        }
        false
    }

    /// Deliver `text` to every handler on `stream`.
    ///
    /// Handlers run without the registry lock held, so they may subscribe or
    /// unsubscribe. A handler removed during an emission is not called by the
    /// remainder of that emission.
    pub fn emit(&self, stream: OutputStream, text: &str) {
        let registry = self.registry(stream);
        let snapshot: Vec<(SubscriptionId, OutputHandler)> = registry.lock().clone();
        trace!(?stream, handlers = snapshot.len(), len = text.len(), "Emitting output");

        for (id, handler) in snapshot {
            let live = registry.lock().iter().any(|(h, _)| *h == id);
            if live {
                handler(text);
            }
        }
    }

    /// Number of handlers currently subscribed to `stream`.
    pub fn subscriber_count(&self, stream: OutputStream) -> usize {
        self.registry(stream).lock().len()
    }

    /// Start accumulating everything emitted on `stream`.
    ///
    /// The accumulator is unsubscribed when the returned guard is finished or
    /// dropped, whichever comes first.
    pub fn capture(&self, stream: OutputStream) -> Capture<'_> {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let id = self.subscribe(stream, move |text| sink.lock().push(text.to_string()));
        Capture {
            mux: self,
            id,
            lines,
        }
    }
}

/// Scoped accumulator created by [`OutputMux::capture`].
pub struct Capture<'a> {
    mux: &'a OutputMux,
    id: SubscriptionId,
    lines: Arc<Mutex<Vec<String>>>,
}

impl Capture<'_> {
    /// Stop capturing and return every emission received.
    pub fn finish(self) -> Vec<String> {
        self.mux.unsubscribe(self.id);
        std::mem::take(&mut *self.lines.lock())
    }
}

impl Drop for Capture<'_> {
    fn drop(&mut self) {
        self.mux.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s: &str| sink.lock().push(s.to_string()))
    }

    #[test]
    fn test_emit_in_subscription_order() {
        let mux = OutputMux::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let order = order.clone();
            mux.subscribe(OutputStream::Stdout, move |_| order.lock().push(tag));
        }

        mux.emit(OutputStream::Stdout, "x");
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_streams_are_independent() {
        let mux = OutputMux::new();
        let (out, out_handler) = recorder();
        let (err, err_handler) = recorder();
        mux.subscribe(OutputStream::Stdout, out_handler);
        mux.subscribe(OutputStream::Stderr, err_handler);

        mux.emit(OutputStream::Stdout, "hello");
        mux.emit(OutputStream::Stderr, "oops");

        assert_eq!(*out.lock(), vec!["hello"]);
        assert_eq!(*err.lock(), vec!["oops"]);
    }

    #[test]
    fn test_unsubscribed_handler_not_invoked() {
        let mux = OutputMux::new();
        let (seen, handler) = recorder();
        let id = mux.subscribe(OutputStream::Stdout, handler);

        mux.emit(OutputStream::Stdout, "first");
        assert!(mux.unsubscribe(id));
        assert!(!mux.unsubscribe(id));
        mux.emit(OutputStream::Stdout, "second");

        assert_eq!(*seen.lock(), vec!["first"]);
        assert_eq!(mux.subscriber_count(OutputStream::Stdout), 0);
    }

    #[test]
    fn test_unsubscribe_during_emission() {
        let mux = Arc::new(OutputMux::new());
        let (seen, handler) = recorder();

        let victim = Arc::new(Mutex::new(None));
        let killer_mux = mux.clone();
        let killer_victim = victim.clone();
        mux.subscribe(OutputStream::Stdout, move |_| {
            if let Some(id) = killer_victim.lock().take() {
                killer_mux.unsubscribe(id);
            }
        });
        *victim.lock() = Some(mux.subscribe(OutputStream::Stdout, handler));

        mux.emit(OutputStream::Stdout, "never seen");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mux = OutputMux::new();
        let a = mux.subscribe(OutputStream::Stdout, |_| {});
        mux.unsubscribe(a);
        let b = mux.subscribe(OutputStream::Stdout, |_| {});
        let c = mux.subscribe(OutputStream::Stderr, |_| {});
        assert!(a < b && b < c);
    }

    #[test]
    fn test_capture_unsubscribes() {
        let mux = OutputMux::new();
        {
            let capture = mux.capture(OutputStream::Stdout);
            mux.emit(OutputStream::Stdout, "one");
            mux.emit(OutputStream::Stderr, "ignored");
            mux.emit(OutputStream::Stdout, "two");
            assert_eq!(capture.finish(), vec!["one", "two"]);
        }
        assert_eq!(mux.subscriber_count(OutputStream::Stdout), 0);

        let capture = mux.capture(OutputStream::Stderr);
        drop(capture);
        assert_eq!(mux.subscriber_count(OutputStream::Stderr), 0);
    }
}
