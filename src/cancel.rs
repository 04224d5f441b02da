//! Cooperative cancellation.
//!
//! A single token propagates from the executor to the job adapter. The
//! executor checks it at layer boundaries and aborts before starting the next
//! layer; the adapter translates it into a best-effort kill request to the
//! batch runtime. In-flight jobs are left to complete or be killed by the
//! runtime. Cleanup of temporary directories runs regardless of outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cheaply cloneable cancellation flag.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
