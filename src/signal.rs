use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag shared by every stage of one pipeline run.
///
/// Blocking primitives in this crate never poll it; they are woken through
/// their own `close`/`cancel` paths, and the flag records that the run is over.
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> crate::Result<()> {
        if self.is_set() {
            return Err(crate::Error::Cancelled);
        }
        Ok(())
    }
}
