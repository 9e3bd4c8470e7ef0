//! Cooperative cancellation context.
//!
//! Operations are not preemptively cancellable; bulk loops poll the flag
//! between chunk-sized sub-operations and abort with `Cancelled` when it
//! is raised. A default context never cancels.

use nlfs_error::{NlfsError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation capability threaded through bulk reads and writes.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    cancel: Option<Arc<AtomicBool>>,
}

impl Cx {
    /// A context that never cancels.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A cancellable context plus the flag that trips it.
    #[must_use]
    pub fn cancellable() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Self {
                cancel: Some(Arc::clone(&flag)),
            },
            flag,
        )
    }

    /// Yield point: fails with `Cancelled` once the flag is raised.
    pub fn checkpoint(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(NlfsError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_never_cancels() {
        let cx = Cx::none();
        for _ in 0..100 {
            assert!(cx.checkpoint().is_ok());
        }
    }

    #[test]
    fn raised_flag_trips_the_next_checkpoint() {
        let (cx, flag) = Cx::cancellable();
        assert!(cx.checkpoint().is_ok());
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
        assert!(matches!(cx.checkpoint(), Err(NlfsError::Cancelled)));
    }
}
