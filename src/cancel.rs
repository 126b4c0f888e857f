//! Cooperative cancellation.
//!
//! Long-running stages take a [CancelToken] and poll it at I/O boundaries.
//! A cancelled stage removes its temporaries, commits nothing, and returns
//! [crate::error::Error::Cancelled], leaving the shard state machine where it
//! was before the stage started.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation was requested.
    pub fn check(&self) -> Result<(), crate::error::Error> {
        if self.is_cancelled() {
            Err(crate::error::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(t2.check().is_ok());
        t.cancel();
        assert!(t2.is_cancelled());
        assert!(t2.check().is_err());
    }
}
