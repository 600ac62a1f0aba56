use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::SfmError;

/// Flag shared between a running reconstruction and its owner.
///
/// Cloning the token shares the same flag. The pipeline polls it between
/// stages and between views while growing the scene.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Return [`SfmError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), SfmError> {
        if self.is_cancelled() {
            return Err(SfmError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(SfmError::Cancelled)));
    }
}
