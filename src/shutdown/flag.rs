// Process-wide shutdown flag
// Set exactly once; read by the health monitor and every spawn path before acting

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, atomically observed "shutdown has begun" bit.
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag. Returns true only for the call that raised it.
    pub(crate) fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_raised_once_and_shared() {
        let flag = ShutdownFlag::new();
        let observer = flag.clone();

        assert!(!observer.is_set());
        assert!(flag.raise());
        assert!(!flag.raise());
        assert!(observer.is_set());
    }
}
