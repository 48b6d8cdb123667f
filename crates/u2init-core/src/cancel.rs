use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session cancelled")]
pub struct Cancelled;

/// Shared cancellation flag for one `init` run.
///
/// Clones observe the same flag. An optional deadline turns the token into
/// an overall session budget: once it passes, the token reads as cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that cancels itself `budget` from now.
    #[must_use]
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            flag: Arc::default(),
            deadline: Instant::now().checked_add(budget),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(other.check().is_ok());
        token.cancel();
        assert_eq!(other.check(), Err(Cancelled));
    }

    #[test]
    fn expired_deadline_reads_as_cancelled() {
        assert!(CancelToken::with_deadline(Duration::ZERO).is_cancelled());
        assert!(!CancelToken::with_deadline(Duration::from_secs(3600)).is_cancelled());
    }
}
