use crate::error::{MergeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Cooperative cancellation shared by the tasks of one merge.
///
/// A child token observes every ancestor, so cancelling a directory's group
/// stops all of its descendants while leaving siblings of the directory alone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    chain: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(AtomicBool::new(false))],
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    /// New token cancelled by this one, but not the other way around.
    pub fn child(&self) -> Self {
        let mut chain = self.chain.clone();
        chain.push(Arc::new(AtomicBool::new(false)));
        Self {
            chain,
            deadline: self.deadline,
        }
    }

    /// Child token whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let at = Instant::now() + timeout;
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
        child
    }

    pub fn cancel(&self) {
        if let Some(flag) = self.chain.last() {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Called before every filesystem mutation.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MergeError::DeadlineExceeded);
            }
        }
        Ok(())
    }
}
