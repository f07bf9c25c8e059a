//! Operation contexts carrying deadlines and cancellation
//!
//! Every server operation takes an [`OpContext`]. The context is checked at
//! operation entry, between storage phases, per writer work unit, and before
//! commit, so a cancelled or expired request stops doing work at the next
//! boundary and its transaction rolls back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};

/// Deadline and cancellation state for one operation
///
/// Cloning an `OpContext` shares the cancellation flag, so a handle kept by
/// the caller cancels the clone passed into the operation.
#[derive(Clone, Debug)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OpContext {
    /// Creates a context with no deadline
    pub fn background() -> Self {
        Self { deadline: None, cancelled: Arc::new(AtomicBool::new(false)) }
    }

    /// Creates a context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Marks the operation as cancelled
    ///
    /// In-flight work observes the flag at its next checkpoint; partial work
    /// is discarded because the enclosing transaction never commits.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns whether the operation was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns an error if the operation was cancelled or its deadline passed
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Unavailable("operation cancelled".to_string()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::DeadlineExceeded);
            }
        }
        Ok(())
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}
