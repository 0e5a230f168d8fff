//! Fault-injecting backend wrapper for failure testing.

use crate::backend::LogBackend;
use crate::error::{LogError, LogResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handle controlling a [`FaultBackend`].
///
/// Tests keep a clone of the plan and arm failures while the backend is
/// owned by a log. An armed flag fires once and disarms itself.
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_next_append: AtomicBool,
    fail_next_truncate: AtomicBool,
}

impl FaultPlan {
    /// Creates a plan with no failures armed.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms a failure for the next `append` call.
    pub fn fail_next_append(&self) {
        self.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Arms a failure for the next `truncate` call.
    pub fn fail_next_truncate(&self) {
        self.fail_next_truncate.store(true, Ordering::SeqCst);
    }

    fn take(flag: &AtomicBool) -> bool {
        flag.swap(false, Ordering::SeqCst)
    }
}

/// A backend wrapper that injects I/O failures according to a [`FaultPlan`].
///
/// All calls are forwarded to the wrapped backend unless a matching failure
/// is armed, in which case the call fails without touching the inner store.
pub struct FaultBackend {
    inner: Box<dyn LogBackend>,
    plan: Arc<FaultPlan>,
}

impl FaultBackend {
    /// Wraps `inner`, controlled by `plan`.
    pub fn new(inner: Box<dyn LogBackend>, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }

    fn injected(what: &str) -> LogError {
        LogError::Io(std::io::Error::other(format!("injected {what} failure")))
    }
}

impl LogBackend for FaultBackend {
    fn read_at(&self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> LogResult<u64> {
        if FaultPlan::take(&self.plan.fail_next_append) {
            return Err(Self::injected("append"));
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> LogResult<()> {
        self.inner.flush()
    }

    fn len(&self) -> LogResult<u64> {
        self.inner.len()
    }

    fn truncate(&mut self, new_len: u64) -> LogResult<()> {
        if FaultPlan::take(&self.plan.fail_next_truncate) {
            return Err(Self::injected("truncate"));
        }
        self.inner.truncate(new_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[test]
    fn passes_through_when_disarmed() {
        let plan = FaultPlan::new();
        let mut backend = FaultBackend::new(Box::new(MemoryBackend::new()), plan);
        backend.append(b"ok").unwrap();
        assert_eq!(backend.read_at(0, 2).unwrap(), b"ok");
    }

    #[test]
    fn armed_append_fails_once() {
        let plan = FaultPlan::new();
        let mut backend = FaultBackend::new(Box::new(MemoryBackend::new()), Arc::clone(&plan));

        plan.fail_next_append();
        assert!(backend.append(b"boom").is_err());
        // The flag disarms itself; the store was not touched.
        assert_eq!(backend.len().unwrap(), 0);
        backend.append(b"fine").unwrap();
        assert_eq!(backend.len().unwrap(), 4);
    }

    #[test]
    fn armed_truncate_fails_once() {
        let plan = FaultPlan::new();
        let mut backend = FaultBackend::new(Box::new(MemoryBackend::new()), Arc::clone(&plan));
        backend.append(b"abcdef").unwrap();

        plan.fail_next_truncate();
        assert!(backend.truncate(3).is_err());
        assert_eq!(backend.len().unwrap(), 6);
        backend.truncate(3).unwrap();
        assert_eq!(backend.len().unwrap(), 3);
    }
}
