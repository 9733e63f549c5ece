use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;

use crate::error::StoreError;

/// Control handle long-running operations report through.
pub trait TaskControl {
    /// If the task should be aborted, this fails with `Cancelled`.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

/// Convenience implementation:
impl<T: TaskControl + ?Sized> TaskControl for Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as TaskControl>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as TaskControl>::log(self, level, message)
    }
}

/// Task handle backed by a shared abort flag, forwarding log output to
/// the `log` crate.
#[derive(Clone, Default)]
pub struct AbortableTask {
    aborted: Arc<AtomicBool>,
}

impl AbortableTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; the running operation fails at its next
    /// `check_abort`.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl TaskControl for AbortableTask {
    fn check_abort(&self) -> Result<(), Error> {
        if self.is_aborted() {
            return Err(StoreError::Cancelled.into());
        }
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "{}", message);
    }
}

// Callers need the `TaskControl` trait in scope.
#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        ($task).log(log::Level::Info, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        ($task).log(log::Level::Warn, &format_args!($($fmt)+))
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abort_flag_propagates() {
        let task = AbortableTask::new();
        assert!(task.check_abort().is_ok());

        task.abort();
        let err = task.check_abort().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Cancelled)
        ));
    }
}
