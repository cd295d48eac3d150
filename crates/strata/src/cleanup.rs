//! Ordered teardown actions.
//!
//! Every resource a container acquires registers its release on a
//! [`CleanupStack`]. Stacks unwind in reverse-of-push order and keep going
//! after a failure, so one stuck unmount never leaks the directories below it.

use std::fmt;
use std::path::Path;

use strata_common::{StrataError, StrataResult};

type Action = Box<dyn FnOnce() -> StrataResult<()> + Send + 'static>;

struct Entry {
    name: String,
    action: Action,
}

/// A stack of fallible teardown actions.
///
/// Actions that were never run explicitly run when the stack is dropped;
/// failures on that path are logged.
#[derive(Default)]
pub struct CleanupStack {
    entries: Vec<Entry>,
}

impl CleanupStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action.
    pub fn push<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> StrataResult<()> + Send + 'static,
    {
        self.entries.push(Entry {
            name: name.into(),
            action: Box::new(action),
        });
    }

    /// Move every action of `other` on top of this stack.
    ///
    /// The appended actions run before anything already registered here.
    pub fn append(&mut self, mut other: Self) {
        self.entries.append(&mut other.entries);
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no action is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of the pending actions in the order they would run.
    #[must_use]
    pub fn pending(&self) -> Vec<&str> {
        self.entries.iter().rev().map(|e| e.name.as_str()).collect()
    }

    /// Run every pending action, last pushed first.
    ///
    /// The stack is empty afterwards, so running it again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns every failure that occurred, combined into one error.
    pub fn run(&mut self) -> StrataResult<()> {
        let mut errors = Vec::new();

        while let Some(entry) = self.entries.pop() {
            tracing::trace!(action = %entry.name, "Running cleanup");
            if let Err(e) = (entry.action)() {
                tracing::debug!(action = %entry.name, error = %e, "Cleanup action failed");
                errors.push(e);
            }
        }

        StrataError::collect(errors)
    }

    /// Take the pending actions, leaving this stack empty.
    #[must_use]
    pub fn take(&mut self) -> Self {
        Self {
            entries: std::mem::take(&mut self.entries),
        }
    }
}

/// Remove a directory tree; a missing directory is not an error.
///
/// # Errors
///
/// Returns any other removal failure.
pub fn remove_dir_all(path: &Path) -> StrataResult<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Remove a file, socket, fifo or symlink; a missing path is not an error.
///
/// # Errors
///
/// Returns any other removal failure.
pub fn remove_file(path: &Path) -> StrataResult<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupStack")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        if let Err(e) = self.run() {
            tracing::warn!(error = %e, "Cleanup on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Action) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = Arc::clone(&log);
            move |name: &'static str| -> Action {
                let log = Arc::clone(&log);
                Box::new(move || {
                    log.lock().push(name);
                    Ok(())
                })
            }
        };
        (log, make)
    }

    fn failing(message: &'static str) -> impl FnOnce() -> StrataResult<()> + Send {
        move || {
            Err(StrataError::Internal {
                message: message.to_string(),
            })
        }
    }

    #[test]
    fn runs_in_reverse_order() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("first", make("first"));
        stack.push("second", make("second"));
        stack.push("third", make("third"));

        assert_eq!(stack.pending(), vec!["third", "second", "first"]);
        stack.run().unwrap();
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn keeps_going_after_failures() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("dir", make("dir"));
        stack.push("unmount", failing("unmount failed"));
        stack.push("socket", failing("socket failed"));

        let err = stack.run().unwrap_err();
        assert_eq!(err.count(), 2);
        assert_eq!(*log.lock(), vec!["dir"]);
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut stack = CleanupStack::new();
        stack.push("broken", failing("boom"));

        assert!(stack.run().is_err());
        assert!(stack.is_empty());
        assert!(stack.run().is_ok());
        assert!(stack.run().is_ok());
    }

    #[test]
    fn appended_stack_runs_first() {
        let (log, make) = recorder();
        let mut outer = CleanupStack::new();
        outer.push("remove dirs", make("remove dirs"));

        let mut mounts = CleanupStack::new();
        mounts.push("unmount /", make("unmount /"));
        mounts.push("unmount /x", make("unmount /x"));
        outer.append(mounts);

        outer.run().unwrap();
        assert_eq!(*log.lock(), vec!["unmount /x", "unmount /", "remove dirs"]);
    }

    #[test]
    fn drop_runs_pending_actions() {
        let (log, make) = recorder();
        {
            let mut stack = CleanupStack::new();
            stack.push("a", make("a"));
            stack.push("b", make("b"));
        }
        assert_eq!(*log.lock(), vec!["b", "a"]);
    }

    #[test]
    fn removal_of_missing_paths_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("scratch");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("nested/file"), b"x").unwrap();

        remove_dir_all(&dir).unwrap();
        assert!(!dir.exists());
        remove_dir_all(&dir).unwrap();
        remove_file(&tmp.path().join("missing.sock")).unwrap();
    }

    #[test]
    fn take_moves_ownership() {
        let (log, make) = recorder();
        let mut stack = CleanupStack::new();
        stack.push("a", make("a"));

        let mut taken = stack.take();
        assert!(stack.is_empty());
        drop(stack);
        assert!(log.lock().is_empty());

        taken.run().unwrap();
        assert_eq!(*log.lock(), vec!["a"]);
    }
}
