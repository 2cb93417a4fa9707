//! Revertible tasks grouped into a transaction
//!
//! A [`Transaction`] records every successfully completed task together with
//! the action that undoes it. When a later step fails, the recorded reverts
//! run most-recent first. Reverting is best effort: a failing revert is
//! logged as [`TaskError::RevertFailed`] and unwinding carries on, so the
//! error surfaced to the caller is always the original one.

use anyhow::Result;
use thiserror::Error;

/// Errors produced by the task framework
#[derive(Debug, Error)]
pub enum TaskError {
    /// A forward action failed
    ///
    /// Attached as context on top of the original error, which remains
    /// reachable with `anyhow::Error::downcast_ref`.
    #[error("{description} failed")]
    OperationFailed {
        /// Description of the task that failed
        description: String,
    },

    /// A revert action failed while unwinding
    #[error("reverting '{description}' failed: {cause}")]
    RevertFailed {
        /// Description of the task being reverted
        description: String,
        /// Rendering of the revert error
        cause: String,
    },
}

type Revert<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

struct Entry<'a> {
    description: String,
    revert: Revert<'a>,
}

/// An in-memory stack of completed tasks and their compensating actions
///
/// Dropping a transaction discards its log without reverting anything; use
/// [`transaction`] to get automatic unwinding on error.
#[derive(Default)]
pub struct Transaction<'a> {
    log: Vec<Entry<'a>>,
}

impl<'a> Transaction<'a> {
    /// Create an empty transaction
    pub fn new() -> Self {
        Self { log: Vec::new() }
    }

    /// Run `forward` and, if it succeeds, record `revert` for later unwinding
    ///
    /// On failure nothing is recorded and the error is returned with a
    /// [`TaskError::OperationFailed`] context naming `description`.
    pub fn run<T, F, R>(
        &mut self,
        description: impl Into<String>,
        forward: F,
        revert: R,
    ) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
        R: FnOnce() -> Result<()> + 'a,
    {
        let description = description.into();
        log::info!("{description}");
        match forward() {
            Ok(value) => {
                self.log.push(Entry {
                    description,
                    revert: Box::new(revert),
                });
                Ok(value)
            }
            Err(e) => Err(e.context(TaskError::OperationFailed { description })),
        }
    }

    /// Number of recorded tasks
    pub fn len(&self) -> usize {
        self.log.len()
    }

    /// Whether no task has been recorded
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Forget all recorded tasks
    pub fn commit(mut self) {
        self.log.clear();
    }

    /// Invoke every recorded revert, most recent first
    ///
    /// Returns the revert failures, which have already been logged.
    pub fn rollback(&mut self) -> Vec<TaskError> {
        let mut failures = Vec::new();
        while let Some(entry) = self.log.pop() {
            log::warn!("reverting: {}", entry.description);
            if let Err(e) = (entry.revert)() {
                let err = TaskError::RevertFailed {
                    description: entry.description,
                    cause: format!("{e:#}"),
                };
                log::error!("{err}");
                failures.push(err);
            }
        }
        failures
    }
}

/// Run `f` within a transaction boundary
///
/// If `f` fails, every task recorded in the transaction is reverted before
/// the error is returned.
pub fn transaction<'a, T>(f: impl FnOnce(&mut Transaction<'a>) -> Result<T>) -> Result<T> {
    let mut tx = Transaction::new();
    match f(&mut tx) {
        Ok(value) => {
            tx.commit();
            Ok(value)
        }
        Err(e) => {
            tx.rollback();
            Err(e)
        }
    }
}
