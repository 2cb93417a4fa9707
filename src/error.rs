//! Error categories surfaced by instance operations
//!
//! Operations return `anyhow::Result`; these variants are the typed root
//! causes callers can recover with `downcast_ref`. Command failures come
//! from [`pgkit::Error`] and transaction wrapping from
//! [`declarative::TaskError`].

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or contradictory manifest; nothing was changed
    #[error("invalid manifest: {0}")]
    Validation(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("instance '{0}' already exists")]
    InstanceAlreadyExists(String),

    /// Operation attempted in the wrong lifecycle state
    #[error("instance {instance}: {message}")]
    InstanceState { instance: String, message: String },

    #[error("instance {instance} not ready after {}s", timeout.as_secs())]
    InstanceNotReady { instance: String, timeout: Duration },

    #[error("instance {instance} still running after {}s", timeout.as_secs())]
    InstanceStillRunning { instance: String, timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn state(instance: impl ToString, message: impl Into<String>) -> Self {
        Self::InstanceState {
            instance: instance.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::InstanceNotReady {
            instance: "16/main".into(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "instance 16/main not ready after 10s");
        assert_eq!(
            Error::state("16/main", "not a standby").to_string(),
            "instance 16/main: not a standby"
        );
    }

    #[test]
    fn test_downcast_through_context() {
        use anyhow::Context;
        let result: anyhow::Result<()> =
            Err(Error::InstanceNotFound("14/db1".into())).context("get instance");
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InstanceNotFound(name)) if name == "14/db1"
        ));
    }
}
