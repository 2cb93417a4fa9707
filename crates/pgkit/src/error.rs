//! Error types for PostgreSQL server control.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while driving PostgreSQL binaries or reading
/// their files.
#[derive(Debug, Error)]
pub enum Error {
    /// An external command exited with a non-zero status
    #[error("command failed (exit code {exit_code}): {}\n{}", args.join(" "), stderr.trim())]
    Command {
        /// Exit status, -1 when the process was killed by a signal
        exit_code: i32,
        /// Program and arguments
        args: Vec<String>,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// A configuration file could not be parsed
    #[error("{}:{line}: {message}", path.display())]
    ConfigParse {
        /// File being parsed
        path: PathBuf,
        /// Line number (1-indexed)
        line: usize,
        /// Description of the syntax error
        message: String,
    },

    /// A program produced output that could not be interpreted
    #[error("unexpected output from {program}: {output}")]
    UnexpectedOutput {
        /// Program that produced the output
        program: String,
        /// The offending output
        output: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Exit code of a failed command, if this is a command error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Command { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Result type alias for pgkit operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_display() {
        let err = Error::Command {
            exit_code: 1,
            args: vec!["pg_ctl".into(), "start".into()],
            stdout: String::new(),
            stderr: "could not start server\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("pg_ctl start"));
        assert!(msg.contains("could not start server"));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_config_parse_display() {
        let err = Error::ConfigParse {
            path: PathBuf::from("/srv/pg/postgresql.conf"),
            line: 3,
            message: "missing value".into(),
        };
        assert_eq!(err.to_string(), "/srv/pg/postgresql.conf:3: missing value");
        assert_eq!(err.exit_code(), None);
    }
}
