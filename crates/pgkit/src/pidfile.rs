//! `postmaster.pid` parsing.
//!
//! The server writes this file on startup. Its port line reflects the port
//! the running server actually listens on, which may differ from
//! `postgresql.conf` once the file was edited without a restart.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Contents of a `postmaster.pid` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostmasterPid {
    pub pid: u32,
    pub datadir: PathBuf,
    /// Start time, seconds since the epoch
    pub start_time: i64,
    pub port: u16,
    pub socket_dir: Option<PathBuf>,
    /// Postmaster status line (`starting`, `ready`, ...) when present
    pub status: Option<String>,
}

impl PostmasterPid {
    /// Path of the file in `datadir`.
    pub fn path(datadir: &Path) -> PathBuf {
        datadir.join("postmaster.pid")
    }

    /// Read the file from `datadir`; `None` when the server is not running.
    pub fn read(datadir: &Path) -> Result<Option<Self>> {
        let path = Self::path(datadir);
        match std::fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content, &path).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Parse file content; `path` is only used in errors.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let lines: Vec<&str> = content.lines().map(str::trim).collect();
        let field = |idx: usize, what: &str| field(&lines, idx, what, path);
        let invalid = |idx: usize, what: &str, value: &str| Error::ConfigParse {
            path: path.to_path_buf(),
            line: idx + 1,
            message: format!("invalid {what}: {value:?}"),
        };

        let pid = field(0, "pid")?;
        let pid = pid.parse().map_err(|_| invalid(0, "pid", pid))?;
        let datadir = PathBuf::from(field(1, "data directory")?);
        let start = field(2, "start time")?;
        let start_time = start.parse().map_err(|_| invalid(2, "start time", start))?;
        let port = field(3, "port")?;
        let port = port.parse().map_err(|_| invalid(3, "port", port))?;
        let socket_dir = lines
            .get(4)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let status = lines
            .get(7)
            .filter(|s| !s.is_empty())
            .map(|s| (*s).to_string());

        Ok(Self {
            pid,
            datadir,
            start_time,
            port,
            socket_dir,
            status,
        })
    }

    /// Render in the server's layout (used by tools that fake a server).
    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n*\n0\n{}\n",
            self.pid,
            self.datadir.display(),
            self.start_time,
            self.port,
            self.socket_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            self.status.as_deref().unwrap_or("ready"),
        )
    }
}

fn field<'a>(lines: &[&'a str], idx: usize, what: &str, path: &Path) -> Result<&'a str> {
    lines.get(idx).copied().ok_or_else(|| Error::ConfigParse {
        path: path.to_path_buf(),
        line: idx + 1,
        message: format!("missing {what}"),
    })
}
