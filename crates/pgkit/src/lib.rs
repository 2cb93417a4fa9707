//! # pgkit
//!
//! PostgreSQL server control for operators.
//!
//! This crate provides:
//! - A replaceable process boundary ([`Runner`]) with a `std::process`
//!   implementation
//! - Line-preserving `postgresql.conf` editing ([`conf::ConfigFile`])
//! - `postmaster.pid` parsing, to address the live server
//! - The [`Backend`] trait and its `pg_ctl`/`psql` implementation
//!
//! ## Example
//!
//! ```no_run
//! use pgkit::{Backend, Cluster, PgCtlBackend, SystemRunner};
//! use std::sync::Arc;
//!
//! let backend = PgCtlBackend::new(Arc::new(SystemRunner));
//! let cluster = Cluster {
//!     version: "16".into(),
//!     bindir: "/usr/lib/postgresql/16/bin".into(),
//!     datadir: "/srv/pgsql/16/main/data".into(),
//!     waldir: "/srv/pgsql/16/main/wal".into(),
//!     port: 5432,
//!     socket_dir: "/run/postgresql".into(),
//!     user: "postgres".into(),
//!     password: None,
//! };
//! println!("{}", backend.status(&cluster).unwrap());
//! ```

pub mod backend;
pub mod cmd;
pub mod conf;
pub mod error;
pub mod pidfile;
pub mod process;
pub mod types;

pub use backend::Backend;
pub use backend::pgctl::PgCtlBackend;
pub use cmd::{Cmd, CommandOutput, Runner, SystemRunner};
pub use conf::{ConfigFile, Value};
pub use error::{Error, Result};
pub use pidfile::PostmasterPid;
pub use types::{
    Cluster, DatabaseSpec, InitdbOptions, ReplicationSource, RoleSpec, Setting, Status, StopMode,
};
