//! Core types for PostgreSQL server control.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Status of a PostgreSQL server, as reported by `pg_ctl status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The server is running
    Running,
    /// The server is not running
    NotRunning,
    /// The data directory is missing or invalid
    Unspecified,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::NotRunning => "not running",
            Self::Unspecified => "unspecified datadir",
        })
    }
}

/// Shutdown mode passed to `pg_ctl stop -m`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Wait for clients to disconnect
    Smart,
    /// Roll back transactions and disconnect clients
    #[default]
    Fast,
    /// Abort without a clean shutdown
    Immediate,
}

impl StopMode {
    /// Value for `pg_ctl -m`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Fast => "fast",
            Self::Immediate => "immediate",
        }
    }
}

impl FromStr for StopMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smart" => Ok(Self::Smart),
            "fast" => Ok(Self::Fast),
            "immediate" => Ok(Self::Immediate),
            other => Err(format!("invalid stop mode: {other}")),
        }
    }
}

/// A row of `pg_settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub name: String,
    pub setting: String,
    /// When the parameter can be changed (`postmaster`, `sighup`, `user`, ...)
    pub context: String,
    /// Set by the server when a changed value awaits a restart
    pub pending_restart: bool,
}

impl Setting {
    /// Whether changing this parameter only takes effect after a restart.
    pub fn requires_restart(&self) -> bool {
        matches!(self.context.as_str(), "postmaster" | "internal")
    }
}

/// Location of, and connection parameters for, a PostgreSQL cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Major version, e.g. `16`
    pub version: String,
    /// Directory holding `pg_ctl`, `initdb`, `psql`, ...
    pub bindir: PathBuf,
    pub datadir: PathBuf,
    pub waldir: PathBuf,
    /// Port to connect to; the live port while the server runs
    pub port: u16,
    pub socket_dir: PathBuf,
    /// Super-user role name
    pub user: String,
    pub password: Option<String>,
}

impl Cluster {
    /// Path of a server binary.
    pub fn bin(&self, program: &str) -> PathBuf {
        self.bindir.join(program)
    }
}

/// Options for `initdb`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitdbOptions {
    pub locale: Option<String>,
    pub encoding: Option<String>,
    pub data_checksums: bool,
    /// Authentication method for local connections
    pub auth_local: String,
    /// Authentication method for host connections
    pub auth_host: String,
    /// Super-user password
    pub password: Option<String>,
}

/// Where a standby replicates from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSource {
    /// libpq connection string to the primary
    pub primary_conninfo: String,
    /// Physical replication slot on the primary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    /// Password of the replication role
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

/// A database role as seen by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub name: String,
    pub login: bool,
    pub superuser: bool,
    pub replication: bool,
    /// `None` means no limit
    pub connection_limit: Option<i32>,
    /// Roles this role is a member of
    pub in_roles: Vec<String>,
    /// Only used when creating; never read back
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

impl RoleSpec {
    /// Attributes that can be compared with what the server reports.
    pub fn same_attributes(&self, other: &Self) -> bool {
        let mut a = self.in_roles.clone();
        let mut b = other.in_roles.clone();
        a.sort();
        b.sort();
        self.login == other.login
            && self.superuser == other.superuser
            && self.replication == other.replication
            && self.connection_limit == other.connection_limit
            && a == b
    }
}

/// A database as seen by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSpec {
    pub name: String,
    pub owner: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_restart() {
        let mut s = Setting {
            name: "port".into(),
            setting: "5432".into(),
            context: "postmaster".into(),
            pending_restart: false,
        };
        assert!(s.requires_restart());
        s.context = "sighup".into();
        assert!(!s.requires_restart());
    }

    #[test]
    fn test_stop_mode() {
        assert_eq!("Immediate".parse::<StopMode>().unwrap(), StopMode::Immediate);
        assert!("slow".parse::<StopMode>().is_err());
        assert_eq!(StopMode::default().as_str(), "fast");
    }

    #[test]
    fn test_role_attributes_ignore_membership_order_and_password() {
        let a = RoleSpec {
            name: "app".into(),
            login: true,
            in_roles: vec!["r1".into(), "r2".into()],
            password: Some("secret".into()),
            ..Default::default()
        };
        let b = RoleSpec {
            name: "app".into(),
            login: true,
            in_roles: vec!["r2".into(), "r1".into()],
            ..Default::default()
        };
        assert!(a.same_attributes(&b));
        let c = RoleSpec {
            superuser: true,
            ..b.clone()
        };
        assert!(!a.same_attributes(&c));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::NotRunning.to_string(), "not running");
        assert_eq!(
            serde_json::to_string(&Status::Unspecified).unwrap(),
            "\"unspecified\""
        );
    }
}
