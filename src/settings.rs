//! Site settings for pgsteward
//!
//! Settings describe *where* instances live and *which* capabilities are
//! available on this host. They are read once at startup from a TOML file.
//!
//! # Resolution
//!
//! 1. `PGSTEWARD_SETTINGS` environment variable (path to a TOML file)
//! 2. `<config_dir>/pgsteward/settings.toml` if it exists
//! 3. Built-in defaults
//!
//! Paths accept `~` and `$VAR` expansion.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at a settings file
pub const ENV_SETTINGS: &str = "PGSTEWARD_SETTINGS";

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(path).as_ref()),
    }
}

fn default_prefix() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("pgsteward"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/pgsteward"))
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Base directory for everything pgsteward writes
    pub prefix: PathBuf,
    pub postgresql: PostgreSQLSettings,
    /// Service manager driving instance processes; direct control when unset
    pub service_manager: Option<ServiceManager>,
    pub systemd: SystemdSettings,
    pub backup: Option<BackupSettings>,
    pub prometheus: Option<PrometheusSettings>,
    /// Seconds to wait for a started server to accept connections
    pub ready_timeout: u64,
    /// Seconds to wait for a server to stop
    pub stop_timeout: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self::for_prefix(&default_prefix())
    }
}

impl Settings {
    /// Defaults with every path rooted at `prefix`
    pub fn for_prefix(prefix: &Path) -> Self {
        Self {
            prefix: prefix.to_path_buf(),
            postgresql: PostgreSQLSettings::default(),
            service_manager: None,
            systemd: SystemdSettings::default(),
            backup: None,
            prometheus: None,
            ready_timeout: 10,
            stop_timeout: 10,
        }
    }

    /// Load settings following the resolution order
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var(ENV_SETTINGS) {
            let path = expand_path(&path);
            log::debug!("Using settings from {}: {}", ENV_SETTINGS, path.display());
            return Self::from_file(&path);
        }
        if let Some(dir) = dirs::config_dir() {
            let path = dir.join("pgsteward").join("settings.toml");
            if path.exists() {
                log::debug!("Using settings from {}", path.display());
                return Self::from_file(&path);
            }
        }
        log::debug!("No settings file, using defaults");
        Ok(Self::default())
    }

    /// Load settings from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    /// Parse settings from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut settings: Self = toml::from_str(content)?;
        settings.expand();
        Ok(settings)
    }

    fn expand(&mut self) {
        let expand = |p: &mut PathBuf| *p = expand_path(&p.to_string_lossy());
        expand(&mut self.prefix);
        for p in [
            &mut self.postgresql.root,
            &mut self.postgresql.socket_directory,
            &mut self.systemd.unit_dir,
        ]
        .into_iter()
        .flatten()
        {
            expand(p);
        }
        if let Some(passfile) = self.postgresql.auth.passfile.as_mut() {
            expand(passfile);
        }
        if let Some(backup) = self.backup.as_mut() {
            for p in [&mut backup.config_dir, &mut backup.repository]
                .into_iter()
                .flatten()
            {
                expand(p);
            }
        }
        if let Some(prometheus) = self.prometheus.as_mut()
            && let Some(dir) = prometheus.config_dir.as_mut()
        {
            expand(dir);
        }
    }

    /// Root under which `<version>/<name>` instance directories live
    pub fn pgroot(&self) -> PathBuf {
        self.postgresql
            .root
            .clone()
            .unwrap_or_else(|| self.prefix.join("srv").join("pgsql"))
    }

    /// Directory holding one instance's files
    pub fn instance_dir(&self, version: &str, name: &str) -> PathBuf {
        self.pgroot().join(version).join(name)
    }

    pub fn datadir(&self, version: &str, name: &str) -> PathBuf {
        self.instance_dir(version, name).join("data")
    }

    pub fn waldir(&self, version: &str, name: &str) -> PathBuf {
        self.instance_dir(version, name).join("wal")
    }

    /// Directory of server binaries for `version`
    pub fn bindir(&self, version: &str) -> PathBuf {
        expand_path(&self.postgresql.bindir.replace("{version}", version))
    }

    pub fn socket_directory(&self) -> PathBuf {
        self.postgresql
            .socket_directory
            .clone()
            .unwrap_or_else(|| self.prefix.join("run").join("postgresql"))
    }

    /// Runtime directory for pid files of auxiliary processes
    pub fn run_dir(&self) -> PathBuf {
        self.prefix.join("run")
    }

    /// Directory for logs of auxiliary processes
    pub fn log_dir(&self) -> PathBuf {
        self.prefix.join("log")
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgreSQLSettings {
    /// Instances root; `<prefix>/srv/pgsql` when unset
    pub root: Option<PathBuf>,
    /// Binaries directory template, `{version}` is substituted
    pub bindir: String,
    pub default_version: String,
    /// `<prefix>/run/postgresql` when unset
    pub socket_directory: Option<PathBuf>,
    pub surole: SuRole,
    /// Name of the role used by standbys to stream WAL
    pub replrole: String,
    pub auth: AuthSettings,
    pub initdb: InitdbSettings,
}

impl Default for PostgreSQLSettings {
    fn default() -> Self {
        Self {
            root: None,
            bindir: "/usr/lib/postgresql/{version}/bin".to_string(),
            default_version: "16".to_string(),
            socket_directory: None,
            surole: SuRole::default(),
            replrole: "replication".to_string(),
            auth: AuthSettings::default(),
            initdb: InitdbSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuRole {
    pub name: String,
    /// Record the super-user password in the password file
    pub pgpass: bool,
}

impl Default for SuRole {
    fn default() -> Self {
        Self {
            name: "postgres".to_string(),
            pgpass: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    /// Method for local (socket) connections
    pub local: String,
    /// Method for TCP connections
    pub host: String,
    /// libpq password file maintained for managed roles
    pub passfile: Option<PathBuf>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            local: "trust".to_string(),
            host: "scram-sha-256".to_string(),
            passfile: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitdbSettings {
    pub locale: Option<String>,
    pub encoding: Option<String>,
    pub data_checksums: bool,
}

// ============================================================================
// Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    Systemd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemdSettings {
    /// `~/.config/systemd/user` when unset
    pub unit_dir: Option<PathBuf>,
    pub systemctl: String,
    /// Operate on the user service manager
    pub user: bool,
}

impl Default for SystemdSettings {
    fn default() -> Self {
        Self {
            unit_dir: None,
            systemctl: "systemctl".to_string(),
            user: true,
        }
    }
}

impl SystemdSettings {
    pub fn unit_dir(&self) -> PathBuf {
        self.unit_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/etc"))
                .join("systemd")
                .join("user")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSettings {
    #[serde(default = "default_pgbackrest")]
    pub execpath: PathBuf,
    /// `<prefix>/etc/pgbackrest` when unset
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    /// `<prefix>/srv/pgbackrest` when unset
    #[serde(default)]
    pub repository: Option<PathBuf>,
}

fn default_pgbackrest() -> PathBuf {
    PathBuf::from("/usr/bin/pgbackrest")
}

impl BackupSettings {
    pub fn config_dir(&self, prefix: &Path) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| prefix.join("etc").join("pgbackrest"))
    }

    pub fn repository(&self, prefix: &Path) -> PathBuf {
        self.repository
            .clone()
            .unwrap_or_else(|| prefix.join("srv").join("pgbackrest"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusSettings {
    #[serde(default = "default_exporter")]
    pub execpath: PathBuf,
    /// `<prefix>/etc/prometheus` when unset
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
}

fn default_exporter() -> PathBuf {
    PathBuf::from("/usr/bin/prometheus-postgres-exporter")
}

impl PrometheusSettings {
    pub fn config_dir(&self, prefix: &Path) -> PathBuf {
        self.config_dir
            .clone()
            .unwrap_or_else(|| prefix.join("etc").join("prometheus"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_rooted_at_prefix() {
        let s = Settings::for_prefix(Path::new("/tmp/pfx"));
        assert_eq!(s.datadir("16", "main"), PathBuf::from("/tmp/pfx/srv/pgsql/16/main/data"));
        assert_eq!(s.waldir("16", "main"), PathBuf::from("/tmp/pfx/srv/pgsql/16/main/wal"));
        assert_eq!(s.socket_directory(), PathBuf::from("/tmp/pfx/run/postgresql"));
        assert_eq!(s.bindir("14"), PathBuf::from("/usr/lib/postgresql/14/bin"));
        assert_eq!(s.ready_timeout(), Duration::from_secs(10));
        assert!(s.service_manager.is_none());
    }

    #[test]
    fn test_from_toml() {
        let s = Settings::from_toml(
            r#"
            prefix = "/opt/pg"
            service_manager = "systemd"
            ready_timeout = 3

            [postgresql]
            root = "/data/pgsql"
            default_version = "15"

            [postgresql.auth]
            passfile = "/opt/pg/.pgpass"

            [backup]
            execpath = "/usr/local/bin/pgbackrest"
            "#,
        )
        .unwrap();
        assert_eq!(s.pgroot(), PathBuf::from("/data/pgsql"));
        assert_eq!(s.postgresql.default_version, "15");
        assert_eq!(s.service_manager, Some(ServiceManager::Systemd));
        assert_eq!(s.ready_timeout(), Duration::from_secs(3));
        assert_eq!(s.stop_timeout(), Duration::from_secs(10));
        assert_eq!(s.postgresql.surole.name, "postgres");
        let backup = s.backup.unwrap();
        assert_eq!(
            backup.repository(&s.prefix),
            PathBuf::from("/opt/pg/srv/pgbackrest")
        );
        assert!(s.prometheus.is_none());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Settings::from_toml("prefx = \"/x\"").is_err());
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/pg");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
