//! Instances as found on disk
//!
//! An instance is identified by `(name, version)`, which also fixes its
//! location: `<root>/<version>/<name>/{data,wal}`. An instance exists iff its
//! data directory exists. Nothing here is cached: every accessor re-reads
//! the files it depends on.

use crate::error::Error;
use crate::settings::Settings;
use anyhow::{Context, Result};
use pgkit::conf::{self, ConfigFile};
use pgkit::{Cluster, PostmasterPid};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Port PostgreSQL listens on when `port` is not configured
pub const DEFAULT_PORT: u16 = 5432;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:(?<version>\d+)[/-])?(?<name>\w+)$").expect("valid regex"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));
static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("valid regex"));

// ============================================================================
// Identity
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId {
    pub version: String,
    pub name: String,
}

impl InstanceId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// `<version>-<name>`, used for file and service names
    pub fn qualname(&self) -> String {
        format!("{}-{}", self.version, self.name)
    }

    /// Parse `[VERSION/]NAME` or `VERSION-NAME`
    pub fn parse(spec: &str, default_version: &str) -> Result<Self> {
        let id = match ID_RE.captures(spec) {
            Some(caps) => Self::new(
                &caps["name"],
                caps.name("version").map_or(default_version, |v| v.as_str()),
            ),
            None => Self::new(spec, default_version),
        };
        id.validate()?;
        Ok(id)
    }

    pub fn validate(&self) -> Result<()> {
        if !NAME_RE.is_match(&self.name) {
            return Err(Error::validation(format!(
                "invalid instance name '{}': only letters, digits and '_' are allowed",
                self.name
            ))
            .into());
        }
        if !VERSION_RE.is_match(&self.version) {
            return Err(Error::validation(format!(
                "invalid PostgreSQL version '{}'",
                self.version
            ))
            .into());
        }
        Ok(())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.version, self.name)
    }
}

// ============================================================================
// Instance
// ============================================================================

/// Replication settings found in a standby's data directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandbyInfo {
    pub primary_conninfo: Option<String>,
    pub slot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    pub datadir: PathBuf,
    pub waldir: PathBuf,
    pub bindir: PathBuf,
    socket_dir: PathBuf,
    surole: String,
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

impl Instance {
    /// Locate `id` without checking that it exists
    pub fn new(settings: &Settings, id: InstanceId) -> Self {
        Self {
            datadir: settings.datadir(&id.version, &id.name),
            waldir: settings.waldir(&id.version, &id.name),
            bindir: settings.bindir(&id.version),
            socket_dir: settings.socket_directory(),
            surole: settings.postgresql.surole.name.clone(),
            id,
        }
    }

    /// Locate an existing instance
    pub fn system_lookup(settings: &Settings, id: InstanceId) -> Result<Self> {
        let instance = Self::new(settings, id);
        if !instance.exists() {
            return Err(Error::InstanceNotFound(instance.id.to_string()).into());
        }
        Ok(instance)
    }

    pub fn exists(&self) -> bool {
        self.datadir.is_dir()
    }

    /// Directory holding the data and WAL directories
    pub fn path(&self) -> &Path {
        self.datadir.parent().unwrap_or(&self.datadir)
    }

    pub fn psqlrc(&self) -> PathBuf {
        self.path().join(".psqlrc")
    }

    pub fn psql_history(&self) -> PathBuf {
        self.path().join(".psql_history")
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn config_path(&self) -> PathBuf {
        conf::config_path(&self.datadir)
    }

    /// Parsed `postgresql.conf`, empty if the file does not exist yet
    pub fn config(&self) -> Result<ConfigFile> {
        let path = self.config_path();
        if !path.exists() {
            return Ok(ConfigFile::default());
        }
        Ok(ConfigFile::load(&path)?)
    }

    /// Port set in `postgresql.conf`
    pub fn configured_port(&self) -> Result<u16> {
        port_of(&self.config()?)
    }

    /// Replication settings if the instance is a standby
    pub fn standby(&self) -> Result<Option<StandbyInfo>> {
        if !self.datadir.join("standby.signal").exists() {
            return Ok(None);
        }
        let mut entries = self.config()?.entries();
        let auto = self.datadir.join("postgresql.auto.conf");
        if auto.exists() {
            entries.extend(ConfigFile::load(&auto)?.entries());
        }
        Ok(Some(StandbyInfo {
            primary_conninfo: entries.get("primary_conninfo").map(|v| v.as_text()),
            slot: entries.get("primary_slot_name").map(|v| v.as_text()),
        }))
    }

    pub fn is_standby(&self) -> bool {
        self.datadir.join("standby.signal").exists()
    }

    /// Connection parameters for the server
    ///
    /// While the server runs, its port comes from `postmaster.pid` so that
    /// a port changed on disk but not yet applied does not hide the live
    /// server.
    pub fn cluster(&self) -> Result<Cluster> {
        let port = match PostmasterPid::read(&self.datadir)? {
            Some(pid) => pid.port,
            None => self.configured_port()?,
        };
        Ok(Cluster {
            version: self.id.version.clone(),
            bindir: self.bindir.clone(),
            datadir: self.datadir.clone(),
            waldir: self.waldir.clone(),
            port,
            socket_dir: self.socket_dir.clone(),
            user: self.surole.clone(),
            password: None,
        })
    }
}

/// Port configured in `config`, or the server default
pub fn port_of(config: &ConfigFile) -> Result<u16> {
    match config.get("port") {
        None => Ok(DEFAULT_PORT),
        Some(value) => value
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .with_context(|| format!("invalid port value: {value}")),
    }
}

/// Instances found under the instances root, optionally for one version
pub fn list(settings: &Settings, version: Option<&str>) -> Result<Vec<Instance>> {
    let root = settings.pgroot();
    let mut instances = Vec::new();
    if !root.is_dir() {
        return Ok(instances);
    }
    let versions: Vec<String> = match version {
        Some(v) => vec![v.to_string()],
        None => subdirs(&root)?,
    };
    for v in versions {
        let vdir = root.join(&v);
        if !vdir.is_dir() {
            continue;
        }
        for name in subdirs(&vdir)? {
            let id = InstanceId::new(name, v.clone());
            if id.validate().is_err() {
                log::debug!("skipping {}", vdir.join(&id.name).display());
                continue;
            }
            let instance = Instance::new(settings, id);
            if instance.exists() {
                instances.push(instance);
            }
        }
    }
    instances.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(instances)
}

fn subdirs(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Could not read {}", dir.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
