//! Desired state of an instance
//!
//! A manifest is decoded from YAML, JSON or TOML. Besides the core fields,
//! top-level sections named after a registered capability (`backup`,
//! `prometheus`, ...) are kept as opaque payloads and handed to that
//! capability for validation. Any other unknown key is rejected.

use crate::ctx::Ctx;
use crate::error::Error;
use crate::system::{self, InstanceId};
use anyhow::{Context, Result};
use declarative::{ChangeState, PresenceState};
use pgkit::{RoleSpec, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Absent,
    Stopped,
    #[default]
    Started,
    Restarted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceManifest {
    pub name: String,
    pub version: String,
    /// Shorthand for `configuration.port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub configuration: BTreeMap<String, Value>,
    #[serde(default)]
    pub state: InstanceState,
    /// Restart without asking when a change needs it
    #[serde(default)]
    pub restart_on_changes: bool,
    #[serde(default, skip_serializing)]
    pub surole_password: Option<String>,
    #[serde(default, skip_serializing)]
    pub replrole_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_checksums: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthManifest>,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub databases: Vec<Database>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<Standby>,
    /// Capability sections, keyed by capability manifest key
    #[serde(flatten)]
    pub capabilities: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthManifest {
    pub local: Option<String>,
    pub host: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Role {
    pub name: String,
    /// Set when the role is created; never compared afterwards
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub superuser: bool,
    #[serde(default)]
    pub replication: bool,
    #[serde(default)]
    pub connection_limit: Option<i32>,
    #[serde(default)]
    pub in_roles: Vec<String>,
    /// Record the password in the password file
    #[serde(default)]
    pub pgpass: bool,
    #[serde(default)]
    pub state: PresenceState,
}

impl Role {
    pub fn spec(&self) -> RoleSpec {
        RoleSpec {
            name: self.name.clone(),
            login: self.login,
            superuser: self.superuser,
            replication: self.replication,
            connection_limit: self.connection_limit,
            in_roles: self.in_roles.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Database {
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub state: PresenceState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandbyStatus {
    #[default]
    Demoted,
    Promoted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Standby {
    /// libpq connection string to the primary
    pub primary_conninfo: String,
    #[serde(default)]
    pub slot: Option<String>,
    /// Password of the replication role on the primary
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default)]
    pub status: StandbyStatus,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub change_state: Option<ChangeState>,
    pub pending_restart: bool,
}

// ============================================================================
// Extensions
// ============================================================================

/// An extension known to pgsteward
pub struct Extension {
    pub name: &'static str,
    /// Must be listed in `shared_preload_libraries`
    pub preload: bool,
    /// Installed with `CREATE EXTENSION`
    pub create: bool,
}

const fn ext(name: &'static str, preload: bool, create: bool) -> Extension {
    Extension {
        name,
        preload,
        create,
    }
}

pub const EXTENSIONS: &[Extension] = &[
    ext("auto_explain", true, false),
    ext("btree_gin", false, true),
    ext("btree_gist", false, true),
    ext("hypopg", false, true),
    ext("passwordcheck", true, false),
    ext("pg_qualstats", true, true),
    ext("pg_stat_kcache", true, true),
    ext("pg_stat_statements", true, true),
    ext("pg_trgm", false, true),
    ext("pgaudit", true, true),
    ext("plpgsql", false, true),
    ext("postgis", false, true),
    ext("powa", true, true),
    ext("unaccent", false, true),
];

pub fn extension(name: &str) -> Option<&'static Extension> {
    EXTENSIONS.iter().find(|e| e.name == name)
}

// ============================================================================
// Loading and validation
// ============================================================================

impl InstanceManifest {
    pub fn id(&self) -> InstanceId {
        InstanceId::new(self.name.clone(), self.version.clone())
    }

    /// Decode a manifest file, by extension: `.json`, `.toml`, else YAML
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let manifest = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(anyhow::Error::from),
            Some("toml") => toml::from_str(&content).map_err(anyhow::Error::from),
            _ => serde_yaml::from_str(&content).map_err(anyhow::Error::from),
        };
        manifest.with_context(|| format!("Invalid manifest {}", path.display()))
    }

    /// Port the instance should listen on
    pub fn effective_port(&self) -> Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        match self.configuration.get("port") {
            None => Ok(system::DEFAULT_PORT),
            Some(value) => value
                .as_int()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| Error::validation(format!("invalid port value: {value}")).into()),
        }
    }

    /// Payload of a capability section
    pub fn capability(&self, key: &str) -> Option<&serde_json::Value> {
        self.capabilities.get(key)
    }

    /// Check the manifest on its own, then capability sections against
    /// the registered capabilities
    pub fn validate(&self, ctx: &Ctx) -> Result<()> {
        self.id().validate()?;
        self.validate_configuration()?;
        for name in &self.extensions {
            if extension(name).is_none() {
                return Err(Error::validation(format!("unknown extension '{name}'")).into());
            }
        }
        for (key, payload) in &self.capabilities {
            let Some(module) = ctx.hooks.by_manifest_key(key) else {
                return Err(Error::validation(format!("unknown field '{key}'")).into());
            };
            module
                .validate_manifest(payload)
                .with_context(|| format!("invalid '{key}' section"))?;
        }
        Ok(())
    }

    fn validate_configuration(&self) -> Result<()> {
        if let Some(value) = self.configuration.get("port") {
            let port = value
                .as_int()
                .filter(|_| !value.is_str())
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    Error::validation(format!("'configuration.port' must be an integer: {value}"))
                })?;
            if let Some(explicit) = self.port
                && explicit != port
            {
                return Err(Error::validation(format!(
                    "'port' field and 'configuration.port' mismatch: {explicit} != {port}"
                ))
                .into());
            }
        }
        if let Some(value) = self.configuration.get("log_directory")
            && !value.is_str()
        {
            return Err(Error::validation(format!(
                "'configuration.log_directory' must be a string: {value}"
            ))
            .into());
        }
        Ok(())
    }

    /// Ports this manifest would bind, with what binds them
    pub fn ports(&self, ctx: &Ctx) -> Result<Vec<(String, u16)>> {
        let mut ports = vec![("postgresql".to_string(), self.effective_port()?)];
        for (owner, port) in ctx.hooks.ports(ctx, self)? {
            ports.push((owner, port));
        }
        Ok(ports)
    }
}

/// Check that a new instance does not reuse a port of another instance
pub fn validate_ports(ctx: &Ctx, manifest: &InstanceManifest) -> Result<()> {
    let wanted = manifest.ports(ctx)?;
    for instance in system::list(&ctx.settings, None)? {
        if instance.id == manifest.id() {
            continue;
        }
        let port = instance.configured_port()?;
        if let Some((owner, _)) = wanted.iter().find(|(_, p)| *p == port) {
            return Err(Error::validation(format!(
                "{owner} port {port} already used by instance {instance}"
            ))
            .into());
        }
    }
    let mut seen = BTreeMap::new();
    for (owner, port) in &wanted {
        if let Some(other) = seen.insert(*port, owner) {
            return Err(Error::validation(format!(
                "port {port} used by both {other} and {owner}"
            ))
            .into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use tempfile::TempDir;

    fn yaml(s: &str) -> InstanceManifest {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_decode_minimal() {
        let m = yaml("name: db1\nversion: '14'\n");
        assert_eq!(m.id(), InstanceId::new("db1", "14"));
        assert_eq!(m.state, InstanceState::Started);
        assert_eq!(m.effective_port().unwrap(), 5432);
        assert!(m.capabilities.is_empty());
    }

    #[test]
    fn test_decode_full() {
        let m = yaml(
            r"
name: app
version: '16'
state: stopped
configuration:
  port: 5433
  shared_buffers: 1GB
  log_connections: true
extensions: [pg_stat_statements]
roles:
  - name: alice
    login: true
    password: s3kret
  - name: bob
    state: absent
databases:
  - name: appdb
    owner: alice
standby:
  primary_conninfo: host=primary
  status: promoted
",
        );
        assert_eq!(m.state, InstanceState::Stopped);
        assert_eq!(m.configuration["port"], Value::Int(5433));
        assert_eq!(m.configuration["log_connections"], Value::Bool(true));
        assert_eq!(m.effective_port().unwrap(), 5433);
        assert_eq!(m.roles[0].password.as_deref(), Some("s3kret"));
        assert_eq!(m.roles[1].state, PresenceState::Absent);
        assert_eq!(m.databases[0].owner.as_deref(), Some("alice"));
        assert_eq!(m.standby.unwrap().status, StandbyStatus::Promoted);
    }

    #[test]
    fn test_passwords_not_serialized() {
        let mut m = yaml("name: db1\nversion: '14'\nsurole_password: x\n");
        m.roles.push(Role {
            name: "r".into(),
            password: Some("y".into()),
            ..Default::default()
        });
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("\"x\""));
        assert!(!json.contains("\"y\""));
    }

    #[test]
    fn test_validate_port_mismatch() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let m = yaml("name: db1\nversion: '14'\nport: 5433\nconfiguration:\n  port: 5434\n");
        let err = m.validate(&ctx).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
        assert!(err.to_string().contains("mismatch"));

        let m = yaml("name: db1\nversion: '14'\nport: 5433\nconfiguration:\n  port: 5433\n");
        m.validate(&ctx).unwrap();
    }

    #[test]
    fn test_validate_configuration_types() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let m = yaml("name: db1\nversion: '14'\nconfiguration:\n  port: '5433'\n");
        assert!(m.validate(&ctx).is_err());
        let m = yaml("name: db1\nversion: '14'\nconfiguration:\n  log_directory: 12\n");
        assert!(m.validate(&ctx).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_sections() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let m = yaml("name: db1\nversion: '14'\nfoo: {}\n");
        let err = m.validate(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "invalid manifest: unknown field 'foo'");

        let m = yaml("name: db1\nversion: '14'\nextensions: [nope]\n");
        assert!(m.validate(&ctx).is_err());
    }

    #[test]
    fn test_validate_ports_conflict() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let datadir = ctx.settings.datadir("16", "other");
        fs::create_dir_all(&datadir).unwrap();
        fs::write(datadir.join("postgresql.conf"), "port = 5433\n").unwrap();

        let m = yaml("name: db1\nversion: '14'\nport: 5433\n");
        let err = validate_ports(&ctx, &m).unwrap_err();
        assert!(err.to_string().contains("already used by instance 16/other"));

        let m = yaml("name: db1\nversion: '14'\nport: 5434\n");
        validate_ports(&ctx, &m).unwrap();
    }
}
