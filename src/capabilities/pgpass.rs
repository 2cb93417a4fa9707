//! libpq password file maintenance
//!
//! Entries are `*:<port>:*:<role>:<password>`, one per role and instance
//! port. Lines this module does not own are left untouched.

use crate::ctx::Ctx;
use crate::hooks::CapabilityModule;
use crate::manifest::Role;
use crate::system::Instance;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

pub struct PassFile {
    path: PathBuf,
}

/// A parsed password file line
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    host: String,
    port: String,
    database: String,
    username: String,
    password: String,
}

impl Entry {
    fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let mut fields = split_fields(trimmed).into_iter();
        Some(Self {
            host: fields.next()?,
            port: fields.next()?,
            database: fields.next()?,
            username: fields.next()?,
            password: fields.next()?,
        })
    }

    fn render(&self) -> String {
        [
            &self.host,
            &self.port,
            &self.database,
            &self.username,
            &self.password,
        ]
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(":")
    }

    fn owned_by(&self, port: u16, username: &str) -> bool {
        self.host == "*" && self.database == "*" && self.port == port.to_string() && self.username == username
    }
}

/// Split on unescaped `:`, unescaping `\:` and `\\`
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next()
                    && let Some(field) = fields.last_mut()
                {
                    field.push(next);
                }
            }
            ':' => fields.push(String::new()),
            c => {
                if let Some(field) = fields.last_mut() {
                    field.push(c);
                }
            }
        }
    }
    fields
}

fn escape(field: &str) -> String {
    field.replace('\\', r"\\").replace(':', r"\:")
}

impl PassFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    fn lines(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Could not read {}", self.path.display()))?;
        Ok(content.lines().map(String::from).collect())
    }

    fn save(&self, lines: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .with_context(|| format!("Could not write {}", self.path.display()))?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Add or update the entry of `username` on `port`; `true` if the file
    /// changed
    fn set(&self, port: u16, username: &str, password: &str) -> Result<bool> {
        let wanted = Entry {
            host: "*".to_string(),
            port: port.to_string(),
            database: "*".to_string(),
            username: username.to_string(),
            password: password.to_string(),
        };
        let mut lines = self.lines()?;
        let existing = lines
            .iter()
            .position(|l| Entry::parse(l).is_some_and(|e| e.owned_by(port, username)));
        match existing {
            Some(i) if Entry::parse(&lines[i]).as_ref() == Some(&wanted) => return Ok(false),
            Some(i) => lines[i] = wanted.render(),
            None => lines.push(wanted.render()),
        }
        log::info!("updating password file entry for role '{username}' on port {port}");
        self.save(&lines)?;
        Ok(true)
    }

    /// Remove the entry of `username` on `port`
    fn remove(&self, port: u16, username: &str) -> Result<()> {
        let mut lines = self.lines()?;
        let before = lines.len();
        lines.retain(|l| !Entry::parse(l).is_some_and(|e| e.owned_by(port, username)));
        if lines.len() != before {
            log::info!("removing password file entry for role '{username}' on port {port}");
            self.save(&lines)?;
        }
        Ok(())
    }

    /// Entries by role name for `port`
    fn entries(&self, port: u16) -> Result<BTreeMap<String, String>> {
        Ok(self
            .lines()?
            .iter()
            .filter_map(|l| Entry::parse(l))
            .filter(|e| e.port == port.to_string() && e.host == "*" && e.database == "*")
            .map(|e| (e.username, e.password))
            .collect())
    }
}

impl CapabilityModule for PassFile {
    fn name(&self) -> &'static str {
        "pgpass"
    }

    fn role_changed(&self, _ctx: &Ctx, instance: &Instance, role: &Role) -> Result<bool> {
        let port = instance.configured_port()?;
        match (&role.password, role.pgpass) {
            (Some(password), true) => self.set(port, &role.name, password),
            (_, false) => {
                self.remove(port, &role.name)?;
                Ok(false)
            }
            (None, true) => Ok(false),
        }
    }

    fn rolenames(&self, _ctx: &Ctx, instance: &Instance) -> Result<Option<Vec<String>>> {
        let port = instance.configured_port()?;
        Ok(Some(self.entries(port)?.into_keys().collect()))
    }

    fn role_dropped(&self, _ctx: &Ctx, instance: &Instance, rolename: &str) -> Result<()> {
        self.remove(instance.configured_port()?, rolename)
    }

    fn instance_env(&self, _ctx: &Ctx, _instance: &Instance) -> Result<Option<BTreeMap<String, String>>> {
        Ok(Some(BTreeMap::from([(
            "PGPASSFILE".to_string(),
            self.path.display().to_string(),
        )])))
    }
}
