//! Built-in capability modules
//!
//! Which modules take part is decided once from the site settings: a module
//! is registered iff its settings section is present, `replication` always.

pub mod backup;
pub mod pgpass;
pub mod prometheus;
pub mod replication;
pub mod systemd;

use crate::hooks::{CapabilityModule, HookRegistry};
use crate::settings::{ServiceManager, Settings};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub fn registry(settings: &Settings) -> HookRegistry {
    let mut modules: Vec<Box<dyn CapabilityModule>> = Vec::new();
    if settings.service_manager == Some(ServiceManager::Systemd) {
        modules.push(Box::new(systemd::Systemd::new(settings)));
    }
    if let Some(passfile) = &settings.postgresql.auth.passfile {
        modules.push(Box::new(pgpass::PassFile::new(passfile)));
    }
    if let Some(backup) = &settings.backup {
        modules.push(Box::new(backup::Backup::new(backup, settings)));
    }
    if let Some(prometheus) = &settings.prometheus {
        modules.push(Box::new(prometheus::Prometheus::new(prometheus, settings)));
    }
    modules.push(Box::new(replication::Replication));
    let registry = HookRegistry::new(modules);
    log::debug!("capabilities: {}", registry.names().join(", "));
    registry
}

/// Write `content` to `path` unless it already holds it; `true` if written
pub(crate) fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if fs::read_to_string(path).is_ok_and(|current| current == content) {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Could not create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))?;
    Ok(true)
}

pub(crate) fn remove_file(path: &Path) -> Result<()> {
    if path.exists() {
        log::debug!("removing {}", path.display());
        fs::remove_file(path).with_context(|| format!("Could not remove {}", path.display()))?;
    }
    Ok(())
}
