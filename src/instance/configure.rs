//! `postgresql.conf` management
//!
//! The configuration file is made to contain exactly the entries computed
//! from the manifest, capability contributions included, so that applying
//! the same manifest twice leaves it untouched.

use crate::ctx::Ctx;
use crate::instance::{lifecycle, ssl};
use crate::manifest::{self, InstanceManifest};
use crate::system::Instance;
use anyhow::{Context, Result};
use declarative::{Merge, Transaction};
use pgkit::{StopMode, Value};
use std::collections::BTreeMap;
use std::fs;

/// Parameter name to `(before, after)`; `None` means unset
pub type ConfigChanges = BTreeMap<String, (Option<Value>, Option<Value>)>;

const LC_PARAMETERS: [&str; 4] = ["lc_messages", "lc_monetary", "lc_numeric", "lc_time"];

fn split_list(value: &Value) -> Vec<String> {
    value
        .as_text()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configuration entries for `manifest`
pub fn configuration(ctx: &Ctx, manifest: &InstanceManifest) -> Result<BTreeMap<String, Value>> {
    let mut conf = BTreeMap::new();
    conf.insert("cluster_name".to_string(), Value::from(manifest.name.as_str()));
    conf.insert(
        "unix_socket_directories".to_string(),
        Value::from(ctx.settings.socket_directory().display().to_string()),
    );
    let locale = manifest
        .locale
        .as_ref()
        .or(ctx.settings.postgresql.initdb.locale.as_ref());
    if let Some(locale) = locale {
        for key in LC_PARAMETERS {
            conf.insert(key.to_string(), Value::from(locale.as_str()));
        }
    }
    conf.extend(manifest.configuration.clone());
    conf.insert("port".to_string(), Value::from(manifest.effective_port()?));

    let mut preload = conf
        .remove("shared_preload_libraries")
        .map(|v| split_list(&v))
        .unwrap_or_default();
    preload.merge(
        manifest
            .extensions
            .iter()
            .filter(|name| manifest::extension(name).is_some_and(|e| e.preload))
            .cloned()
            .collect(),
    );
    for (name, value) in ctx.hooks.instance_configuration(ctx, manifest)? {
        if name == "shared_preload_libraries" {
            preload.merge(split_list(&value));
        } else {
            conf.insert(name, value);
        }
    }
    preload.merge(ctx.hooks.preload_libraries(ctx, manifest)?);
    if !preload.is_empty() {
        conf.insert(
            "shared_preload_libraries".to_string(),
            Value::from(preload.join(", ")),
        );
    }
    Ok(conf)
}

/// Write the configuration of `instance` and notify capability modules
///
/// Returns the parameters whose value changed in the file.
pub fn configure<'a>(
    ctx: &'a Ctx,
    tx: &mut Transaction<'a>,
    instance: &'a Instance,
    manifest: &'a InstanceManifest,
    creating: bool,
) -> Result<ConfigChanges> {
    let path = instance.config_path();
    let mut config = instance.config()?;
    let before = config.entries();
    let mut wanted = configuration(ctx, manifest)?;
    ssl::configure_ssl(ctx, instance, &mut wanted)?;

    if creating {
        config.comment_all();
    } else {
        for name in before.keys().filter(|n| !wanted.contains_key(*n)) {
            config.remove(name);
        }
    }
    for (name, value) in &wanted {
        config.set(name, value.clone());
    }

    let changes = declarative::changes(&before, &config.entries());
    if creating || !changes.is_empty() {
        log::info!("configuring PostgreSQL instance {instance}");
        config
            .save(&path)
            .with_context(|| format!("Could not write {}", path.display()))?;
    }

    if let Some(logdir) = wanted.get("log_directory") {
        let logdir = instance.datadir.join(logdir.as_text());
        fs::create_dir_all(&logdir)
            .with_context(|| format!("Could not create {}", logdir.display()))?;
    }

    ctx.hooks
        .instance_configured(ctx, tx, instance, manifest, &changes, creating)?;
    Ok(changes)
}

/// Act on configuration changes of a running instance
///
/// Reload-only parameters trigger an immediate reload. Parameters needing a
/// restart trigger one if the operator agrees (defaulting to the manifest's
/// `restart_on_changes`). Returns whether a restart is still pending.
pub fn check_pending_actions(
    ctx: &Ctx,
    instance: &Instance,
    manifest: &InstanceManifest,
    changes: &ConfigChanges,
) -> Result<bool> {
    if changes.is_empty() || !lifecycle::is_running(ctx, instance)? {
        return Ok(false);
    }
    let live = ctx.backend.settings(&instance.cluster()?)?;
    let (restart, reload): (Vec<&str>, Vec<&str>) =
        changes.keys().map(String::as_str).partition(|name| {
            *name == "port"
                || live
                    .iter()
                    .find(|s| s.name == *name)
                    .is_some_and(|s| s.requires_restart())
        });

    if !reload.is_empty() {
        log::info!(
            "instance {instance} needs reload due to parameter changes: {}",
            reload.join(", ")
        );
        lifecycle::reload(ctx, instance)?;
    }
    if restart.is_empty() {
        return Ok(false);
    }
    log::warn!(
        "instance {instance} needs restart due to parameter changes: {}",
        restart.join(", ")
    );
    if ctx.confirm(
        "Instance needs to be restarted; restart now?",
        manifest.restart_on_changes,
    )? {
        lifecycle::restart(ctx, instance, StopMode::Fast)?;
        return Ok(false);
    }
    Ok(true)
}
