//! Major version upgrades with `pg_upgrade`
//!
//! The upgraded instance is a new one, initialized and configured from the
//! old instance's settings. The old instance is left untouched; if any step
//! fails, the new instance is removed.

use crate::ctx::Ctx;
use crate::error::Error;
use crate::instance::{configure, init, lifecycle};
use crate::manifest::{InstanceManifest, InstanceState};
use crate::system::{Instance, InstanceId};
use anyhow::Result;
use pgkit::Cmd;

/// Where an instance is upgraded to
#[derive(Debug, Clone, Default)]
pub struct UpgradeTarget {
    /// Defaults to the site default version
    pub version: Option<String>,
    /// Defaults to the old instance's name
    pub name: Option<String>,
    /// Defaults to the old instance's port
    pub port: Option<u16>,
    /// `pg_upgrade --jobs`
    pub jobs: Option<u32>,
}

/// Manifest of the new instance, carrying over the old configuration
fn target_manifest(
    ctx: &Ctx,
    old: &Instance,
    id: &InstanceId,
    port: Option<u16>,
) -> Result<InstanceManifest> {
    let port = match port {
        Some(port) => port,
        None => old.configured_port()?,
    };
    let mut configuration = old.config()?.entries();
    configuration.remove("port");
    configuration.remove("cluster_name");
    Ok(InstanceManifest {
        name: id.name.clone(),
        version: id.version.clone(),
        port: Some(port),
        configuration,
        state: InstanceState::Stopped,
        data_checksums: Some(ctx.backend.data_checksums(&old.cluster()?)?),
        ..Default::default()
    })
}

fn pg_upgrade(ctx: &Ctx, old: &Instance, new: &Instance, jobs: Option<u32>) -> Result<()> {
    let cluster = old.cluster()?;
    let mut cmd = Cmd::new(new.bindir.join("pg_upgrade"))
        .arg(format!("--old-bindir={}", old.bindir.display()))
        .arg(format!("--new-bindir={}", new.bindir.display()))
        .arg(format!("--old-datadir={}", old.datadir.display()))
        .arg(format!("--new-datadir={}", new.datadir.display()))
        .arg(format!("--username={}", cluster.user))
        .current_dir(new.path());
    if let Some(jobs) = jobs {
        cmd = cmd.args(["--jobs".to_string(), jobs.to_string()]);
    }
    if let Some(password) = &cluster.password {
        cmd = cmd.env("PGPASSWORD", password.as_str());
    }
    ctx.runner.run_checked(&cmd)?;
    Ok(())
}

/// Upgrade the stopped primary `old` into a new instance, returned stopped
pub fn upgrade(ctx: &Ctx, old: &Instance, target: &UpgradeTarget) -> Result<Instance> {
    if old.is_standby() {
        return Err(Error::state(old, "standby instances cannot be upgraded").into());
    }
    let id = InstanceId::new(
        target.name.as_deref().unwrap_or(&old.id.name),
        target
            .version
            .as_deref()
            .unwrap_or(&ctx.settings.postgresql.default_version),
    );
    id.validate()?;
    if id == old.id {
        return Err(Error::validation(format!(
            "could not upgrade {old} using same name and same version"
        ))
        .into());
    }
    let new = Instance::new(&ctx.settings, id);
    if new.exists() {
        return Err(Error::InstanceAlreadyExists(new.to_string()).into());
    }
    if lifecycle::is_running(ctx, old)? {
        return Err(Error::state(old, "must be stopped before upgrade").into());
    }
    if !ctx.confirm(
        &format!("Confirm upgrade of instance {old} to version {}?", new.id.version),
        true,
    )? {
        return Err(Error::Cancelled.into());
    }

    let manifest = target_manifest(ctx, old, &new.id, target.port)?;
    log::info!("upgrading instance {old} to {new}");
    declarative::transaction(|tx| {
        init::init(ctx, tx, &new, &manifest)?;
        configure::configure(ctx, tx, &new, &manifest, true)?;
        tx.run(
            format!("upgrading PostgreSQL instance {old} to {new}"),
            || pg_upgrade(ctx, old, &new, target.jobs),
            || Ok(()),
        )
    })?;
    Ok(new)
}
