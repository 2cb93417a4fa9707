//! Creation and removal of an instance on disk

use crate::ctx::Ctx;
use crate::error::Error;
use crate::instance::lifecycle;
use crate::manifest::InstanceManifest;
use crate::system::Instance;
use anyhow::{Context, Result};
use declarative::Transaction;
use pgkit::{InitdbOptions, PostmasterPid, StopMode};
use std::fs;
use std::path::Path;

const PG_IDENT: &str = "\
# MAPNAME       SYSTEM-USERNAME         PG-USERNAME
";

fn auth_methods(ctx: &Ctx, manifest: &InstanceManifest) -> (String, String) {
    let site = &ctx.settings.postgresql.auth;
    let auth = manifest.auth.clone().unwrap_or_default();
    (
        auth.local.unwrap_or_else(|| site.local.clone()),
        auth.host.unwrap_or_else(|| site.host.clone()),
    )
}

pub fn initdb_options(ctx: &Ctx, manifest: &InstanceManifest) -> InitdbOptions {
    let site = &ctx.settings.postgresql.initdb;
    let (auth_local, auth_host) = auth_methods(ctx, manifest);
    InitdbOptions {
        locale: manifest.locale.clone().or_else(|| site.locale.clone()),
        encoding: manifest.encoding.clone().or_else(|| site.encoding.clone()),
        data_checksums: manifest.data_checksums.unwrap_or(site.data_checksums),
        auth_local,
        auth_host,
        password: manifest.surole_password.clone(),
    }
}

/// `pg_hba.conf` granting `local` and `host` methods to every role,
/// replication included
pub fn render_hba(local: &str, host: &str) -> String {
    let mut out = String::from(
        "# TYPE  DATABASE        USER            ADDRESS                 METHOD\n",
    );
    for database in ["all", "replication"] {
        out.push_str(&format!("local   {database:<15} all                                     {local}\n"));
        for address in ["127.0.0.1/32", "::1/128"] {
            out.push_str(&format!(
                "host    {database:<15} all             {address:<23} {host}\n"
            ));
        }
    }
    out
}

fn render_psqlrc(instance: &Instance) -> String {
    format!(
        "\\set PROMPT1 '[{instance}] %n@%~%R%x%# '\n\\set PROMPT2 ' %R%x%# '\n"
    )
}

fn write(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Could not write {}", path.display()))
}

/// Create the data directory of `instance`, as a standby when a capability
/// takes over, and its authentication files
///
/// The registered revert removes everything, stopping the server first if
/// a later step left it running.
pub fn init<'a>(
    ctx: &'a Ctx,
    tx: &mut Transaction<'a>,
    instance: &'a Instance,
    manifest: &'a InstanceManifest,
) -> Result<()> {
    if instance.exists() {
        return Err(Error::InstanceAlreadyExists(instance.to_string()).into());
    }
    tx.run(
        format!("initializing PostgreSQL instance {instance}"),
        || {
            if !ctx.hooks.init_replication(ctx, instance, manifest)? {
                ctx.backend
                    .initdb(&instance.cluster()?, &initdb_options(ctx, manifest))?;
            }
            Ok(())
        },
        move || remove_files(ctx, instance),
    )?;
    // Reverted along with the data directory.
    tx.run(
        format!("writing authentication files of {instance}"),
        || {
            let (local, host) = auth_methods(ctx, manifest);
            write(&instance.datadir.join("pg_hba.conf"), &render_hba(&local, &host))?;
            write(&instance.datadir.join("pg_ident.conf"), PG_IDENT)?;
            write(&instance.psqlrc(), &render_psqlrc(instance))
        },
        || Ok(()),
    )
}

/// Delete the directories of `instance`, stopping a server left running
fn remove_files(ctx: &Ctx, instance: &Instance) -> Result<()> {
    if PostmasterPid::read(&instance.datadir)?.is_some() {
        ctx.backend
            .stop(&instance.cluster()?, StopMode::Immediate, true)?;
    }
    for dir in [instance.path(), instance.waldir.as_path()] {
        if dir.exists() {
            log::debug!("removing {}", dir.display());
            fs::remove_dir_all(dir)
                .with_context(|| format!("Could not remove {}", dir.display()))?;
        }
    }
    Ok(())
}

/// Delete `instance` and everything capability modules keep for it
///
/// Asks for confirmation first; a refusal fails with `Cancelled`.
pub fn drop_instance(ctx: &Ctx, instance: &Instance) -> Result<()> {
    if !ctx.confirm(
        &format!("Confirm complete deletion of instance {instance}?"),
        true,
    )? {
        return Err(Error::Cancelled.into());
    }
    log::info!("dropping instance {instance}");
    declarative::transaction(|tx| {
        tx.run(
            format!("stopping instance {instance} before deletion"),
            || {
                if lifecycle::is_running(ctx, instance)? {
                    lifecycle::stop(ctx, instance, StopMode::Immediate, true)?;
                }
                Ok(())
            },
            || Ok(()),
        )?;
        ctx.hooks.instance_dropped(ctx, instance)?;
        for rolename in ctx.hooks.rolenames(ctx, instance)? {
            ctx.hooks.role_dropped(ctx, instance, &rolename)?;
        }
        tx.run(
            format!("deleting PostgreSQL instance {instance}"),
            || remove_files(ctx, instance),
            || Ok(()),
        )
    })
}
