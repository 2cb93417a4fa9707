//! Instance commands

use crate::cli::UpgradeArgs;
use crate::ctx::Ctx;
use crate::instance::upgrade::{self, UpgradeTarget};
use crate::instance::{self, env, init, lifecycle, logs};
use crate::manifest::{ApplyOutcome, InstanceManifest};
use crate::progress;
use crate::system::{self, Instance, InstanceId};
use crate::ui;
use anyhow::{Result, bail};
use colored::Colorize;
use declarative::DefaultAnswer;
use pgkit::{Status, StopMode};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Resolve `[VERSION/]NAME` to an existing instance
pub fn lookup(ctx: &Ctx, spec: &str) -> Result<Instance> {
    let id = InstanceId::parse(spec, &ctx.settings.postgresql.default_version)?;
    Instance::system_lookup(&ctx.settings, id)
}

fn apply_file(ctx: &Ctx, path: &Path) -> Result<(InstanceId, ApplyOutcome)> {
    let manifest = InstanceManifest::from_file(path)?;
    let outcome = instance::apply(ctx, &manifest)?;
    Ok((manifest.id(), outcome))
}

fn report(id: &InstanceId, outcome: ApplyOutcome) {
    let label = ui::change_label(outcome.change_state);
    if outcome.change_state.is_some() {
        ui::success(&format!("instance {id} {label}"));
    } else {
        ui::info(&format!("instance {id} {label}"));
    }
    if outcome.pending_restart {
        ui::warn(&format!("instance {id} needs a restart to apply its configuration"));
    }
}

/// Apply every manifest in `files` on a pool of `jobs` threads
///
/// A failing manifest does not stop the others; results come back in the
/// order of `files`.
pub fn apply_files(
    ctx: &Ctx,
    files: &[PathBuf],
    jobs: usize,
) -> Result<Vec<(PathBuf, Result<(InstanceId, ApplyOutcome)>)>> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()?;
    let pb = progress::apply_bar(files.len() as u64);
    let results = pool.install(|| {
        files
            .par_iter()
            .map(|path| {
                let result = apply_file(ctx, path);
                let name = path.display().to_string();
                match &result {
                    Ok(_) => pb.set_message(format!("{name} ✓")),
                    Err(_) => pb.set_message(format!("{name} ✗")),
                }
                pb.inc(1);
                (path.clone(), result)
            })
            .collect()
    });
    pb.finish_and_clear();
    Ok(results)
}

/// `apply -f FILE...`
///
/// Several manifests are applied in parallel without prompting; failures
/// are reported once all of them have been tried.
pub fn apply(ctx: Ctx, files: &[PathBuf], jobs: usize) -> Result<()> {
    if let [path] = files {
        let (id, outcome) = apply_file(&ctx, path)?;
        report(&id, outcome);
        return Ok(());
    }

    let ctx = ctx.with_confirm(Box::new(DefaultAnswer));
    let results = apply_files(&ctx, files, jobs)?;
    let mut failed = Vec::new();
    for (path, result) in results {
        match result {
            Ok((id, outcome)) => report(&id, outcome),
            Err(e) => failed.push((path, e)),
        }
    }
    if failed.is_empty() {
        return Ok(());
    }
    println!();
    ui::error("Failed manifests:");
    for (path, e) in &failed {
        println!(
            "  {} {} - {}",
            "✗".red(),
            path.display(),
            format!("{e:#}").dimmed()
        );
    }
    bail!("{} of {} manifests failed", failed.len(), files.len())
}

/// `get`: actual state as JSON
pub fn get(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    let state = instance::discovery::discover_instance(ctx, &instance)?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

pub fn list(ctx: &Ctx, version: Option<&str>) -> Result<()> {
    let instances = system::list(&ctx.settings, version)?;
    if instances.is_empty() {
        ui::info("No instances found.");
        return Ok(());
    }
    ui::header("Instances");
    for instance in &instances {
        let status = match lifecycle::status(ctx, instance)? {
            Status::Running => "running".green(),
            Status::NotRunning => "not running".yellow(),
            Status::Unspecified => "unspecified".red(),
        };
        let port = instance.configured_port()?;
        println!(
            "  {:<24} {:>5}  {}  {}",
            instance.to_string(),
            port,
            status,
            instance.datadir.display().to_string().dimmed()
        );
    }
    Ok(())
}

pub fn status(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    match lifecycle::status(ctx, &instance)? {
        Status::Running => ui::success(&format!("instance {instance} is running")),
        Status::NotRunning => ui::warn(&format!("instance {instance} is not running")),
        Status::Unspecified => ui::error(&format!("instance {instance} has an invalid data directory")),
    }
    Ok(())
}

pub fn start(ctx: &Ctx, spec: &str, foreground: bool) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    if lifecycle::is_running(ctx, &instance)? {
        ui::info(&format!("instance {instance} is already running"));
        return Ok(());
    }
    lifecycle::start(ctx, &instance, foreground)?;
    if !foreground {
        ui::success(&format!("instance {instance} started"));
    }
    Ok(())
}

pub fn stop(ctx: &Ctx, spec: &str, mode: StopMode) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    lifecycle::stop(ctx, &instance, mode, true)?;
    ui::success(&format!("instance {instance} stopped"));
    Ok(())
}

pub fn restart(ctx: &Ctx, spec: &str, mode: StopMode) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    lifecycle::restart(ctx, &instance, mode)?;
    ui::success(&format!("instance {instance} restarted"));
    Ok(())
}

pub fn reload(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    lifecycle::reload(ctx, &instance)?;
    ui::success(&format!("instance {instance} reloaded"));
    Ok(())
}

pub fn promote(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    lifecycle::promote(ctx, &instance)?;
    ui::success(&format!("instance {instance} promoted"));
    Ok(())
}

pub fn drop_instance(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    init::drop_instance(ctx, &instance)?;
    ui::success(&format!("instance {instance} dropped"));
    Ok(())
}

pub fn env(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    print!("{}", env::render(ctx, &instance)?);
    Ok(())
}

pub fn logs(ctx: &Ctx, spec: &str) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    for line in logs::logs(&instance)? {
        println!("{line}");
    }
    Ok(())
}

/// `exec INSTANCE PROGRAM [ARGS...]`
pub fn exec(ctx: &Ctx, spec: &str, command: &[String]) -> Result<()> {
    let instance = lookup(ctx, spec)?;
    let Some((program, args)) = command.split_first() else {
        bail!("no program given");
    };
    let code = env::exec(ctx, &instance, program, args)?;
    if code != 0 {
        bail!("{program} exited with status {code}");
    }
    Ok(())
}

pub fn upgrade(ctx: &Ctx, args: &UpgradeArgs) -> Result<()> {
    let instance = lookup(ctx, &args.instance.instance)?;
    let target = UpgradeTarget {
        version: args.pg_version.clone(),
        name: args.name.clone(),
        port: args.port,
        jobs: args.jobs,
    };
    let new = upgrade::upgrade(ctx, &instance, &target)?;
    ui::success(&format!("instance {instance} upgraded to {new}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, create_instance};
    use declarative::ChangeState;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_lookup_uses_default_version() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        create_instance(&ctx, "db1", 5433);
        let version = ctx.settings.postgresql.default_version.clone();
        assert_eq!(lookup(&ctx, "db1").unwrap().id.version, version);
        assert!(lookup(&ctx, &format!("{version}/db1")).is_ok());
        assert!(lookup(&ctx, "db2").is_err());
    }

    #[test]
    fn test_bulk_apply_continues_after_failure() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let manifests = tmp.path().join("manifests");
        fs::create_dir_all(&manifests).unwrap();
        let good = manifests.join("good.yaml");
        fs::write(&good, "name: good\nversion: '16'\nport: 5433\n").unwrap();
        let bad = manifests.join("bad.yaml");
        fs::write(&bad, "name: bad\nversion: '16'\nbogus: true\n").unwrap();
        let other = manifests.join("other.json");
        fs::write(&other, r#"{"name": "other", "version": "16", "port": 5434}"#).unwrap();

        let files = vec![good.clone(), bad.clone(), other.clone()];
        let results = apply_files(&ctx, &files, 2).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, good);
        let (id, outcome) = results[0].1.as_ref().unwrap();
        assert_eq!(id.name, "good");
        assert_eq!(outcome.change_state, Some(ChangeState::Created));
        assert!(results[1].1.is_err());
        assert!(results[2].1.is_ok());

        assert!(apply(ctx, &files, 2).is_err());
    }
}
