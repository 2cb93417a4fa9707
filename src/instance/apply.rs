//! Reconciliation of an instance with its manifest
//!
//! One pass: validate, then either drop, create or update. Creation runs
//! inside a transaction so that a failure at any step unwinds everything
//! created so far. Updating an existing instance never deletes it.

use crate::ctx::Ctx;
use crate::instance::configure::{self, ConfigChanges};
use crate::instance::{init, lifecycle};
use crate::manifest::{self, ApplyOutcome, InstanceManifest, InstanceState, Role, StandbyStatus};
use crate::resources;
use crate::system::Instance;
use anyhow::Result;
use declarative::{ChangeState, Transaction};
use pgkit::{Status, StopMode};

/// Converge the instance described by `manifest`
pub fn apply(ctx: &Ctx, manifest: &InstanceManifest) -> Result<ApplyOutcome> {
    manifest.validate(ctx)?;
    let instance = Instance::new(&ctx.settings, manifest.id());

    if manifest.state == InstanceState::Absent {
        if !instance.exists() {
            log::debug!("instance {instance} is already absent");
            return Ok(ApplyOutcome::default());
        }
        init::drop_instance(ctx, &instance)?;
        return Ok(ApplyOutcome {
            change_state: Some(ChangeState::Dropped),
            pending_restart: false,
        });
    }

    if instance.exists() {
        update(ctx, &instance, manifest)
    } else {
        create(ctx, &instance, manifest)
    }
}

fn create(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<ApplyOutcome> {
    manifest::validate_ports(ctx, manifest)?;
    declarative::transaction(|tx| {
        init::init(ctx, tx, instance, manifest)?;
        configure::configure(ctx, tx, instance, manifest, true)?;
        if !instance.is_standby() {
            create_roles(ctx, instance, manifest)?;
        }
        tx.run(
            format!("setting the state of instance {instance}"),
            || set_state(ctx, instance, manifest),
            || {
                if lifecycle::is_running(ctx, instance)? {
                    lifecycle::stop(ctx, instance, StopMode::Immediate, true)?;
                }
                Ok(())
            },
        )?;
        converge_resources(ctx, instance, manifest)?;
        Ok(())
    })?;
    Ok(ApplyOutcome {
        change_state: Some(ChangeState::Created),
        pending_restart: pending_restart(ctx, instance)?,
    })
}

/// Whether the running server reports parameters awaiting a restart
fn pending_restart(ctx: &Ctx, instance: &Instance) -> Result<bool> {
    if !lifecycle::is_running(ctx, instance)? {
        return Ok(false);
    }
    Ok(ctx.backend.pending_restart(&instance.cluster()?)?)
}

/// Roles every new primary gets: the replication role and those required
/// by capabilities; the super-user role is announced to capabilities
fn create_roles(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<()> {
    let mut roles = Vec::new();
    if let Some(password) = &manifest.replrole_password {
        roles.push(Role {
            name: ctx.settings.postgresql.replrole.clone(),
            password: Some(password.clone()),
            login: true,
            replication: true,
            ..Default::default()
        });
    }
    roles.extend(ctx.hooks.roles(ctx, manifest)?);
    if !roles.is_empty() {
        lifecycle::with_running(ctx, instance, || {
            let cluster = instance.cluster()?;
            for role in &roles {
                if ctx.backend.get_role(&cluster, &role.name)?.is_none() {
                    log::info!("creating role '{}' on instance {instance}", role.name);
                    ctx.backend.create_role(&cluster, &role.spec())?;
                    ctx.hooks.role_changed(ctx, instance, role)?;
                }
            }
            Ok(())
        })?;
    }
    let surole = Role {
        name: ctx.settings.postgresql.surole.name.clone(),
        password: manifest.surole_password.clone(),
        login: true,
        superuser: true,
        replication: true,
        pgpass: ctx.settings.postgresql.surole.pgpass,
        ..Default::default()
    };
    ctx.hooks.role_changed(ctx, instance, &surole)?;
    Ok(())
}

fn update(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<ApplyOutcome> {
    let mut changed = false;
    let changes: ConfigChanges = declarative::transaction(|tx: &mut Transaction<'_>| {
        configure::configure(ctx, tx, instance, manifest, false)
    })?;
    changed |= !changes.is_empty();
    let mut pending = configure::check_pending_actions(ctx, instance, manifest, &changes)?;

    if let Some(wanted) = manifest.data_checksums {
        let cluster = instance.cluster()?;
        if ctx.backend.data_checksums(&cluster)? != wanted {
            let action = if wanted { "enabling" } else { "disabling" };
            log::info!("{action} data checksums for instance {instance}");
            lifecycle::with_stopped(ctx, instance, || {
                Ok(ctx.backend.set_data_checksums(&instance.cluster()?, wanted)?)
            })?;
            changed = true;
        }
    }

    let restarted = manifest.state == InstanceState::Restarted;
    changed |= set_state(ctx, instance, manifest)?;
    if restarted {
        pending = false;
    }

    if manifest.standby.as_ref().map(|s| s.status) == Some(StandbyStatus::Promoted)
        && instance.is_standby()
    {
        lifecycle::promote(ctx, instance)?;
        changed = true;
    }

    changed |= converge_resources(ctx, instance, manifest)?;

    pending |= pending_restart(ctx, instance)?;
    Ok(ApplyOutcome {
        change_state: changed.then_some(ChangeState::Changed),
        pending_restart: pending,
    })
}

/// Bring the server to the requested lifecycle state; `true` if it moved
fn set_state(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<bool> {
    let status = lifecycle::status(ctx, instance)?;
    match (manifest.state, status) {
        (InstanceState::Stopped, Status::Running) => {
            lifecycle::stop(ctx, instance, StopMode::Fast, true)?;
            Ok(true)
        }
        (InstanceState::Started, Status::NotRunning) => {
            lifecycle::start(ctx, instance, false)?;
            Ok(true)
        }
        (InstanceState::Restarted, Status::Running) => {
            lifecycle::restart(ctx, instance, StopMode::Fast)?;
            Ok(true)
        }
        (InstanceState::Restarted, Status::NotRunning) => {
            lifecycle::start(ctx, instance, false)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Sub-resources of a primary, converged with the server running
fn converge_resources(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<bool> {
    if instance.is_standby() {
        return Ok(false);
    }
    let wants_any = !manifest.extensions.is_empty()
        || !manifest.roles.is_empty()
        || !manifest.databases.is_empty();
    if !wants_any && !lifecycle::is_running(ctx, instance)? {
        return Ok(false);
    }
    let summary =
        lifecycle::with_running(ctx, instance, || resources::converge(ctx, instance, manifest))?;
    Ok(summary.has_changes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hooks::{CapabilityModule, HookRegistry};
    use crate::settings::{PrometheusSettings, Settings};
    use crate::testing::{self, Op};
    use declarative::AutoConfirm;
    use pgkit::Value;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn manifest(yaml: &str) -> InstanceManifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_create_then_noop() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let m = manifest("name: db1\nversion: '16'\nport: 5433\n");

        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Created));
        assert!(!outcome.pending_restart);
        let instance = Instance::system_lookup(&ctx.settings, m.id()).unwrap();
        assert!(lifecycle::is_running(&ctx, &instance).unwrap());
        assert_eq!(instance.cluster().unwrap().port, 5433);

        let before = fs::read_to_string(instance.config_path()).unwrap();
        let starts = backend.count(Op::Start);
        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome, ApplyOutcome::default());
        assert_eq!(fs::read_to_string(instance.config_path()).unwrap(), before);
        assert_eq!(backend.count(Op::Start), starts);
        assert_eq!(backend.count(Op::Reload), 0);
    }

    #[test]
    fn test_create_stopped() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let m = manifest("name: db1\nversion: '16'\nstate: stopped\n");
        apply(&ctx, &m).unwrap();
        let instance = Instance::system_lookup(&ctx.settings, m.id()).unwrap();
        assert_eq!(
            lifecycle::status(&ctx, &instance).unwrap(),
            Status::NotRunning
        );
    }

    #[test]
    fn test_reload_parameter_change() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();

        let m = manifest("name: db1\nversion: '16'\nconfiguration:\n  work_mem: 16MB\n");
        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Changed));
        assert!(!outcome.pending_restart);
        assert_eq!(backend.count(Op::Reload), 1);
        let instance = Instance::new(&ctx.settings, m.id());
        assert_eq!(backend.live_setting(&instance, "work_mem").as_deref(), Some("16MB"));
    }

    #[test]
    fn test_restart_parameter_left_pending() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();
        let starts = backend.count(Op::Start);

        let m = manifest("name: db1\nversion: '16'\nconfiguration:\n  shared_buffers: 1GB\n");
        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Changed));
        assert!(outcome.pending_restart);
        assert_eq!(backend.count(Op::Start), starts);
        assert_eq!(apply(&ctx, &m).unwrap().change_state, None);
    }

    #[test]
    fn test_restart_parameter_confirmed() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let ctx = ctx.with_confirm(Box::new(AutoConfirm));
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();
        let starts = backend.count(Op::Start);

        let m = manifest("name: db1\nversion: '16'\nport: 5444\n");
        let outcome = apply(&ctx, &m).unwrap();
        assert!(!outcome.pending_restart);
        assert_eq!(backend.count(Op::Start), starts + 1);
        let instance = Instance::new(&ctx.settings, m.id());
        assert_eq!(instance.cluster().unwrap().port, 5444);
    }

    #[test]
    fn test_drop_existing_and_absent() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();

        let m = manifest("name: db1\nversion: '16'\nstate: absent\n");
        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Dropped));
        assert!(!Instance::new(&ctx.settings, m.id()).exists());

        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, None);
    }

    #[test]
    fn test_failed_creation_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        backend.fail(Op::CreateDatabase);
        let m = manifest(
            "name: db1\nversion: '16'\ndatabases:\n  - name: app\n",
        );
        let err = apply(&ctx, &m).unwrap_err();
        assert!(format!("{err:#}").contains("database 'app'"));
        let instance = Instance::new(&ctx.settings, m.id());
        assert!(!instance.exists());
        assert!(!instance.path().exists());
        assert!(crate::system::list(&ctx.settings, None).unwrap().is_empty());
    }

    #[test]
    fn test_failed_creation_stops_exporter() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::for_prefix(tmp.path());
        settings.prometheus = Some(PrometheusSettings {
            execpath: PathBuf::from("/usr/bin/prometheus-postgres-exporter"),
            config_dir: None,
        });
        let (ctx, backend, runner) = testing::ctx_with(settings);
        backend.fail(Op::CreateDatabase);
        let m = manifest(
            "name: db1\nversion: '16'\nprometheus:\n  port: 9188\ndatabases:\n  - name: app\n",
        );

        assert!(apply(&ctx, &m).is_err());
        assert_eq!(runner.calls().len(), 1);
        assert!(!tmp.path().join("run/prometheus/16-db1.pid").exists());
        assert!(!tmp.path().join("etc/prometheus/16-db1-postgres_exporter.conf").exists());
        let instance = Instance::new(&ctx.settings, m.id());
        assert!(!instance.path().exists());
        assert!(!lifecycle::is_running(&ctx, &instance).unwrap_or(false));
    }

    /// Raises `shared_buffers` behind the server's back once it has started
    struct Drift;

    impl CapabilityModule for Drift {
        fn name(&self) -> &'static str {
            "drift"
        }

        fn instance_started(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
            let mut config = instance.config()?;
            config.set("shared_buffers", "1GB");
            config.save(&instance.config_path())?;
            Ok(ctx.backend.reload(&instance.cluster()?)?)
        }
    }

    #[test]
    fn test_creation_reports_pending_restart() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let ctx = ctx.with_hooks(HookRegistry::new(vec![Box::new(Drift)]));
        let outcome = apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Created));
        assert!(outcome.pending_restart);

        let stopped = manifest("name: db2\nversion: '16'\nport: 5440\nstate: stopped\n");
        assert!(!apply(&ctx, &stopped).unwrap().pending_restart);
    }

    #[test]
    fn test_failed_start_reverts_init() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        backend.fail(Op::Start);
        let m = manifest("name: db1\nversion: '16'\n");
        assert!(apply(&ctx, &m).is_err());
        assert!(!Instance::new(&ctx.settings, m.id()).exists());
    }

    #[test]
    fn test_port_conflict_rejected_before_any_change() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\nport: 5433\n")).unwrap();
        let calls = backend.calls().len();

        let err = apply(&ctx, &manifest("name: db2\nversion: '16'\nport: 5433\n")).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
        assert_eq!(backend.calls().len(), calls);
    }

    #[test]
    fn test_invalid_manifest_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let m = manifest("name: db1\nversion: '16'\nport: 5433\nconfiguration:\n  port: 5434\n");
        let err = apply(&ctx, &m).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();
        let instance = Instance::new(&ctx.settings, manifest("name: db1\nversion: '16'\n").id());

        let outcome = apply(&ctx, &manifest("name: db1\nversion: '16'\nstate: stopped\n")).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Changed));
        assert!(!lifecycle::is_running(&ctx, &instance).unwrap());

        let starts = backend.count(Op::Start);
        let outcome =
            apply(&ctx, &manifest("name: db1\nversion: '16'\nstate: restarted\n")).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Changed));
        assert_eq!(backend.count(Op::Start), starts + 1);
        assert!(lifecycle::is_running(&ctx, &instance).unwrap());
    }

    #[test]
    fn test_roles_and_replication_role_on_creation() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let m = manifest(
            r"
name: db1
version: '16'
replrole_password: r3pl
extensions: [pg_stat_statements]
roles:
  - name: app
    login: true
databases:
  - name: appdb
    owner: app
",
        );
        apply(&ctx, &m).unwrap();
        let instance = Instance::new(&ctx.settings, m.id());
        assert!(backend.role(&instance, "replication").unwrap().replication);
        assert!(backend.role(&instance, "app").is_some());
        assert!(backend.database(&instance, "appdb").is_some());
        assert!(
            backend
                .extensions(&instance, "postgres")
                .contains(&"pg_stat_statements".to_string())
        );
        let conf = instance.config().unwrap();
        assert_eq!(
            conf.get("shared_preload_libraries"),
            Some(&Value::from("pg_stat_statements"))
        );
    }

    #[test]
    fn test_data_checksums_toggle() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        apply(&ctx, &manifest("name: db1\nversion: '16'\n")).unwrap();
        let m = manifest("name: db1\nversion: '16'\ndata_checksums: true\n");
        let outcome = apply(&ctx, &m).unwrap();
        assert_eq!(outcome.change_state, Some(ChangeState::Changed));
        assert_eq!(backend.count(Op::SetChecksums), 1);
        let instance = Instance::new(&ctx.settings, m.id());
        assert!(lifecycle::is_running(&ctx, &instance).unwrap());
        assert_eq!(apply(&ctx, &m).unwrap().change_state, None);
    }
}
