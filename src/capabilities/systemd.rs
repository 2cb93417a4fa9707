//! systemd as service manager
//!
//! Every service of an instance runs from a template unit
//! `pgsteward-<service>@.service`, instantiated with the qualified instance
//! name. Template units are installed on first enable.

use crate::capabilities::write_if_changed;
use crate::ctx::Ctx;
use crate::hooks::{CapabilityModule, ServiceAction};
use crate::instance::configure::ConfigChanges;
use crate::instance::lifecycle::SERVICE;
use crate::manifest::InstanceManifest;
use crate::settings::{Settings, SystemdSettings};
use crate::system::Instance;
use anyhow::{Result, bail};
use declarative::Transaction;
use pgkit::Cmd;
use std::env;
use std::path::PathBuf;

pub struct Systemd {
    settings: SystemdSettings,
}

impl Systemd {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.systemd.clone(),
        }
    }

    pub fn unit(service: &str, instance: &Instance) -> String {
        format!("pgsteward-{service}@{}.service", instance.id.qualname())
    }

    fn template_path(&self, service: &str) -> PathBuf {
        self.settings
            .unit_dir()
            .join(format!("pgsteward-{service}@.service"))
    }

    fn systemctl(&self, ctx: &Ctx, args: &[&str]) -> Result<()> {
        let mut cmd = Cmd::new(&self.settings.systemctl);
        if self.settings.user {
            cmd = cmd.arg("--user");
        }
        ctx.runner.run_checked(&cmd.args(args))?;
        Ok(())
    }

    /// Install the template unit of `service`; `true` if it was (re)written
    fn install_template(&self, ctx: &Ctx, service: &str) -> Result<bool> {
        let content = template(ctx, service)?;
        write_if_changed(&self.template_path(service), &content)
    }
}

/// Unit template for `service`
fn template(ctx: &Ctx, service: &str) -> Result<String> {
    let exe = env::current_exe()?;
    let settings_env = match env::var("PGSTEWARD_SETTINGS") {
        Ok(path) => format!("Environment=PGSTEWARD_SETTINGS={path}\n"),
        Err(_) => String::new(),
    };
    Ok(match service {
        SERVICE => format!(
            "\
[Unit]
Description=PostgreSQL %i database server
After=network.target

[Service]
Type=simple
{settings_env}ExecStart={exe} start --foreground %i
ExecReload=/bin/kill -HUP $MAINPID
KillMode=mixed
KillSignal=SIGINT
TimeoutSec=300

[Install]
WantedBy=default.target
",
            exe = exe.display()
        ),
        super::prometheus::SERVICE => {
            let Some(prometheus) = &ctx.settings.prometheus else {
                bail!("prometheus is not configured");
            };
            let config_dir = prometheus.config_dir(&ctx.settings.prefix);
            format!(
                "\
[Unit]
Description=Prometheus exporter for PostgreSQL %i
After=network.target

[Service]
EnvironmentFile={config}/%i-postgres_exporter.conf
ExecStart={exec} $POSTGRES_EXPORTER_OPTS

[Install]
WantedBy=default.target
",
                config = config_dir.display(),
                exec = prometheus.execpath.display()
            )
        }
        other => bail!("no systemd unit template for service '{other}'"),
    })
}

impl CapabilityModule for Systemd {
    fn name(&self) -> &'static str {
        "systemd"
    }

    fn service_name(&self, _ctx: &Ctx, service: &str, instance: &Instance) -> Result<Option<String>> {
        Ok(Some(Self::unit(service, instance)))
    }

    fn service(
        &self,
        ctx: &Ctx,
        action: ServiceAction,
        service: &str,
        instance: &Instance,
    ) -> Result<bool> {
        let unit = Self::unit(service, instance);
        if action == ServiceAction::Enable && self.install_template(ctx, service)? {
            self.systemctl(ctx, &["daemon-reload"])?;
        }
        self.systemctl(ctx, &[action.as_str(), &unit])?;
        Ok(true)
    }

    fn instance_configured<'a>(
        &'a self,
        ctx: &'a Ctx,
        tx: &mut Transaction<'a>,
        instance: &'a Instance,
        _manifest: &'a InstanceManifest,
        _changes: &ConfigChanges,
        creating: bool,
    ) -> Result<()> {
        if !creating {
            return Ok(());
        }
        tx.run(
            format!("enabling systemd unit {}", Self::unit(SERVICE, instance)),
            || {
                self.service(ctx, ServiceAction::Enable, SERVICE, instance)?;
                Ok(())
            },
            move || {
                self.service(ctx, ServiceAction::Disable, SERVICE, instance)?;
                Ok(())
            },
        )
    }

    fn instance_dropped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        self.service(ctx, ServiceAction::Disable, SERVICE, instance)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::instance;
    use crate::settings::ServiceManager;
    use crate::testing::{self, Op};
    use tempfile::TempDir;

    fn settings(prefix: &std::path::Path) -> Settings {
        let mut settings = Settings::for_prefix(prefix);
        settings.service_manager = Some(ServiceManager::Systemd);
        settings.systemd.unit_dir = Some(prefix.join("units"));
        settings
    }

    #[test]
    fn test_unit_name() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = testing::ctx(tmp.path());
        let instance = Instance::new(&ctx.settings, crate::system::InstanceId::new("main", "16"));
        assert_eq!(
            Systemd::unit(SERVICE, &instance),
            "pgsteward-postgresql@16-main.service"
        );
    }

    #[test]
    fn test_lifecycle_goes_through_systemctl() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend, runner) = testing::ctx_with(settings(tmp.path()));
        let m: InstanceManifest =
            serde_yaml::from_str("name: main\nversion: '16'\nstate: stopped\n").unwrap();
        instance::apply(&ctx, &m).unwrap();

        let commands = runner.commands();
        assert!(commands.contains(&"systemctl --user daemon-reload".to_string()));
        assert!(commands.contains(
            &"systemctl --user enable pgsteward-postgresql@16-main.service".to_string()
        ));
        assert!(tmp.path().join("units/pgsteward-postgresql@.service").exists());

        let instance = Instance::new(&ctx.settings, m.id());
        let state = instance::discover(&ctx, m.id()).unwrap();
        assert_eq!(
            state.service.as_deref(),
            Some("pgsteward-postgresql@16-main.service")
        );

        instance::apply(&ctx, &InstanceManifest {
            state: crate::manifest::InstanceState::Absent,
            ..m.clone()
        })
        .unwrap();
        assert!(runner.commands().contains(
            &"systemctl --user disable pgsteward-postgresql@16-main.service".to_string()
        ));
        assert!(!instance.exists());
        assert_eq!(backend.count(Op::Start), 0);
    }

    #[test]
    fn test_failed_creation_disables_unit() {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings(tmp.path());
        settings.ready_timeout = 0;
        let (ctx, backend, runner) = testing::ctx_with(settings);
        let m: InstanceManifest = serde_yaml::from_str("name: main\nversion: '16'\n").unwrap();

        let err = instance::apply(&ctx, &m).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InstanceNotReady { .. })
        ));
        let commands = runner.commands();
        assert!(commands.contains(
            &"systemctl --user start pgsteward-postgresql@16-main.service".to_string()
        ));
        assert!(commands.contains(
            &"systemctl --user disable pgsteward-postgresql@16-main.service".to_string()
        ));
        assert_eq!(backend.count(Op::Start), 0);
        assert!(!Instance::new(&ctx.settings, m.id()).exists());
    }
}
