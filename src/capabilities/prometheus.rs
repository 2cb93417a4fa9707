//! Prometheus exporter for PostgreSQL, one per instance
//!
//! Instances opt in with a `prometheus` manifest section. The exporter reads
//! its settings from an environment file; it runs under the service manager
//! when one is registered, else as a detached process tracked by a pid file.

use crate::capabilities::{remove_file, write_if_changed};
use crate::ctx::Ctx;
use crate::error::Error;
use crate::hooks::{CapabilityModule, Facts, ServiceAction};
use crate::instance::configure::ConfigChanges;
use crate::manifest::{InstanceManifest, Role};
use crate::settings::{PrometheusSettings, Settings};
use crate::system::Instance;
use anyhow::{Context, Result};
use declarative::Transaction;
use pgkit::{Cmd, process};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

const KEY: &str = "prometheus";

/// Service name of the exporter
pub const SERVICE: &str = "postgres_exporter";

/// Role the exporter connects as
pub const ROLE: &str = "prometheus";

const DEFAULT_PORT: u16 = 9187;

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// The `prometheus` manifest section
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusManifest {
    /// Port the exporter listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Password of the exporter role
    #[serde(default)]
    pub password: Option<String>,
}

pub struct Prometheus {
    execpath: PathBuf,
    config_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
}

impl Prometheus {
    pub fn new(prometheus: &PrometheusSettings, settings: &Settings) -> Self {
        Self {
            execpath: prometheus.execpath.clone(),
            config_dir: prometheus.config_dir(&settings.prefix),
            run_dir: settings.run_dir().join("prometheus"),
            log_dir: settings.log_dir().join("prometheus"),
        }
    }

    fn section(manifest: &InstanceManifest) -> Result<Option<PrometheusManifest>> {
        manifest
            .capability(KEY)
            .map(|payload| serde_json::from_value(payload.clone()))
            .transpose()
            .map_err(|e| Error::validation(format!("invalid '{KEY}' section: {e}")).into())
    }

    fn config_path(&self, instance: &Instance) -> PathBuf {
        self.config_dir
            .join(format!("{}-{SERVICE}.conf", instance.id.qualname()))
    }

    fn pid_path(&self, instance: &Instance) -> PathBuf {
        self.run_dir.join(format!("{}.pid", instance.id.qualname()))
    }

    fn render_config(
        ctx: &Ctx,
        manifest: &InstanceManifest,
        section: &PrometheusManifest,
    ) -> Result<String> {
        let user = match &section.password {
            Some(password) => format!("{ROLE}:{password}"),
            None => ROLE.to_string(),
        };
        Ok(format!(
            "DATA_SOURCE_NAME=postgresql://{user}@:{}/postgres?host={}&sslmode=disable\n\
             PG_EXPORTER_WEB_LISTEN_ADDRESS=:{}\n",
            manifest.effective_port()?,
            ctx.settings.socket_directory().display(),
            section.port,
        ))
    }

    /// Variables of the environment file
    fn read_config(&self, instance: &Instance) -> Result<BTreeMap<String, String>> {
        let path = self.config_path(instance);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    fn listen_port(&self, instance: &Instance) -> Result<Option<u16>> {
        Ok(self
            .read_config(instance)?
            .get("PG_EXPORTER_WEB_LISTEN_ADDRESS")
            .and_then(|addr| addr.rsplit(':').next())
            .and_then(|p| p.parse().ok()))
    }

    fn running_pid(&self, instance: &Instance) -> Result<Option<u32>> {
        let path = self.pid_path(instance);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Ok(content
            .trim()
            .parse()
            .ok()
            .filter(|pid| process::is_alive(*pid)))
    }

    fn start(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        if ctx.hooks.service(ctx, ServiceAction::Start, SERVICE, instance)? {
            return Ok(());
        }
        if let Some(pid) = self.running_pid(instance)? {
            log::debug!("{SERVICE} of {instance} already running as {pid}");
            return Ok(());
        }
        let mut cmd = Cmd::new(&self.execpath);
        for (name, value) in self.read_config(instance)? {
            cmd = cmd.env(name, value);
        }
        fs::create_dir_all(&self.log_dir)?;
        fs::create_dir_all(&self.run_dir)?;
        let log_file = self
            .log_dir
            .join(format!("{}-{SERVICE}.log", instance.id.qualname()));
        log::info!("starting {SERVICE} for {instance}");
        let pid = ctx.runner.spawn(&cmd, &log_file)?;
        fs::write(self.pid_path(instance), format!("{pid}\n"))?;
        Ok(())
    }

    fn stop(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        if ctx.hooks.service(ctx, ServiceAction::Stop, SERVICE, instance)? {
            return Ok(());
        }
        if let Some(pid) = self.running_pid(instance)? {
            log::info!("stopping {SERVICE} for {instance}");
            process::terminate(pid)?;
        }
        remove_file(&self.pid_path(instance))
    }
}

impl CapabilityModule for Prometheus {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn manifest_key(&self) -> Option<&'static str> {
        Some(KEY)
    }

    fn validate_manifest(&self, payload: &serde_json::Value) -> Result<()> {
        let section: PrometheusManifest = serde_json::from_value(payload.clone())?;
        if section.port == 0 {
            return Err(Error::validation("prometheus port must not be 0").into());
        }
        Ok(())
    }

    fn ports(&self, _ctx: &Ctx, manifest: &InstanceManifest) -> Result<Option<Vec<(String, u16)>>> {
        Ok(Self::section(manifest)?.map(|s| vec![(KEY.to_string(), s.port)]))
    }

    fn roles(&self, _ctx: &Ctx, manifest: &InstanceManifest) -> Result<Option<Vec<Role>>> {
        Ok(Self::section(manifest)?.map(|s| {
            vec![Role {
                name: ROLE.to_string(),
                password: s.password,
                login: true,
                in_roles: vec!["pg_monitor".to_string()],
                ..Default::default()
            }]
        }))
    }

    fn instance_configured<'a>(
        &'a self,
        ctx: &'a Ctx,
        tx: &mut Transaction<'a>,
        instance: &'a Instance,
        manifest: &'a InstanceManifest,
        _changes: &ConfigChanges,
        creating: bool,
    ) -> Result<()> {
        let Some(section) = Self::section(manifest)? else {
            return Ok(());
        };
        let content = Self::render_config(ctx, manifest, &section)?;
        let path = self.config_path(instance);
        if !creating {
            if write_if_changed(&path, &content)? && self.running_pid(instance)?.is_some() {
                log::warn!("{SERVICE} of {instance} must be restarted to use its new settings");
            }
            return Ok(());
        }
        let revert_path = path.clone();
        tx.run(
            format!("configuring {SERVICE} for {instance}"),
            || write_if_changed(&path, &content).map(|_| ()),
            move || remove_file(&revert_path),
        )?;
        tx.run(
            format!("enabling {SERVICE} service for {instance}"),
            || {
                ctx.hooks
                    .service(ctx, ServiceAction::Enable, SERVICE, instance)?;
                Ok(())
            },
            move || {
                ctx.hooks
                    .service(ctx, ServiceAction::Disable, SERVICE, instance)?;
                Ok(())
            },
        )
    }

    fn instance_started(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        if !self.config_path(instance).exists() {
            return Ok(());
        }
        self.start(ctx, instance)
    }

    fn instance_stopped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        if !self.config_path(instance).exists() {
            return Ok(());
        }
        self.stop(ctx, instance)
    }

    fn instance_dropped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        let path = self.config_path(instance);
        if !path.exists() {
            return Ok(());
        }
        self.stop(ctx, instance)?;
        ctx.hooks
            .service(ctx, ServiceAction::Disable, SERVICE, instance)?;
        remove_file(&path)
    }

    fn live_facts(&self, _ctx: &Ctx, instance: &Instance) -> Result<Option<Facts>> {
        if !self.config_path(instance).exists() {
            return Ok(None);
        }
        let fact = serde_json::json!({
            "port": self.listen_port(instance)?,
            "running": self.running_pid(instance)?.is_some(),
        });
        Ok(Some(Facts::from([(KEY.to_string(), fact)])))
    }
}
