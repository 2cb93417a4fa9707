//! Physical backups with pgBackRest
//!
//! Instances opt in with a `backup` manifest section. Each gets a stanza,
//! described in `<config_dir>/conf.d/<qualname>.conf`; the site-wide
//! `pgbackrest.conf` points every stanza at the shared repository.

use crate::capabilities::{remove_file, write_if_changed};
use crate::ctx::Ctx;
use crate::error::Error;
use crate::hooks::{CapabilityModule, Facts};
use crate::instance::configure::ConfigChanges;
use crate::instance::lifecycle;
use crate::manifest::InstanceManifest;
use crate::settings::{BackupSettings, Settings};
use crate::system::Instance;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use declarative::Transaction;
use pgkit::{Cmd, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

const KEY: &str = "backup";

/// The `backup` manifest section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupManifest {
    /// Defaults to the qualified instance name
    #[serde(default)]
    pub stanza: Option<String>,
}

pub struct Backup {
    execpath: PathBuf,
    config_dir: PathBuf,
    repository: PathBuf,
    log_dir: PathBuf,
}

impl Backup {
    pub fn new(backup: &BackupSettings, settings: &Settings) -> Self {
        Self {
            execpath: backup.execpath.clone(),
            config_dir: backup.config_dir(&settings.prefix),
            repository: backup.repository(&settings.prefix),
            log_dir: settings.log_dir().join("pgbackrest"),
        }
    }

    fn section(manifest: &InstanceManifest) -> Result<Option<BackupManifest>> {
        manifest
            .capability(KEY)
            .map(|payload| serde_json::from_value(payload.clone()))
            .transpose()
            .map_err(|e| Error::validation(format!("invalid '{KEY}' section: {e}")).into())
    }

    fn stanza_name(manifest: &InstanceManifest, section: &BackupManifest) -> String {
        section
            .stanza
            .clone()
            .unwrap_or_else(|| manifest.id().qualname())
    }

    fn global_config_path(&self) -> PathBuf {
        self.config_dir.join("pgbackrest.conf")
    }

    fn stanza_config_path(&self, instance: &Instance) -> PathBuf {
        self.config_dir
            .join("conf.d")
            .join(format!("{}.conf", instance.id.qualname()))
    }

    /// Stanza of `instance`, read back from its configuration file
    pub fn stanza(&self, instance: &Instance) -> Result<Option<String>> {
        let path = self.stanza_config_path(instance);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Ok(content.lines().find_map(|l| {
            l.trim()
                .strip_prefix('[')
                .and_then(|l| l.strip_suffix(']'))
                .map(String::from)
        }))
    }

    fn render_global(&self) -> String {
        format!(
            "[global]\nrepo1-path = {}\nrepo1-retention-full = 2\nlog-path = {}\n",
            self.repository.display(),
            self.log_dir.display()
        )
    }

    fn render_stanza(
        &self,
        ctx: &Ctx,
        instance: &Instance,
        manifest: &InstanceManifest,
        stanza: &str,
    ) -> Result<String> {
        Ok(format!(
            "[{stanza}]\npg1-path = {}\npg1-port = {}\npg1-socket-path = {}\npg1-user = {}\n",
            instance.datadir.display(),
            manifest.effective_port()?,
            ctx.settings.socket_directory().display(),
            ctx.settings.postgresql.surole.name,
        ))
    }

    fn command(&self, stanza: &str) -> Cmd {
        Cmd::new(&self.execpath)
            .arg(format!("--config-path={}", self.config_dir.display()))
            .arg(format!("--stanza={stanza}"))
    }

    fn repository_dirs(&self, stanza: &str) -> [PathBuf; 2] {
        [
            self.repository.join("archive").join(stanza),
            self.repository.join("backup").join(stanza),
        ]
    }

    fn remove_repository(&self, stanza: &str) -> Result<()> {
        for dir in self.repository_dirs(stanza) {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("Could not remove {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

/// Start time of the most recent backup in `pgbackrest info --output=json`
fn last_backup(info: &str) -> Result<Option<(String, DateTime<Utc>)>> {
    #[derive(Deserialize)]
    struct Stanza {
        #[serde(default)]
        backup: Vec<BackupInfo>,
    }
    #[derive(Deserialize)]
    struct BackupInfo {
        #[serde(rename = "type")]
        kind: String,
        timestamp: Timestamp,
    }
    #[derive(Deserialize)]
    struct Timestamp {
        start: i64,
    }

    let stanzas: Vec<Stanza> = serde_json::from_str(info).context("Invalid pgbackrest info output")?;
    Ok(stanzas
        .into_iter()
        .flat_map(|s| s.backup)
        .max_by_key(|b| b.timestamp.start)
        .and_then(|b| DateTime::from_timestamp(b.timestamp.start, 0).map(|t| (b.kind, t))))
}

impl CapabilityModule for Backup {
    fn name(&self) -> &'static str {
        "backup"
    }

    fn manifest_key(&self) -> Option<&'static str> {
        Some(KEY)
    }

    fn validate_manifest(&self, payload: &serde_json::Value) -> Result<()> {
        let section: BackupManifest = serde_json::from_value(payload.clone())?;
        if let Some(stanza) = &section.stanza
            && (stanza.is_empty() || stanza.contains(['[', ']', '/']))
        {
            return Err(Error::validation(format!("invalid stanza name '{stanza}'")).into());
        }
        Ok(())
    }

    fn instance_configuration(
        &self,
        _ctx: &Ctx,
        manifest: &InstanceManifest,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let Some(section) = Self::section(manifest)? else {
            return Ok(None);
        };
        let stanza = Self::stanza_name(manifest, &section);
        let archive_command = format!(
            "{} --config-path={} --stanza={stanza} archive-push %p",
            self.execpath.display(),
            self.config_dir.display()
        );
        Ok(Some(BTreeMap::from([
            ("archive_mode".to_string(), Value::Bool(true)),
            ("archive_command".to_string(), Value::from(archive_command)),
            ("wal_level".to_string(), Value::from("replica")),
        ])))
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
        let stanza = Self::stanza_name(manifest, &section);
        write_if_changed(&self.global_config_path(), &self.render_global())?;
        let content = self.render_stanza(ctx, instance, manifest, &stanza)?;
        let path = self.stanza_config_path(instance);
        if !creating {
            write_if_changed(&path, &content)?;
            return Ok(());
        }

        let revert_path = path.clone();
        tx.run(
            format!("configuring pgBackRest stanza '{stanza}'"),
            || write_if_changed(&path, &content).map(|_| ()),
            move || remove_file(&revert_path),
        )?;
        if instance.is_standby() {
            return Ok(());
        }
        let revert_stanza = stanza.clone();
        tx.run(
            format!("creating pgBackRest stanza '{stanza}'"),
            || {
                lifecycle::with_running(ctx, instance, || {
                    ctx.runner
                        .run_checked(&self.command(&stanza).arg("stanza-create"))?;
                    Ok(())
                })
            },
            move || self.remove_repository(&revert_stanza),
        )
    }

    fn instance_dropped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        let Some(stanza) = self.stanza(instance)? else {
            return Ok(());
        };
        log::info!("deleting pgBackRest stanza '{stanza}'");
        ctx.runner
            .run_checked(&self.command(&stanza).arg("--force").arg("stanza-delete"))?;
        self.remove_repository(&stanza)?;
        remove_file(&self.stanza_config_path(instance))
    }

    fn instance_env(&self, _ctx: &Ctx, instance: &Instance) -> Result<Option<BTreeMap<String, String>>> {
        let Some(stanza) = self.stanza(instance)? else {
            return Ok(None);
        };
        Ok(Some(BTreeMap::from([
            (
                "PGBACKREST_CONFIG_PATH".to_string(),
                self.config_dir.display().to_string(),
            ),
            ("PGBACKREST_STANZA".to_string(), stanza),
        ])))
    }

    fn live_facts(&self, ctx: &Ctx, instance: &Instance) -> Result<Option<Facts>> {
        let Some(stanza) = self.stanza(instance)? else {
            return Ok(None);
        };
        let output = ctx
            .runner
            .run_checked(&self.command(&stanza).arg("--output=json").arg("info"))?;
        let last = last_backup(&output.stdout)?;
        let fact = serde_json::json!({
            "stanza": stanza,
            "last_backup": last.as_ref().map(|(_, t)| t.to_rfc3339()),
            "last_backup_type": last.map(|(kind, _)| kind),
        });
        Ok(Some(Facts::from([(KEY.to_string(), fact)])))
    }
}
