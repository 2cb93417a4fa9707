//! Actual state of an instance
//!
//! On-disk facts are always reported. Facts that can only be read from a
//! live server are `None` when the server is not running, which means
//! "unknown", never "empty".

use crate::ctx::Ctx;
use crate::hooks::Facts;
use crate::instance::lifecycle::{self, SERVICE};
use crate::system::{Instance, InstanceId, StandbyInfo};
use anyhow::Result;
use pgkit::{DatabaseSpec, RoleSpec, Status, Value};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActualState {
    pub name: String,
    pub version: String,
    pub status: Status,
    /// Port of the running server, or the configured one
    pub port: u16,
    /// Active entries of `postgresql.conf`
    pub configuration: BTreeMap<String, Value>,
    pub data_directory: PathBuf,
    pub wal_directory: PathBuf,
    /// OS service unit, when a service manager handles the instance
    pub service: Option<String>,
    pub data_checksums: Option<bool>,
    pub locale: Option<String>,
    pub encoding: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub roles: Option<Vec<RoleSpec>>,
    pub databases: Option<Vec<DatabaseSpec>>,
    pub pending_restart: Option<bool>,
    pub standby: Option<StandbyInfo>,
    /// Live fragments contributed by capability modules
    pub capabilities: Facts,
}

/// Discover the state of instance `id`
///
/// Fails with `InstanceNotFound` if it does not exist.
pub fn discover(ctx: &Ctx, id: InstanceId) -> Result<ActualState> {
    let instance = Instance::system_lookup(&ctx.settings, id)?;
    discover_instance(ctx, &instance)
}

pub fn discover_instance(ctx: &Ctx, instance: &Instance) -> Result<ActualState> {
    let status = lifecycle::status(ctx, instance)?;
    let cluster = instance.cluster()?;
    let standby = instance.standby()?;

    let mut state = ActualState {
        name: instance.id.name.clone(),
        version: instance.id.version.clone(),
        status,
        port: cluster.port,
        configuration: instance.config()?.entries(),
        data_directory: instance.datadir.clone(),
        wal_directory: instance.waldir.clone(),
        service: ctx.hooks.service_name(ctx, SERVICE, instance)?,
        data_checksums: None,
        locale: None,
        encoding: None,
        extensions: None,
        roles: None,
        databases: None,
        pending_restart: None,
        standby,
        capabilities: Facts::new(),
    };
    if status != Status::Unspecified {
        state.data_checksums = Some(ctx.backend.data_checksums(&cluster)?);
    }

    if status == Status::Running {
        state.locale = ctx.backend.locale(&cluster)?;
        state.encoding = Some(ctx.backend.encoding(&cluster)?);
        state.extensions = Some(ctx.backend.installed_extensions(&cluster, "postgres")?);
        state.roles = Some(ctx.backend.list_roles(&cluster)?);
        state.databases = Some(ctx.backend.list_databases(&cluster)?);
        state.pending_restart = Some(ctx.backend.pending_restart(&cluster)?);
        state.capabilities = ctx.hooks.live_facts(ctx, instance)?;
    } else {
        let mut unknown = vec![
            "locale",
            "encoding",
            "extensions",
            "roles",
            "databases",
            "pending_restart",
        ];
        if state.standby.is_some() {
            unknown.push("replication lag");
        }
        log::warn!(
            "instance {instance} is not running, information about {} may not be accurate",
            unknown.join(", ")
        );
    }
    Ok(state)
}
