//! Capability modules and their dispatch
//!
//! A [`CapabilityModule`] participates in the instance lifecycle by
//! overriding the hooks it cares about; every hook has a neutral default.
//! The [`HookRegistry`] is built once at startup and dispatches each hook
//! with a fixed aggregation discipline:
//!
//! | Hook | Discipline |
//! |---|---|
//! | `service_name` | first non-null |
//! | `init_replication`, service operations | any true |
//! | `ports`, `instance_configuration`, `preload_libraries`, `instance_env`, `roles`, `rolenames`, `live_facts` | merge |
//! | `instance_configured`, `instance_started`, `instance_stopped`, `instance_dropped`, `role_changed`, `role_dropped` | call all |

use crate::ctx::Ctx;
use crate::instance::configure::ConfigChanges;
use crate::manifest::{InstanceManifest, Role};
use crate::system::Instance;
use anyhow::Result;
use declarative::{HookOrder, HookSet, Transaction};
use declarative::{any_true, call_all, first_non_null, merge_all};
use pgkit::Value;
use std::collections::BTreeMap;

/// Live-state fragment contributed by a capability, keyed by section name
pub type Facts = BTreeMap<String, serde_json::Value>;

/// A service operation, dispatched until a module handles it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
        }
    }
}

#[allow(unused_variables)]
pub trait CapabilityModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn order(&self) -> HookOrder {
        HookOrder::Normal
    }

    /// Top-level manifest section owned by this module
    fn manifest_key(&self) -> Option<&'static str> {
        None
    }

    /// Check this module's manifest section
    fn validate_manifest(&self, payload: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    /// Ports the module binds for `manifest`, with their owner name
    fn ports(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Option<Vec<(String, u16)>>> {
        Ok(None)
    }

    /// Create the data directory by a specialized path; `true` if handled
    fn init_replication(
        &self,
        ctx: &Ctx,
        instance: &Instance,
        manifest: &InstanceManifest,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Configuration entries required by the module
    fn instance_configuration(
        &self,
        ctx: &Ctx,
        manifest: &InstanceManifest,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        Ok(None)
    }

    /// Libraries to add to `shared_preload_libraries`
    fn preload_libraries(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// `postgresql.conf` was written; artifacts created here should be
    /// registered on `tx` with their revert
    fn instance_configured<'a>(
        &'a self,
        ctx: &'a Ctx,
        tx: &mut Transaction<'a>,
        instance: &'a Instance,
        manifest: &'a InstanceManifest,
        changes: &ConfigChanges,
        creating: bool,
    ) -> Result<()> {
        Ok(())
    }

    /// OS service unit name of `service` for `instance`
    fn service_name(&self, ctx: &Ctx, service: &str, instance: &Instance) -> Result<Option<String>> {
        Ok(None)
    }

    /// Perform `action` on a service through a service manager; `true` if
    /// handled
    fn service(
        &self,
        ctx: &Ctx,
        action: ServiceAction,
        service: &str,
        instance: &Instance,
    ) -> Result<bool> {
        Ok(false)
    }

    fn instance_started(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        Ok(())
    }

    fn instance_stopped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        Ok(())
    }

    /// Remove every artifact the module owns for `instance`
    fn instance_dropped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        Ok(())
    }

    /// Extra environment for tools working on `instance`
    fn instance_env(&self, ctx: &Ctx, instance: &Instance) -> Result<Option<BTreeMap<String, String>>> {
        Ok(None)
    }

    /// Roles the module needs on a new instance
    fn roles(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Option<Vec<Role>>> {
        Ok(None)
    }

    /// A role was created or altered; `true` if the module changed something
    fn role_changed(&self, ctx: &Ctx, instance: &Instance, role: &Role) -> Result<bool> {
        Ok(false)
    }

    /// Names of roles the module keeps state for
    fn rolenames(&self, ctx: &Ctx, instance: &Instance) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Forget what the module keeps for `rolename`
    fn role_dropped(&self, ctx: &Ctx, instance: &Instance, rolename: &str) -> Result<()> {
        Ok(())
    }

    /// Live-state fragment, only asked while the instance runs
    fn live_facts(&self, ctx: &Ctx, instance: &Instance) -> Result<Option<Facts>> {
        Ok(None)
    }
}

/// The registered capability modules, in dispatch order
#[derive(Default)]
pub struct HookRegistry {
    modules: HookSet<dyn CapabilityModule>,
}

impl HookRegistry {
    pub fn new(modules: Vec<Box<dyn CapabilityModule>>) -> Self {
        Self {
            modules: HookSet::new(modules, |m| m.order()),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.modules.iter().map(|m| m.name()).collect()
    }

    pub fn by_manifest_key(&self, key: &str) -> Option<&dyn CapabilityModule> {
        self.modules.iter().find(|m| m.manifest_key() == Some(key))
    }

    pub fn ports(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Vec<(String, u16)>> {
        merge_all(self.modules.iter(), |m| m.ports(ctx, manifest))
    }

    pub fn init_replication(
        &self,
        ctx: &Ctx,
        instance: &Instance,
        manifest: &InstanceManifest,
    ) -> Result<bool> {
        any_true(self.modules.iter(), |m| m.init_replication(ctx, instance, manifest))
    }

    pub fn instance_configuration(
        &self,
        ctx: &Ctx,
        manifest: &InstanceManifest,
    ) -> Result<BTreeMap<String, Value>> {
        merge_all(self.modules.iter(), |m| m.instance_configuration(ctx, manifest))
    }

    pub fn preload_libraries(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Vec<String>> {
        merge_all(self.modules.iter(), |m| m.preload_libraries(ctx, manifest))
    }

    pub fn instance_configured<'a>(
        &'a self,
        ctx: &'a Ctx,
        tx: &mut Transaction<'a>,
        instance: &'a Instance,
        manifest: &'a InstanceManifest,
        changes: &ConfigChanges,
        creating: bool,
    ) -> Result<()> {
        call_all(self.modules.iter(), |m| {
            m.instance_configured(ctx, tx, instance, manifest, changes, creating)
        })
    }

    pub fn service_name(&self, ctx: &Ctx, service: &str, instance: &Instance) -> Result<Option<String>> {
        first_non_null(self.modules.iter(), |m| m.service_name(ctx, service, instance))
    }

    pub fn service(
        &self,
        ctx: &Ctx,
        action: ServiceAction,
        service: &str,
        instance: &Instance,
    ) -> Result<bool> {
        any_true(self.modules.iter(), |m| m.service(ctx, action, service, instance))
    }

    pub fn instance_started(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        call_all(self.modules.iter(), |m| m.instance_started(ctx, instance))
    }

    pub fn instance_stopped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        call_all(self.modules.iter(), |m| m.instance_stopped(ctx, instance))
    }

    pub fn instance_dropped(&self, ctx: &Ctx, instance: &Instance) -> Result<()> {
        call_all(self.modules.iter(), |m| m.instance_dropped(ctx, instance))
    }

    pub fn instance_env(&self, ctx: &Ctx, instance: &Instance) -> Result<BTreeMap<String, String>> {
        merge_all(self.modules.iter(), |m| m.instance_env(ctx, instance))
    }

    pub fn roles(&self, ctx: &Ctx, manifest: &InstanceManifest) -> Result<Vec<Role>> {
        merge_all(self.modules.iter(), |m| m.roles(ctx, manifest))
    }

    /// Every module is notified; `true` if one of them changed something
    pub fn role_changed(&self, ctx: &Ctx, instance: &Instance, role: &Role) -> Result<bool> {
        let mut changed = false;
        call_all(self.modules.iter(), |m| {
            changed |= m.role_changed(ctx, instance, role)?;
            Ok(())
        })?;
        Ok(changed)
    }

    pub fn rolenames(&self, ctx: &Ctx, instance: &Instance) -> Result<Vec<String>> {
        merge_all(self.modules.iter(), |m| m.rolenames(ctx, instance))
    }

    pub fn role_dropped(&self, ctx: &Ctx, instance: &Instance, rolename: &str) -> Result<()> {
        call_all(self.modules.iter(), |m| m.role_dropped(ctx, instance, rolename))
    }

    pub fn live_facts(&self, ctx: &Ctx, instance: &Instance) -> Result<Facts> {
        merge_all(self.modules.iter(), |m| m.live_facts(ctx, instance))
    }
}
