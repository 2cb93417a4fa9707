//! Standby instances: creation from a primary and replication lag

use crate::ctx::Ctx;
use crate::hooks::{CapabilityModule, Facts};
use crate::manifest::InstanceManifest;
use crate::system::Instance;
use anyhow::Result;
use declarative::HookOrder;
use pgkit::ReplicationSource;

/// Runs after every other module so that specialized initializers win
pub struct Replication;

impl CapabilityModule for Replication {
    fn name(&self) -> &'static str {
        "replication"
    }

    fn order(&self) -> HookOrder {
        HookOrder::TryLast
    }

    fn init_replication(
        &self,
        ctx: &Ctx,
        instance: &Instance,
        manifest: &InstanceManifest,
    ) -> Result<bool> {
        let Some(standby) = &manifest.standby else {
            return Ok(false);
        };
        log::info!("initializing standby {instance} with a base backup");
        let source = ReplicationSource {
            primary_conninfo: standby.primary_conninfo.clone(),
            slot: standby.slot.clone(),
            password: standby.password.clone(),
        };
        ctx.backend.basebackup(&instance.cluster()?, &source)?;
        Ok(true)
    }

    fn live_facts(&self, ctx: &Ctx, instance: &Instance) -> Result<Option<Facts>> {
        if !instance.is_standby() {
            return Ok(None);
        }
        let lag = ctx.backend.replication_lag(&instance.cluster()?)?;
        Ok(Some(Facts::from([(
            "replication_lag".to_string(),
            serde_json::json!(lag),
        )])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{self, discovery, lifecycle};
    use crate::testing::{self, Op};
    use tempfile::TempDir;

    fn manifest(yaml: &str) -> InstanceManifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_standby_creation_skips_roles() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let m = manifest(
            r"
name: replica
version: '16'
replrole_password: r3pl
standby:
  primary_conninfo: host=primary port=5432 user=replication
  slot: replica1
roles:
  - name: app
",
        );
        instance::apply(&ctx, &m).unwrap();
        assert_eq!(backend.count(Op::Basebackup), 1);
        assert_eq!(backend.count(Op::Initdb), 0);
        assert_eq!(backend.count(Op::CreateRole), 0);

        let state = instance::discover(&ctx, m.id()).unwrap();
        let standby = state.standby.unwrap();
        assert_eq!(standby.slot.as_deref(), Some("replica1"));
        assert_eq!(state.capabilities["replication_lag"], serde_json::json!(0));
    }

    #[test]
    fn test_promotion() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let standby = "name: replica\nversion: '16'\nstandby:\n  primary_conninfo: host=primary\n";
        instance::apply(&ctx, &manifest(standby)).unwrap();

        let promoted = format!("{standby}  status: promoted\n");
        let outcome = instance::apply(&ctx, &manifest(&promoted)).unwrap();
        assert!(outcome.change_state.is_some());
        assert_eq!(backend.count(Op::Promote), 1);
        let instance = Instance::new(&ctx.settings, manifest(standby).id());
        assert!(!instance.is_standby());
        assert!(lifecycle::is_running(&ctx, &instance).unwrap());

        instance::apply(&ctx, &manifest(&promoted)).unwrap();
        assert_eq!(backend.count(Op::Promote), 1);
        let state = discovery::discover_instance(&ctx, &instance).unwrap();
        assert!(state.standby.is_none());
        assert!(!state.capabilities.contains_key("replication_lag"));
    }
}
