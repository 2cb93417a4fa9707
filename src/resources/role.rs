use crate::ctx::Ctx;
use crate::manifest::Role;
use crate::system::Instance;
use anyhow::Result;
use declarative::{ChangeState, PresenceState, Resource, ResourceState};
use pgkit::{Cluster, RoleSpec};

/// A database role of a running instance
pub struct RoleResource<'a> {
    pub ctx: &'a Ctx,
    pub instance: &'a Instance,
    pub cluster: &'a Cluster,
    pub role: &'a Role,
}

impl RoleResource<'_> {
    fn current(&self) -> Result<Option<RoleSpec>> {
        Ok(self.ctx.backend.get_role(self.cluster, &self.role.name)?)
    }
}

impl Resource for RoleResource<'_> {
    fn id(&self) -> String {
        self.role.name.clone()
    }

    fn description(&self) -> String {
        format!("role '{}'", self.role.name)
    }

    fn resource_type(&self) -> &'static str {
        "role"
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(match self.current()? {
            Some(_) => ResourceState::Present { details: None },
            None => ResourceState::Absent,
        })
    }

    fn desired_state(&self) -> ResourceState {
        match self.role.state {
            PresenceState::Present => ResourceState::Present { details: None },
            PresenceState::Absent => ResourceState::Absent,
        }
    }

    fn needs_apply(&self) -> Result<bool> {
        Ok(match (self.current()?, self.role.state) {
            (Some(current), PresenceState::Present) => {
                !self.role.spec().same_attributes(&current)
            }
            (Some(_), PresenceState::Absent) | (None, PresenceState::Present) => true,
            (None, PresenceState::Absent) => false,
        })
    }

    fn apply(&self) -> Result<Option<ChangeState>> {
        let desired = self.role.spec();
        let change = match (self.current()?, self.role.state) {
            (None, PresenceState::Present) => {
                log::info!("creating role '{}' on instance {}", desired.name, self.instance);
                self.ctx.backend.create_role(self.cluster, &desired)?;
                Some(ChangeState::Created)
            }
            (Some(current), PresenceState::Present) if !desired.same_attributes(&current) => {
                log::info!("altering role '{}' on instance {}", desired.name, self.instance);
                self.ctx.backend.alter_role(self.cluster, &desired, &current)?;
                Some(ChangeState::Changed)
            }
            (Some(_), PresenceState::Absent) => {
                log::info!("dropping role '{}' from instance {}", desired.name, self.instance);
                self.ctx.backend.drop_role(self.cluster, &desired.name)?;
                self.ctx
                    .hooks
                    .role_dropped(self.ctx, self.instance, &desired.name)?;
                return Ok(Some(ChangeState::Dropped));
            }
            _ => None,
        };
        if change.is_some() {
            self.ctx
                .hooks
                .role_changed(self.ctx, self.instance, self.role)?;
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::lifecycle;
    use crate::testing::{self, create_instance};
    use tempfile::TempDir;

    #[test]
    fn test_role_create_alter_drop() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let instance = create_instance(&ctx, "db1", 5433);
        lifecycle::start(&ctx, &instance, false).unwrap();
        let cluster = instance.cluster().unwrap();

        let mut role = Role {
            name: "app".into(),
            login: true,
            password: Some("pw".into()),
            ..Default::default()
        };
        let resource = RoleResource {
            ctx: &ctx,
            instance: &instance,
            cluster: &cluster,
            role: &role,
        };
        assert!(resource.needs_apply().unwrap());
        assert_eq!(resource.apply().unwrap(), Some(ChangeState::Created));
        assert!(!resource.needs_apply().unwrap());
        assert!(backend.role(&instance, "app").unwrap().login);

        role.connection_limit = Some(10);
        let resource = RoleResource {
            ctx: &ctx,
            instance: &instance,
            cluster: &cluster,
            role: &role,
        };
        assert_eq!(resource.apply().unwrap(), Some(ChangeState::Changed));

        role.state = PresenceState::Absent;
        let resource = RoleResource {
            ctx: &ctx,
            instance: &instance,
            cluster: &cluster,
            role: &role,
        };
        assert_eq!(resource.apply().unwrap(), Some(ChangeState::Dropped));
        assert!(backend.role(&instance, "app").is_none());
        assert!(!resource.needs_apply().unwrap());
    }
}
