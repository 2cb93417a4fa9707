use crate::ctx::Ctx;
use crate::manifest::Database;
use crate::system::Instance;
use anyhow::Result;
use declarative::{ChangeState, PresenceState, Resource, ResourceState};
use pgkit::{Cluster, DatabaseSpec};

pub struct DatabaseResource<'a> {
    pub ctx: &'a Ctx,
    pub instance: &'a Instance,
    pub cluster: &'a Cluster,
    pub database: &'a Database,
}

impl DatabaseResource<'_> {
    fn spec(&self) -> DatabaseSpec {
        DatabaseSpec {
            name: self.database.name.clone(),
            owner: self.database.owner.clone(),
        }
    }

    /// An unset owner in the manifest accepts any owner
    fn owner_differs(&self, current: &DatabaseSpec) -> bool {
        self.database
            .owner
            .as_ref()
            .is_some_and(|owner| current.owner.as_ref() != Some(owner))
    }
}

impl Resource for DatabaseResource<'_> {
    fn id(&self) -> String {
        self.database.name.clone()
    }

    fn description(&self) -> String {
        format!("database '{}'", self.database.name)
    }

    fn resource_type(&self) -> &'static str {
        "database"
    }

    fn current_state(&self) -> Result<ResourceState> {
        Ok(
            match self.ctx.backend.get_database(self.cluster, &self.database.name)? {
                Some(db) => ResourceState::Present { details: db.owner },
                None => ResourceState::Absent,
            },
        )
    }

    fn desired_state(&self) -> ResourceState {
        match self.database.state {
            PresenceState::Present => ResourceState::Present {
                details: self.database.owner.clone(),
            },
            PresenceState::Absent => ResourceState::Absent,
        }
    }

    fn needs_apply(&self) -> Result<bool> {
        let current = self.ctx.backend.get_database(self.cluster, &self.database.name)?;
        Ok(match (current, self.database.state) {
            (Some(current), PresenceState::Present) => self.owner_differs(&current),
            (Some(_), PresenceState::Absent) | (None, PresenceState::Present) => true,
            (None, PresenceState::Absent) => false,
        })
    }

    fn apply(&self) -> Result<Option<ChangeState>> {
        let current = self.ctx.backend.get_database(self.cluster, &self.database.name)?;
        let name = &self.database.name;
        Ok(match (current, self.database.state) {
            (None, PresenceState::Present) => {
                log::info!("creating database '{name}' on instance {}", self.instance);
                self.ctx.backend.create_database(self.cluster, &self.spec())?;
                Some(ChangeState::Created)
            }
            (Some(current), PresenceState::Present) if self.owner_differs(&current) => {
                log::info!("altering database '{name}' on instance {}", self.instance);
                self.ctx.backend.alter_database(self.cluster, &self.spec())?;
                Some(ChangeState::Changed)
            }
            (Some(_), PresenceState::Absent) => {
                log::info!("dropping database '{name}' from instance {}", self.instance);
                self.ctx.backend.drop_database(self.cluster, name)?;
                Some(ChangeState::Dropped)
            }
            _ => None,
        })
    }
}
