use crate::ctx::Ctx;
use anyhow::Result;
use declarative::{ChangeState, PresenceState, Resource, ResourceState};
use pgkit::Cluster;

/// An extension in one database
pub struct ExtensionResource<'a> {
    pub ctx: &'a Ctx,
    pub cluster: &'a Cluster,
    pub dbname: &'a str,
    pub name: String,
    pub state: PresenceState,
}

impl Resource for ExtensionResource<'_> {
    fn id(&self) -> String {
        format!("{}.{}", self.dbname, self.name)
    }

    fn description(&self) -> String {
        format!("extension '{}' in database '{}'", self.name, self.dbname)
    }

    fn resource_type(&self) -> &'static str {
        "extension"
    }

    fn current_state(&self) -> Result<ResourceState> {
        let installed = self.ctx.backend.installed_extensions(self.cluster, self.dbname)?;
        Ok(if installed.contains(&self.name) {
            ResourceState::Present { details: None }
        } else {
            ResourceState::Absent
        })
    }

    fn desired_state(&self) -> ResourceState {
        match self.state {
            PresenceState::Present => ResourceState::Present { details: None },
            PresenceState::Absent => ResourceState::Absent,
        }
    }

    fn apply(&self) -> Result<Option<ChangeState>> {
        match self.state {
            PresenceState::Present => {
                log::info!("creating extension '{}' in database {}", self.name, self.dbname);
                self.ctx
                    .backend
                    .create_extension(self.cluster, self.dbname, &self.name)?;
                Ok(Some(ChangeState::Created))
            }
            PresenceState::Absent => {
                log::info!("dropping extension '{}' from database {}", self.name, self.dbname);
                self.ctx
                    .backend
                    .drop_extension(self.cluster, self.dbname, &self.name)?;
                Ok(Some(ChangeState::Dropped))
            }
        }
    }
}
