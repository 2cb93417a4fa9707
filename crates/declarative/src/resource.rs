//! Resource trait for declarative state management
//!
//! A resource is an object (a role, a database, an extension) whose current
//! state can be observed and converged to a desired state.

use crate::types::{ChangeState, ResourceState};
use anyhow::Result;

/// Core trait for declarative resources
///
/// # Example
///
/// ```ignore
/// use declarative::{ChangeState, Resource, ResourceState};
///
/// struct Schema<'a> { client: &'a Client, name: String }
///
/// impl Resource for Schema<'_> {
///     fn id(&self) -> String { self.name.clone() }
///     fn description(&self) -> String { format!("schema '{}'", self.name) }
///     fn resource_type(&self) -> &'static str { "schema" }
///
///     fn current_state(&self) -> anyhow::Result<ResourceState> {
///         Ok(if self.client.has_schema(&self.name)? {
///             ResourceState::Present { details: None }
///         } else {
///             ResourceState::Absent
///         })
///     }
///
///     fn desired_state(&self) -> ResourceState {
///         ResourceState::Present { details: None }
///     }
///
///     fn apply(&self) -> anyhow::Result<Option<ChangeState>> {
///         self.client.create_schema(&self.name)?;
///         Ok(Some(ChangeState::Created))
///     }
/// }
/// ```
pub trait Resource {
    /// Identifier, unique within the resource type
    fn id(&self) -> String;

    /// Human-readable description
    fn description(&self) -> String;

    /// Resource type category, used for grouping in reports
    fn resource_type(&self) -> &'static str;

    /// Observe the current state
    fn current_state(&self) -> Result<ResourceState>;

    /// The state the resource should reach
    fn desired_state(&self) -> ResourceState;

    /// Whether [`Resource::apply`] would change anything
    ///
    /// The default compares current and desired states; resources whose
    /// attributes can drift while present should override it.
    fn needs_apply(&self) -> Result<bool> {
        Ok(self.current_state()? != self.desired_state())
    }

    /// Converge to the desired state
    ///
    /// Returns `None` when nothing had to change.
    fn apply(&self) -> Result<Option<ChangeState>>;
}

/// A boxed resource for type-erased storage
pub type BoxedResource<'a> = Box<dyn Resource + 'a>;
