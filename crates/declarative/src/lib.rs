//! # Declarative
//!
//! Building blocks for converging a system to a declared state.
//!
//! ## Core Concepts
//!
//! - **Transaction**: a stack of completed tasks and their reverts, unwound
//!   most-recent first when a later step fails
//! - **HookSet**: an ordered plugin set with result aggregation disciplines
//!   (first non-null, any true, merge, call all)
//! - **Resource**: something with an observable state that can be converged
//! - **Confirm**: operator decisions, injected so the library stays UI-free

pub mod context;
pub mod diff;
pub mod executor;
pub mod hooks;
pub mod resource;
pub mod transaction;
pub mod types;

pub use context::{AutoConfirm, AutoDecline, Confirm, DefaultAnswer, NoProgress, ProgressCallback};
pub use diff::changes;
pub use executor::apply_resources;
pub use hooks::{any_true, call_all, first_non_null, merge_all, HookOrder, HookSet, Merge};
pub use resource::{BoxedResource, Resource};
pub use transaction::{transaction, TaskError, Transaction};
pub use types::{ApplySummary, ChangeState, PresenceState, ResourceState};
