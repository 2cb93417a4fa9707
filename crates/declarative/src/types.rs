//! Core types for declarative reconciliation

use serde::{Deserialize, Serialize};

/// Should the object be present or absent?
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    #[default]
    Present,
    Absent,
}

/// Current or desired state of a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Resource exists/is configured
    Present { details: Option<String> },
    /// Resource does not exist/is not configured
    Absent,
}

/// What an apply operation did to its target
///
/// `None` in an `Option<ChangeState>` means nothing changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeState {
    /// Target was created
    Created,
    /// Target existed and was modified
    Changed,
    /// Target was removed
    Dropped,
}

impl ChangeState {
    /// Combine two outcomes of operations on the same target.
    ///
    /// Creation and removal dominate modification; anything dominates no change.
    pub fn combine(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (None, x) | (x, None) => x,
            (Some(Self::Created), _) | (_, Some(Self::Created)) => Some(Self::Created),
            (Some(Self::Dropped), _) | (_, Some(Self::Dropped)) => Some(Self::Dropped),
            _ => Some(Self::Changed),
        }
    }
}

/// Summary of applying a set of resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub changed: usize,
    pub dropped: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.changed + self.dropped
    }

    /// Whether anything changed
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: Option<ChangeState>) {
        match result {
            None => self.unchanged += 1,
            Some(ChangeState::Created) => self.created += 1,
            Some(ChangeState::Changed) => self.changed += 1,
            Some(ChangeState::Dropped) => self.dropped += 1,
        }
    }
}
