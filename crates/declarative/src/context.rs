//! Interaction seams for reconciliation
//!
//! Operations that need a user decision or report progress go through these
//! traits, so the library stays free of any terminal or UI dependency.

use anyhow::Result;

/// Yes/no decisions asked of the operator
///
/// The `default` is the answer an implementation should return when it
/// cannot or should not ask.
pub trait Confirm: Send + Sync {
    /// Ask to confirm `prompt`
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;
}

/// Always answers yes
pub struct AutoConfirm;

impl Confirm for AutoConfirm {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        log::debug!("auto-confirming: {prompt}");
        Ok(true)
    }
}

/// Always answers no
pub struct AutoDecline;

impl Confirm for AutoDecline {
    fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
        log::debug!("auto-declining: {prompt}");
        Ok(false)
    }
}

/// Answers with the prompt's default
///
/// Used for non-interactive runs.
pub struct DefaultAnswer;

impl Confirm for DefaultAnswer {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        log::debug!("{prompt} [{}]", if default { "yes" } else { "no" });
        Ok(default)
    }
}

/// Progress notifications emitted while applying resources
pub trait ProgressCallback {
    /// A resource is about to be applied
    fn on_resource_start(&mut self, id: &str, description: &str);

    /// A resource has been applied
    fn on_resource_complete(&mut self, id: &str, change: Option<crate::ChangeState>);
}

/// Progress callback that ignores every notification
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_resource_start(&mut self, _id: &str, _description: &str) {}
    fn on_resource_complete(&mut self, _id: &str, _change: Option<crate::ChangeState>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_implementations() {
        assert!(AutoConfirm.confirm("go?", false).unwrap());
        assert!(!AutoDecline.confirm("go?", true).unwrap());
        assert!(DefaultAnswer.confirm("go?", true).unwrap());
        assert!(!DefaultAnswer.confirm("go?", false).unwrap());
    }
}
