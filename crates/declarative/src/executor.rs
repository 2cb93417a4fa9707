//! Sequential application of resources

use crate::context::ProgressCallback;
use crate::resource::Resource;
use crate::types::ApplySummary;
use anyhow::{Context, Result};

/// Apply every resource in order, stopping at the first failure
///
/// Resources already in their desired state are counted as unchanged without
/// calling [`Resource::apply`].
pub fn apply_resources<P: ProgressCallback>(
    resources: &[Box<dyn Resource + '_>],
    progress: &mut P,
) -> Result<ApplySummary> {
    let mut summary = ApplySummary::default();
    for resource in resources {
        let id = resource.id();
        if !resource.needs_apply()? {
            log::debug!("{} '{}' is up to date", resource.resource_type(), id);
            summary.add_result(None);
            continue;
        }
        progress.on_resource_start(&id, &resource.description());
        let change = resource
            .apply()
            .with_context(|| format!("failed to apply {}", resource.description()))?;
        progress.on_resource_complete(&id, change);
        summary.add_result(change);
    }
    Ok(summary)
}
