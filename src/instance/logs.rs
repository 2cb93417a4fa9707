//! Server log files

use crate::system::Instance;
use anyhow::{Context, Result, anyhow};
use std::fs;
use std::path::PathBuf;

const CURRENT_LOGFILES: &str = "current_logfiles";

/// Log file the server currently writes to, for the first configured
/// `log_destination`
pub fn current_logfile(instance: &Instance) -> Result<PathBuf> {
    let path = instance.datadir.join(CURRENT_LOGFILES);
    if !path.exists() {
        return Err(anyhow!(
            "file '{CURRENT_LOGFILES}' for instance {instance} not found"
        ));
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    let destination = instance
        .config()?
        .get("log_destination")
        .map(|v| v.as_text())
        .and_then(|d| d.split(',').map(str::trim).find(|s| !s.is_empty()).map(String::from))
        .unwrap_or_else(|| "stderr".to_string());
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(kind, _)| *kind == destination)
        .map(|(_, file)| instance.datadir.join(file.trim()))
        .ok_or_else(|| anyhow!("no {destination} record found in {CURRENT_LOGFILES}"))
}

/// Lines of the current log file
pub fn logs(instance: &Instance) -> Result<Vec<String>> {
    let path = current_logfile(instance)?;
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    Ok(content.lines().map(String::from).collect())
}
