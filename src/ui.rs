use anyhow::Result;
use colored::Colorize;
use declarative::{ChangeState, Confirm};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Short label for a reconciliation outcome
pub fn change_label(change: Option<ChangeState>) -> &'static str {
    match change {
        Some(ChangeState::Created) => "created",
        Some(ChangeState::Changed) => "changed",
        Some(ChangeState::Dropped) => "dropped",
        None => "unchanged",
    }
}

/// Terminal prompt backed by `dialoguer`
pub struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()?)
    }
}
