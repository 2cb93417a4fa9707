//! Command handlers behind the CLI

pub mod instance;
