//! Execution context shared by every operation
//!
//! Built once at startup and passed by reference; nothing in it changes
//! afterwards. It is `Sync`, so a bulk apply can share one context across
//! worker threads.

use crate::capabilities;
use crate::hooks::HookRegistry;
use crate::settings::Settings;
use anyhow::Result;
use declarative::{Confirm, DefaultAnswer};
use pgkit::{Backend, PgCtlBackend, Runner};
use std::sync::Arc;

pub struct Ctx {
    pub settings: Settings,
    pub runner: Arc<dyn Runner>,
    pub backend: Arc<dyn Backend>,
    pub hooks: HookRegistry,
    confirm: Box<dyn Confirm>,
}

impl Ctx {
    /// Context with the capability modules enabled by `settings` and a
    /// `pg_ctl` backend over `runner`
    pub fn new(settings: Settings, runner: Arc<dyn Runner>) -> Self {
        let backend = Arc::new(PgCtlBackend::new(Arc::clone(&runner)));
        let hooks = capabilities::registry(&settings);
        Self {
            settings,
            runner,
            backend,
            hooks,
            confirm: Box::new(DefaultAnswer),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_confirm(mut self, confirm: Box<dyn Confirm>) -> Self {
        self.confirm = confirm;
        self
    }

    /// Ask the operator; non-interactive contexts answer `default`
    pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        self.confirm.confirm(prompt, default)
    }
}
