//! Server process lifecycle
//!
//! Every operation re-reads the server status; nothing is cached between
//! calls. Public operations (`start`, `stop`, `restart`) notify capability
//! modules; the `*_postgresql` variants and the scoped helpers only drive
//! the server itself.

use crate::ctx::Ctx;
use crate::error::Error;
use crate::hooks::ServiceAction;
use crate::system::Instance;
use anyhow::Result;
use pgkit::{Status, StopMode};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Service name of the server itself, as known to service managers
pub const SERVICE: &str = "postgresql";

pub fn status(ctx: &Ctx, instance: &Instance) -> Result<Status> {
    Ok(ctx.backend.status(&instance.cluster()?)?)
}

pub fn is_running(ctx: &Ctx, instance: &Instance) -> Result<bool> {
    Ok(status(ctx, instance)? == Status::Running)
}

/// Fail with `InstanceState` unless the server is in `expected` state
pub fn check_status(ctx: &Ctx, instance: &Instance, expected: Status) -> Result<()> {
    let actual = status(ctx, instance)?;
    if actual != expected {
        return Err(Error::state(instance, format!("instance is {actual}")).into());
    }
    Ok(())
}

/// Poll until the server accepts connections
pub fn wait_ready(ctx: &Ctx, instance: &Instance) -> Result<()> {
    let timeout = ctx.settings.ready_timeout();
    let started = Instant::now();
    loop {
        if ctx.backend.is_ready(&instance.cluster()?)? {
            log::debug!("{instance} is ready");
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(Error::InstanceNotReady {
                instance: instance.to_string(),
                timeout,
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Poll until the server is no longer running
fn wait_stopped(ctx: &Ctx, instance: &Instance) -> Result<()> {
    let timeout = ctx.settings.stop_timeout();
    let started = Instant::now();
    while is_running(ctx, instance)? {
        if started.elapsed() >= timeout {
            return Err(Error::InstanceStillRunning {
                instance: instance.to_string(),
                timeout,
            }
            .into());
        }
        thread::sleep(POLL_INTERVAL);
    }
    Ok(())
}

// ============================================================================
// Server only
// ============================================================================

/// Start the server, through the service manager when one handles it
///
/// Blocks until the server is ready, unless in `foreground` mode where the
/// call only returns once the server exits.
pub fn start_postgresql(ctx: &Ctx, instance: &Instance, foreground: bool) -> Result<()> {
    log::info!("starting PostgreSQL {instance}");
    if foreground {
        ctx.backend.start(&instance.cluster()?, true)?;
        return Ok(());
    }
    if !ctx
        .hooks
        .service(ctx, ServiceAction::Start, SERVICE, instance)?
    {
        ctx.backend.start(&instance.cluster()?, false)?;
    }
    wait_ready(ctx, instance)
}

pub fn stop_postgresql(ctx: &Ctx, instance: &Instance, mode: StopMode, wait: bool) -> Result<()> {
    log::info!("stopping PostgreSQL {instance}");
    if !ctx
        .hooks
        .service(ctx, ServiceAction::Stop, SERVICE, instance)?
    {
        ctx.backend.stop(&instance.cluster()?, mode, wait)?;
    }
    Ok(())
}

fn restart_postgresql(ctx: &Ctx, instance: &Instance, mode: StopMode) -> Result<()> {
    log::info!("restarting PostgreSQL {instance}");
    if ctx
        .hooks
        .service(ctx, ServiceAction::Restart, SERVICE, instance)?
    {
        return wait_ready(ctx, instance);
    }
    if is_running(ctx, instance)? {
        ctx.backend.stop(&instance.cluster()?, mode, true)?;
    }
    start_postgresql(ctx, instance, false)
}

// ============================================================================
// Lifecycle operations
// ============================================================================

/// Start the instance; a no-op with a warning if it already runs
///
/// Capability modules are notified unless in `foreground` mode.
pub fn start(ctx: &Ctx, instance: &Instance, foreground: bool) -> Result<()> {
    match status(ctx, instance)? {
        Status::Running => {
            log::warn!("instance {instance} is already started");
            return Ok(());
        }
        Status::Unspecified => {
            return Err(Error::state(instance, "data directory is missing or invalid").into());
        }
        Status::NotRunning => {}
    }
    start_postgresql(ctx, instance, foreground)?;
    if !foreground {
        ctx.hooks.instance_started(ctx, instance)?;
    }
    Ok(())
}

/// Stop the instance; a no-op with a warning if it is not running
pub fn stop(ctx: &Ctx, instance: &Instance, mode: StopMode, wait: bool) -> Result<()> {
    match status(ctx, instance)? {
        Status::NotRunning => {
            log::warn!("instance {instance} is already stopped");
            return Ok(());
        }
        Status::Unspecified => {
            return Err(Error::state(instance, "data directory is missing or invalid").into());
        }
        Status::Running => {}
    }
    stop_postgresql(ctx, instance, mode, wait)?;
    ctx.hooks.instance_stopped(ctx, instance)
}

pub fn restart(ctx: &Ctx, instance: &Instance, mode: StopMode) -> Result<()> {
    ctx.hooks.instance_stopped(ctx, instance)?;
    restart_postgresql(ctx, instance, mode)?;
    ctx.hooks.instance_started(ctx, instance)
}

/// Make the running server re-read its configuration
pub fn reload(ctx: &Ctx, instance: &Instance) -> Result<()> {
    log::info!("reloading PostgreSQL configuration for {instance}");
    if !ctx
        .hooks
        .service(ctx, ServiceAction::Reload, SERVICE, instance)?
    {
        ctx.backend.reload(&instance.cluster()?)?;
    }
    Ok(())
}

/// Turn a standby into a primary
pub fn promote(ctx: &Ctx, instance: &Instance) -> Result<()> {
    if !instance.is_standby() {
        return Err(Error::state(instance, "not a standby").into());
    }
    check_status(ctx, instance, Status::Running)?;
    log::info!("promoting PostgreSQL instance {instance}");
    ctx.backend.promote(&instance.cluster()?)?;
    Ok(())
}

// ============================================================================
// Scopes
// ============================================================================

/// Combine the result of a scoped body with the result of leaving the scope
fn finish<T>(instance: &Instance, body: Result<T>, leave: Result<()>) -> Result<T> {
    match (body, leave) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(leave_err)) => {
            log::error!("{instance}: {leave_err:#}");
            Err(e)
        }
    }
}

/// Run `f` with the server running, starting it for the duration if needed
pub fn with_running<T>(ctx: &Ctx, instance: &Instance, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if is_running(ctx, instance)? {
        return f();
    }
    start_postgresql(ctx, instance, false)?;
    let body = f();
    let leave = stop_postgresql(ctx, instance, StopMode::Fast, true);
    finish(instance, body, leave)
}

/// Run `f` with the server stopped, stopping it for the duration if needed
///
/// Fails with `InstanceStillRunning` if the server does not stop within the
/// configured timeout.
pub fn with_stopped<T>(ctx: &Ctx, instance: &Instance, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if !is_running(ctx, instance)? {
        return f();
    }
    stop_postgresql(ctx, instance, StopMode::Fast, true)?;
    wait_stopped(ctx, instance)?;
    let body = f();
    let leave = start_postgresql(ctx, instance, false);
    finish(instance, body, leave)
}
