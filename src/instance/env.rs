//! Environment for client tools working on an instance

use crate::ctx::Ctx;
use crate::error::Error;
use crate::system::Instance;
use anyhow::Result;
use pgkit::Cmd;
use std::collections::BTreeMap;
use std::env;

/// libpq and psql variables addressing `instance`, capability additions
/// included
pub fn env_for(ctx: &Ctx, instance: &Instance) -> Result<BTreeMap<String, String>> {
    let cluster = instance.cluster()?;
    let mut vars = BTreeMap::from([
        ("PGUSER".to_string(), cluster.user.clone()),
        ("PGPORT".to_string(), cluster.port.to_string()),
        ("PGHOST".to_string(), cluster.socket_dir.display().to_string()),
        ("PGDATA".to_string(), instance.datadir.display().to_string()),
        ("PSQLRC".to_string(), instance.psqlrc().display().to_string()),
        (
            "PSQL_HISTORY".to_string(),
            instance.psql_history().display().to_string(),
        ),
    ]);
    vars.extend(ctx.hooks.instance_env(ctx, instance)?);
    Ok(vars)
}

/// Shell `export` lines, sorted by name, with the server binaries first in
/// `PATH`
pub fn render(ctx: &Ctx, instance: &Instance) -> Result<String> {
    let mut vars = env_for(ctx, instance)?;
    let path = match env::var("PATH") {
        Ok(path) if !path.is_empty() => format!("{}:{path}", instance.bindir.display()),
        _ => instance.bindir.display().to_string(),
    };
    vars.insert("PATH".to_string(), path);
    Ok(vars
        .iter()
        .map(|(name, value)| format!("export {name}={}\n", quote(value)))
        .collect())
}

/// Run `program` from the server binaries directory with the environment of
/// `instance`, returning its exit status
pub fn exec(ctx: &Ctx, instance: &Instance, program: &str, args: &[String]) -> Result<i32> {
    let path = instance.bindir.join(program);
    if !path.is_file() {
        return Err(Error::validation(format!(
            "program '{program}' not found in {}",
            instance.bindir.display()
        ))
        .into());
    }
    let mut cmd = Cmd::new(&path).args(args);
    for (name, value) in env_for(ctx, instance)? {
        cmd = cmd.env(name, value);
    }
    log::debug!("executing {}", cmd.display());
    Ok(ctx.runner.run_inherit(&cmd)?)
}

fn quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-:=@,+%".contains(c))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}
