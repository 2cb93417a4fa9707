mod capabilities;
mod cli;
mod commands;
mod ctx;
mod error;
mod hooks;
mod instance;
mod manifest;
mod progress;
mod resources;
mod settings;
mod system;
#[cfg(test)]
mod testing;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use commands::instance as cmd;
use ctx::Ctx;
use declarative::{AutoConfirm, Confirm, DefaultAnswer};
use settings::Settings;
use std::io::{self, IsTerminal};
use std::sync::Arc;

fn main() {
    if let Err(e) = run() {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut command = Cli::command();
        generate(shell, &mut command, "pgsteward", &mut io::stdout());
        return Ok(());
    }

    let settings = match &cli.settings {
        Some(path) => Settings::from_file(path)?,
        None => Settings::load()?,
    };
    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AutoConfirm)
    } else if io::stdin().is_terminal() {
        Box::new(ui::Prompt)
    } else {
        Box::new(DefaultAnswer)
    };
    let ctx = Ctx::new(settings, Arc::new(pgkit::SystemRunner)).with_confirm(confirm);

    match cli.command {
        Command::Apply(args) => cmd::apply(ctx, &args.files, args.jobs),
        Command::Get(arg) => cmd::get(&ctx, &arg.instance),
        Command::List { pg_version } => cmd::list(&ctx, pg_version.as_deref()),
        Command::Status(arg) => cmd::status(&ctx, &arg.instance),
        Command::Start {
            instance,
            foreground,
        } => cmd::start(&ctx, &instance.instance, foreground),
        Command::Stop { instance, mode } => cmd::stop(&ctx, &instance.instance, mode.into()),
        Command::Restart { instance, mode } => {
            cmd::restart(&ctx, &instance.instance, mode.into())
        }
        Command::Reload(arg) => cmd::reload(&ctx, &arg.instance),
        Command::Promote(arg) => cmd::promote(&ctx, &arg.instance),
        Command::Drop(arg) => cmd::drop_instance(&ctx, &arg.instance),
        Command::Env(arg) => cmd::env(&ctx, &arg.instance),
        Command::Logs(arg) => cmd::logs(&ctx, &arg.instance),
        Command::Exec { instance, command } => cmd::exec(&ctx, &instance.instance, &command),
        Command::Upgrade(args) => cmd::upgrade(&ctx, &args),
        Command::Completions { .. } => Ok(()),
    }
}
