//! External command execution.
//!
//! Every interaction with PostgreSQL binaries and auxiliary tools goes
//! through a [`Runner`], which makes the process boundary replaceable in
//! tests.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A command to execute: program, arguments, environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl Cmd {
    /// Create a command for `program` (a name looked up in `PATH` or a path).
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().display().to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory of the child.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program to run.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, without the program.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Environment overrides.
    pub fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Program and arguments, as reported in errors.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Shell-like rendering for log messages.
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status, -1 when terminated by a signal
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a successful command printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert into `Error::Command` for `cmd`.
    pub fn into_error(self, cmd: &Cmd) -> Error {
        Error::Command {
            exit_code: self.exit_code,
            args: cmd.argv(),
            stdout: self.stdout,
            stderr: self.stderr,
        }
    }
}

/// Executes external commands.
pub trait Runner: Send + Sync {
    /// Run `cmd` to completion and capture its output.
    ///
    /// A non-zero exit status is not an error here; only failing to launch
    /// the program is.
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput>;

    /// Run `cmd` in the foreground with inherited stdio, returning its exit
    /// status.
    fn run_inherit(&self, cmd: &Cmd) -> Result<i32>;

    /// Start `cmd` detached, with stdout and stderr appended to `log_file`,
    /// and return its pid without waiting.
    fn spawn(&self, cmd: &Cmd, log_file: &Path) -> Result<u32>;

    /// Run `cmd`, failing with `Error::Command` on non-zero exit.
    fn run_checked(&self, cmd: &Cmd) -> Result<CommandOutput> {
        let output = self.run(cmd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(output.into_error(cmd))
        }
    }
}

/// [`Runner`] backed by `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        log::debug!("running: {}", cmd.display());
        let output = cmd.to_command().stdin(Stdio::null()).output()?;
        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.success() {
            log::debug!("{} exited with {}", cmd.program(), result.exit_code);
        }
        Ok(result)
    }

    fn run_inherit(&self, cmd: &Cmd) -> Result<i32> {
        log::debug!("running (foreground): {}", cmd.display());
        let status = cmd
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status.code().unwrap_or(-1))
    }

    fn spawn(&self, cmd: &Cmd, log_file: &Path) -> Result<u32> {
        log::debug!("spawning: {} (log: {})", cmd.display(), log_file.display());
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        let child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .process_group(0)
            .spawn()?;
        Ok(child.id())
    }
}
