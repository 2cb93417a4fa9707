//! Backend driving the PostgreSQL binaries: `pg_ctl`, `initdb`,
//! `pg_basebackup`, `pg_isready` and `psql`.

use crate::backend::Backend;
use crate::cmd::{Cmd, Runner};
use crate::error::{Error, Result};
use crate::types::{
    Cluster, DatabaseSpec, InitdbOptions, ReplicationSource, RoleSpec, Setting, Status, StopMode,
};
use serde::de::DeserializeOwned;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

/// Quote an SQL identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Backend that executes the PostgreSQL client and server programs found in
/// each cluster's `bindir`.
pub struct PgCtlBackend {
    runner: Arc<dyn Runner>,
}

impl PgCtlBackend {
    /// Create a backend running commands through `runner`.
    pub fn new(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    fn pg_ctl(cluster: &Cluster, action: &str) -> Cmd {
        Cmd::new(cluster.bin("pg_ctl"))
            .arg(action)
            .arg("-D")
            .arg(cluster.datadir.display().to_string())
    }

    fn psql(cluster: &Cluster, dbname: &str, sql: &str) -> Cmd {
        let mut cmd = Cmd::new(cluster.bin("psql"))
            .args(["-X", "-A", "-t", "-q", "-v", "ON_ERROR_STOP=1"])
            .arg("-h")
            .arg(cluster.socket_dir.display().to_string())
            .arg("-p")
            .arg(cluster.port.to_string())
            .arg("-U")
            .arg(&cluster.user)
            .arg("-d")
            .arg(dbname)
            .arg("-c")
            .arg(sql);
        if let Some(password) = &cluster.password {
            cmd = cmd.env("PGPASSWORD", password);
        }
        cmd
    }

    /// Run a statement, discarding its output.
    fn execute(&self, cluster: &Cluster, dbname: &str, sql: &str) -> Result<()> {
        log::debug!("{}: {sql}", cluster.datadir.display());
        self.runner.run_checked(&Self::psql(cluster, dbname, sql))?;
        Ok(())
    }

    /// Run a query returning at most one text value.
    fn query_value(&self, cluster: &Cluster, dbname: &str, sql: &str) -> Result<Option<String>> {
        let output = self.runner.run_checked(&Self::psql(cluster, dbname, sql))?;
        let value = output.stdout.trim();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    /// Run a query returning one JSON document.
    fn query_json<T: DeserializeOwned>(
        &self,
        cluster: &Cluster,
        dbname: &str,
        sql: &str,
    ) -> Result<Option<T>> {
        match self.query_value(cluster, dbname, sql)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn pwfile_path(cluster: &Cluster) -> PathBuf {
        cluster.datadir.with_file_name(".pwfile")
    }
}

/// JSON rendering of a `pg_roles r` row as a [`RoleSpec`]
const ROLE_OBJECT: &str = "json_build_object(\
    'name', r.rolname, 'login', r.rolcanlogin, 'superuser', r.rolsuper, \
    'replication', r.rolreplication, \
    'connection_limit', NULLIF(r.rolconnlimit, -1), \
    'in_roles', ARRAY(SELECT g.rolname FROM pg_auth_members m \
    JOIN pg_roles g ON g.oid = m.roleid WHERE m.member = r.oid ORDER BY 1))";

fn role_options(role: &RoleSpec, with_password: bool) -> String {
    let mut opts = vec![
        if role.login { "LOGIN" } else { "NOLOGIN" }.to_string(),
        if role.superuser { "SUPERUSER" } else { "NOSUPERUSER" }.to_string(),
        if role.replication {
            "REPLICATION"
        } else {
            "NOREPLICATION"
        }
        .to_string(),
        format!("CONNECTION LIMIT {}", role.connection_limit.unwrap_or(-1)),
    ];
    if with_password && let Some(password) = &role.password {
        opts.push(format!("PASSWORD {}", quote_literal(password)));
    }
    opts.join(" ")
}

impl Backend for PgCtlBackend {
    fn initdb(&self, cluster: &Cluster, options: &InitdbOptions) -> Result<()> {
        let mut cmd = Cmd::new(cluster.bin("initdb"))
            .arg("--pgdata")
            .arg(cluster.datadir.display().to_string())
            .arg("--waldir")
            .arg(cluster.waldir.display().to_string())
            .arg("--username")
            .arg(&cluster.user)
            .arg(format!("--auth-local={}", options.auth_local))
            .arg(format!("--auth-host={}", options.auth_host));
        if let Some(locale) = &options.locale {
            cmd = cmd.arg(format!("--locale={locale}"));
        }
        if let Some(encoding) = &options.encoding {
            cmd = cmd.arg(format!("--encoding={encoding}"));
        }
        if options.data_checksums {
            cmd = cmd.arg("--data-checksums");
        }

        let pwfile = Self::pwfile_path(cluster);
        if let Some(password) = &options.password {
            if let Some(parent) = pwfile.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&pwfile)?;
            writeln!(f, "{password}")?;
            cmd = cmd.arg(format!("--pwfile={}", pwfile.display()));
        }

        let result = self.runner.run_checked(&cmd);
        if options.password.is_some() {
            std::fs::remove_file(&pwfile)?;
        }
        result.map(|_| ())
    }

    fn basebackup(&self, cluster: &Cluster, source: &ReplicationSource) -> Result<()> {
        let mut cmd = Cmd::new(cluster.bin("pg_basebackup"))
            .arg("--pgdata")
            .arg(cluster.datadir.display().to_string())
            .arg("--waldir")
            .arg(cluster.waldir.display().to_string())
            .args(["--write-recovery-conf", "--checkpoint=fast", "--no-password"])
            .arg("--dbname")
            .arg(&source.primary_conninfo);
        if let Some(slot) = &source.slot {
            cmd = cmd.arg("--slot").arg(slot);
        }
        if let Some(password) = &source.password {
            cmd = cmd.env("PGPASSWORD", password);
        }
        self.runner.run_checked(&cmd)?;
        Ok(())
    }

    fn status(&self, cluster: &Cluster) -> Result<Status> {
        let cmd = Self::pg_ctl(cluster, "status");
        let output = self.runner.run(&cmd)?;
        match output.exit_code {
            0 => Ok(Status::Running),
            3 => Ok(Status::NotRunning),
            4 => Ok(Status::Unspecified),
            _ => Err(output.into_error(&cmd)),
        }
    }

    fn start(&self, cluster: &Cluster, foreground: bool) -> Result<()> {
        if foreground {
            let cmd = Cmd::new(cluster.bin("postgres"))
                .arg("-D")
                .arg(cluster.datadir.display().to_string());
            let code = self.runner.run_inherit(&cmd)?;
            if code != 0 {
                return Err(Error::Command {
                    exit_code: code,
                    args: cmd.argv(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }
            return Ok(());
        }
        let logfile = cluster.datadir.with_file_name("startup.log");
        let cmd = Self::pg_ctl(cluster, "start")
            .args(["-W", "-s", "-l"])
            .arg(logfile.display().to_string());
        self.runner.run_checked(&cmd)?;
        Ok(())
    }

    fn stop(&self, cluster: &Cluster, mode: StopMode, wait: bool) -> Result<()> {
        let cmd = Self::pg_ctl(cluster, "stop")
            .args(["-m", mode.as_str(), "-s"])
            .arg(if wait { "-w" } else { "-W" });
        self.runner.run_checked(&cmd)?;
        Ok(())
    }

    fn is_ready(&self, cluster: &Cluster) -> Result<bool> {
        let cmd = Cmd::new(cluster.bin("pg_isready"))
            .arg("-q")
            .arg("-h")
            .arg(cluster.socket_dir.display().to_string())
            .arg("-p")
            .arg(cluster.port.to_string())
            .arg("-U")
            .arg(&cluster.user)
            .args(["-d", "postgres"]);
        let output = self.runner.run(&cmd)?;
        match output.exit_code {
            0 => Ok(true),
            // 1: rejecting connections (starting up), 2: no response
            1 | 2 => Ok(false),
            _ => Err(output.into_error(&cmd)),
        }
    }

    fn reload(&self, cluster: &Cluster) -> Result<()> {
        self.runner
            .run_checked(&Self::pg_ctl(cluster, "reload").arg("-s"))?;
        Ok(())
    }

    fn promote(&self, cluster: &Cluster) -> Result<()> {
        self.runner
            .run_checked(&Self::pg_ctl(cluster, "promote").args(["-w", "-s"]))?;
        Ok(())
    }

    fn data_checksums(&self, cluster: &Cluster) -> Result<bool> {
        let cmd = Cmd::new(cluster.bin("pg_controldata"))
            .arg("-D")
            .arg(cluster.datadir.display().to_string());
        let output = self.runner.run_checked(&cmd)?;
        let version = output
            .stdout
            .lines()
            .find_map(|l| l.strip_prefix("Data page checksum version:"))
            .map(str::trim)
            .ok_or_else(|| Error::UnexpectedOutput {
                program: "pg_controldata".to_string(),
                output: output.stdout.clone(),
            })?;
        Ok(version != "0")
    }

    fn set_data_checksums(&self, cluster: &Cluster, enabled: bool) -> Result<()> {
        let cmd = Cmd::new(cluster.bin("pg_checksums"))
            .arg(if enabled { "--enable" } else { "--disable" })
            .arg("--pgdata")
            .arg(cluster.datadir.display().to_string());
        self.runner.run_checked(&cmd)?;
        Ok(())
    }

    fn settings(&self, cluster: &Cluster) -> Result<Vec<Setting>> {
        let sql = "SELECT coalesce(json_agg(json_build_object(\
                   'name', name, 'setting', setting, 'context', context, \
                   'pending_restart', pending_restart)), '[]') FROM pg_settings";
        Ok(self
            .query_json(cluster, "postgres", sql)?
            .unwrap_or_default())
    }

    fn encoding(&self, cluster: &Cluster) -> Result<String> {
        let sql = "SELECT pg_encoding_to_char(encoding) FROM pg_database \
                   WHERE datname = current_database()";
        self.query_value(cluster, "postgres", sql)?
            .ok_or_else(|| Error::UnexpectedOutput {
                program: "psql".to_string(),
                output: "no encoding for current database".to_string(),
            })
    }

    fn locale(&self, cluster: &Cluster) -> Result<Option<String>> {
        let sql = "SELECT datcollate FROM pg_database WHERE datname = current_database()";
        self.query_value(cluster, "postgres", sql)
    }

    fn replication_lag(&self, cluster: &Cluster) -> Result<Option<u64>> {
        let sql = "SELECT CASE WHEN pg_is_in_recovery() THEN \
                   pg_wal_lsn_diff(pg_last_wal_receive_lsn(), pg_last_wal_replay_lsn()) END";
        match self.query_value(cluster, "postgres", sql)? {
            None => Ok(None),
            Some(lag) => lag
                .parse::<f64>()
                .map(|l| Some(l.max(0.0) as u64))
                .map_err(|_| Error::UnexpectedOutput {
                    program: "psql".to_string(),
                    output: lag,
                }),
        }
    }

    fn installed_extensions(&self, cluster: &Cluster, dbname: &str) -> Result<Vec<String>> {
        let output = self.runner.run_checked(&Self::psql(
            cluster,
            dbname,
            "SELECT extname FROM pg_extension ORDER BY extname",
        ))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn create_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()> {
        let sql = format!("CREATE EXTENSION IF NOT EXISTS {} CASCADE", quote_ident(name));
        self.execute(cluster, dbname, &sql)
    }

    fn drop_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()> {
        let sql = format!("DROP EXTENSION IF EXISTS {} CASCADE", quote_ident(name));
        self.execute(cluster, dbname, &sql)
    }

    fn list_roles(&self, cluster: &Cluster) -> Result<Vec<RoleSpec>> {
        let sql = format!(
            "SELECT coalesce(json_agg({ROLE_OBJECT} ORDER BY r.rolname), '[]') \
             FROM pg_roles r WHERE r.rolname !~ '^pg_'"
        );
        Ok(self.query_json(cluster, "postgres", &sql)?.unwrap_or_default())
    }

    fn get_role(&self, cluster: &Cluster, name: &str) -> Result<Option<RoleSpec>> {
        let sql = format!(
            "SELECT {ROLE_OBJECT} FROM pg_roles r WHERE r.rolname = {}",
            quote_literal(name)
        );
        self.query_json(cluster, "postgres", &sql)
    }

    fn create_role(&self, cluster: &Cluster, role: &RoleSpec) -> Result<()> {
        let mut sql = format!(
            "CREATE ROLE {} {}",
            quote_ident(&role.name),
            role_options(role, true)
        );
        if !role.in_roles.is_empty() {
            let roles: Vec<String> = role.in_roles.iter().map(|r| quote_ident(r)).collect();
            sql.push_str(&format!(" IN ROLE {}", roles.join(", ")));
        }
        self.execute(cluster, "postgres", &sql)
    }

    fn alter_role(&self, cluster: &Cluster, desired: &RoleSpec, current: &RoleSpec) -> Result<()> {
        let ident = quote_ident(&desired.name);
        let mut statements = vec![format!("ALTER ROLE {ident} {}", role_options(desired, false))];
        for granted in desired.in_roles.iter().filter(|r| !current.in_roles.contains(r)) {
            statements.push(format!("GRANT {} TO {ident}", quote_ident(granted)));
        }
        for revoked in current.in_roles.iter().filter(|r| !desired.in_roles.contains(r)) {
            statements.push(format!("REVOKE {} FROM {ident}", quote_ident(revoked)));
        }
        self.execute(cluster, "postgres", &statements.join("; "))
    }

    fn drop_role(&self, cluster: &Cluster, name: &str) -> Result<()> {
        self.execute(cluster, "postgres", &format!("DROP ROLE {}", quote_ident(name)))
    }

    fn list_databases(&self, cluster: &Cluster) -> Result<Vec<DatabaseSpec>> {
        let sql = "SELECT coalesce(json_agg(json_build_object(\
                   'name', datname, 'owner', pg_get_userbyid(datdba)) ORDER BY datname), '[]') \
                   FROM pg_database WHERE NOT datistemplate";
        Ok(self.query_json(cluster, "postgres", sql)?.unwrap_or_default())
    }

    fn get_database(&self, cluster: &Cluster, name: &str) -> Result<Option<DatabaseSpec>> {
        let sql = format!(
            "SELECT json_build_object('name', datname, 'owner', pg_get_userbyid(datdba)) \
             FROM pg_database WHERE datname = {}",
            quote_literal(name)
        );
        self.query_json(cluster, "postgres", &sql)
    }

    fn create_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()> {
        let mut sql = format!("CREATE DATABASE {}", quote_ident(&database.name));
        if let Some(owner) = &database.owner {
            sql.push_str(&format!(" OWNER {}", quote_ident(owner)));
        }
        self.execute(cluster, "postgres", &sql)
    }

    fn alter_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()> {
        let Some(owner) = &database.owner else {
            return Ok(());
        };
        let sql = format!(
            "ALTER DATABASE {} OWNER TO {}",
            quote_ident(&database.name),
            quote_ident(owner)
        );
        self.execute(cluster, "postgres", &sql)
    }

    fn drop_database(&self, cluster: &Cluster, name: &str) -> Result<()> {
        self.execute(cluster, "postgres", &format!("DROP DATABASE {}", quote_ident(name)))
    }
}
