//! Test doubles: an in-memory PostgreSQL backend and a recording runner

use crate::ctx::Ctx;
use crate::settings::Settings;
use crate::system::{Instance, InstanceId};
use pgkit::conf::ConfigFile;
use pgkit::{
    Backend, Cluster, Cmd, CommandOutput, DatabaseSpec, Error, InitdbOptions, PostmasterPid,
    ReplicationSource, Result, RoleSpec, Runner, Setting, Status, StopMode,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Parameters the fake server only picks up at start
const POSTMASTER_PARAMETERS: &[&str] = &[
    "archive_mode",
    "cluster_name",
    "listen_addresses",
    "max_connections",
    "port",
    "shared_buffers",
    "shared_preload_libraries",
    "unix_socket_directories",
    "wal_level",
];

const SAMPLE_CONF: &str = "\
# PostgreSQL configuration file
max_connections = 100
shared_buffers = 128MB
#port = 5432
#log_destination = 'stderr'
";

/// Mutating backend operations, as recorded by [`MemoryBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Initdb,
    Basebackup,
    Start,
    Stop,
    Reload,
    Promote,
    SetChecksums,
    CreateExtension,
    DropExtension,
    CreateRole,
    AlterRole,
    DropRole,
    CreateDatabase,
    AlterDatabase,
    DropDatabase,
}

#[derive(Default)]
struct Server {
    running: bool,
    live: BTreeMap<String, String>,
    pending: BTreeSet<String>,
    checksums: bool,
    roles: BTreeMap<String, RoleSpec>,
    databases: BTreeMap<String, DatabaseSpec>,
    extensions: BTreeMap<String, BTreeSet<String>>,
}

/// Backend simulating clusters on disk and servers in memory
///
/// Data directories are real (`PG_VERSION`, `postgresql.conf`,
/// `postmaster.pid`); server processes, roles, databases and extensions
/// live in memory, keyed by data directory.
#[derive(Default)]
pub struct MemoryBackend {
    servers: Mutex<BTreeMap<PathBuf, Server>>,
    calls: Mutex<Vec<Op>>,
    failures: Mutex<BTreeSet<Op>>,
    never_ready: AtomicBool,
    ignore_stop: AtomicBool,
}

fn failure(what: &str, message: &str) -> Error {
    Error::Command {
        exit_code: 1,
        args: vec![what.to_string()],
        stdout: String::new(),
        stderr: message.to_string(),
    }
}

impl MemoryBackend {
    /// Make every later `op` fail
    pub fn fail(&self, op: Op) {
        self.failures.lock().unwrap().insert(op);
    }

    pub fn calls(&self) -> Vec<Op> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls().iter().filter(|o| **o == op).count()
    }

    /// Started servers never accept connections
    pub fn never_ready(&self) {
        self.never_ready.store(true, Ordering::SeqCst);
    }

    /// Stop requests are accepted but the server keeps running
    pub fn ignore_stop(&self) {
        self.ignore_stop.store(true, Ordering::SeqCst);
    }

    /// Value the running server uses for `name`
    pub fn live_setting(&self, instance: &Instance, name: &str) -> Option<String> {
        let servers = self.servers.lock().unwrap();
        servers.get(&instance.datadir)?.live.get(name).cloned()
    }

    pub fn role(&self, instance: &Instance, name: &str) -> Option<RoleSpec> {
        let servers = self.servers.lock().unwrap();
        servers.get(&instance.datadir)?.roles.get(name).cloned()
    }

    pub fn database(&self, instance: &Instance, name: &str) -> Option<DatabaseSpec> {
        let servers = self.servers.lock().unwrap();
        servers.get(&instance.datadir)?.databases.get(name).cloned()
    }

    pub fn extensions(&self, instance: &Instance, dbname: &str) -> Vec<String> {
        let servers = self.servers.lock().unwrap();
        servers
            .get(&instance.datadir)
            .and_then(|s| s.extensions.get(dbname))
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, op: Op) -> Result<()> {
        self.calls.lock().unwrap().push(op);
        if self.failures.lock().unwrap().contains(&op) {
            return Err(failure(&format!("{op:?}"), "injected failure"));
        }
        Ok(())
    }

    /// Run `f` on the running server of `cluster`
    fn with_server<T>(&self, cluster: &Cluster, f: impl FnOnce(&mut Server) -> T) -> Result<T> {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(&cluster.datadir) {
            Some(server) if server.running => Ok(f(server)),
            _ => Err(failure("psql", "could not connect to server")),
        }
    }

    fn disk_entries(cluster: &Cluster) -> Result<BTreeMap<String, String>> {
        let path = cluster.datadir.join("postgresql.conf");
        let config = if path.exists() {
            ConfigFile::load(&path)?
        } else {
            ConfigFile::default()
        };
        Ok(config
            .entries()
            .into_iter()
            .map(|(k, v)| (k, v.as_text()))
            .collect())
    }

    fn create_cluster(&self, cluster: &Cluster, options: &InitdbOptions) -> Result<()> {
        fs::create_dir_all(&cluster.datadir)?;
        fs::create_dir_all(&cluster.waldir)?;
        fs::write(cluster.datadir.join("PG_VERSION"), format!("{}\n", cluster.version))?;
        fs::write(cluster.datadir.join("postgresql.conf"), SAMPLE_CONF)?;
        let surole = RoleSpec {
            name: cluster.user.clone(),
            login: true,
            superuser: true,
            replication: true,
            ..Default::default()
        };
        let server = Server {
            checksums: options.data_checksums,
            roles: BTreeMap::from([(surole.name.clone(), surole)]),
            databases: ["postgres", "template1"]
                .into_iter()
                .map(|n| {
                    (
                        n.to_string(),
                        DatabaseSpec {
                            name: n.to_string(),
                            owner: Some(cluster.user.clone()),
                        },
                    )
                })
                .collect(),
            extensions: BTreeMap::from([(
                "postgres".to_string(),
                BTreeSet::from(["plpgsql".to_string()]),
            )]),
            ..Default::default()
        };
        self.servers
            .lock()
            .unwrap()
            .insert(cluster.datadir.clone(), server);
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn initdb(&self, cluster: &Cluster, options: &InitdbOptions) -> Result<()> {
        self.record(Op::Initdb)?;
        self.create_cluster(cluster, options)
    }

    fn basebackup(&self, cluster: &Cluster, source: &ReplicationSource) -> Result<()> {
        self.record(Op::Basebackup)?;
        self.create_cluster(cluster, &InitdbOptions::default())?;
        fs::write(cluster.datadir.join("standby.signal"), "")?;
        let mut auto = ConfigFile::default();
        auto.set("primary_conninfo", source.primary_conninfo.as_str());
        if let Some(slot) = &source.slot {
            auto.set("primary_slot_name", slot.as_str());
        }
        auto.save(&cluster.datadir.join("postgresql.auto.conf"))?;
        Ok(())
    }

    fn status(&self, cluster: &Cluster) -> Result<Status> {
        if !cluster.datadir.join("PG_VERSION").exists() {
            return Ok(Status::Unspecified);
        }
        let servers = self.servers.lock().unwrap();
        Ok(match servers.get(&cluster.datadir) {
            Some(server) if server.running => Status::Running,
            _ => Status::NotRunning,
        })
    }

    fn start(&self, cluster: &Cluster, _foreground: bool) -> Result<()> {
        self.record(Op::Start)?;
        let live = Self::disk_entries(cluster)?;
        let port = live
            .get("port")
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432);
        let pid = PostmasterPid {
            pid: std::process::id(),
            datadir: cluster.datadir.clone(),
            start_time: 0,
            port,
            socket_dir: Some(cluster.socket_dir.clone()),
            status: Some("ready".to_string()),
        };
        fs::write(PostmasterPid::path(&cluster.datadir), pid.render())?;
        let mut servers = self.servers.lock().unwrap();
        let server = servers.entry(cluster.datadir.clone()).or_default();
        server.running = true;
        server.live = live;
        server.pending.clear();
        Ok(())
    }

    fn stop(&self, cluster: &Cluster, _mode: StopMode, _wait: bool) -> Result<()> {
        self.record(Op::Stop)?;
        if self.ignore_stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(server) = self.servers.lock().unwrap().get_mut(&cluster.datadir) {
            server.running = false;
        }
        let pidfile = PostmasterPid::path(&cluster.datadir);
        if pidfile.exists() {
            fs::remove_file(pidfile)?;
        }
        Ok(())
    }

    fn is_ready(&self, cluster: &Cluster) -> Result<bool> {
        Ok(self.status(cluster)? == Status::Running && !self.never_ready.load(Ordering::SeqCst))
    }

    fn reload(&self, cluster: &Cluster) -> Result<()> {
        self.record(Op::Reload)?;
        let disk = Self::disk_entries(cluster)?;
        self.with_server(cluster, |server| {
            server
                .live
                .retain(|k, _| POSTMASTER_PARAMETERS.contains(&k.as_str()) || disk.contains_key(k));
            for (name, value) in disk {
                if POSTMASTER_PARAMETERS.contains(&name.as_str()) {
                    if server.live.get(&name) == Some(&value) {
                        server.pending.remove(&name);
                    } else {
                        server.pending.insert(name);
                    }
                } else {
                    server.live.insert(name, value);
                }
            }
        })
    }

    fn promote(&self, cluster: &Cluster) -> Result<()> {
        self.record(Op::Promote)?;
        fs::remove_file(cluster.datadir.join("standby.signal"))?;
        Ok(())
    }

    fn data_checksums(&self, cluster: &Cluster) -> Result<bool> {
        let servers = self.servers.lock().unwrap();
        Ok(servers.get(&cluster.datadir).is_some_and(|s| s.checksums))
    }

    fn set_data_checksums(&self, cluster: &Cluster, enabled: bool) -> Result<()> {
        self.record(Op::SetChecksums)?;
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(&cluster.datadir) {
            Some(server) if !server.running => {
                server.checksums = enabled;
                Ok(())
            }
            _ => Err(failure("pg_checksums", "cluster must be shut down")),
        }
    }

    fn settings(&self, cluster: &Cluster) -> Result<Vec<Setting>> {
        self.with_server(cluster, |server| {
            let mut names: BTreeSet<&str> = POSTMASTER_PARAMETERS.iter().copied().collect();
            names.extend(server.live.keys().map(String::as_str));
            names
                .into_iter()
                .map(|name| {
                    let postmaster = POSTMASTER_PARAMETERS.contains(&name);
                    Setting {
                        name: name.to_string(),
                        setting: server.live.get(name).cloned().unwrap_or_default(),
                        context: if postmaster { "postmaster" } else { "sighup" }.to_string(),
                        pending_restart: server.pending.contains(name),
                    }
                })
                .collect()
        })
    }

    fn encoding(&self, cluster: &Cluster) -> Result<String> {
        self.with_server(cluster, |_| "UTF8".to_string())
    }

    fn locale(&self, cluster: &Cluster) -> Result<Option<String>> {
        self.with_server(cluster, |_| Some("C".to_string()))
    }

    fn replication_lag(&self, cluster: &Cluster) -> Result<Option<u64>> {
        let standby = cluster.datadir.join("standby.signal").exists();
        self.with_server(cluster, |_| standby.then_some(0))
    }

    fn installed_extensions(&self, cluster: &Cluster, dbname: &str) -> Result<Vec<String>> {
        self.with_server(cluster, |server| {
            server
                .extensions
                .get(dbname)
                .map(|e| e.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    fn create_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()> {
        self.record(Op::CreateExtension)?;
        self.with_server(cluster, |server| {
            server
                .extensions
                .entry(dbname.to_string())
                .or_default()
                .insert(name.to_string());
        })
    }

    fn drop_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()> {
        self.record(Op::DropExtension)?;
        self.with_server(cluster, |server| {
            if let Some(e) = server.extensions.get_mut(dbname) {
                e.remove(name);
            }
        })
    }

    fn list_roles(&self, cluster: &Cluster) -> Result<Vec<RoleSpec>> {
        self.with_server(cluster, |server| server.roles.values().cloned().collect())
    }

    fn get_role(&self, cluster: &Cluster, name: &str) -> Result<Option<RoleSpec>> {
        self.with_server(cluster, |server| server.roles.get(name).cloned())
    }

    fn create_role(&self, cluster: &Cluster, role: &RoleSpec) -> Result<()> {
        self.record(Op::CreateRole)?;
        let role = RoleSpec {
            password: None,
            ..role.clone()
        };
        self.with_server(cluster, |server| {
            server.roles.insert(role.name.clone(), role);
        })
    }

    fn alter_role(&self, cluster: &Cluster, desired: &RoleSpec, _current: &RoleSpec) -> Result<()> {
        self.record(Op::AlterRole)?;
        let role = RoleSpec {
            password: None,
            ..desired.clone()
        };
        self.with_server(cluster, |server| {
            server.roles.insert(role.name.clone(), role);
        })
    }

    fn drop_role(&self, cluster: &Cluster, name: &str) -> Result<()> {
        self.record(Op::DropRole)?;
        self.with_server(cluster, |server| {
            server.roles.remove(name);
        })
    }

    fn list_databases(&self, cluster: &Cluster) -> Result<Vec<DatabaseSpec>> {
        self.with_server(cluster, |server| {
            server
                .databases
                .values()
                .filter(|db| !db.name.starts_with("template"))
                .cloned()
                .collect()
        })
    }

    fn get_database(&self, cluster: &Cluster, name: &str) -> Result<Option<DatabaseSpec>> {
        self.with_server(cluster, |server| server.databases.get(name).cloned())
    }

    fn create_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()> {
        self.record(Op::CreateDatabase)?;
        let user = cluster.user.clone();
        self.with_server(cluster, |server| {
            let owner = database.owner.clone().or(Some(user));
            server.databases.insert(
                database.name.clone(),
                DatabaseSpec {
                    name: database.name.clone(),
                    owner,
                },
            );
        })
    }

    fn alter_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()> {
        self.record(Op::AlterDatabase)?;
        self.with_server(cluster, |server| {
            server
                .databases
                .insert(database.name.clone(), database.clone());
        })
    }

    fn drop_database(&self, cluster: &Cluster, name: &str) -> Result<()> {
        self.record(Op::DropDatabase)?;
        self.with_server(cluster, |server| {
            server.databases.remove(name);
        })
    }
}

/// Pid reported for spawned commands; out of the valid pid range
pub const SPAWNED_PID: u32 = u32::MAX;

/// Runner recording commands and answering with canned outputs
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Cmd>>,
    outputs: Mutex<BTreeMap<String, CommandOutput>>,
}

impl RecordingRunner {
    /// Answer every later run of `program` (file name) with `output`
    pub fn respond(&self, program: &str, output: CommandOutput) {
        self.outputs
            .lock()
            .unwrap()
            .insert(program.to_string(), output);
    }

    pub fn calls(&self) -> Vec<Cmd> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered command lines, for assertions
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Cmd::display).collect()
    }

    fn answer(&self, cmd: &Cmd) -> CommandOutput {
        self.calls.lock().unwrap().push(cmd.clone());
        let program = Path::new(cmd.program())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.outputs
            .lock()
            .unwrap()
            .get(&program)
            .cloned()
            .unwrap_or_default()
    }
}

impl Runner for RecordingRunner {
    fn run(&self, cmd: &Cmd) -> Result<CommandOutput> {
        Ok(self.answer(cmd))
    }

    fn run_inherit(&self, cmd: &Cmd) -> Result<i32> {
        Ok(self.answer(cmd).exit_code)
    }

    /// Nothing is started; the returned pid never names a live process
    fn spawn(&self, cmd: &Cmd, _log_file: &Path) -> Result<u32> {
        self.answer(cmd);
        Ok(SPAWNED_PID)
    }
}

/// Context rooted at `prefix` with default settings
pub fn ctx(prefix: &Path) -> (Ctx, Arc<MemoryBackend>) {
    let (ctx, backend, _) = ctx_with(Settings::for_prefix(prefix));
    (ctx, backend)
}

/// Context for `settings`, registering the capabilities they enable
pub fn ctx_with(settings: Settings) -> (Ctx, Arc<MemoryBackend>, Arc<RecordingRunner>) {
    let backend = Arc::new(MemoryBackend::default());
    let runner = Arc::new(RecordingRunner::default());
    let ctx = Ctx::new(settings, runner.clone()).with_backend(backend.clone());
    (ctx, backend, runner)
}

/// Initialize version 16 instance `name` listening on `port`
pub fn create_instance(ctx: &Ctx, name: &str, port: u16) -> Instance {
    let instance = Instance::new(&ctx.settings, InstanceId::new(name, "16"));
    ctx.backend
        .initdb(&instance.cluster().unwrap(), &InitdbOptions::default())
        .unwrap();
    let mut config = instance.config().unwrap();
    config.set("port", port);
    config.save(&instance.config_path()).unwrap();
    instance
}
