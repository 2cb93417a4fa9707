//! Backend abstraction for PostgreSQL server operations.
//!
//! The [`Backend`] trait covers everything done to a cluster: creating it,
//! driving the server process, and the handful of SQL statements needed to
//! manage roles, databases and extensions. [`pgctl::PgCtlBackend`] drives
//! the real binaries; tests substitute an in-memory implementation.

pub mod pgctl;

use crate::error::Result;
use crate::types::{
    Cluster, DatabaseSpec, InitdbOptions, ReplicationSource, RoleSpec, Setting, Status, StopMode,
};

/// Backend trait for PostgreSQL operations.
pub trait Backend: Send + Sync {
    // =========================================================================
    // Cluster creation
    // =========================================================================

    /// Initialize the data directory of `cluster`.
    fn initdb(&self, cluster: &Cluster, options: &InitdbOptions) -> Result<()>;

    /// Initialize the data directory of `cluster` as a copy of a primary.
    fn basebackup(&self, cluster: &Cluster, source: &ReplicationSource) -> Result<()>;

    // =========================================================================
    // Server process
    // =========================================================================

    /// Query the server status.
    fn status(&self, cluster: &Cluster) -> Result<Status>;

    /// Start the server.
    ///
    /// In `foreground` mode the call blocks until the server exits; otherwise
    /// it returns as soon as the server is launched, without waiting for it
    /// to accept connections.
    fn start(&self, cluster: &Cluster, foreground: bool) -> Result<()>;

    /// Stop the server.
    fn stop(&self, cluster: &Cluster, mode: StopMode, wait: bool) -> Result<()>;

    /// Whether the server accepts connections.
    fn is_ready(&self, cluster: &Cluster) -> Result<bool>;

    /// Ask the server to re-read its configuration files.
    fn reload(&self, cluster: &Cluster) -> Result<()>;

    /// Promote a standby server to primary.
    fn promote(&self, cluster: &Cluster) -> Result<()>;

    /// Whether data page checksums are enabled, read from the control file.
    fn data_checksums(&self, cluster: &Cluster) -> Result<bool>;

    /// Enable or disable data page checksums; the server must be stopped.
    fn set_data_checksums(&self, cluster: &Cluster, enabled: bool) -> Result<()>;

    // =========================================================================
    // Live facts (server must be running)
    // =========================================================================

    /// Current `pg_settings`.
    fn settings(&self, cluster: &Cluster) -> Result<Vec<Setting>>;

    /// Whether the server reports a parameter change awaiting restart.
    fn pending_restart(&self, cluster: &Cluster) -> Result<bool> {
        Ok(self.settings(cluster)?.iter().any(|s| s.pending_restart))
    }

    /// Encoding of the maintenance database.
    fn encoding(&self, cluster: &Cluster) -> Result<String>;

    /// Collation of the maintenance database.
    fn locale(&self, cluster: &Cluster) -> Result<Option<String>>;

    /// Bytes received but not yet replayed, on a standby; `None` on a primary.
    fn replication_lag(&self, cluster: &Cluster) -> Result<Option<u64>>;

    // =========================================================================
    // Extensions
    // =========================================================================

    /// Extensions installed in `dbname`.
    fn installed_extensions(&self, cluster: &Cluster, dbname: &str) -> Result<Vec<String>>;

    /// Create an extension in `dbname`.
    fn create_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()>;

    /// Drop an extension from `dbname`.
    fn drop_extension(&self, cluster: &Cluster, dbname: &str, name: &str) -> Result<()>;

    // =========================================================================
    // Roles
    // =========================================================================

    /// Every role except the `pg_` built-ins, by name.
    fn list_roles(&self, cluster: &Cluster) -> Result<Vec<RoleSpec>>;

    /// Look up a role.
    fn get_role(&self, cluster: &Cluster, name: &str) -> Result<Option<RoleSpec>>;

    /// Create a role.
    fn create_role(&self, cluster: &Cluster, role: &RoleSpec) -> Result<()>;

    /// Bring an existing role from `current` to `desired`.
    fn alter_role(&self, cluster: &Cluster, desired: &RoleSpec, current: &RoleSpec) -> Result<()>;

    /// Drop a role.
    fn drop_role(&self, cluster: &Cluster, name: &str) -> Result<()>;

    // =========================================================================
    // Databases
    // =========================================================================

    /// Every database except the templates, by name.
    fn list_databases(&self, cluster: &Cluster) -> Result<Vec<DatabaseSpec>>;

    /// Look up a database.
    fn get_database(&self, cluster: &Cluster, name: &str) -> Result<Option<DatabaseSpec>>;

    /// Create a database.
    fn create_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()>;

    /// Change the owner of an existing database.
    fn alter_database(&self, cluster: &Cluster, database: &DatabaseSpec) -> Result<()>;

    /// Drop a database.
    fn drop_database(&self, cluster: &Cluster, name: &str) -> Result<()>;
}
