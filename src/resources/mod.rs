//! Objects living inside a running instance: extensions, roles, databases
//!
//! Each is a [`declarative::Resource`]; [`converge`] builds the list for a
//! manifest and applies it in dependency order.

pub mod database;
pub mod extension;
pub mod role;

pub use database::DatabaseResource;
pub use extension::ExtensionResource;
pub use role::RoleResource;

use crate::ctx::Ctx;
use crate::manifest::{self, InstanceManifest};
use crate::system::Instance;
use anyhow::Result;
use declarative::{ApplySummary, BoxedResource, NoProgress, PresenceState};
use pgkit::Cluster;

/// Database where extensions are managed
pub const EXTENSIONS_DATABASE: &str = "postgres";

/// Extensions never dropped even when not listed
const BUILTIN_EXTENSIONS: [&str; 1] = ["plpgsql"];

/// Bring extensions, roles and databases of the running `instance` in line
/// with `manifest`
pub fn converge(ctx: &Ctx, instance: &Instance, manifest: &InstanceManifest) -> Result<ApplySummary> {
    let cluster = instance.cluster()?;
    let installed = ctx
        .backend
        .installed_extensions(&cluster, EXTENSIONS_DATABASE)?;
    let wanted: Vec<&str> = manifest
        .extensions
        .iter()
        .filter(|name| manifest::extension(name).is_some_and(|e| e.create))
        .map(String::as_str)
        .collect();

    let mut resources: Vec<BoxedResource<'_>> = Vec::new();
    for name in &wanted {
        resources.push(extension(ctx, &cluster, name, PresenceState::Present));
    }
    for name in installed
        .iter()
        .filter(|n| !wanted.contains(&n.as_str()) && !BUILTIN_EXTENSIONS.contains(&n.as_str()))
    {
        resources.push(extension(ctx, &cluster, name, PresenceState::Absent));
    }
    for role in &manifest.roles {
        resources.push(Box::new(RoleResource {
            ctx,
            instance,
            cluster: &cluster,
            role,
        }));
    }
    for database in &manifest.databases {
        resources.push(Box::new(DatabaseResource {
            ctx,
            instance,
            cluster: &cluster,
            database,
        }));
    }
    declarative::apply_resources(&resources, &mut NoProgress)
}

fn extension<'a>(
    ctx: &'a Ctx,
    cluster: &'a Cluster,
    name: &str,
    state: PresenceState,
) -> BoxedResource<'a> {
    Box::new(ExtensionResource {
        ctx,
        cluster,
        dbname: EXTENSIONS_DATABASE,
        name: name.to_string(),
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::lifecycle;
    use crate::testing::{self, Op, create_instance};
    use tempfile::TempDir;

    #[test]
    fn test_converge_extensions_keeps_plpgsql() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let instance = create_instance(&ctx, "db1", 5433);
        lifecycle::start(&ctx, &instance, false).unwrap();

        let mut manifest: InstanceManifest =
            serde_yaml::from_str("name: db1\nversion: '16'\nextensions: [unaccent, auto_explain]\n")
                .unwrap();
        let summary = converge(&ctx, &instance, &manifest).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(
            backend.extensions(&instance, EXTENSIONS_DATABASE),
            vec!["plpgsql".to_string(), "unaccent".to_string()]
        );

        manifest.extensions.clear();
        let summary = converge(&ctx, &instance, &manifest).unwrap();
        assert_eq!(summary.dropped, 1);
        assert_eq!(backend.count(Op::DropExtension), 1);
        assert_eq!(
            backend.extensions(&instance, EXTENSIONS_DATABASE),
            vec!["plpgsql".to_string()]
        );
        assert!(!converge(&ctx, &instance, &manifest).unwrap().has_changes());
    }

    #[test]
    fn test_converge_roles_before_databases() {
        let tmp = TempDir::new().unwrap();
        let (ctx, backend) = testing::ctx(tmp.path());
        let instance = create_instance(&ctx, "db1", 5433);
        lifecycle::start(&ctx, &instance, false).unwrap();

        let manifest: InstanceManifest = serde_yaml::from_str(
            r"
name: db1
version: '16'
roles:
  - name: app
    login: true
databases:
  - name: appdb
    owner: app
",
        )
        .unwrap();
        converge(&ctx, &instance, &manifest).unwrap();
        let calls = backend.calls();
        let role = calls.iter().position(|o| *o == Op::CreateRole).unwrap();
        let db = calls.iter().position(|o| *o == Op::CreateDatabase).unwrap();
        assert!(role < db);
        assert_eq!(
            backend.database(&instance, "appdb").unwrap().owner.as_deref(),
            Some("app")
        );
    }
}
