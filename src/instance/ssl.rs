//! TLS material for instances with `ssl` enabled
//!
//! `configuration.ssl` turns TLS on. `ssl_cert_file` and `ssl_key_file`
//! name existing files; relative paths, and the `server.crt`/`server.key`
//! defaults, live in the instance directory. When neither file exists a
//! self-signed certificate is generated with `openssl`.

use crate::ctx::Ctx;
use crate::error::Error;
use crate::system::Instance;
use anyhow::{Context, Result};
use pgkit::{Cmd, Value};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";

fn enabled(conf: &BTreeMap<String, Value>) -> bool {
    conf.get("ssl").is_some_and(|v| {
        matches!(
            v.as_text().to_ascii_lowercase().as_str(),
            "on" | "true" | "yes" | "1"
        )
    })
}

fn resolve(
    instance: &Instance,
    conf: &BTreeMap<String, Value>,
    name: &str,
    default: &str,
) -> PathBuf {
    let path = conf
        .get(name)
        .map_or_else(|| PathBuf::from(default), |v| PathBuf::from(v.as_text()));
    if path.is_absolute() {
        path
    } else {
        instance.path().join(path)
    }
}

/// Point `ssl_cert_file` and `ssl_key_file` of `conf` at usable files
pub fn configure_ssl(
    ctx: &Ctx,
    instance: &Instance,
    conf: &mut BTreeMap<String, Value>,
) -> Result<()> {
    if !enabled(conf) {
        return Ok(());
    }
    let cert = resolve(instance, conf, "ssl_cert_file", CERT_FILE);
    let key = resolve(instance, conf, "ssl_key_file", KEY_FILE);
    match (cert.exists(), key.exists()) {
        (true, true) => {}
        (false, false) => generate_certificate(ctx, instance, &cert, &key)?,
        _ => {
            return Err(Error::validation(format!(
                "one of SSL certificate files {} or {} exists but the other does not",
                cert.display(),
                key.display()
            ))
            .into());
        }
    }
    conf.insert(
        "ssl_cert_file".to_string(),
        Value::from(cert.display().to_string()),
    );
    conf.insert(
        "ssl_key_file".to_string(),
        Value::from(key.display().to_string()),
    );
    Ok(())
}

fn generate_certificate(ctx: &Ctx, instance: &Instance, cert: &Path, key: &Path) -> Result<()> {
    for dir in [cert.parent(), key.parent()].into_iter().flatten() {
        fs::create_dir_all(dir).with_context(|| format!("Could not create {}", dir.display()))?;
    }
    log::info!("generating a self-signed certificate for {instance}");
    let cmd = Cmd::new("openssl")
        .args(["req", "-new", "-x509", "-nodes", "-days", "365"])
        .args(["-newkey", "rsa:2048", "-subj", "/CN=localhost"])
        .arg("-keyout")
        .arg(key.display().to_string())
        .arg("-out")
        .arg(cert.display().to_string());
    ctx.runner.run_checked(&cmd)?;
    if key.exists() {
        fs::set_permissions(key, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Could not restrict {}", key.display()))?;
    }
    Ok(())
}
