//! Certificate materializer
//!
//! Writes a credential bundle to disk, one file per key, so the tunnel server
//! can be pointed at plain file paths. Directories are owner-only (0700) and
//! files are 0600. Each file is written beside its target and renamed into
//! place, so a restarting engine never reads half a certificate.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use cluster_proxy_common::Error;

use crate::bundle::CredentialBundle;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Write every entry of `bundle` into `target_dir`.
///
/// Fails with [`Error::Validation`] when the bundle is empty or a key is not
/// a plain file name, and with [`Error::Io`] when the directory or a file
/// cannot be written. Files already holding the same bytes are left alone.
pub async fn materialize(bundle: &CredentialBundle, target_dir: &Path) -> Result<(), Error> {
    let name = bundle.role().secret_name();

    if bundle.is_empty() {
        return Err(Error::validation(name, "secret data is empty"));
    }
    for key in bundle.data().keys() {
        validate_key(name, key)?;
    }

    ensure_dir(target_dir).await?;

    let mut written = 0usize;
    for (key, value) in bundle.data() {
        if write_file(target_dir, key, value).await? {
            written += 1;
        }
    }

    debug!(
        bundle = %name,
        dir = %target_dir.display(),
        files = bundle.data().len(),
        written,
        "Materialized credential bundle"
    );
    Ok(())
}

fn validate_key(bundle: &str, key: &str) -> Result<(), Error> {
    if key.is_empty() || key == "." || key == ".." || key.contains('/') || key.contains('\0') {
        return Err(Error::validation(
            bundle,
            format!("key '{key}' is not a valid file name"),
        ));
    }
    Ok(())
}

async fn ensure_dir(dir: &Path) -> Result<(), Error> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(DIR_MODE);
    builder.create(dir).await.map_err(|e| Error::io(dir, e))
}

/// Returns whether the file was (re)written
async fn write_file(dir: &Path, key: &str, value: &[u8]) -> Result<bool, Error> {
    let path = dir.join(key);

    if let Ok(existing) = tokio::fs::read(&path).await {
        if existing == value {
            return Ok(false);
        }
    }

    let tmp = dir.join(format!(".{key}.tmp"));
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(&tmp)
        .await
        .map_err(|e| Error::io(&tmp, e))?;
    file.write_all(value).await.map_err(|e| Error::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| Error::io(&tmp, e))?;
    drop(file);

    // A leftover temp file from an earlier crash keeps its old mode
    tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(FILE_MODE))
        .await
        .map_err(|e| Error::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| Error::io(&path, e))?;

    Ok(true)
}
