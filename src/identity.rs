//! Host identity bootstrap.
//!
//! The server proves itself with a single RSA key kept under the base
//! storage path. It is generated on first start and loaded on every start
//! after that; a key that exists but can not be parsed is never replaced.

use rand::rngs::OsRng;
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use russh::keys::ssh_key::HashAlg;
use russh::keys::PrivateKey;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Directory under the base path that holds the host key
pub const KEY_DIR: &str = ".sftp";

/// Host key file name inside [`KEY_DIR`]
pub const KEY_FILE: &str = "id_rsa";

/// Modulus size for generated host keys
pub const RSA_KEY_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to generate host key: {0}")]
    Generate(#[from] rsa::Error),

    #[error("failed to encode host key: {0}")]
    Encode(#[from] rsa::pkcs1::Error),

    #[error("host key generation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse host key {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: russh::keys::Error,
    },
}

/// The server's long-term host key, immutable once loaded
#[derive(Clone)]
pub struct ServerIdentity {
    key: PrivateKey,
    path: PathBuf,
}

impl ServerIdentity {
    pub fn key(&self) -> &PrivateKey {
        &self.key
    }

    /// Location the key was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fingerprint(&self) -> String {
        self.key.public_key().fingerprint(HashAlg::Sha256).to_string()
    }
}

/// Path of the persisted host key for a base storage path
pub fn key_path(base_path: &Path) -> PathBuf {
    base_path.join(KEY_DIR).join(KEY_FILE)
}

/// Load the host key below `base_path`, generating and persisting a new
/// one if none exists yet.
pub async fn ensure_identity(base_path: &Path) -> Result<ServerIdentity, IdentityError> {
    let path = key_path(base_path);

    match fs::metadata(&path).await {
        Ok(_) => debug!(path = %path.display(), "Loading existing host key"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            generate_identity(&path).await?;
        }
        Err(source) => return Err(IdentityError::Io { path, source }),
    }

    let pem = fs::read_to_string(&path)
        .await
        .map_err(|source| IdentityError::Io {
            path: path.clone(),
            source,
        })?;
    let key = russh::keys::decode_secret_key(&pem, None).map_err(|source| {
        IdentityError::Parse {
            path: path.clone(),
            source,
        }
    })?;

    let identity = ServerIdentity { key, path };
    info!(
        path = %identity.path.display(),
        fingerprint = %identity.fingerprint(),
        "Host identity ready"
    );
    Ok(identity)
}

async fn generate_identity(path: &Path) -> Result<(), IdentityError> {
    info!(path = %path.display(), bits = RSA_KEY_BITS, "Generating new host key");

    let key = tokio::task::spawn_blocking(|| RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)).await??;
    let pem = key.to_pkcs1_pem(LineEnding::LF)?;

    let io_err = |source| IdentityError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(dir) = path.parent() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(dir).await.map_err(io_err)?;
    }

    // Written next to the key and renamed over it, so a crash never leaves
    // a truncated key behind.
    let staging = staging_path(path);
    match fs::remove_file(&staging).await {
        Ok(()) => debug!(path = %staging.display(), "Removed stale staging key"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(err)),
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&staging).await.map_err(io_err)?;
    file.write_all(pem.as_bytes()).await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    drop(file);

    fs::rename(&staging, path).await.map_err(io_err)
}

fn staging_path(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}
