//! Per-key on-disk configuration.
//!
//! Each key lives in its own directory under the data root:
//!
//! | File | Meaning when present | Meaning when absent |
//! |------|----------------------|---------------------|
//! | `key` | secret bytes, served verbatim | key does not exist |
//! | `allowed_clients` | PEM trust roots for this key | empty pool, nothing verifies |
//! | `allowed_hosts` | allow-listed caller addresses | any host permitted |
//! | `email_to` | notification recipients | no notification |
//!
//! The absent-vs-empty asymmetry for `allowed_hosts` is load-bearing: a
//! file with zero usable entries denies every host, while no file at all
//! skips the host check entirely.

use std::io;
use std::path::{Path, PathBuf};

use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::{Error, Result};

/// Secret file name inside a key directory.
const KEY_FILE: &str = "key";
/// Trust root bundle file name.
const ALLOWED_CLIENTS_FILE: &str = "allowed_clients";
/// Host allow-list file name.
const ALLOWED_HOSTS_FILE: &str = "allowed_hosts";
/// Notification recipient list file name.
const EMAIL_TO_FILE: &str = "email_to";

/// Handle to one key's directory on disk.
///
/// Creating a `KeyDir` touches nothing; [`KeyDir::exists`] and
/// [`KeyDir::load`] do the filesystem work, fresh on every request.
#[derive(Debug, Clone)]
pub struct KeyDir {
    dir: PathBuf,
}

/// A key's configuration, loaded from its directory.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Certificates acting as verification roots for this key only.
    /// Always present after a load, possibly empty (matches nothing).
    pub trust_pool: Vec<CertificateDer<'static>>,

    /// Resolved allow-listed caller addresses. `None` means no allow-list
    /// file exists and host checking is skipped; `Some` with an empty
    /// vector denies every host.
    pub allowed_hosts: Option<Vec<String>>,

    /// Notification recipients. Empty means notification is skipped.
    pub email_to: Vec<String>,
}

impl KeyDir {
    /// Handle for `key_path` under `data_dir`. The caller is responsible
    /// for having validated `key_path` (no traversal) beforehand.
    #[must_use]
    pub fn new(data_dir: &Path, key_path: &str) -> Self {
        Self {
            dir: data_dir.join(key_path),
        }
    }

    /// Path to the secret file.
    #[must_use]
    pub fn key_file(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Whether this key exists: the directory is a directory and the
    /// secret file is a regular file. A directory without a secret file
    /// is absent, not an error.
    pub fn exists(&self) -> Result<bool> {
        match std::fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        match std::fs::metadata(self.key_file()) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the secret bytes.
    pub fn secret(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.key_file())?)
    }

    /// Load this key's trust pool, allow-list, and recipient list.
    pub async fn load(&self) -> Result<KeyConfig> {
        Ok(KeyConfig {
            trust_pool: self.load_trust_pool()?,
            allowed_hosts: self.load_allowed_hosts().await?,
            email_to: self.load_email_to()?,
        })
    }

    /// Parse every PEM `CERTIFICATE` block in `allowed_clients`.
    ///
    /// A malformed block aborts the load: a corrupt trust file must never
    /// be silently narrowed to the blocks that happened to parse. An
    /// absent file yields an empty pool, which matches nothing.
    fn load_trust_pool(&self) -> Result<Vec<CertificateDer<'static>>> {
        let path = self.dir.join(ALLOWED_CLIENTS_FILE);
        let pem = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::Config(format!("Malformed trust bundle {}: {e}", path.display()))
            })?;

        // The bundle must also hold as trust anchors; a cert with an
        // unparseable subject or SPKI fails the load, not a later request.
        for cert in &certs {
            webpki::anchor_from_trusted_cert(cert).map_err(|e| {
                Error::Config(format!(
                    "Unusable trust root in {}: {e:?}",
                    path.display()
                ))
            })?;
        }

        Ok(certs)
    }

    /// Read `allowed_hosts`, resolving hostnames once at load time.
    ///
    /// IP literals are normalized to their canonical rendering so that
    /// `2001:0DB8::1` matches the address a connection reports; other
    /// entries go through a forward DNS lookup and every resulting
    /// address joins the set. An entry
    /// that fails to resolve is dropped (best effort), but the list
    /// itself stays present so an all-unresolvable file still denies
    /// every host.
    async fn load_allowed_hosts(&self) -> Result<Option<Vec<String>>> {
        let path = self.dir.join(ALLOWED_HOSTS_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut hosts = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Ok(ip) = line.parse::<std::net::IpAddr>() {
                hosts.push(ip.to_string());
                continue;
            }

            match tokio::net::lookup_host((line, 0)).await {
                Ok(addrs) => hosts.extend(addrs.map(|a| a.ip().to_string())),
                Err(e) => {
                    debug!(host = line, error = %e, "dropping unresolvable allow-list entry");
                }
            }
        }

        Ok(Some(hosts))
    }

    /// Read `email_to`; a line counts as an address only if it contains `@`.
    fn load_email_to(&self) -> Result<Vec<String>> {
        let path = self.dir.join(EMAIL_TO_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| line.contains('@'))
            .map(str::to_string)
            .collect())
    }
}
