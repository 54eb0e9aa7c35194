//! The ordered authorization pipeline.
//!
//! Step order is part of the security contract: path validation happens
//! before any filesystem access, host and certificate checks before the
//! hook, and notification before the secret is written to the caller.
//! Every failure is terminal for the request; there are no retries.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use percent_encoding::percent_decode_str;
use rustls::pki_types::CertificateDer;
use tracing::{info, warn};

use super::hook::{DisabledHook, HookContext, PolicyHook, ScriptHook};
use super::hosts::authorize_host;
use super::notify::{AccessEvent, DisabledNotifier, Notifier, SmtpNotifier};
use super::store::KeyDir;
use super::verify::{cert_label, verify_chains};
use crate::config::Config;
use crate::{Error, Result, URL_VERSION_PREFIX};

/// One inbound authenticated request, as the transport hands it over.
#[derive(Debug)]
pub struct KeyRequest {
    /// Raw URL path of the request (e.g. `/v1/host1/root`).
    pub uri_path: String,
    /// Caller's network address.
    pub remote_addr: SocketAddr,
    /// Peer certificates from the TLS handshake, leaf first.
    pub peer_certs: Vec<CertificateDer<'static>>,
}

/// The authorization pipeline. Holds only static configuration; every
/// evaluation loads per-key state fresh from disk.
pub struct Pipeline {
    data_dir: PathBuf,
    hook: Arc<dyn PolicyHook>,
    notifier: Arc<dyn Notifier>,
    mail_from: String,
}

impl Pipeline {
    /// Pipeline with explicit collaborators (tests substitute their own).
    #[must_use]
    pub fn new(
        data_dir: PathBuf,
        hook: Arc<dyn PolicyHook>,
        notifier: Arc<dyn Notifier>,
        mail_from: String,
    ) -> Self {
        Self {
            data_dir,
            hook,
            notifier,
            mail_from,
        }
    }

    /// Pipeline wired from daemon configuration: subprocess hook when a
    /// hook path is set, SMTP notifier when a relay is set, and the
    /// disabled variants otherwise.
    pub fn from_config(config: &Config) -> Result<Self> {
        let data_dir = config.server.data_dir.clone();

        let hook: Arc<dyn PolicyHook> = match config.hook.path {
            Some(ref path) => Arc::new(ScriptHook::new(
                path.clone(),
                data_dir.clone(),
                config.hook_timeout(),
            )),
            None => Arc::new(DisabledHook),
        };

        let notifier: Arc<dyn Notifier> = match config.smtp_relay()? {
            Some((host, port)) => Arc::new(SmtpNotifier::new(
                host,
                port,
                config.mail_from().unwrap_or_default(),
            )),
            None => Arc::new(DisabledNotifier),
        };

        Ok(Self::new(
            data_dir,
            hook,
            notifier,
            config.mail_from().unwrap_or_default(),
        ))
    }

    /// Run the full check sequence and return the secret bytes, or the
    /// rejection that terminated the request.
    pub async fn evaluate(&self, req: &KeyRequest) -> Result<Vec<u8>> {
        let remote = req.remote_addr;

        // 1. The connection must carry at least one client certificate.
        if req.peer_certs.is_empty() {
            warn!(%remote, path = %req.uri_path, "rejecting request without client certificate");
            return Err(Error::CertificateMissing);
        }

        // 2. Path validation, before any filesystem access.
        let key_path = match key_path_from_uri(&req.uri_path) {
            Ok(kp) => kp,
            Err(e) => {
                warn!(%remote, path = %req.uri_path, error = %e, "rejecting invalid key path");
                return Err(e);
            }
        };

        // 3. Key existence: directory plus secret file.
        let key_dir = KeyDir::new(&self.data_dir, &key_path);
        match key_dir.exists() {
            Ok(true) => {}
            Ok(false) => {
                warn!(%remote, key = %key_path, "unknown key");
                return Err(Error::UnknownKey);
            }
            Err(e) => {
                warn!(%remote, key = %key_path, error = %e, "error checking key");
                return Err(e);
            }
        }

        // 4. Per-key configuration, fresh from disk.
        let key_config = key_dir.load().await.inspect_err(
            |e| warn!(%remote, key = %key_path, error = %e, "error loading key configuration"),
        )?;

        // 5. Host authorization against the resolved allow-list.
        authorize_host(&remote, key_config.allowed_hosts.as_deref()).inspect_err(
            |e| warn!(%remote, key = %key_path, error = %e, "host not allowed"),
        )?;

        // 6. Chain verification against the per-key trust pool.
        let (chains, failures) = verify_chains(&req.peer_certs, &key_config.trust_pool)
            .inspect_err(
                |e| warn!(%remote, key = %key_path, error = %e, "error verifying certificates"),
            )?;
        if chains.is_empty() {
            warn!(
                %remote,
                key = %key_path,
                checked = failures.len(),
                "no allowed certificate found"
            );
            for failure in &failures {
                warn!(
                    %remote,
                    key = %key_path,
                    index = failure.index,
                    cert = %failure.cert,
                    reason = %failure.reason,
                    "certificate rejected"
                );
            }
            return Err(Error::CertificateNotAllowed);
        }

        // 7. External policy veto, bounded in time.
        let ctx = HookContext {
            key_path: &key_path,
            remote_addr: remote,
            mail_from: &self.mail_from,
            email_to: &key_config.email_to,
            chains: &chains,
        };
        self.hook
            .authorize(&ctx)
            .await
            .inspect_err(|e| warn!(%remote, key = %key_path, error = %e, "prevented by hook"))?;

        // 8. The secret is read only after every check has passed.
        let secret = key_dir
            .secret()
            .inspect_err(|e| warn!(%remote, key = %key_path, error = %e, "error reading key"))?;

        info!(
            %remote,
            key = %key_path,
            client = %cert_label(chains[0].leaf()),
            "allowing request"
        );

        // 9. Notification before release; a dead relay aborts the request.
        let event = AccessEvent {
            key_path: &key_path,
            remote_addr: remote,
            email_to: &key_config.email_to,
            chains: &chains,
        };
        self.notifier.notify(&event).await.inspect_err(
            |e| warn!(%remote, key = %key_path, error = %e, "error sending notification"),
        )?;

        // 10. Serve the bytes verbatim.
        Ok(secret)
    }
}

/// Derive the key path from a request URL path.
///
/// The decoded path is lexically cleaned, must start with the fixed
/// version segment followed by a non-empty remainder, and must not
/// contain `..` anywhere afterwards. Rejections here happen before the
/// filesystem is touched.
pub fn key_path_from_uri(uri_path: &str) -> Result<String> {
    let decoded: Cow<'_, str> = percent_decode_str(uri_path)
        .decode_utf8()
        .map_err(|_| Error::InvalidKeyPath("undecodable percent-encoding".to_string()))?;

    let cleaned = clean_path(&decoded);

    // Cleaning strips trailing slashes, so a bare version segment will
    // not match the prefix and "/v1/" alone is rejected here too.
    let Some(key_path) = cleaned.strip_prefix(URL_VERSION_PREFIX) else {
        return Err(Error::InvalidKeyPath("missing version prefix".to_string()));
    };

    // Extra paranoia: reject any remaining "..", even in forms that are
    // technically valid key names like "a..b".
    if key_path.contains("..") {
        return Err(Error::InvalidKeyPath("path contains '..'".to_string()));
    }

    Ok(key_path.to_string())
}

/// Lexical path cleaning: collapse `//` and `/./`, apply `..` segments,
/// drop the trailing slash. Purely textual, no filesystem access.
fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.last().is_some_and(|s| *s != "..") {
                    segments.pop();
                } else if !rooted {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── path cleaning ────────────────────────────────────────────────────

    #[test]
    fn clean_path_normalizes_lexically() {
        assert_eq!(clean_path("/v1/key"), "/v1/key");
        assert_eq!(clean_path("/v1//key/"), "/v1/key");
        assert_eq!(clean_path("/v1/./key"), "/v1/key");
        assert_eq!(clean_path("/v1/a/../b"), "/v1/b");
        assert_eq!(clean_path("/v1/.."), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path(""), ".");
        assert_eq!(clean_path("relative/x/"), "relative/x");
    }

    // ── key path derivation ──────────────────────────────────────────────

    #[test]
    fn valid_paths_yield_the_key_path() {
        assert_eq!(key_path_from_uri("/v1/key").unwrap(), "key");
        assert_eq!(key_path_from_uri("/v1/path/to/key").unwrap(), "path/to/key");
        assert_eq!(key_path_from_uri("/v1/path/to/key/").unwrap(), "path/to/key");
    }

    #[test]
    fn missing_or_wrong_version_is_rejected() {
        for path in ["", "/", "/v1", "/v1/", "/v1//", "v1/path/to/key/", "/v2/path/to/key"] {
            let result = key_path_from_uri(path);
            assert!(
                matches!(result, Err(Error::InvalidKeyPath(_))),
                "expected rejection for {path:?}, got {result:?}"
            );
        }
    }

    #[test]
    fn dotdot_is_rejected_in_any_position() {
        for path in ["/v1/a..b", "/v1/../etc/shadow", "/v1/x/../../etc", "/v1/.."] {
            assert!(
                key_path_from_uri(path).is_err(),
                "expected rejection for {path:?}"
            );
        }
    }

    #[test]
    fn percent_encoded_traversal_is_rejected() {
        // %2e%2e == ".." and %2f == "/" after decoding
        for path in ["/v1/%2e%2e/etc", "/v1/a%2e%2eb", "/v1/..%2fother"] {
            assert!(
                key_path_from_uri(path).is_err(),
                "expected rejection for {path:?}"
            );
        }
    }

    #[test]
    fn traversal_resolving_inside_the_prefix_is_still_cleaned() {
        // ".." that cancels out lexically leaves a clean path behind
        assert_eq!(key_path_from_uri("/v1/a/../b").unwrap(), "b");
    }
}
