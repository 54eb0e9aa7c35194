//! External policy veto point.
//!
//! The hook is modeled as a capability: anything that can look at the
//! request context and answer allow/deny within a bounded time satisfies
//! [`PolicyHook`]. The shipped implementation ([`ScriptHook`]) spawns an
//! operator-supplied executable; tests substitute in-process
//! implementations.
//!
//! A veto, an execution failure, and a timeout are all the same outcome
//! for the caller: the release is prevented.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::verify::{VerifiedChain, signature_hex, subject_string};
use crate::{Error, Result};

/// Environment variables copied from the daemon's environment into the
/// hook's, so scripts have something reasonable to run under.
const PASSTHROUGH_ENV: [&str; 4] = ["USER", "PWD", "SHELL", "PATH"];

/// Context handed to the policy hook for one authorized-so-far request.
#[derive(Debug)]
pub struct HookContext<'a> {
    /// Validated key path relative to the data directory.
    pub key_path: &'a str,
    /// Caller's network address.
    pub remote_addr: SocketAddr,
    /// Address notifications are sent from.
    pub mail_from: &'a str,
    /// The key's notification recipients, possibly empty.
    pub email_to: &'a [String],
    /// Every chain that verified; the first one is the authorizing
    /// identity. Never empty when the hook runs.
    pub chains: &'a [VerifiedChain],
}

/// Out-of-process decision point consulted after cryptographic
/// authorization and before release. Any non-success outcome vetoes.
#[async_trait]
pub trait PolicyHook: Send + Sync {
    /// Allow (`Ok`) or veto (`Err`) the release.
    async fn authorize(&self, ctx: &HookContext<'_>) -> Result<()>;
}

/// Hook used when no hook path is configured: the feature is off and
/// every request passes this step.
#[derive(Debug, Default)]
pub struct DisabledHook;

#[async_trait]
impl PolicyHook for DisabledHook {
    async fn authorize(&self, _ctx: &HookContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Subprocess hook: runs the configured executable from the data
/// directory with the request context in its environment.
#[derive(Debug)]
pub struct ScriptHook {
    path: PathBuf,
    data_dir: PathBuf,
    timeout: Duration,
}

impl ScriptHook {
    /// Hook invoking `path`, run from `data_dir`, bounded by `timeout`.
    #[must_use]
    pub fn new(path: PathBuf, data_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            path,
            data_dir,
            timeout,
        }
    }
}

#[async_trait]
impl PolicyHook for ScriptHook {
    /// Spawn the hook and interpret its exit status.
    ///
    /// Environment contract: `KEY_PATH`, `REMOTE_ADDR`, `MAIL_FROM`,
    /// `EMAIL_TO` (space-joined, only when recipients exist),
    /// `CLIENT_CERT_SIGNATURE` (hex), `CLIENT_CERT_SUBJECT`, and one
    /// `CHAIN_<i>` per authorizing chain, rendered as arrow-joined
    /// `(signature-prefix subject)` tuples. Plus a pass-through of
    /// `USER PWD SHELL PATH`.
    ///
    /// A path that does not exist means the hook is not configured:
    /// the request is allowed through this step.
    async fn authorize(&self, ctx: &HookContext<'_>) -> Result<()> {
        if !self.path.exists() {
            debug!(hook = %self.path.display(), "hook not present, skipping");
            return Ok(());
        }

        let mut cmd = Command::new(&self.path);
        cmd.current_dir(&self.data_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Timeout expiry drops the future, which kills the subprocess.
            .kill_on_drop(true);

        for var in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }

        cmd.env("KEY_PATH", ctx.key_path)
            .env("REMOTE_ADDR", ctx.remote_addr.to_string())
            .env("MAIL_FROM", ctx.mail_from);
        if !ctx.email_to.is_empty() {
            cmd.env("EMAIL_TO", ctx.email_to.join(" "));
        }

        let leaf = ctx.chains[0].leaf();
        cmd.env("CLIENT_CERT_SIGNATURE", signature_hex(leaf))
            .env("CLIENT_CERT_SUBJECT", subject_string(leaf));
        for (i, chain) in ctx.chains.iter().enumerate() {
            cmd.env(format!("CHAIN_{i}"), chain.to_string());
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::HookVeto(format!("failed to spawn hook: {e}")))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::HookVeto(format!("hook execution failed: {e}"))),
            Err(_) => {
                return Err(Error::HookVeto(format!(
                    "hook timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(Error::HookVeto(format!(
                "exited with {}, stderr: {:?}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::verify::verify_chains;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
    use rustls::pki_types::CertificateDer;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn test_chain() -> Vec<VerifiedChain> {
        let key_pair = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "hook-test-client");
        params.distinguished_name = dn;
        let cert = params.self_signed(&key_pair).unwrap();
        let der: CertificateDer<'static> = cert.der().clone().into_owned();
        let (chains, _) = verify_chains(&[der.clone()], &[der]).unwrap();
        chains
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn ctx<'a>(chains: &'a [VerifiedChain], email_to: &'a [String]) -> HookContext<'a> {
        HookContext {
            key_path: "host1/root",
            remote_addr: "192.0.2.5:40000".parse().unwrap(),
            mail_from: "kexd@example.com",
            email_to,
            chains,
        }
    }

    #[tokio::test]
    async fn missing_hook_path_allows() {
        // Not-configured is a feature state, not an error
        let chains = test_chain();
        let hook = ScriptHook::new(
            PathBuf::from("/nonexistent/hook"),
            std::env::temp_dir(),
            Duration::from_secs(5),
        );
        assert!(hook.authorize(&ctx(&chains, &[])).await.is_ok());
    }

    #[tokio::test]
    async fn exit_zero_allows() {
        let tmp = tempfile::tempdir().unwrap();
        let chains = test_chain();
        let script = write_script(tmp.path(), "hook", "exit 0");
        let hook = ScriptHook::new(script, tmp.path().to_path_buf(), Duration::from_secs(5));
        assert!(hook.authorize(&ctx(&chains, &[])).await.is_ok());
    }

    #[tokio::test]
    async fn nonzero_exit_vetoes() {
        let tmp = tempfile::tempdir().unwrap();
        let chains = test_chain();
        let script = write_script(tmp.path(), "hook", "echo nope >&2; exit 3");
        let hook = ScriptHook::new(script, tmp.path().to_path_buf(), Duration::from_secs(5));

        let result = hook.authorize(&ctx(&chains, &[])).await;
        match result {
            Err(Error::HookVeto(detail)) => assert!(detail.contains("nope"), "detail: {detail}"),
            other => panic!("expected HookVeto, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_a_veto() {
        // GIVEN: a hook that outlives its budget
        let tmp = tempfile::tempdir().unwrap();
        let chains = test_chain();
        let script = write_script(tmp.path(), "hook", "sleep 30");
        let hook = ScriptHook::new(script, tmp.path().to_path_buf(), Duration::from_millis(200));

        // THEN: expiry is the same variant as an explicit veto
        let result = hook.authorize(&ctx(&chains, &[])).await;
        assert!(matches!(result, Err(Error::HookVeto(_))));
    }

    #[tokio::test]
    async fn hook_sees_request_context_in_environment() {
        // GIVEN: a hook that only passes when the contract variables are set
        let tmp = tempfile::tempdir().unwrap();
        let chains = test_chain();
        let script = write_script(
            tmp.path(),
            "hook",
            concat!(
                "[ \"$KEY_PATH\" = \"host1/root\" ] || exit 1\n",
                "[ \"$REMOTE_ADDR\" = \"192.0.2.5:40000\" ] || exit 2\n",
                "[ \"$MAIL_FROM\" = \"kexd@example.com\" ] || exit 3\n",
                "[ \"$EMAIL_TO\" = \"a@example.com b@example.com\" ] || exit 4\n",
                "[ -n \"$CLIENT_CERT_SIGNATURE\" ] || exit 5\n",
                "case \"$CLIENT_CERT_SUBJECT\" in *hook-test-client*) ;; *) exit 6 ;; esac\n",
                "[ -n \"$CHAIN_0\" ] || exit 7",
            ),
        );
        let hook = ScriptHook::new(script, tmp.path().to_path_buf(), Duration::from_secs(5));

        let email_to = vec!["a@example.com".to_string(), "b@example.com".to_string()];
        hook.authorize(&ctx(&chains, &email_to)).await.unwrap();
    }

    #[tokio::test]
    async fn hook_runs_from_the_data_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let chains = test_chain();
        fs::write(tmp.path().join("marker"), b"here").unwrap();
        let script = write_script(tmp.path(), "hook", "[ -f marker ] || exit 1");
        let hook = ScriptHook::new(script, tmp.path().to_path_buf(), Duration::from_secs(5));
        assert!(hook.authorize(&ctx(&chains, &[])).await.is_ok());
    }

    #[tokio::test]
    async fn disabled_hook_always_allows() {
        let chains = test_chain();
        assert!(DisabledHook.authorize(&ctx(&chains, &[])).await.is_ok());
    }
}
