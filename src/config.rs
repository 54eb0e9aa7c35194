//! Configuration management
//!
//! Daemon configuration is merged from three layers, later layers winning:
//! a YAML file (if given), `KEXD_`-prefixed environment variables, and
//! command-line flags. The result is read-only for the lifetime of the
//! process; everything per-key lives on disk and is loaded per request.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::{DEFAULT_PORT, Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and data directory
    pub server: ServerConfig,
    /// Server TLS identity
    pub tls: TlsConfig,
    /// Access notification settings
    pub notify: NotifyConfig,
    /// Policy hook settings
    pub hook: HookConfig,
}

/// Listener and data directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to listen on
    pub ip_addr: String,
    /// Port to listen on
    pub port: u16,
    /// Data directory holding one subdirectory per key
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("/etc/kexd/data"),
        }
    }
}

/// Server TLS identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate (PEM)
    pub cert: PathBuf,
    /// Private key (PEM)
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("/etc/kexd/cert.pem"),
            key: PathBuf::from("/etc/kexd/key.pem"),
        }
    }
}

/// Access notification configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    /// SMTP relay (host or host:port). Unset means notifications are
    /// disabled; dispatch becomes a no-op, not an error.
    pub smtp_addr: Option<String>,
    /// Address notifications are sent from. Defaults to `kexd@<smtp-host>`.
    pub mail_from: Option<String>,
}

/// Policy hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Hook executable consulted before releasing a key. A path that does
    /// not exist means the feature is not configured and every request is
    /// allowed through this step.
    pub path: Option<PathBuf>,
    /// Wall-clock bound on a hook invocation; expiry counts as a veto.
    pub timeout_secs: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("/etc/kexd/hook")),
            timeout_secs: 60,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file merged with
    /// `KEXD_`-prefixed environment variables (e.g. `KEXD_SERVER__PORT`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("KEXD_").split("__"));

        figment.extract().map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply command-line flag overrides (highest precedence layer).
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(ref ip) = cli.ip_addr {
            self.server.ip_addr = ip.clone();
        }
        if let Some(ref dir) = cli.data_dir {
            self.server.data_dir = dir.clone();
        }
        if let Some(ref cert) = cli.cert {
            self.tls.cert = cert.clone();
        }
        if let Some(ref key) = cli.key {
            self.tls.key = key.clone();
        }
        if let Some(ref smtp) = cli.smtp_addr {
            self.notify.smtp_addr = Some(smtp.clone());
        }
        if let Some(ref from) = cli.mail_from {
            self.notify.mail_from = Some(from.clone());
        }
        if let Some(ref hook) = cli.hook {
            self.hook.path = Some(hook.clone());
        }
    }

    /// Socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.ip_addr, self.server.port);
        addr.parse()
            .map_err(|e| Error::Config(format!("Invalid listen address {addr:?}: {e}")))
    }

    /// Sender address for notifications: the configured one, or
    /// `kexd@<smtp-host>` derived from the relay when unset.
    #[must_use]
    pub fn mail_from(&self) -> Option<String> {
        if let Some(ref from) = self.notify.mail_from {
            return Some(from.clone());
        }
        self.notify
            .smtp_addr
            .as_ref()
            .map(|addr| format!("kexd@{}", smtp_host(addr)))
    }

    /// SMTP relay split into host and port (default 25). A bare IP
    /// address, IPv6 included, is a host on its own; otherwise whatever
    /// follows the last `:` must be a valid port.
    pub fn smtp_relay(&self) -> Result<Option<(String, u16)>> {
        let Some(addr) = self.notify.smtp_addr.as_ref() else {
            return Ok(None);
        };
        if addr.parse::<std::net::IpAddr>().is_ok() {
            return Ok(Some((addr.clone(), 25)));
        }
        match addr.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::Config(format!("Invalid SMTP relay port in {addr:?}")))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Some((host.to_string(), port)))
            }
            None => Ok(Some((addr.clone(), 25))),
        }
    }

    /// Hook invocation timeout.
    #[must_use]
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook.timeout_secs)
    }
}

fn smtp_host(addr: &str) -> &str {
    if addr.parse::<std::net::IpAddr>().is_ok() {
        return addr;
    }
    addr.rsplit_once(':').map_or(addr, |(host, _)| {
        host.trim_start_matches('[').trim_end_matches(']')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_daemon_conventions() {
        let config = Config::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.server.data_dir, PathBuf::from("/etc/kexd/data"));
        assert_eq!(config.hook.timeout_secs, 60);
        assert!(config.notify.smtp_addr.is_none());
    }

    #[test]
    fn load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kexd.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 2222\n  data_dir: /srv/keys\nnotify:\n  smtp_addr: mail.example.com:587\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 2222);
        assert_eq!(config.server.data_dir, PathBuf::from("/srv/keys"));
        assert_eq!(
            config.notify.smtp_addr.as_deref(),
            Some("mail.example.com:587")
        );
        // Unset sections keep their defaults
        assert_eq!(config.tls.cert, PathBuf::from("/etc/kexd/cert.pem"));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/kexd.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn mail_from_derived_from_smtp_host() {
        // GIVEN: a relay but no explicit sender
        let mut config = Config::default();
        config.notify.smtp_addr = Some("mail.example.com:587".to_string());
        // THEN: sender defaults to kexd@<smtp-host>
        assert_eq!(config.mail_from().as_deref(), Some("kexd@mail.example.com"));

        // GIVEN: an explicit sender
        config.notify.mail_from = Some("ops@example.com".to_string());
        assert_eq!(config.mail_from().as_deref(), Some("ops@example.com"));
    }

    #[test]
    fn mail_from_is_none_without_relay() {
        assert!(Config::default().mail_from().is_none());
    }

    #[test]
    fn smtp_relay_splits_host_and_port() {
        let mut config = Config::default();
        config.notify.smtp_addr = Some("mail.example.com:2525".to_string());
        assert_eq!(
            config.smtp_relay().unwrap(),
            Some(("mail.example.com".to_string(), 2525))
        );

        config.notify.smtp_addr = Some("mail.example.com".to_string());
        assert_eq!(
            config.smtp_relay().unwrap(),
            Some(("mail.example.com".to_string(), 25))
        );
    }

    #[test]
    fn smtp_relay_rejects_unparseable_port() {
        // A typo in the port must fail loudly, not fall back to 25
        let mut config = Config::default();
        config.notify.smtp_addr = Some("mail.example.com:smtp".to_string());
        assert!(matches!(config.smtp_relay(), Err(Error::Config(_))));

        config.notify.smtp_addr = Some("mail.example.com:70000".to_string());
        assert!(matches!(config.smtp_relay(), Err(Error::Config(_))));
    }

    #[test]
    fn smtp_relay_keeps_bare_ipv6_addresses_whole() {
        // GIVEN: a bare IPv6 relay address; its colons are not a port
        let mut config = Config::default();
        config.notify.smtp_addr = Some("2001:db8::1".to_string());
        assert_eq!(
            config.smtp_relay().unwrap(),
            Some(("2001:db8::1".to_string(), 25))
        );
        assert_eq!(config.mail_from().as_deref(), Some("kexd@2001:db8::1"));

        // GIVEN: the bracketed form carrying an explicit port
        config.notify.smtp_addr = Some("[2001:db8::1]:587".to_string());
        assert_eq!(
            config.smtp_relay().unwrap(),
            Some(("2001:db8::1".to_string(), 587))
        );
    }

    #[test]
    fn listen_addr_parses_ip_and_port() {
        let mut config = Config::default();
        config.server.ip_addr = "127.0.0.1".to_string();
        config.server.port = 9000;
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn listen_addr_rejects_garbage() {
        let mut config = Config::default();
        config.server.ip_addr = "not-an-ip".to_string();
        assert!(config.listen_addr().is_err());
    }
}
