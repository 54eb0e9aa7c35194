//! kexd — key escrow authorization gateway.
//!
//! Serves opaque secret blobs ("keys") over HTTPS, authenticating and
//! authorizing callers with TLS client certificates verified against a
//! per-key trust pool, and notifying operators on every access.
//!
//! The main use case is fetching disk-encryption keys at boot without
//! storing them on the machine: the daemon releases a key only to callers
//! that present a certificate chaining to that key's registered roots,
//! connect from an allow-listed address (when one is configured), and are
//! not vetoed by the operator's policy hook.
//!
//! # On-disk layout
//!
//! One directory per key under the data directory:
//!
//! ```text
//! <data_dir>/<key-path>/
//!   key               opaque secret bytes, served verbatim
//!   allowed_clients   PEM bundle of trust roots for this key (optional)
//!   allowed_hosts     newline-delimited hostnames/IPs (optional)
//!   email_to          newline-delimited notification recipients (optional)
//! ```
//!
//! Per-key configuration is read fresh on every request; there is no cache
//! and therefore no invalidation problem.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod escrow;
pub mod fetch;
pub mod server;
pub mod tls;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Version segment every key request path must start with.
pub const URL_VERSION_PREFIX: &str = "/v1/";

/// Default port the daemon listens on and the fetch tool connects to.
pub const DEFAULT_PORT: u16 = 19840;

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
