//! Caller address authorization.
//!
//! The allow-list was resolved once when the key's configuration was
//! loaded; authorization here is an exact string match against those
//! resolved forms. No DNS happens on the hot path.

use std::net::SocketAddr;

use crate::{Error, Result};

/// Check the caller's address against a key's allow-list.
///
/// `None` means no allow-list file exists for the key and every host is
/// permitted. `Some` requires the connection's IP (the host part of the
/// remote address, port discarded) to match one resolved entry exactly;
/// an empty list therefore denies everyone.
pub fn authorize_host(remote: &SocketAddr, allowed: Option<&[String]>) -> Result<()> {
    let Some(allowed) = allowed else {
        return Ok(());
    };

    let host = remote.ip().to_string();
    if allowed.iter().any(|entry| *entry == host) {
        Ok(())
    } else {
        Err(Error::HostNotAllowed(host))
    }
}
