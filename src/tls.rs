//! TLS material handling — PEM loading and self-signed cert generation.
//!
//! All certificate and key files are expected in **PEM format**. DER is
//! not supported to keep operator tooling simple (openssl and friends
//! default to PEM).

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair, SanType,
    date_time_ymd,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key,
/// or the key format is unsupported.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| Error::Config(format!("No private key found in '{}'", path.display())))?;

    Ok(key)
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate generation
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a self-signed identity certificate.
#[derive(Debug)]
pub struct SelfSignedParams<'a> {
    /// Subject Alternative Names. IP address literals become IP SANs,
    /// everything else a DNS SAN. The first entry doubles as the CN.
    pub hosts: &'a [String],
    /// Organization name for the subject; empty omits the attribute.
    pub organization: &'a str,
    /// Validity period in days.
    pub valid_days: u32,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Generate a self-signed certificate usable both as a server identity
/// and as a client identity, so one generated pair serves daemon and
/// fetcher alike.
///
/// # Errors
///
/// Returns an error if a SAN entry is malformed or key generation or
/// certificate serialisation fails.
pub fn generate_self_signed(params: &SelfSignedParams<'_>) -> Result<GeneratedCert> {
    let key_pair =
        KeyPair::generate().map_err(|e| Error::Config(format!("Failed to generate key: {e}")))?;

    let mut cert_params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    if !params.organization.is_empty() {
        dn.push(DnType::OrganizationName, params.organization);
    }
    if let Some(first) = params.hosts.first() {
        dn.push(DnType::CommonName, first.as_str());
    }
    cert_params.distinguished_name = dn;

    let mut sans: Vec<SanType> = Vec::new();
    for host in params.hosts {
        if let Ok(ip) = host.parse::<IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else {
            let ia5 = Ia5String::try_from(host.as_str())
                .map_err(|e| Error::Config(format!("Invalid DNS SAN '{host}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
    }
    cert_params.subject_alt_names = sans;

    // Dual-purpose EKU: the same pair authenticates the daemon to
    // fetchers and a fetcher to the daemon.
    cert_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    cert_params.not_after = validity_to_date(params.valid_days)?;

    let cert = cert_params
        .self_signed(&key_pair)
        .map_err(|e| Error::Config(format!("Cert generation failed: {e}")))?;

    Ok(GeneratedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

/// Convert a validity period (days) into a future `OffsetDateTime` for
/// `rcgen`, truncated to day granularity.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(i64::try_from(future_secs).unwrap_or(i64::MAX))
        .map_err(|e| Error::Config(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
