//! Client-side key fetch.
//!
//! The fetcher authenticates itself with a client certificate and
//! verifies the daemon by *byte equality*: the server's presented
//! certificate must literally appear in the local trust file. No name
//! checks, no chain building, so deployments with wildcard or
//! placeholder CNs keep working.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, aws_lc_rs};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use tracing::debug;

use crate::{DEFAULT_PORT, Error, Result, URL_VERSION_PREFIX, tls};

/// Parameters for one fetch.
#[derive(Debug)]
pub struct FetchParams {
    /// Key URL, `kxd://` or `https://`.
    pub url: String,
    /// PEM file with the client certificate presented to the daemon.
    pub client_cert: PathBuf,
    /// PEM file with the client private key.
    pub client_key: PathBuf,
    /// PEM file with the daemon certificates we accept, byte for byte.
    pub server_cert: PathBuf,
}

/// Fetch the key and return its raw bytes.
pub async fn fetch_key(params: &FetchParams) -> Result<Vec<u8>> {
    let url = normalize_url(&params.url)?;

    let client_certs = tls::load_certs(&params.client_cert)?;
    let client_key = tls::load_private_key(&params.client_key)?;
    let trusted = tls::load_certs(&params.server_cert)?;

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedServerVerifier::new(trusted)))
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;

    debug!(%url, "fetching key");
    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .build()?;

    let response = client.get(url.as_str()).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Fetch(format!(
            "server returned {status}: {}",
            body.trim_end()
        )));
    }

    Ok(response.bytes().await?.to_vec())
}

/// Normalize a user-supplied URL into the form the daemon expects:
/// `kxd://` becomes `https://`, the `/v1/` prefix is added when absent,
/// and the default port is filled in.
pub fn normalize_url(raw: &str) -> Result<url::Url> {
    let raw = if let Some(rest) = raw.strip_prefix("kxd://") {
        format!("https://{rest}")
    } else {
        raw.to_string()
    };

    let mut url =
        url::Url::parse(&raw).map_err(|e| Error::Fetch(format!("invalid URL {raw:?}: {e}")))?;

    if url.scheme() != "https" {
        return Err(Error::Fetch(format!(
            "unsupported scheme {:?}, use kxd:// or https://",
            url.scheme()
        )));
    }

    if !url.path().starts_with(URL_VERSION_PREFIX) {
        let path = format!("/v1{}", url.path());
        url.set_path(&path);
    }

    if url.port().is_none() {
        url.set_port(Some(DEFAULT_PORT))
            .map_err(|()| Error::Fetch(format!("URL {url} cannot carry a port")))?;
    }

    Ok(url)
}

/// Server verifier that trusts exact certificate bytes and nothing
/// else. Handshake signatures are still verified against the presented
/// certificate's key.
#[derive(Debug)]
struct PinnedServerVerifier {
    trusted: Vec<CertificateDer<'static>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedServerVerifier {
    fn new(trusted: Vec<CertificateDer<'static>>) -> Self {
        Self {
            trusted,
            algorithms: aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self.trusted.iter().any(|t| t == end_entity) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
