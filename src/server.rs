//! HTTPS front end.
//!
//! The TLS layer accepts *any* client certificate at the handshake; the
//! real decision of whether a certificate is trusted happens per key in
//! the authorization pipeline, against that key's own trust pool. The
//! acceptor's only job here is to complete the handshake and carry the
//! presented chain into the request extensions.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{ConnectInfo, Extension, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum_server::Handle;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::crypto::{WebPkiSupportedAlgorithms, aws_lc_rs};
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{SignalKind, signal};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tower_http::add_extension::{AddExtension, AddExtensionLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::escrow::{KeyRequest, Pipeline};
use crate::{Error, Result, tls};

// ─────────────────────────────────────────────────────────────────────────────
// Handshake: accept any client certificate
// ─────────────────────────────────────────────────────────────────────────────

/// Client certificate verifier that accepts whatever the peer presents.
///
/// Authorization is deferred to the per-key trust pools, which are not
/// known at handshake time. Signature checks over the handshake itself
/// still run, so a client cannot claim a certificate it holds no key
/// for.
#[derive(Debug)]
struct AcceptAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyClientCert {
    fn new() -> Self {
        Self {
            algorithms: aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }

    // Certificate-less clients complete the handshake and get a proper
    // HTTP rejection instead of an opaque TLS alert.
    fn client_auth_mandatory(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Acceptor: carry the peer chain into the request
// ─────────────────────────────────────────────────────────────────────────────

/// Peer certificates captured at handshake time, leaf first. `None`
/// when the client presented nothing.
#[derive(Debug, Clone)]
pub struct PeerCerts(pub Option<Arc<Vec<CertificateDer<'static>>>>);

impl PeerCerts {
    fn into_chain(self) -> Vec<CertificateDer<'static>> {
        match self.0 {
            Some(certs) => certs.as_ref().clone(),
            None => Vec::new(),
        }
    }
}

/// TLS acceptor that completes the handshake via [`RustlsAcceptor`] and
/// then attaches the presented client chain as a request extension.
#[derive(Clone)]
struct MutualTlsAcceptor {
    inner: RustlsAcceptor,
}

impl MutualTlsAcceptor {
    fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for MutualTlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerCerts>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();
        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let peer_certs = stream.get_ref().1.peer_certificates().map(|certs| {
                Arc::new(
                    certs
                        .iter()
                        .map(|c| c.clone().into_owned())
                        .collect::<Vec<CertificateDer<'static>>>(),
                )
            });

            let service = AddExtensionLayer::new(PeerCerts(peer_certs)).layer(service);
            Ok((stream, service))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request handling
// ─────────────────────────────────────────────────────────────────────────────

/// Every path goes through the pipeline; there is no other route.
async fn serve_key(
    State(pipeline): State<Arc<Pipeline>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Extension(peer_certs): Extension<PeerCerts>,
    request: Request,
) -> Response {
    let req = KeyRequest {
        uri_path: request.uri().path().to_string(),
        remote_addr,
        peer_certs: peer_certs.into_chain(),
    };

    match pipeline.evaluate(&req).await {
        Ok(secret) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "application/octet-stream")],
            secret,
        )
            .into_response(),
        Err(e) => (e.status(), format!("{}\n", e.client_message())).into_response(),
    }
}

/// Run the daemon until a termination signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let addr = config.listen_addr()?;

    let certs = tls::load_certs(&config.tls.cert)?;
    let key = tls::load_private_key(&config.tls.key)?;

    let mut tls_cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert::new()))
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("TLS config error (cert/key mismatch?): {e}")))?;
    // Prefer HTTP/2, fall back to HTTP/1.1
    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let pipeline = Arc::new(Pipeline::from_config(&config)?);
    let router = Router::new().fallback(serve_key).with_state(pipeline);

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    info!(
        %addr,
        data_dir = %config.server.data_dir.display(),
        "key escrow daemon listening"
    );

    let acceptor = MutualTlsAcceptor::new(RustlsConfig::from_config(Arc::new(tls_cfg)));
    axum_server::bind(addr)
        .acceptor(acceptor)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("key escrow daemon stopped");
    Ok(())
}

/// Trigger a graceful shutdown on SIGINT or SIGTERM, with a drain
/// window for requests already in flight.
async fn shutdown_on_signal(handle: Handle<SocketAddr>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
    }

    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
