//! Error types for kexd

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for kexd
pub type Result<T> = std::result::Result<T, Error>;

/// kexd errors
///
/// Every variant maps to one of four caller-visible categories
/// (not-acceptable / not-found / forbidden / internal-error) via
/// [`Error::status`]. The variant payloads carry server-side diagnostic
/// detail only; [`Error::client_message`] is the complete text a caller
/// ever sees.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection carried no client certificate
    #[error("client certificate not provided")]
    CertificateMissing,

    /// Request path is not a valid key path
    #[error("invalid key path: {0}")]
    InvalidKeyPath(String),

    /// Key directory or its secret file does not exist
    #[error("unknown key")]
    UnknownKey,

    /// Caller address is not on the key's allow-list
    #[error("host {0:?} not allowed")]
    HostNotAllowed(String),

    /// No presented certificate chained to the key's trust pool
    #[error("no allowed certificate found")]
    CertificateNotAllowed,

    /// Policy hook vetoed the release (non-zero exit, execution error, or timeout)
    #[error("prevented by hook: {0}")]
    HookVeto(String),

    /// Configuration error (malformed trust bundle, bad TLS identity, ...)
    #[error("configuration error: {0}")]
    Config(String),

    /// Notification dispatch failed after authorization succeeded
    #[error("notification error: {0}")]
    Notification(String),

    /// Fetch tool error (server rejected the request or spoke garbage)
    #[error("fetch error: {0}")]
    Fetch(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// HTTP status reported to the caller.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::CertificateMissing | Self::InvalidKeyPath(_) => StatusCode::NOT_ACCEPTABLE,
            Self::UnknownKey => StatusCode::NOT_FOUND,
            Self::HostNotAllowed(_) | Self::CertificateNotAllowed | Self::HookVeto(_) => {
                StatusCode::FORBIDDEN
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Caller-visible reason text.
    ///
    /// Deliberately generic: internal detail (paths, parse errors, hook
    /// stderr) stays in the server log.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::CertificateMissing => "Client certificate not provided",
            Self::InvalidKeyPath(_) => "Invalid key path",
            Self::UnknownKey => "Unknown key",
            Self::HostNotAllowed(_) => "Host not allowed",
            Self::CertificateNotAllowed => "No allowed certificate found",
            Self::HookVeto(_) => "Prevented by hook",
            Self::Notification(_) => "Error sending notification",
            _ => "Internal error",
        }
    }
}
