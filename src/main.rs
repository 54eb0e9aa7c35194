//! kexd - key escrow authorization gateway.
//!
//! Serves secrets over mutual TLS, one trust decision per key.

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};

use kexd::cli::{Cli, Command};
use kexd::config::Config;
use kexd::fetch::{FetchParams, fetch_key};
use kexd::tls::{SelfSignedParams, generate_self_signed};
use kexd::{server, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Fetch {
            ref url,
            ref client_cert,
            ref client_key,
            ref server_cert,
        }) => run_fetch(url, client_cert, client_key, server_cert).await,
        Some(Command::GenCert {
            ref host,
            valid_days,
            ref organization,
            ref cert,
            ref key,
        }) => run_gen_cert(host, valid_days, organization, cert, key),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

/// Run the daemon.
async fn run_server(cli: &Cli) -> ExitCode {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_cli(cli);

    if config.notify.smtp_addr.is_none() {
        warn!("no SMTP relay configured, no notifications will be sent");
    }

    match server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Fetch a key from a daemon and write it to stdout, verbatim.
async fn run_fetch(
    url: &str,
    client_cert: &Path,
    client_key: &Path,
    server_cert: &Path,
) -> ExitCode {
    let params = FetchParams {
        url: url.to_string(),
        client_cert: client_cert.to_path_buf(),
        client_key: client_key.to_path_buf(),
        server_cert: server_cert.to_path_buf(),
    };

    match fetch_key(&params).await {
        // No trailing newline: key bytes go out verbatim
        Ok(key) => match std::io::stdout().write_all(&key) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Failed to write key to stdout: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("Fetch failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Generate a self-signed certificate and key pair.
fn run_gen_cert(
    host: &str,
    valid_days: u32,
    organization: &str,
    cert_path: &Path,
    key_path: &Path,
) -> ExitCode {
    let hosts: Vec<String> = host
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(ToString::to_string)
        .collect();

    let generated = match generate_self_signed(&SelfSignedParams {
        hosts: &hosts,
        organization,
        valid_days,
    }) {
        Ok(generated) => generated,
        Err(e) => {
            eprintln!("Certificate generation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = std::fs::write(cert_path, &generated.cert_pem) {
        eprintln!("Failed to write {}: {e}", cert_path.display());
        return ExitCode::FAILURE;
    }
    if let Err(e) = std::fs::write(key_path, &generated.key_pem) {
        eprintln!("Failed to write {}: {e}", key_path.display());
        return ExitCode::FAILURE;
    }

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        hosts = %hosts.join(","),
        "generated self-signed certificate"
    );
    println!("Wrote {} and {}", cert_path.display(), key_path.display());
    ExitCode::SUCCESS
}
