//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Key escrow authorization gateway - serves secrets over mutual TLS
#[derive(Parser, Debug)]
#[command(name = "kexd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KEXD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KEXD_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KEXD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "KEXD_PORT")]
    pub port: Option<u16>,

    /// IP address to listen on
    #[arg(long, env = "KEXD_IP_ADDR")]
    pub ip_addr: Option<String>,

    /// Data directory holding one subdirectory per key
    #[arg(long, env = "KEXD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Server TLS certificate (PEM)
    #[arg(long, env = "KEXD_CERT")]
    pub cert: Option<PathBuf>,

    /// Server TLS private key (PEM)
    #[arg(long, env = "KEXD_KEY")]
    pub key: Option<PathBuf>,

    /// SMTP relay (host or host:port) used to send access notifications
    #[arg(long, env = "KEXD_SMTP_ADDR")]
    pub smtp_addr: Option<String>,

    /// Email address notifications are sent from
    #[arg(long, env = "KEXD_MAIL_FROM")]
    pub mail_from: Option<String>,

    /// Policy hook executable, consulted before releasing a key
    /// (skipped if the path does not exist)
    #[arg(long, env = "KEXD_HOOK")]
    pub hook: Option<PathBuf>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway daemon (default)
    Serve,

    /// Fetch a key from a kexd server and print it to standard output
    Fetch {
        /// Key URL, e.g. `kxd://server/hostname/keyname` or `https://server:19840/v1/hostname/keyname`
        url: String,

        /// File containing the client certificate (PEM)
        #[arg(long, required = true)]
        client_cert: PathBuf,

        /// File containing the client private key (PEM)
        #[arg(long, required = true)]
        client_key: PathBuf,

        /// File containing valid server certificate(s) (PEM)
        #[arg(long, required = true)]
        server_cert: PathBuf,
    },

    /// Generate a self-signed certificate and key pair
    GenCert {
        /// Hostnames/IPs to generate the certificate for (comma separated)
        #[arg(long, default_value = "localhost")]
        host: String,

        /// How long the certificate will be valid for, in days
        #[arg(long, default_value_t = 3650)]
        valid_days: u32,

        /// Organization to use in the certificate, useful for debugging
        #[arg(long, default_value = "")]
        organization: String,

        /// Where to write the generated certificate
        #[arg(long, default_value = "cert.pem")]
        cert: PathBuf,

        /// Where to write the generated key
        #[arg(long, default_value = "key.pem")]
        key: PathBuf,
    },
}
