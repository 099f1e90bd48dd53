//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// Bidirectional UDP-over-TLS tunnel.
///
/// In client mode, accepts UDP datagrams at the bind address and forwards
/// each peer's traffic over parallel TLS connections to the destination
/// server. In server mode, accepts those connections and re-emits the
/// datagrams toward the destination UDP address.
#[derive(Parser, Debug)]
#[command(name = "udpierce", version, about)]
pub struct Cli {
    /// Server-side mode
    #[arg(long)]
    pub server: bool,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0:8911")]
    pub bind: String,

    /// Forwarding address
    #[arg(long)]
    pub dst: String,

    /// Logging verbosity (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub verbosity: tracing::Level,

    /// (client) Amount of parallel TLS connections per session
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u16).range(1..))]
    pub conns: u16,

    /// Connect timeout
    #[arg(long, default_value = "10s")]
    pub timeout: humantime::Duration,

    /// (client) Interval between failed connection attempts
    #[arg(long, default_value = "5s")]
    pub backoff: humantime::Duration,

    /// (client) Idle session lifetime
    #[arg(long, default_value = "2m")]
    pub expire: humantime::Duration,

    /// Certificate for peer TLS auth
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Key for the TLS certificate
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Client: override default CA certs by the ones in this file.
    /// Server: require client TLS auth verified by the given CAs
    #[arg(long)]
    pub cafile: Option<PathBuf>,

    /// (client) Skip the hostname check of the server certificate;
    /// the chain is still verified against the CA file
    #[arg(long)]
    pub no_hostname_check: bool,

    /// (client) Hostname to expect in the server certificate
    #[arg(long)]
    pub tls_servername: Option<String>,

    /// Use password authentication
    #[arg(long, default_value = "")]
    pub password: String,

    /// Resolve the destination hostname once on start
    #[arg(long)]
    pub resolve_once: bool,

    /// (client) Concurrency limit for TLS connection attempts
    #[arg(long, default_value_t = default_dialers(), value_parser = clap::value_parser!(u16).range(1..))]
    pub dialers: u16,

    /// Run over plain TCP without TLS
    #[arg(long)]
    pub no_tls: bool,
}

fn default_dialers() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u16)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["udpierce", "--dst", "example.com:443"]);
        assert!(!cli.server);
        assert_eq!(cli.bind, "0.0.0.0:8911");
        assert_eq!(cli.conns, 4);
        assert!(cli.dialers >= 1);
        assert_eq!(std::time::Duration::from(cli.timeout), std::time::Duration::from_secs(10));
        assert_eq!(std::time::Duration::from(cli.expire), std::time::Duration::from_secs(120));
        assert!(!cli.no_tls);
    }

    #[test]
    fn test_dst_is_required() {
        assert!(Cli::try_parse_from(["udpierce"]).is_err());
    }

    #[test]
    fn test_conns_must_be_positive() {
        assert!(Cli::try_parse_from(["udpierce", "--dst", "x:1", "--conns", "0"]).is_err());
        assert!(Cli::try_parse_from(["udpierce", "--dst", "x:1", "--dialers", "0"]).is_err());
    }
}
