//! udpierce: bidirectional UDP-over-TLS tunnel
//!
//! One binary, two modes: the client accepts local UDP and multiplexes it
//! over TLS connections to the server; the server re-emits the datagrams
//! toward the destination UDP address and carries replies back.

mod cli;
mod tls;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use tunnel_client::{ClientListener, ClientSessionFactory, ConnFactory, TlsParams};
use tunnel_server::{DgramEndpoint, ServerHandler, serve};

use cli::Cli;

/// Exit code for failures during startup
const EXIT_STARTUP: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(args.verbosity).into())
                .from_env_lossy(),
        )
        .init();

    if args.server {
        server_main(args).await
    } else {
        client_main(args).await
    }
}

async fn client_main(args: Cli) -> ExitCode {
    info!("Starting client...");

    let tls = if args.no_tls {
        None
    } else {
        match client_tls_params(&args) {
            Ok(params) => Some(params),
            Err(e) => {
                error!("TLS config construction failed: {:#}", e);
                return ExitCode::from(EXIT_STARTUP);
            }
        }
    };

    let connfactory = match ConnFactory::new(
        args.dst.clone(),
        args.timeout.into(),
        tls,
        args.dialers as usize,
        args.resolve_once,
    )
    .await
    {
        Ok(factory) => Arc::new(factory),
        Err(e) => {
            error!("Connection factory construction failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let sessfact = ClientSessionFactory::new(
        args.password.clone(),
        args.backoff.into(),
        args.conns as usize,
        connfactory,
    );
    let listener = match ClientListener::bind(&args.bind, args.expire.into(), sessfact).await {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!("Listener bind failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }
    listener.serve().await;
    ExitCode::SUCCESS
}

fn client_tls_params(args: &Cli) -> anyhow::Result<TlsParams> {
    let config = tls::make_client_config(
        args.cert.as_deref(),
        args.key.as_deref(),
        args.cafile.as_deref(),
        !args.no_hostname_check,
    )?;
    let servername = match &args.tls_servername {
        Some(name) if !name.is_empty() => name.clone(),
        _ => tls::host_part(&args.dst)?,
    };
    let server_name = rustls::pki_types::ServerName::try_from(servername)
        .context("invalid TLS server name")?;
    Ok(TlsParams {
        config: Arc::new(config),
        server_name,
    })
}

async fn server_main(args: Cli) -> ExitCode {
    info!("Starting server...");

    let endpoint = match DgramEndpoint::new(
        args.dst.clone(),
        args.timeout.into(),
        args.resolve_once,
    )
    .await
    {
        Ok(endpoint) => Arc::new(endpoint),
        Err(e) => {
            error!("Endpoint construction failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let require_tls_auth = !args.no_tls && args.cafile.is_some();
    let handler = Arc::new(ServerHandler::new(&args.password, endpoint, require_tls_auth));

    let acceptor = if args.no_tls {
        None
    } else {
        let (Some(cert), Some(key)) = (args.cert.as_deref(), args.key.as_deref()) else {
            error!("TLS config construction failed: certificate and key files are required");
            return ExitCode::from(EXIT_STARTUP);
        };
        match tls::make_server_config(cert, key, args.cafile.as_deref()) {
            Ok(config) => Some(TlsAcceptor::from(Arc::new(config))),
            Err(e) => {
                error!("TLS config construction failed: {:#}", e);
                return ExitCode::from(EXIT_STARTUP);
            }
        }
    };

    let listener = match TcpListener::bind(&args.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Listener bind failed: {}", e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };
    if let Err(e) = serve(listener, acceptor, handler).await {
        error!("Server terminated with a reason: {}", e);
    }
    info!("Shutting down...");
    ExitCode::SUCCESS
}
