mod config;
mod connection;
mod curl;
mod filter;
mod forward;
mod pipe;
mod redirect;
mod server;
mod socks;

use crate::config::{Cli, ForwardConfig, Mode};
use crate::connection::ConnectionGuard;
use crate::curl::{CommandSink, StdoutSink};
use crate::forward::Forwarder;
use crate::pipe::Inspector;
use crate::redirect::RedirectTrace;
use crate::server::{bind, serve, Service};
use crate::socks::Socks5Handler;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use color_eyre::eyre::{Report, Result, WrapErr};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;

fn main() -> ExitCode {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("port_forward=info"));
    // stdout carries the generated commands, diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = match Cli::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            eprint!("{}", e.render());
            println!("{}", Cli::command().render_usage());
            return ExitCode::from(1);
        }
    };

    if let Err(e) = color_eyre::install() {
        eprintln!("{:?}", e);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{:?}", e);
            ExitCode::from(2)
        }
    }
}

fn run(args: Cli) -> Result<()> {
    let config = ForwardConfig::from_cli(args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .enable_all()
        .build()
        .wrap_err("Failed to start the async runtime")?;

    runtime.block_on(start(config))
}

async fn start(config: ForwardConfig) -> Result<()> {
    // one trace for the whole process, shared by every relay
    let inspector = config.inspect.then(|| {
        let sink: Arc<dyn CommandSink> = Arc::new(StdoutSink);
        Inspector::new(Arc::new(RedirectTrace::with_window(config.trace_window)), sink)
    });

    let inspector_window = inspector.as_ref().map(|inspector| inspector.trace.window());

    let service = match &config.mode {
        Mode::Socks5 => {
            info!("SOCKS5 mode");
            Service::Socks5(Socks5Handler::new(inspector))
        }
        Mode::Forward { host, port } => {
            info!("Forwarding to {}:{} with {} worker thread(s)", host, port, config.threads);
            Service::Forward(Forwarder::new(host.clone(), *port, inspector))
        }
    };
    match &inspector_window {
        Some(window) => info!(
            "HTTP inspection on, redirects remembered for {}-{}s",
            window.as_secs(),
            window.as_secs().saturating_mul(2)
        ),
        None => info!("HTTP inspection disabled"),
    }

    let listener = match bind(config.listen_addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind address {}: {}", config.listen_addr, e);
            return Err(Report::new(e)
                .wrap_err(format!("Failed to bind address {}", config.listen_addr)));
        }
    };

    // Connection status monitor
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300)); // 5 minutes
        let mut last_active_count = 0;

        loop {
            interval.tick().await;

            let active = ConnectionGuard::active_count();
            if active > 0 || active != last_active_count {
                info!("Status - Active connections: {}", active);
            }
            last_active_count = active;
        }
    });

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install CTRL+C handler: {}", e);
            std::future::pending::<()>().await;
        }

        info!("Shutdown signal received");
        let active = ConnectionGuard::active_count();
        if active > 0 {
            info!("Dropping {} active connections", active);
        }
    };

    tokio::select! {
        _ = serve(listener, Arc::new(service)) => {
            warn!("Server loop terminated");
        }
        _ = shutdown => {
            info!("Server shutdown complete");
        }
    }

    Ok(())
}
