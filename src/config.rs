use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::{value_parser, Parser};
use color_eyre::eyre::{eyre, Result, WrapErr};

use crate::redirect::DEFAULT_TRACE_WINDOW;

/// Upper bound for `--trace-window` (one week)
pub const MAX_TRACE_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "TCP port forwarder / SOCKS5 relay that prints curl commands for HTTP downloads",
    override_usage = "port-forward <LISTEN_HOST> <LISTEN_PORT> [<DST_HOST> <DST_PORT> [THREADS]]",
    long_about = "port-forward relays TCP connections and watches plain HTTP passing through.\n\nModes:\n- LISTEN_HOST LISTEN_PORT                   : SOCKS5 server (no auth, CONNECT only)\n- LISTEN_HOST LISTEN_PORT DST_HOST DST_PORT : forward every connection to DST_HOST:DST_PORT\n\nWhenever a GET request (possibly after 302 redirects) is answered with\n`Content-Disposition: attachment`, an equivalent curl command is printed\non standard output. Logs go to standard error (RUST_LOG controls the level).\n"
)]
pub struct Cli {
    /// IP address to listen on
    pub listen_host: String,

    /// Port to listen on
    pub listen_port: String,

    /// Destination host for plain forwarding (omit for SOCKS5 mode)
    #[arg(requires = "dst_port")]
    pub dst_host: Option<String>,

    /// Destination port for plain forwarding
    pub dst_port: Option<String>,

    /// Worker threads driving the relay
    pub threads: Option<String>,

    /// Relay only; do not inspect HTTP traffic
    #[arg(long)]
    pub no_inspect: bool,

    /// Seconds a redirect is remembered per rotation window
    #[arg(
        long,
        value_name = "SECS",
        value_parser = value_parser!(u64).range(1..=MAX_TRACE_WINDOW_SECS),
        default_value_t = DEFAULT_TRACE_WINDOW.as_secs()
    )]
    pub trace_window: u64,
}

/// How accepted connections are handled
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// SOCKS5 negotiation per connection
    Socks5,
    /// Fixed destination
    Forward { host: String, port: u16 },
}

/// Relay configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ForwardConfig {
    pub listen_addr: SocketAddr,
    pub mode: Mode,
    pub threads: usize,
    pub inspect: bool,
    pub trace_window: Duration,
}

impl ForwardConfig {
    /// Create ForwardConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Result<Self> {
        let listen_ip: IpAddr = args
            .listen_host
            .parse()
            .wrap_err_with(|| format!("Invalid listen host {:?}, expected an IP address", args.listen_host))?;
        let listen_port = parse_port(&args.listen_port)?;

        let mode = match (args.dst_host, args.dst_port) {
            (Some(host), Some(port)) => Mode::Forward {
                host,
                port: parse_port(&port)?,
            },
            (None, None) => Mode::Socks5,
            _ => return Err(eyre!("A destination needs both host and port")),
        };

        let threads = match args.threads.as_deref() {
            Some(t) => t
                .parse::<usize>()
                .wrap_err_with(|| format!("Invalid thread count {:?}", t))?
                .max(1),
            None => 1,
        };

        Ok(Self {
            listen_addr: SocketAddr::new(listen_ip, listen_port),
            mode,
            threads,
            inspect: !args.no_inspect,
            trace_window: Duration::from_secs(args.trace_window),
        })
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .wrap_err_with(|| format!("Invalid port {:?}", s))
}
