//! wg-provision CLI - add a WireGuard peer
//!
//! Prompts for a peer name on stdin, then generates keys, allocates the next
//! free address, appends the peer to the server configuration, and writes the
//! client `.conf` and QR code under the output directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::{fmt, EnvFilter};

use wg_provision::config::Overrides;
use wg_provision::{qr, Provisioned, Provisioner, Settings};

/// wg-provision - WireGuard peer provisioning
#[derive(Parser, Debug)]
#[command(name = "wg-provision")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Settings file (default: /etc/wireguard/wg-provision.json if present)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Server WireGuard configuration to append the peer to
    #[arg(short = 'c', long)]
    server_config: Option<PathBuf>,

    /// Public endpoint clients connect to (host or host:port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// DNS server for the client config (repeatable)
    #[arg(long = "dns", value_name = "ADDR")]
    dns: Vec<String>,

    /// Directory receiving the per-peer output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// PersistentKeepalive interval in seconds for the client
    #[arg(long, value_name = "SECS")]
    keepalive: Option<u16>,

    /// Generate a pre-shared key for the peer
    #[arg(long)]
    psk: bool,

    /// Also add the peer to the running interface with `wg set`
    #[arg(long)]
    apply: bool,

    /// Generate keys in-process instead of calling `wg genkey`
    #[arg(long)]
    native_keys: bool,

    /// Do not print the QR code to the terminal
    #[arg(long)]
    no_terminal_qr: bool,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            server_config: self.server_config.clone(),
            endpoint: self.endpoint.clone(),
            dns: self.dns.clone(),
            output_dir: self.output_dir.clone(),
            persistent_keepalive: self.keepalive,
            preshared_key: self.psk,
            apply: self.apply,
            native_keys: self.native_keys,
            no_terminal_qr: self.no_terminal_qr,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    // stdout carries the prompt and the summary
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let settings = match Settings::load(args.settings.as_deref()) {
        Ok(s) => s.merge(args.overrides()),
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            return ExitCode::from(e.exit_code());
        }
    };
    let terminal_qr = settings.terminal_qr;

    let provisioner = Provisioner::from_settings(settings);
    match provisioner
        .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
        .await
    {
        Ok(done) => {
            report(&done, terminal_qr);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn report(done: &Provisioned, terminal_qr: bool) {
    println!();
    println!("Peer {} added as {}", done.name, done.allowed_ip);
    println!("  Public key:    {}", done.public_key);
    println!("  Server config: {}", done.server_config.display());
    println!("  Client config: {}", done.paths.config.display());
    println!("  QR code:       {}", done.paths.qr.display());

    if terminal_qr {
        match qr::render_terminal(&done.client_config) {
            Ok(art) => println!("\n{}", art),
            Err(e) => tracing::warn!("Cannot show QR code in terminal: {}", e.user_message()),
        }
    }
}
