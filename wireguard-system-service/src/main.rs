/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * CLI entry point. Grounded on `zerotier-system-service/src/main.rs`'s
 * dispatch shape (a fixed set of subcommands, a `Flags` struct carrying
 * global options, `exitcode`-typed process exit) but expressed with `clap`'s
 * derive API rather than that file's `Command`/`ArgMatches` builder calls --
 * the workspace already pulls in `clap`'s `derive` feature (see root
 * Cargo.toml) and every other crate in this workspace favors derive-style
 * APIs over builder ones, so the daemon's CLI follows suit (see DESIGN.md).
 */

mod datadir;
mod exitcode;
mod service;
mod uapi_socket;
mod utils;

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};

use wireguard_crypto::dh::KeyPair;

use crate::service::Service;

fn default_base_path() -> PathBuf {
    if cfg!(target_os = "macos") {
        PathBuf::from("/Library/Application Support/wireguard")
    } else {
        PathBuf::from("/var/lib/wireguard")
    }
}

#[derive(Parser)]
#[command(name = "wgcored", about = "Userspace WireGuard core: handshake, routing, and the get=1/set=1 control socket")]
struct Cli {
    /// Base data directory holding the identity, auth token, and control socket.
    #[arg(short = 'p', long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a new private key and print it, base64-encoded, to stdout.
    Genkey,
    /// Derive a public key from a private key read from stdin.
    Pubkey,
    /// Start the long-running daemon: loads (or generates) the identity,
    /// brings up the control socket, and runs the packet-processing engine.
    Service {
        /// Interface name; only used to name the control socket file.
        #[arg(long, default_value = "wg0")]
        interface: String,
        #[arg(long, default_value_t = 51820, value_parser = utils::parse_port)]
        listen_port: u16,
        /// Print a JSON device/metrics snapshot to stdout every 5s and once
        /// more at shutdown, for diagnostics (SPEC_FULL.md §4.9).
        #[arg(long)]
        dump_json: bool,
    },
    /// Print the daemon's version.
    Version,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Genkey => cmd_genkey(),
        Command::Pubkey => cmd_pubkey(),
        Command::Version => {
            println!("wgcored {}", env!("CARGO_PKG_VERSION"));
            exitcode::OK
        }
        Command::Service { interface, listen_port, dump_json } => {
            let base_path = cli.path.unwrap_or_else(default_base_path);
            cmd_service(base_path, &interface, listen_port, dump_json).await
        }
    };
    std::process::exit(code);
}

/// `wg genkey`-compatible: a fresh Curve25519 private key, base64-encoded.
fn cmd_genkey() -> i32 {
    let keypair = KeyPair::generate();
    println!("{}", BASE64.encode(keypair.private_bytes()));
    exitcode::OK
}

/// `wg pubkey`-compatible: reads a base64 private key from stdin, prints
/// the derived base64 public key.
fn cmd_pubkey() -> i32 {
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        eprintln!("failed to read private key from stdin");
        return exitcode::ERR_IOERR;
    }
    let Ok(bytes) = BASE64.decode(line.trim()) else {
        eprintln!("private key is not valid base64");
        return exitcode::ERR_USAGE;
    };
    let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
        eprintln!("private key must be 32 bytes");
        return exitcode::ERR_USAGE;
    };
    println!("{}", BASE64.encode(KeyPair::from_bytes(&bytes).public_bytes()));
    exitcode::OK
}

async fn cmd_service(base_path: PathBuf, interface: &str, listen_port: u16, dump_json: bool) -> i32 {
    match Service::start(base_path, interface, listen_port).await {
        Ok(service) => {
            let dump_task = dump_json.then(|| service.spawn_periodic_dump(std::time::Duration::from_secs(5)));
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("terminate signal received, shutting down");
            if let Some(task) = dump_task {
                task.abort();
            }
            if dump_json {
                println!("{}", service.dump_json());
            }
            service.shutdown();
            exitcode::OK
        }
        Err(err) => {
            eprintln!("FATAL: error starting service: {err}");
            exitcode::ERR_IOERR
        }
    }
}
