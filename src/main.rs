//! A tunneling proxy implemented in Rust
//!
//! Tunnelkeeperd runs either half of a tunnelkeeper deployment:
//! the tunnel server or the SOCKS5 front-end.
//!
use std::io;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::*;
use signal_hook::consts::signal::*;
use signal_hook::iterator::Signals;

use tunnelkeeper as tk;

#[derive(Parser, Debug)]
#[command(name = "tunnelkeeperd", version, about)]
struct Opt {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the tunnel server
    Server {
        #[arg(short = 'c', long = "config")]
        /// Set path to the server config file (format: yaml)
        config: Option<PathBuf>,
    },
    /// Run the SOCKS5 front-end connected to a tunnel server
    Client {
        #[arg(short = 'c', long = "config")]
        /// Set path to the client config file (format: yaml)
        config: Option<PathBuf>,
    },
}

fn set_handler<C: Send + 'static>(tx: Sender<tk::ServerCommand<C>>) -> io::Result<()> {
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGQUIT])?;
    std::thread::spawn(move || {
        for sig in signals.forever() {
            info!("signal: {}", sig);
            tx.send(tk::ServerCommand::Terminate).ok();
        }
    });
    Ok(())
}

fn run_server(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match path {
        Some(ref path) => tk::ServerConfig::with_file(path)
            .with_context(|| format!("server config: {}", path.display()))?,
        None => tk::ServerConfig::default(),
    };
    debug!("config: {:?}", config);
    let (mut server, tx) = tk::TunnelServer::new(&config).context("tunnel server")?;
    set_handler(tx).context("setting signal handler")?;
    server.serve().context("server error")
}

fn run_client(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = match path {
        Some(ref path) => tk::ClientConfig::with_file(path)
            .with_context(|| format!("client config: {}", path.display()))?,
        None => tk::ClientConfig::default(),
    };
    debug!("config: {:?}", config);
    let (mut server, tx) = tk::SocksServer::new(&config).context("socks front-end")?;
    set_handler(tx).context("setting signal handler")?;
    server.serve().context("server error")
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    match opt.mode {
        Mode::Server { config } => run_server(config),
        Mode::Client { config } => run_client(config),
    }
}
