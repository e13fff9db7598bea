use std::cell::Cell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use tcpnet::NetConfig;
use tcpnet::net::{Accept, Callbacks, Network, OpenOptions};

/// Small driver around the connection layer.
#[derive(Debug, Parser)]
#[command(name = "tcpnet", version, about)]
struct Cli {
    /// TOML file with connection layer settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Echo every received line back to its sender.
    Echo {
        /// Port to listen on; 0 picks a free one.
        port: u16,
        /// Serve TLS using the certificate files from the configuration.
        #[arg(long)]
        tls: bool,
    },
    /// Send one line to a server and print the replies until it hangs up.
    Send {
        /// Host name or IP literal.
        host: String,
        port: u16,
        line: String,
    },
}

const TICK: Duration = Duration::from_millis(50);

fn main() {
    tcpnet::log::init("info");

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => NetConfig::load(path).unwrap_or_else(|err| {
            error!("failed to load {}: {err}", path.display());
            process::exit(1);
        }),
        None => NetConfig::default(),
    };

    let mut net = Network::new(config).unwrap_or_else(|err| {
        error!("invalid configuration: {err}");
        process::exit(1);
    });

    match cli.command {
        Command::Echo { port, tls } => echo(&mut net, port, tls),
        Command::Send { host, port, line } => send(&mut net, &host, port, &line),
    }
}

/// Serves forever.
fn echo(net: &mut Network, port: u16, tls: bool) -> ! {
    let bound = net
        .listen(port, tls, |id, peer| {
            info!("[{id}] client {peer} connected");
            let callbacks = Callbacks::new()
                .on_read(|ctx, line| {
                    ctx.send(line);
                    ctx.send(b"\n");
                })
                .on_error(|id, code| info!("[{id}] ended: {code}"));
            Some(Accept::new(callbacks).line_buffered(true))
        })
        .unwrap_or_else(|err| {
            error!("failed to listen on port {port}: {err}");
            process::exit(1);
        });

    info!("echoing on port {bound}");

    loop {
        if let Err(err) = net.wait(TICK) {
            warn!("wait failed: {err}");
        }
        net.check_for_connections();
        net.poll_connections();
    }
}

fn send(net: &mut Network, host: &str, port: u16, line: &str) {
    let done = Rc::new(Cell::new(false));
    let failed = Rc::clone(&done);

    let request = format!("{line}\n");
    let callbacks = Callbacks::new()
        .on_connect(move |ctx| {
            info!("[{}] connected to {:?}", ctx.id(), ctx.peer_addr());
            ctx.send(request.as_bytes());
        })
        .on_read(|_, reply| println!("{}", String::from_utf8_lossy(reply)))
        .on_error(move |id, code| {
            info!("[{id}] {code}");
            failed.set(true);
        });

    let id = net.open(host, port, OpenOptions::new().line_buffered(true), callbacks);

    while !done.get() {
        if let Err(err) = net.wait(TICK) {
            warn!("wait failed: {err}");
        }
        net.poll_connections();
    }

    net.close(id);
    net.poll_connections();
}
