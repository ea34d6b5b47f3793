use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use port_manager::{PortManager, SerialPortTransport, available_ports};
use relay_protocol::DedupCache;
use serial_terminal::{
    DEFAULT_BAUD_RATE, MessageKind, RelayClient, SessionEvent, TerminalSession,
};

#[derive(Parser)]
#[command(name = "serial-term")]
#[command(about = "Serial terminal that shares device output through a relay")]
struct Args {
    /// Serial devices to open at startup
    ports: Vec<String>,

    /// Baud rate for every port
    #[arg(short, long, env = "SERIAL_TERM_BAUD", default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Relay WebSocket URL, e.g. ws://127.0.0.1:3000/ws
    #[arg(short, long, env = "SERIAL_TERM_RELAY")]
    relay: Option<String>,

    /// Remember at most this many message bodies for echo suppression
    #[arg(long, env = "SERIAL_TERM_DEDUP_CAPACITY")]
    dedup_capacity: Option<usize>,

    /// List available serial devices and exit
    #[arg(long)]
    list: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

const HELP: &str = "\
Commands:
  /open <path>          open another device
  /close                close every device
  /ports                list open devices
  /baud <rate>          set the baud rate for new connections
  /random start|stop    toggle the relay's synthetic number stream
  /export <file>        write sent messages as JSON
  /import <file>        load messages from an export (display only)
  /quit                 exit
Anything else is sent to every open device.";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so they don't interleave with the message stream
    let default_directive = if args.debug {
        "serial_terminal=debug,port_manager=debug,info"
    } else {
        "serial_terminal=info,port_manager=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if args.list {
        for path in available_ports().context("Failed to enumerate serial ports")? {
            println!("{}", path);
        }
        return Ok(());
    }

    let ports = Arc::new(PortManager::new(Arc::new(SerialPortTransport::default())));

    let relay = match &args.relay {
        Some(url) => {
            let dedup = match args.dedup_capacity {
                Some(capacity) => DedupCache::bounded(capacity),
                None => DedupCache::unbounded(),
            };
            Some(RelayClient::connect(url, Arc::new(Mutex::new(dedup))).await?)
        }
        None => None,
    };

    let session = Arc::new(TerminalSession::new(ports, relay));
    session.set_baud_rate(args.baud);

    let cancel = CancellationToken::new();
    tokio::spawn(print_events(session.subscribe()));
    let pump = {
        let session = session.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { session.run(cancel).await })
    };

    for path in &args.ports {
        if let Err(e) = session.connect(path).await {
            eprintln!("{}", e);
        }
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => line,
                None => break,
            },
        };
        match handle_command(&session, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => eprintln!("{}", e),
        }
    }

    info!("Shutting down");
    session.close_all().await;
    cancel.cancel();
    let _ = pump.await;
    Ok(())
}

/// Returns `Ok(false)` when the user asked to quit
async fn handle_command(session: &TerminalSession, line: &str) -> Result<bool> {
    let (command, rest) = match line.split_once(' ') {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/open" => {
            let id = session.connect(rest).await?;
            println!("Opened {} as {}", rest, id);
        }
        "/close" => {
            let count = session.close_all().await;
            println!("Closed {} port(s)", count);
        }
        "/ports" => {
            for port in session.list_ports().await {
                println!("{}  {}  {} baud  {:?}", port.id, port.path, port.baud_rate, port.state);
            }
        }
        "/baud" => {
            let rate: u32 = rest
                .parse()
                .with_context(|| format!("Invalid baud rate: {:?}", rest))?;
            session.set_baud_rate(rate);
            println!("Baud rate set to {}", rate);
        }
        "/random" => {
            let Some(relay) = session.relay() else {
                anyhow::bail!("Not connected to a relay");
            };
            match rest {
                "start" => relay.start_random_numbers()?,
                "stop" => relay.stop_random_numbers()?,
                other => anyhow::bail!("Expected start or stop, got {:?}", other),
            }
        }
        "/export" => {
            let count = session.export_to(Path::new(rest)).await?;
            println!("Exported {} message(s) to {}", count, rest);
        }
        "/import" => {
            let count = session.import_from(Path::new(rest)).await?;
            println!("Imported {} message(s) from {}", count, rest);
        }
        _ => {
            session.send(line).await?;
        }
    }
    Ok(true)
}

async fn print_events(mut rx: broadcast::Receiver<SessionEvent>) {
    loop {
        match rx.recv().await {
            Ok(SessionEvent::Message(message)) => {
                let time = chrono::DateTime::from_timestamp_millis(message.timestamp)
                    .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                    .unwrap_or_default();
                let arrow = match message.kind {
                    MessageKind::Sent => ">>",
                    MessageKind::Received => "<<",
                };
                println!(
                    "[{}] {} {:<8} {}",
                    time,
                    arrow,
                    message.source.to_string(),
                    message.body
                );
            }
            Ok(SessionEvent::Notice(text)) => println!("*** {}", text),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Display lagged, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
