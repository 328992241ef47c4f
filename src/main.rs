//! LoRaHop - Multi-hop messaging over LoRa radio modems
//!
//! Runs one mesh node on top of an AT-command radio modem and offers a line
//! console for sending messages and managing peers and sessions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lorahop::config::{self, Config};
use lorahop::network::{open_serial, AppEvent, Delivery, Engine, Modem};
use lorahop::protocol::{self, decode_frame, HeaderType};

/// LoRaHop - Multi-hop messaging over LoRa radio modems
#[derive(Parser)]
#[command(name = "lorahop")]
#[command(author = "LoRaHop Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Reactive multi-hop routing over AT-command radio modems", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a mesh node on the configured modem
    Run {
        /// Serial port of the modem
        #[arg(short, long, conflicts_with = "tcp")]
        device: Option<PathBuf>,

        /// host:port of a serial-over-TCP bridge
        #[arg(short, long)]
        tcp: Option<String>,

        /// Address of the local radio module
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse a received modem line and print its header
    Decode {
        /// Raw line, e.g. "LR,0136,10,|0137|3|8|4|0138|"
        line: String,
    },

    /// Show protocol information
    Info,
}

/// Commands accepted on the node console
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Send(String),
    Register(String),
    Unregister(String),
    Connect {
        source: String,
        target: String,
        timeout: u32,
    },
    Disconnect {
        source: String,
        target: String,
    },
    Peers,
    Routes,
    Help,
    Quit,
}

const CONSOLE_HELP: &str = "\
Commands:
  send <text>                          send text to the connected node
  register <peer>                      register a local peer
  unregister <peer>                    unregister a local peer
  connect <peer> <remote peer> [secs]  request a session (default 60 s)
  disconnect <peer> <remote peer>      close a session
  peers                                list known peers
  routes                               list best routes
  quit                                 stop the node";

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (word, args.as_slice()) {
            ("send", _) if !rest.is_empty() => Ok(Self::Send(rest.to_string())),
            ("register", [peer]) => Ok(Self::Register(peer.to_string())),
            ("unregister", [peer]) => Ok(Self::Unregister(peer.to_string())),
            ("connect", [source, target]) => Ok(Self::Connect {
                source: source.to_string(),
                target: target.to_string(),
                timeout: 60,
            }),
            ("connect", [source, target, timeout]) => Ok(Self::Connect {
                source: source.to_string(),
                target: target.to_string(),
                timeout: timeout
                    .parse()
                    .map_err(|_| format!("invalid timeout '{}'", timeout))?,
            }),
            ("disconnect", [source, target]) => Ok(Self::Disconnect {
                source: source.to_string(),
                target: target.to_string(),
            }),
            ("peers", []) => Ok(Self::Peers),
            ("routes", []) => Ok(Self::Routes),
            ("help", []) => Ok(Self::Help),
            ("quit" | "exit", []) => Ok(Self::Quit),
            _ => Err(format!("unknown command '{}', try 'help'", line)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if debug_logging(&cli, &config) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            device,
            tcp,
            address,
        } => {
            let mut config = config;
            if let Some(address) = address {
                config.node.address = Some(address);
            }
            if device.is_some() || tcp.is_some() {
                config.modem.device = device;
                config.modem.tcp = tcp;
            }
            config.validate()?;
            open_modem(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Decode { line } => match decode_frame(&line) {
            Ok(header) => println!("{:#?}", header),
            Err(e) => match e.received_from {
                Some(sender) => anyhow::bail!("invalid frame from {}: {}", sender, e),
                None => anyhow::bail!("invalid frame: {}", e),
            },
        },
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Debug logging is on when either the flag or the config asks for it
fn debug_logging(cli: &Cli, config: &Config) -> bool {
    cli.verbose || config.general.verbose
}

/// Connect to the configured modem and run the node on it
async fn open_modem(config: Config) -> anyhow::Result<()> {
    if let Some(addr) = config.modem.tcp.clone() {
        tracing::info!("Connecting to modem bridge at {}", addr);
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("could not connect to {}", addr))?;
        return run_node(config, stream).await;
    }

    let device = config
        .modem
        .device
        .clone()
        .context("no modem configured, use --device or --tcp")?;
    let port = open_serial(&device.to_string_lossy(), config.modem.baud_rate)
        .with_context(|| format!("could not open {}", device.display()))?;
    run_node(config, port).await
}

/// Run a node on an open modem stream until quit or Ctrl+C
async fn run_node<S>(config: Config, stream: S) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let engine_config = config.engine_config()?;
    let (modem, handle, inbound) = Modem::new(stream, &config.modem_config());
    let modem_task = tokio::spawn(modem.run());

    let (engine, mut events) = Engine::new(engine_config, Arc::new(handle));
    let dispatch_task = tokio::spawn(engine.clone().run(inbound));

    tracing::info!(
        "Node '{}' running with address {}",
        config.general.name,
        engine.address()
    );

    println!("\n========================================");
    println!("  LoRaHop Node Running");
    println!("========================================");
    println!("  Name: {}", config.general.name);
    println!("  Address: {}", engine.address());
    println!("========================================");
    println!("\n{}\n", CONSOLE_HELP);

    let mut console = BufReader::new(tokio::io::stdin()).lines();

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = events.recv() => print_event(event),
            line = console.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match ConsoleCommand::parse(&line) {
                    Ok(ConsoleCommand::Quit) => break,
                    Ok(command) => {
                        // Operations wait on the radio; keep the console responsive
                        tokio::spawn(run_command(engine.clone(), command));
                    }
                    Err(e) => println!("{}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    modem_task.abort();
    dispatch_task.abort();
    tracing::info!("Node stopped");

    Ok(())
}

async fn run_command(engine: Engine, command: ConsoleCommand) {
    match command {
        ConsoleCommand::Send(text) => match engine.send_message(text.into_bytes()).await {
            Ok(Delivery::Confirmed) => println!("Message was acknowledged by the receiver"),
            Ok(Delivery::Unconfirmed) => println!("Message was not acknowledged"),
            Err(e) => println!("Could not send message: {}", e),
        },
        ConsoleCommand::Register(peer) => report_registration(&engine, true, &peer).await,
        ConsoleCommand::Unregister(peer) => report_registration(&engine, false, &peer).await,
        ConsoleCommand::Connect {
            source,
            target,
            timeout,
        } => match engine.send_connect_request(&source, &target, timeout).await {
            Ok(true) => println!("Connect request sent to '{}'", target),
            Ok(false) => println!("Connect request to '{}' not sent", target),
            Err(e) => println!("Could not connect: {}", e),
        },
        ConsoleCommand::Disconnect { source, target } => {
            match engine.send_disconnect_request(&source, &target).await {
                Ok(true) => println!("Disconnect request sent to '{}'", target),
                Ok(false) => println!("Disconnect request to '{}' not sent", target),
                Err(e) => println!("Could not disconnect: {}", e),
            }
        }
        ConsoleCommand::Peers => {
            let peers = engine.peers().await;
            if peers.is_empty() {
                println!("No peers registered");
            }
            for peer in peers {
                println!("  {} @ {}", peer.peer_id, peer.address);
            }
        }
        ConsoleCommand::Routes => {
            let routes = engine.best_routes().await;
            if routes.is_empty() {
                println!("No routes known");
            }
            for route in routes {
                println!("  {}", route);
            }
            let unsupported = engine.unsupported_devices().await;
            if !unsupported.is_empty() {
                let list: Vec<String> = unsupported.iter().map(|a| a.to_string()).collect();
                println!("Unsupported devices: {}", list.join(", "));
            }
        }
        ConsoleCommand::Help => println!("{}", CONSOLE_HELP),
        ConsoleCommand::Quit => {}
    }
}

async fn report_registration(engine: &Engine, subscribe: bool, peer: &str) {
    match engine.send_registration(subscribe, peer).await {
        Ok(true) => println!("Registration of '{}' confirmed by the network", peer),
        Ok(false) => println!("Registration of '{}' was not relayed by any neighbor", peer),
        Err(e) => println!("Could not register: {}", e),
    }
}

fn print_event(event: AppEvent) {
    match event {
        AppEvent::Delivered {
            source, payload, ..
        } => {
            println!("[{}] {}", source, String::from_utf8_lossy(&payload));
        }
        AppEvent::ConnectRequest {
            source,
            source_peer_id,
            target_peer_id,
            timeout,
        } => {
            println!(
                "Connect request from '{}' ({}) to '{}', timeout {} s",
                source_peer_id, source, target_peer_id, timeout
            );
        }
        AppEvent::DisconnectRequest {
            source,
            source_peer_id,
            target_peer_id,
        } => {
            println!(
                "Disconnect request from '{}' ({}) to '{}'",
                source_peer_id, source, target_peer_id
            );
        }
    }
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("LoRaHop Protocol Information");
    println!("============================\n");

    println!("Header types:");
    for code in 1..=8u8 {
        if let Ok(header_type) = HeaderType::try_from(code) {
            println!(
                "  {} {:?} ({} fields)",
                code,
                header_type,
                header_type.field_count()
            );
        }
    }

    println!("\nAddress length: {}", protocol::ADDRESS_LEN);
    println!("Default TTL: {}", config.protocol.default_ttl);
    println!("Attempts: {}", config.protocol.max_attempts);
    println!("Acknowledgment timeout: {} ms", config.protocol.ack_timeout_ms);
    println!("Known nodes: {}", config.node.known_nodes.len());
    match &config.node.address {
        Some(address) => println!("Local address: {}", address),
        None => println!("Local address: not configured"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["lorahop", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["lorahop", "run", "--device", "/dev/ttyS0", "--tcp", "x:1"]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_verbose_from_flag_or_config() {
        let quiet = Cli::try_parse_from(["lorahop", "info"]).unwrap();
        let loud = Cli::try_parse_from(["lorahop", "-v", "info"]).unwrap();
        let mut config = Config::default();

        assert!(!debug_logging(&quiet, &config));
        assert!(debug_logging(&loud, &config));

        config.general.verbose = true;
        assert!(debug_logging(&quiet, &config));
    }

    #[test]
    fn test_console_commands() {
        assert_eq!(
            ConsoleCommand::parse("send hello there"),
            Ok(ConsoleCommand::Send("hello there".to_string()))
        );
        assert_eq!(
            ConsoleCommand::parse("connect alice bob"),
            Ok(ConsoleCommand::Connect {
                source: "alice".to_string(),
                target: "bob".to_string(),
                timeout: 60,
            })
        );
        assert_eq!(
            ConsoleCommand::parse(" register alice "),
            Ok(ConsoleCommand::Register("alice".to_string()))
        );
        assert_eq!(ConsoleCommand::parse("routes"), Ok(ConsoleCommand::Routes));
        assert!(ConsoleCommand::parse("send").is_err());
        assert!(ConsoleCommand::parse("connect alice bob soon").is_err());
        assert!(ConsoleCommand::parse("fly").is_err());
    }
}
