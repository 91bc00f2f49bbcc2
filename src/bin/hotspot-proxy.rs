//! Command-line host for the hotspot proxy
//!
//! Starts a proxy service in the foreground and accepts `start`, `stop`,
//! `status` and `quit` on stdin. Ctrl-C stops the engine and exits.

use clap::Parser;
use hotspot_proxy::control::{LogNotifier, ProxyControl, ProxyService};
use hotspot_proxy::proxy::{ProxyConfig, ProxyServer, DEFAULT_PORT, MAX_PORT};
use std::io::{self, BufRead};
use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// First port to try
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Exclusive upper bound of the probed ports
    #[arg(long, default_value_t = MAX_PORT)]
    max_port: u16,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Wait for a `start` command instead of starting right away
    #[arg(long)]
    no_autostart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Stop,
    Status,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Option<Command> {
        match line.trim().to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "stop" => Some(Command::Stop),
            "status" => Some(Command::Status),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hotspot_proxy={}", cli.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.port >= cli.max_port {
        error!(port = cli.port, max_port = cli.max_port, "empty port range");
        return ExitCode::FAILURE;
    }

    let config = ProxyConfig::default()
        .with_bind_addr(cli.bind)
        .with_port_range(cli.port, cli.max_port);
    let service = ProxyService::new(Arc::new(ProxyServer::new(config)), LogNotifier);
    service.on_start_command();

    let (commands, inbox) = mpsc::channel();
    install_interrupt(commands.clone());
    spawn_stdin_reader(commands);

    if !cli.no_autostart {
        apply(&service, Command::Start);
    }

    for command in inbox {
        if command == Command::Quit {
            break;
        }
        apply(&service, command);
    }

    service.stop();
    info!("bye");
    ExitCode::SUCCESS
}

fn apply(service: &ProxyService, command: Command) {
    match command {
        Command::Start => {
            if service.start() {
                report(service);
            } else {
                error!("proxy did not start");
            }
        }
        Command::Stop => {
            if !service.stop() {
                info!("proxy was not running");
            }
        }
        Command::Status => report(service),
        Command::Quit => {}
    }
}

fn report(service: &ProxyService) {
    match service.share_address() {
        Some(addr) => println!("proxy running, point clients at {}", addr),
        None => println!("proxy stopped"),
    }
}

fn install_interrupt(commands: Sender<Command>) {
    let result = ctrlc::set_handler(move || {
        let _ = commands.send(Command::Quit);
    });
    if let Err(e) = result {
        warn!(error = %e, "interrupt handler not installed");
    }
}

/// Feed stdin lines to the command loop until stdin closes
fn spawn_stdin_reader(commands: Sender<Command>) {
    let spawned = thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Some(command) => {
                        if commands.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!(input = %line.trim(), "unknown command"),
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "stdin commands unavailable");
    }
}
