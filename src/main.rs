//! flashkv-cli - send one command to a FlashKV (or any RESP) server
//!
//! Connects, submits the command given on the command line through the
//! driver and prints the reply the way redis-cli does.

use flashkv_driver::command::{Command, CommandError, RespOutput};
use flashkv_driver::{Client, ClientOptions};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// CLI configuration
struct Config {
    /// Server host
    host: String,
    /// Server port
    port: u16,
    /// Command name followed by its arguments
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: flashkv_driver::DEFAULT_HOST.to_string(),
            port: flashkv_driver::DEFAULT_PORT,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    if i + 1 < args.len() {
                        config.host = args[i + 1].clone();
                        i += 2;
                    } else {
                        eprintln!("Error: --host requires a value");
                        std::process::exit(1);
                    }
                }
                "--port" | "-p" => {
                    if i + 1 < args.len() {
                        config.port = args[i + 1].parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid port number");
                            std::process::exit(1);
                        });
                        i += 2;
                    } else {
                        eprintln!("Error: --port requires a value");
                        std::process::exit(1);
                    }
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashkv-cli version {}", flashkv_driver::VERSION);
                    std::process::exit(0);
                }
                flag if flag.starts_with('-') => {
                    eprintln!("Unknown argument: {}", flag);
                    print_help();
                    std::process::exit(1);
                }
                _ => {
                    config.command.extend(args[i..].iter().cloned());
                    break;
                }
            }
        }

        if config.command.is_empty() {
            config.command.push("PING".to_string());
        }
        config
    }

    /// Returns the server address as a string
    fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn print_help() {
    println!(
        r#"
flashkv-cli - send a command to a FlashKV server

USAGE:
    flashkv-cli [OPTIONS] [COMMAND [ARG ...]]

OPTIONS:
    -h, --host <HOST>    Server host (default: 127.0.0.1)
    -p, --port <PORT>    Server port (default: 6379)
    -v, --version        Print version information
        --help           Print this help message

EXAMPLES:
    flashkv-cli                          # PING
    flashkv-cli SET name Ariz            # OK
    flashkv-cli -p 6380 GET name         # "Ariz"

Set RUST_LOG=debug to watch the driver at work.
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging; quiet unless RUST_LOG asks for more
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let options = ClientOptions {
        auto_reconnect: false,
        connect_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let client = Client::connect(&config.server_address(), options).await?;
    debug!(address = %config.server_address(), "Connected");

    let mut command = Command::new(config.command[0].to_uppercase(), RespOutput::new());
    for arg in &config.command[1..] {
        command = command.arg(arg.clone());
    }

    let reply = client.submit(command).await;
    client.close();

    match reply {
        Ok(value) => println!("{}", value),
        Err(CommandError::Server(message)) => println!("(error) {}", message),
        Err(e) => {
            println!("(error) {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}
