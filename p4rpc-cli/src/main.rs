//! p4rpc-cli - Command-line interface for the p4 RPC protocol
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod output;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::OutputOptions;
use p4rpc_client::crypto::response_digest;
use p4rpc_client::{Connection, IdentityProvider};
use p4rpc_protocol::ServerAddress;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "p4rpc-cli")]
#[command(about = "Run p4 server commands over the binary RPC protocol")]
#[command(version)]
pub struct Cli {
    /// Server address ([proto:]host:port)
    #[arg(short, long, env = "P4PORT")]
    port: Option<String>,

    /// User name
    #[arg(short, long, env = "P4USER")]
    user: Option<String>,

    /// Client workspace name
    #[arg(short, long, env = "P4CLIENT")]
    client: Option<String>,

    /// Client host name
    #[arg(short = 'H', long, env = "P4HOST")]
    host: Option<String>,

    /// Password, used when no ticket is stored
    #[arg(short = 'P', long, env = "P4PASSWD", hide_env_values = true)]
    password: Option<String>,

    /// Working directory reported to the server
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Suppress informational messages
    #[arg(short, long)]
    quiet: bool,

    /// Print records and messages as JSON lines
    #[arg(long)]
    json: bool,

    /// Seconds to wait for each command (0 waits forever)
    #[arg(long, default_value = "0")]
    timeout: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start interactive REPL
    Repl,

    /// Run one server command
    Run {
        /// Extra request symbol as name=value (repeatable)
        #[arg(short, long = "symbol", value_parser = commands::parse_symbol)]
        symbols: Vec<(String, String)>,

        /// Command name, e.g. info or fstat
        verb: String,

        /// Command arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Parse a server address and show its parts
    ParsePort {
        /// Address to parse (defaults to the configured P4PORT)
        address: Option<String>,
    },

    /// Compute a login challenge response
    Digest {
        /// Password, ticket or 32-digit MD5 digest
        secret: String,

        /// Challenge token sent by the server
        #[arg(short, long)]
        token: String,

        /// Server address as seen by the client (ip:port)
        #[arg(short, long, default_value = "unknown")]
        daddr: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let opts = OutputOptions::from_cli(&cli);

    match &cli.command {
        // Handled locally (no server connection needed)
        Some(Commands::Digest {
            secret,
            token,
            daddr,
        }) => {
            println!(
                "{}",
                response_digest(secret.as_bytes(), token.as_bytes(), daddr)
            );
        }
        Some(Commands::ParsePort { address }) => {
            let text = match address {
                Some(address) => address.clone(),
                None => commands::environment(&cli)?.server_address(),
            };
            match ServerAddress::parse(&text) {
                Ok(parsed) => println!("{}", commands::describe_address(&parsed)),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Repl) | None => {
            let conn = open(&cli).await?;
            repl::run(conn, opts).await?;
        }
        Some(Commands::Run {
            symbols,
            verb,
            args,
        }) => {
            let conn = open(&cli).await?;
            let result = commands::run_command(&conn, verb, args, symbols, &opts).await;
            let _ = conn.close().await;

            match result {
                Ok(0) => {}
                Ok(_) => std::process::exit(1),
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Connects using the environment and flags.
async fn open(cli: &Cli) -> Result<Connection, Box<dyn std::error::Error>> {
    let env = Arc::new(commands::environment(cli)?);
    let conn = commands::connect(env).await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    Ok(conn)
}
