//! Command execution.

use crate::output::{ColorSink, Counted, JsonSink};
use crate::Cli;
use colored::Colorize;
use p4rpc_client::{ClientError, Command, Connection, ConnectionConfig, Environment, Handler};
use p4rpc_protocol::ServerAddress;
use std::sync::Arc;
use std::time::Duration;

/// How command output is presented.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputOptions {
    pub quiet: bool,
    pub json: bool,
    /// Limit on a single command; expiry closes the connection.
    pub timeout: Option<Duration>,
}

impl OutputOptions {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            quiet: cli.quiet,
            json: cli.json,
            timeout: (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout)),
        }
    }

    /// Builds a handler writing to the terminal, and the sink it writes to.
    pub fn handler(&self) -> (Handler, Arc<Counted>) {
        let sink = if self.json {
            Arc::new(Counted::new(JsonSink))
        } else {
            Arc::new(Counted::new(ColorSink))
        };
        let handler = Handler::with_sink(sink.clone()).quiet(self.quiet);
        (handler, sink)
    }
}

/// Resolves the environment, layering command-line flags on top.
pub fn environment(cli: &Cli) -> Result<Environment, Box<dyn std::error::Error>> {
    let cwd = match &cli.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut env = Environment::load(cwd);

    let flags = [
        ("P4PORT", &cli.port),
        ("P4USER", &cli.user),
        ("P4CLIENT", &cli.client),
        ("P4HOST", &cli.host),
        ("P4PASSWD", &cli.password),
    ];
    for (name, value) in flags {
        if let Some(value) = value {
            env.set(name, value.clone());
        }
    }
    Ok(env)
}

/// Opens a connection for the environment's server.
pub async fn connect(env: Arc<Environment>) -> Result<Connection, ClientError> {
    let config = ConnectionConfig::from_identity(env.as_ref())?
        .with_program("p4rpc-cli", env!("CARGO_PKG_VERSION"));
    Connection::open(config, env).await
}

/// Builds a command from a verb, positional arguments and `name=value`
/// symbols.
pub fn build_command(
    verb: &str,
    args: &[String],
    symbols: &[(String, String)],
    handler: Handler,
) -> Command {
    let mut command = Command::new(verb)
        .with_args(args.iter().cloned())
        .with_handler(handler);
    for (name, value) in symbols {
        command = command.with_symbol(name.clone(), value.clone());
    }
    command
}

/// Runs a command, closing the connection if it outlives the timeout.
pub async fn execute(
    conn: &Connection,
    command: Command,
    timeout: Option<Duration>,
) -> Result<(), ClientError> {
    let pending = conn.run(command);
    let Some(limit) = timeout else {
        return pending.await;
    };
    match tokio::time::timeout(limit, pending).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Command timed out after {:?}, closing connection", limit);
            conn.close().await?;
            Err(ClientError::Timeout)
        }
    }
}

/// Runs one command and reports how many error-class diagnostics it
/// produced.
pub async fn run_command(
    conn: &Connection,
    verb: &str,
    args: &[String],
    symbols: &[(String, String)],
    opts: &OutputOptions,
) -> Result<usize, ClientError> {
    let (handler, sink) = opts.handler();
    let command = build_command(verb, args, symbols, handler);
    execute(conn, command, opts.timeout).await?;
    Ok(sink.errors())
}

/// Parses a `name=value` symbol argument.
pub fn parse_symbol(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, _)) if name.is_empty() => Err(format!("empty symbol name in {:?}", s)),
        Some((name, value)) => Ok((name.to_string(), value.to_string())),
        None => Ok((s.to_string(), String::new())),
    }
}

/// Splits an interactive line into words, honouring single and double
/// quotes.
pub fn split_line(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_word = true;
            }
            None if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Describes a parsed server address.
pub fn describe_address(address: &ServerAddress) -> String {
    format!(
        "{}\n  Protocol: {}\n  Host: {}\n  Port: {}\n  Encrypted: {}",
        address.to_string().bold(),
        address.protocol.as_deref().unwrap_or("(default)"),
        address.host.cyan(),
        address.port.cyan(),
        if address.encrypted {
            "yes".yellow()
        } else {
            "no".normal()
        }
    )
}
