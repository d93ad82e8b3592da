//! Interactive REPL.

use crate::commands::{self, OutputOptions};
use colored::Colorize;
use p4rpc_client::Connection;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help
  status                        Show connection state
  quiet [on|off]                Toggle suppression of informational messages
  json [on|off]                 Toggle JSON output

  <command> [args...]           Run a server command, e.g. 'info' or
                                'fstat //depot/...'
  !<command> [args...]          Run a command that shares a name with one of
                                the above

  quit, exit                    Exit the REPL
"#;

pub async fn run(
    conn: Connection,
    mut opts: OutputOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "p4rpc CLI".bold().cyan());
    println!(
        "{} {}",
        "Connected to".green(),
        conn.config().address.to_string().cyan()
    );

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".p4rpc_history"))
        .unwrap_or_else(|_| ".p4rpc_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "p4rpc>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&conn, line, &mut opts).await {
                    Ok(Some(output)) if output.is_empty() => {}
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }

                let state = conn.state();
                if state.is_terminal() {
                    println!("{} {}", "Connection".red(), state);
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    let _ = conn.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    conn: &Connection,
    line: &str,
    opts: &mut OutputOptions,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let words = commands::split_line(line)?;
    let Some((first, args)) = words.split_first() else {
        return Ok(Some(String::new()));
    };

    if let Some(verb) = first.strip_prefix('!') {
        return run_server_command(conn, verb, args, opts).await;
    }

    match first.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "status" => Ok(Some(format!(
            "  State: {}\n  Peer: {}\n  Pending: {}",
            conn.state().to_string().yellow(),
            conn.peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            conn.pending_count()
        ))),

        "quiet" => {
            opts.quiet = toggle(opts.quiet, args.first())?;
            Ok(Some(format!("quiet is {}", on_off(opts.quiet))))
        }

        "json" => {
            opts.json = toggle(opts.json, args.first())?;
            Ok(Some(format!("json is {}", on_off(opts.json))))
        }

        _ => run_server_command(conn, first, args, opts).await,
    }
}

async fn run_server_command(
    conn: &Connection,
    verb: &str,
    args: &[String],
    opts: &OutputOptions,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if verb.is_empty() {
        return Ok(Some("Usage: !<command> [args...]".to_string()));
    }
    let errors = commands::run_command(conn, verb, args, &[], opts).await?;
    if errors > 0 {
        Ok(Some(format!("{} {} error(s)", verb.cyan(), errors).dimmed().to_string()))
    } else {
        Ok(Some(String::new()))
    }
}

fn toggle(current: bool, arg: Option<&String>) -> Result<bool, String> {
    match arg.map(|s| s.to_lowercase()).as_deref() {
        None => Ok(!current),
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        Some(other) => Err(format!("expected on or off, got {:?}", other)),
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
