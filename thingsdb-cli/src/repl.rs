//! Interactive REPL.

use crate::commands::{drain_events, format_event, format_json, format_rooms, parse_value};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use serde_json::Value;
use thingsdb_client::Client;

const HELP_TEXT: &str = r#"
Available commands:
  help                                  Show this help
  ping                                  Ping the server

  query <scope> <code...>               Run code in a scope
  run <scope> <procedure> [args...]     Run a stored procedure

  join <scope> <room_id...>             Join rooms
  leave <scope> <room_id...>            Leave rooms
  emit <scope> <room_id> <event> [args...]  Emit an event to a room
  events                                Show events received so far

  quit, exit                            Exit the REPL

Arguments are parsed as JSON where possible, otherwise taken as strings.
"#;

pub async fn run(client: Client, uri: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "ThingsDB CLI".bold().cyan());
    println!("Connecting to {}...", uri);

    client.connect().await?;
    println!("{}", "Connected!".green());

    // Create readline editor
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    // Load history
    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".thingsdb_history"))
        .unwrap_or_else(|_| ".thingsdb_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "thingsdb>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
                    Ok(None) => break, // Exit command
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }

                // Show pushes that arrived while the command ran
                if let Some(output) = pending_events(&client).await {
                    println!("{}", output);
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

    // Save history
    let _ = rl.save_history(&history_path);

    client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            client.ping().await?;
            Ok(Some("PONG".green().to_string()))
        }

        "query" | "qr" => {
            if args.len() < 2 {
                return Ok(Some("Usage: query <scope> <code...>".to_string()));
            }
            let code = args[1..].join(" ");
            let result = client.query(args[0], &code, None).await?;
            Ok(Some(format_json(&result)))
        }

        "run" | "r" => {
            if args.len() < 2 {
                return Ok(Some(
                    "Usage: run <scope> <procedure> [args...]".to_string(),
                ));
            }
            let proc_args: Vec<Value> = args[2..].iter().map(|a| parse_value(a)).collect();
            let result = client.run(args[0], args[1], proc_args).await?;
            Ok(Some(format_json(&result)))
        }

        "join" | "leave" => {
            if args.len() < 2 {
                return Ok(Some(format!("Usage: {} <scope> <room_id...>", cmd)));
            }
            let room_ids = parse_room_ids(&args[1..])?;
            if cmd == "join" {
                let joined = client.join(args[0], &room_ids).await?;
                Ok(Some(format_rooms("Joined", &room_ids, &joined)))
            } else {
                let left = client.leave(args[0], &room_ids).await?;
                Ok(Some(format_rooms("Left", &room_ids, &left)))
            }
        }

        "emit" => {
            if args.len() < 3 {
                return Ok(Some(
                    "Usage: emit <scope> <room_id> <event> [args...]".to_string(),
                ));
            }
            let room_id: u64 = args[1].parse()?;
            let event_args: Vec<Value> = args[3..].iter().map(|a| parse_value(a)).collect();
            client.emit(args[0], room_id, args[2], event_args).await?;
            Ok(Some(format!("{} {}", "Emitted".green(), args[2].cyan())))
        }

        // Pending events are printed after every command
        "events" | "e" => Ok(Some(String::new())),

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}

/// Formats the events waiting on the connection, or the error that stopped the drain.
async fn pending_events(client: &Client) -> Option<String> {
    match drain_events(client).await {
        Ok(events) if events.is_empty() => None,
        Ok(events) => Some(
            events
                .iter()
                .map(format_event)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        Err(e) => Some(format!("{}: {}\n", "Error".red(), e)),
    }
}

fn parse_room_ids(args: &[&str]) -> Result<Vec<u64>, std::num::ParseIntError> {
    args.iter().map(|s| s.parse()).collect()
}
