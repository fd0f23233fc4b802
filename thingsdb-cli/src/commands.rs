//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use std::time::Duration;
use thingsdb_client::{Client, Event, ListenTimeout};

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            client.ping().await?;
            Ok("PONG".green().to_string())
        }

        Commands::Query { scope, code, vars } => {
            let vars = vars.map(|v| parse_json_arg(&v)).transpose()?;
            let result = client.query(&scope, &code, vars).await?;
            Ok(format_json(&result))
        }

        Commands::Run {
            scope,
            procedure,
            args,
        } => {
            let args = args.iter().map(|a| parse_value(a)).collect();
            let result = client.run(&scope, &procedure, args).await?;
            Ok(format_json(&result))
        }

        Commands::Leave { scope, room_ids } => {
            let left = client.leave(&scope, &room_ids).await?;
            Ok(format_rooms("Left", &room_ids, &left))
        }

        Commands::Emit {
            scope,
            room_id,
            event,
            args,
        } => {
            let args = args.iter().map(|a| parse_value(a)).collect();
            client.emit(&scope, room_id, &event, args).await?;
            Ok(format!(
                "{} {} to room {}",
                "Emitted".green(),
                event.cyan(),
                room_id
            ))
        }

        // Streaming and interactive commands are handled in main.rs
        Commands::Repl | Commands::Join { .. } | Commands::Listen { .. } => unreachable!(),
    }
}

/// Pops every event that is already waiting, without blocking on the socket.
pub async fn drain_events(client: &Client) -> Result<Vec<Event>, Box<dyn std::error::Error>> {
    let mut events = Vec::new();
    while let Some(event) = client
        .listen_event(ListenTimeout::After(Duration::ZERO))
        .await?
    {
        events.push(event);
    }
    Ok(events)
}

/// Formats a push event as one line.
pub fn format_event(event: &Event) -> String {
    match event {
        Event::NodeStatus(status) => format!("{} {}", "NODE_STATUS".dimmed(), status),
        Event::Warning { code, message } => {
            format!("{} ({}) {}", "WARNING".yellow(), code, message)
        }
        Event::Join { room_id } => format!("{} room {}", "ON_JOIN".green(), room_id),
        Event::Leave { room_id } => format!("{} room {}", "ON_LEAVE".yellow(), room_id),
        Event::Delete { room_id } => format!("{} room {}", "ON_DELETE".red(), room_id),
        Event::Emit {
            room_id,
            event,
            args,
        } => format!(
            "{} room {} {} {}",
            "ON_EMIT".cyan(),
            room_id,
            event.bold(),
            Value::Array(args.clone())
        ),
    }
}

/// Formats the result of a join or leave, one line per requested room.
pub fn format_rooms(action: &str, requested: &[u64], result: &[Option<u64>]) -> String {
    requested
        .iter()
        .zip(result.iter().chain(std::iter::repeat(&None)))
        .map(|(id, found)| match found {
            Some(_) => format!("{} room {}", action.green(), id),
            None => format!("{}: room {} not found", "Warning".yellow(), id),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Parses a procedure or event argument; anything that is not JSON is a string.
pub fn parse_value(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

/// Formats JSON for display.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
