//! thingsdb-cli - Command-line interface for ThingsDB
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::Duration;
use thingsdb_client::{Client, ConnectionConfig, ListenTimeout, TlsClientConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "thingsdb-cli")]
#[command(about = "Command-line interface for ThingsDB")]
#[command(version)]
struct Cli {
    /// Server address (host[:port])
    #[arg(long, default_value = "localhost:9200", env = "THINGSDB_URI")]
    uri: String,

    /// User name for password authentication
    #[arg(short, long, env = "THINGSDB_USERNAME")]
    user: Option<String>,

    /// Password for password authentication
    #[arg(short, long, env = "THINGSDB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "THINGSDB_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 15)]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "THINGSDB_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "THINGSDB_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Accept a self-signed server certificate
    #[arg(long)]
    allow_self_signed: bool,

    /// Do not check the certificate against the server name
    #[arg(long)]
    no_verify_hostname: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Start interactive REPL
    Repl,

    /// Ping the server
    Ping,

    /// Run code in a scope
    Query {
        /// Scope, e.g. //stuff or @thingsdb
        scope: String,

        /// Code to run
        code: String,

        /// Variables as a JSON object (or @file.json to read from file)
        #[arg(long)]
        vars: Option<String>,
    },

    /// Run a stored procedure
    Run {
        scope: String,

        /// Procedure name
        procedure: String,

        /// Arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,
    },

    /// Join rooms and print their events until Ctrl+C
    Join {
        scope: String,

        #[arg(required = true)]
        room_ids: Vec<u64>,
    },

    /// Leave rooms
    Leave {
        scope: String,

        #[arg(required = true)]
        room_ids: Vec<u64>,
    },

    /// Emit an event to a room
    Emit {
        scope: String,

        room_id: u64,

        /// Event name
        event: String,

        /// Arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,
    },

    /// Print server pushes as they arrive
    Listen {
        /// Stop after this many seconds without an event
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn build_config(cli: &Cli) -> Result<ConnectionConfig, Box<dyn std::error::Error>> {
    let mut config =
        ConnectionConfig::from_uri(&cli.uri)?.with_io_timeout(Duration::from_secs(cli.timeout));

    // Token wins over user/password when both are given
    if let Some(ref token) = cli.token {
        config = config.with_auth_token(token);
    } else if let Some(ref user) = cli.user {
        let password = cli
            .password
            .as_deref()
            .ok_or("--user requires --password")?;
        config = config.with_auth(user, password);
    }

    let wants_tls = cli.tls
        || cli.ca_cert.is_some()
        || cli.client_cert.is_some()
        || cli.insecure
        || cli.allow_self_signed;
    if wants_tls {
        let mut tls = TlsClientConfig::new();

        if let Some(ref path) = cli.ca_cert {
            tls = tls.with_ca_cert(path);
        }
        match (&cli.client_cert, &cli.client_key) {
            (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
            (None, None) => {}
            _ => return Err("--client-cert and --client-key must be used together".into()),
        }
        if cli.insecure {
            tls = tls.with_insecure();
        }
        if cli.allow_self_signed {
            tls = tls.with_self_signed();
        }
        if cli.no_verify_hostname {
            tls = tls.without_hostname_verification();
        }
        if let Some(ref name) = cli.server_name {
            tls = tls.with_server_name(name);
        }

        config = config.with_tls(tls);
    }

    Ok(config)
}

/// Prints events until Ctrl+C, or until `timeout` passes without one.
async fn stream_events(
    client: &Client,
    timeout: ListenTimeout,
) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());
    loop {
        tokio::select! {
            event = client.listen_event(timeout) => {
                match event? {
                    Some(event) => println!("{}", commands::format_event(&event)),
                    None => {
                        eprintln!("{}", "No events".yellow());
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping...".dimmed());
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            std::process::exit(1);
        }
    };
    let client = Client::new(config);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &cli.uri).await?;
        }
        Some(cmd) => {
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = match cmd {
                Commands::Join { scope, room_ids } => {
                    match client.join(&scope, &room_ids).await {
                        Ok(joined) => {
                            println!("{}", commands::format_rooms("Joined", &room_ids, &joined));
                            stream_events(&client, ListenTimeout::Never).await
                        }
                        Err(e) => Err(e.into()),
                    }
                }
                Commands::Listen { timeout } => {
                    let timeout = match timeout {
                        Some(secs) => ListenTimeout::After(Duration::from_secs(secs)),
                        None => ListenTimeout::Never,
                    };
                    stream_events(&client, timeout).await
                }
                cmd => commands::execute(&client, cmd)
                    .await
                    .map(|output| println!("{}", output)),
            };

            client.close().await;
            if let Err(e) = result {
                eprintln!("{}: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
