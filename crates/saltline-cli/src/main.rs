//! saltline - command-line client for the Salt REST API.
//!
//! Logs in once (reusing the cached token while it is valid), then lists
//! minions or jobs, dispatches a job, prints master stats, or follows the
//! event feed.

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use saltline_core::diagnostics;
use saltline_core::{ClientConfig, CredentialStore, SaltClient};

#[derive(Parser)]
#[command(name = "saltline")]
#[command(author, version, about = "Command-line client for the Salt REST API")]
#[command(propagate_version = true)]
struct Cli {
    /// Salt API base URL (e.g. https://salt-master:8000)
    #[arg(short = 'u', long, global = true)]
    url: Option<String>,

    /// Username for the external authentication backend
    #[arg(long, global = true)]
    username: Option<String>,

    /// Password; prompted for when needed and not supplied
    #[arg(long, global = true)]
    password: Option<String>,

    /// External authentication backend (pam, ldap, auto, ...)
    #[arg(short = 'a', long, global = true)]
    eauth: Option<String>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long, global = true)]
    insecure: bool,

    /// Print request and response metadata to stderr
    #[arg(long, global = true)]
    debug: bool,

    /// Discard the cached token and log in again
    #[arg(short = 'x', long, global = true)]
    remove_token: bool,

    /// Where to cache the session token
    #[arg(long, global = true)]
    token_file: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Enable verbose logging (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List minions, or show one minion
    Minions {
        /// Minion ID
        id: Option<String>,
    },

    /// List jobs, or show one job
    Jobs {
        /// Job ID
        jid: Option<String>,
    },

    /// Dispatch a job against a target
    Run {
        /// Target expression (e.g. 'web*')
        target: String,
        /// Execution function (e.g. test.ping)
        function: String,
        /// Positional arguments; key=value pairs are passed as keyword arguments
        args: Vec<String>,
    },

    /// Show master statistics
    Stats,

    /// Follow the event stream
    Events {
        /// Stop after this many events
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Remove the cached token and end the session
    Logout,
}

impl Cli {
    fn apply_to(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.url {
            config.url = url.clone();
        }
        if let Some(ref username) = self.username {
            config.username = Some(username.clone());
        }
        if let Some(ref password) = self.password {
            config.password = Some(password.clone());
        }
        if let Some(ref eauth) = self.eauth {
            config.eauth = eauth.clone();
        }
        if let Some(ref token_file) = self.token_file {
            config.token_file = Some(token_file.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        config.insecure |= self.insecure;
        config.debug |= self.debug;
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(verbose: u8, log_file: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
    // RUST_LOG wins over -v
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .context("--log-file must name a file")?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            Ok(None)
        }
    }
}

/// Split CLI job arguments into `arg` and `kwarg` request fields.
fn job_params(args: &[String]) -> Map<String, Value> {
    let mut positional = Vec::new();
    let mut keyword = Map::new();
    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                keyword.insert(key.to_string(), json!(value));
            }
            _ => positional.push(json!(arg)),
        }
    }

    let mut params = Map::new();
    if !positional.is_empty() {
        params.insert("arg".to_string(), Value::Array(positional));
    }
    if !keyword.is_empty() {
        params.insert("kwarg".to_string(), Value::Object(keyword));
    }
    params
}

fn limit_reached(limit: Option<usize>, seen: usize) -> bool {
    limit.is_some_and(|limit| seen >= limit)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Prompt for a password only when the cached token can't be reused.
fn ensure_password(config: &mut ClientConfig, remove_token: bool) -> Result<()> {
    if config.password.is_some() {
        return Ok(());
    }
    let store = match config.token_file {
        Some(ref path) => CredentialStore::new(path),
        None => CredentialStore::new(CredentialStore::default_path()?),
    };
    if !remove_token && store.read().is_valid() {
        return Ok(());
    }
    if config.username.is_none() {
        bail!("no valid cached token; pass --username or set SALTAPI_USER");
    }
    let password = rpassword::prompt_password("Password: ").context("Failed to read password")?;
    config.password = Some(password);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    cli.apply_to(&mut config);
    debug!(url = %config.url, eauth = %config.eauth, "Resolved configuration");

    if let Commands::Logout = cli.command {
        let mut client = SaltClient::from_config(&config, diagnostics::stderr())?;
        client.resume();
        client.logout().await?;
        info!("Logged out");
        return Ok(());
    }

    ensure_password(&mut config, cli.remove_token)?;
    let mut client = SaltClient::from_config(&config, diagnostics::stderr())?;
    client.login(cli.remove_token).await?;

    match cli.command {
        Commands::Minions { id } => print_json(&client.list_minions(id.as_deref()).await?),
        Commands::Jobs { jid } => print_json(&client.list_jobs(jid.as_deref()).await?),
        Commands::Run {
            target,
            function,
            args,
        } => print_json(
            &client
                .submit_job(&target, &function, job_params(&args))
                .await?,
        ),
        Commands::Stats => print_json(&client.stats().await?),
        Commands::Events { limit } => {
            let mut events = client.events().await?;
            let mut seen = 0usize;
            while !limit_reached(limit, seen) {
                let Some(event) = events.next().await else {
                    break;
                };
                println!("{}", serde_json::to_string(&event?)?);
                seen += 1;
            }
            events.close();
            Ok(())
        }
        Commands::Logout => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = match init_tracing(cli.verbose, cli.log_file.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_params_split() {
        let args: Vec<String> = ["ls -l /", "cwd=/tmp", "runas=root", "=odd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let params = job_params(&args);
        assert_eq!(params["arg"], json!(["ls -l /", "=odd"]));
        assert_eq!(params["kwarg"], json!({"cwd": "/tmp", "runas": "root"}));

        assert!(job_params(&[]).is_empty());
    }

    #[test]
    fn test_event_limit_checked_before_reading() {
        assert!(limit_reached(Some(0), 0));
        assert!(!limit_reached(Some(2), 1));
        assert!(limit_reached(Some(2), 2));
        assert!(!limit_reached(None, 10_000));
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "saltline",
            "--url",
            "https://master:8000",
            "-k",
            "--eauth",
            "ldap",
            "--timeout",
            "5",
            "stats",
        ]);
        let mut config = ClientConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.url, "https://master:8000");
        assert!(config.insecure);
        assert!(!config.debug);
        assert_eq!(config.eauth, "ldap");
        assert_eq!(config.timeout_secs, 5);
    }
}
