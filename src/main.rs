//! CLI entry point for profmon
//!
//! Talks to a running profile monitor over its UI API:
//! - `call`: one request, print the reply
//! - `subscribe`: stream results until a count, an error or Ctrl-C
//! - `status`: connect, authenticate and report
//!
//! # Usage
//!
//! ```bash
//! profmon call get_settings
//! profmon --endpoint lab-pc subscribe plot --args '{"camera": "DEV_CAM"}' --count 10
//! profmon status --timeout-secs 5
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use profmon::config::{AppConfig, DEFAULT_CONFIG_PATH};
use profmon::logging;
use profmon_client::{CallError, EndpointAddress, Handlers, Session};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "profmon")]
#[command(about = "Profile monitor UI API client", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Endpoint URL (overrides config and PROFMON_ENDPOINT)
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Log level (overrides config)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue one call and print its result
    Call {
        /// Remote API name
        api: String,

        /// Arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Subscribe and print each result
    Subscribe {
        /// Remote API name
        api: String,

        /// Arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,

        /// Stop after this many results
        #[arg(long)]
        count: Option<usize>,
    },

    /// Connect, authenticate and report the connection state
    Status {
        /// Give up after this many seconds
        #[arg(long, default_value = "10")]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let endpoint = config.endpoint(cli.endpoint.as_deref())?;
    tracing::info!(source = endpoint.source().label(), "Using endpoint {}", endpoint);
    let session = Session::connect(endpoint.clone(), config.session_config())?;

    let result = match cli.command {
        Commands::Call { api, args } => run_call(&session, api, &args).await,
        Commands::Subscribe { api, args, count } => {
            run_subscribe(&session, api, &args, count).await
        }
        Commands::Status { timeout_secs } => {
            run_status(&session, &endpoint, Duration::from_secs(timeout_secs)).await
        }
    };

    session.destroy();
    session.wait_destroyed().await;
    result
}

fn parse_args(args: &str) -> Result<Value> {
    serde_json::from_str(args).with_context(|| format!("--args is not valid JSON: {args}"))
}

fn call_failed(kind: &str, api: &str, error: &CallError) -> String {
    if error.is_connection_failure() {
        format!("{kind} to {api} lost its connection")
    } else {
        format!("{kind} to {api} failed")
    }
}

async fn run_call(session: &Session, api: String, args: &str) -> Result<()> {
    let api_args = parse_args(args)?;
    let result = match session.call_async(api.as_str(), api_args).await {
        Ok(value) => value,
        Err(error) => {
            let context = call_failed("call", &api, &error);
            return Err(error).context(context);
        }
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_subscribe(
    session: &Session,
    api: String,
    args: &str,
    count: Option<usize>,
) -> Result<()> {
    let api_args = parse_args(args)?;
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<Value, CallError>>();
    let error_tx = tx.clone();
    let handle = session.subscribe(
        api.as_str(),
        api_args,
        Handlers::new(move |value| {
            let _ = tx.send(Ok(value));
        })
        .on_error(move |error| {
            let _ = error_tx.send(Err(error));
        }),
    );

    let mut received = 0usize;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(Ok(value)) => {
                    println!("{}", serde_json::to_string(&value)?);
                    received += 1;
                    if count.is_some_and(|n| received >= n) {
                        break;
                    }
                }
                Some(Err(error)) => {
                    let context = call_failed("subscription", &api, &error);
                    return Err(error).context(context);
                }
                None => {
                    tracing::info!("Subscription to {} ended after {} results", api, received);
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    session.unsubscribe(&handle);
    Ok(())
}

async fn run_status(
    session: &Session,
    endpoint: &EndpointAddress,
    timeout: Duration,
) -> Result<()> {
    println!("Endpoint: {}", endpoint);
    println!("From:     {:?} ({})", endpoint.original(), endpoint.source());
    match tokio::time::timeout(timeout, session.wait_connected()).await {
        Ok(Ok(())) => {
            println!("State:    {}", session.state().label());
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => {
            let state = session.state();
            println!("State:    {}", state.label());
            if let Some(error) = state.error_message() {
                println!("Last error: {error}");
            }
            anyhow::bail!("not connected after {}s", timeout.as_secs())
        }
    }
}
