//! Webex token refresher
//!
//! Single-shot binary run by a scheduler:
//! 1. Loads the credential bundle from a file or Vault
//! 2. Keeps the service app token valid (probe, then the refresh cascade)
//! 3. Optionally extends a data source token with the valid credential
//! 4. Prints a one-line JSON result and exits 0, 1, or 2 (operator needed)
//!
//! Configuration problems produce the same result line as any other failure.

mod config;
mod datasource;
mod error;
mod invocation;
mod metrics;

use anyhow::{Context, Result, bail};
use std::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::invocation::{InvocationResult, Mode};

/// Parsed command line.
#[derive(Debug, PartialEq)]
struct Cli {
    mode: Mode,
    config_path: Option<String>,
}

/// `token-refresher [run|refresh|token] [--config <path>]`
fn parse_args(args: &[String]) -> Result<Cli> {
    let mut mode = None;
    let mut config_path = None;
    let mut iter = args.iter().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = Some(path.clone());
            }
            flag if flag.starts_with("--") => bail!("unknown flag: {flag}"),
            command => {
                if mode.is_some() {
                    bail!("unexpected argument: {command}");
                }
                mode = Some(command.parse::<Mode>().map_err(anyhow::Error::msg)?);
            }
        }
    }

    Ok(Cli {
        mode: mode.unwrap_or(Mode::Run),
        config_path,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support.
    // Logs go to stderr; stdout carries only the result line or the token.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args)?;

    let invocation_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!(
        "invocation",
        invocation_id = %invocation_id,
        mode = cli.mode.label()
    );
    let exit_code = run(cli, &invocation_id).instrument(span).await?;

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn run(cli: Cli, invocation_id: &str) -> Result<i32> {
    info!("starting token-refresher");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let started = Instant::now();
    let config_path = Config::resolve_path(cli.config_path.as_deref());
    info!(path = %config_path.display(), "loading configuration");

    // Configuration failures are reported like any other failed invocation
    let (outcome, metrics_textfile) = match invocation::prepare(&config_path) {
        Ok((config, manager)) => (
            invocation::execute(cli.mode, &manager, &config).await,
            config.invocation.metrics_textfile,
        ),
        Err(e) => (Err(e), config::metrics_textfile_from_env()),
    };
    let elapsed = started.elapsed().as_secs_f64();

    let (outcome_label, exit_code) = match &outcome {
        Ok(completed) => {
            info!(
                token_expiry = completed.token_expiry,
                elapsed_secs = elapsed,
                "invocation succeeded"
            );
            ("success", 0)
        }
        Err(e) => {
            error!(
                error_kind = e.kind(),
                error = %e,
                elapsed_secs = elapsed,
                "invocation failed"
            );
            (e.kind(), e.exit_code())
        }
    };
    metrics::record_invocation(cli.mode.label(), outcome_label, elapsed);

    match (cli.mode, &outcome) {
        (Mode::Token, Ok(completed)) => println!("{}", completed.access_token.expose()),
        (Mode::Token, Err(_)) => {}
        _ => {
            let result = InvocationResult::new(invocation_id, &outcome);
            println!(
                "{}",
                serde_json::to_string(&result).context("failed to encode invocation result")?
            );
        }
    }

    if let Some(path) = &metrics_textfile
        && let Err(e) = metrics::write_textfile(&prometheus, path)
    {
        warn!(path = %path.display(), error = %e, "failed to write metrics textfile");
    }

    Ok(exit_code)
}
