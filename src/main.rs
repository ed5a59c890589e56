//! matbridge - run code in a MATLAB or Octave engine from the command line.
//!
//! Starts an engine, evaluates each CODE argument in order, prints what the
//! engine printed and stops the engine again.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use matbridge::{Session, SessionConfig};

/// Run code in a MATLAB or Octave engine.
///
/// Environment: MATBRIDGE_EXECUTABLE, MATBRIDGE_ADDRESS,
/// MATBRIDGE_TIMEOUT_SECS, MATBRIDGE_SUPPORT_DIR, MATBRIDGE_LOG, RUST_LOG.
#[derive(Parser, Debug, Clone)]
#[command(name = "matbridge", version)]
struct Cli {
    /// Code to evaluate, one snippet per argument
    #[arg(value_name = "CODE", required = true)]
    code: Vec<String>,

    /// Use Octave instead of MATLAB
    #[arg(long)]
    octave: bool,

    /// Engine executable
    #[arg(long = "exe", value_name = "PATH")]
    executable: Option<PathBuf>,

    /// Seconds to wait for the engine to start
    #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
    timeout: Option<Duration>,
}

fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| format!("invalid timeout: {}", raw))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("timeout must be a positive number of seconds".to_string());
    }
    Ok(Duration::from_secs_f64(secs))
}

fn build_config(cli: &Cli) -> Result<SessionConfig> {
    let base = if cli.octave {
        SessionConfig::octave()
    } else {
        SessionConfig::matlab()
    };
    let mut config = base
        .apply_env()
        .context("Invalid MATBRIDGE_* environment")?;
    if let Some(exe) = &cli.executable {
        config = config.with_executable(exe);
    }
    if let Some(timeout) = cli.timeout {
        config = config.with_timeout(timeout);
    }
    Ok(config)
}

/// Evaluate every snippet; returns whether all of them succeeded.
async fn run_all(session: &Session, code: &[String]) -> Result<bool> {
    let mut all_ok = true;
    for snippet in code {
        let reply = session
            .run_code(snippet)
            .await
            .with_context(|| format!("Failed to run `{}`", snippet))?;
        print!("{}", reply.stdout());
        if !reply.success {
            all_ok = false;
            eprintln!("{}", reply.message.as_deref().unwrap_or("Engine reported an error"));
        }
    }
    Ok(all_ok)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "matbridge=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    info!("matbridge v{}", env!("CARGO_PKG_VERSION"));

    let session = Session::new(config);
    session
        .start()
        .await
        .context("Failed to start the engine")?;

    let outcome = run_all(&session, &cli.code).await;
    session.stop().await?;

    Ok(if outcome? {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
