//! quillgate - inspect and drive the client session from a terminal.
//!
//! Usage: `quillgate <status|login|refresh|logout|watch>`
//!
//! Refreshing needs the server's renewal cookie. The CLI keeps it in the
//! cache directory between runs; seed it once with
//! `QUILLGATE_REFRESH_COOKIE=name=value`.

use std::io;
use std::time::Duration;

use anyhow::{Context, Result};
use quillgate_core::{Config, RefreshOutcome, SessionManager, SessionSnapshot};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often `watch` checks whether the token needs renewing
const WATCH_INTERVAL_SECS: u64 = 15;

/// Environment variable holding a token for non-interactive `login`
const ENV_TOKEN: &str = "QUILLGATE_TOKEN";

/// Environment variable naming a directory for a daily log file
const ENV_LOG_DIR: &str = "QUILLGATE_LOG_DIR";

const USAGE: &str = "Usage: quillgate <status|login|refresh|logout|watch>";

/// Initialize the tracing subscriber for logging.
/// Returns the file writer guard, which must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "quillgate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _guard = init_tracing();

    let command = std::env::args().nth(1).unwrap_or_else(|| "status".to_string());

    let config = Config::load()
        .context("Failed to load config")?
        .with_env_overrides();
    let session = config.session_manager()?;
    info!(command = %command, store = ?config.store, api = %config.api_base_url(), "quillgate starting");

    match command.as_str() {
        "status" => {
            let snapshot = session.initialize().await;
            print_snapshot(&snapshot)
        }
        "login" => login(&session),
        "refresh" => refresh(&session).await,
        "logout" => {
            let logged_out = session.logout();
            config.forget_refresh_cookie()?;
            let snapshot = logged_out.context("Logged out, but the stored token could not be removed")?;
            print_snapshot(&snapshot)
        }
        "watch" => watch(&session).await,
        "-h" | "--help" | "help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command `{}`\n{}", other, USAGE)),
    }
}

fn login(session: &SessionManager) -> Result<()> {
    let token = match std::env::var(ENV_TOKEN) {
        Ok(token) => token,
        Err(_) => rpassword::prompt_password("Access token: ")?,
    };

    let snapshot = session.login(token.trim())?;
    print_snapshot(&snapshot)
}

async fn refresh(session: &SessionManager) -> Result<()> {
    session.initialize().await;

    match session.refresh().await {
        Ok(RefreshOutcome::Renewed(snapshot)) => print_snapshot(&snapshot),
        Ok(RefreshOutcome::Superseded(snapshot)) => {
            eprintln!("Session changed while refreshing; showing current state");
            print_snapshot(&snapshot)
        }
        Err(e) => {
            eprintln!("{}", e.reason().user_message());
            Err(e.into())
        }
    }
}

async fn watch(session: &SessionManager) -> Result<()> {
    session.subscribe(|snapshot| {
        let who = snapshot.subject().unwrap_or("-");
        eprintln!(
            "[rev {}] {:?} subject={}{}",
            snapshot.revision,
            snapshot.status,
            who,
            snapshot
                .last_failure
                .map(|r| format!(" ({})", r.user_message()))
                .unwrap_or_default()
        );
    });

    let snapshot = session.initialize().await;
    print_snapshot(&snapshot)?;

    let mut ticker = tokio::time::interval(Duration::from_secs(WATCH_INTERVAL_SECS));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = session.ensure_fresh().await {
                    eprintln!("{}", e.reason().user_message());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving session as is");
                return Ok(());
            }
        }
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}
