//! Courier daemon - serves the session API over HTTP.
//!
//! Each session is backed by its own bridge process, started with
//! `<bridge> --session-id <id> --session-dir <dir>`.

use clap::Parser;
use courier_core::client::{BridgeConfig, BridgeFactory};
use courier_core::SessionController;
use courier_http::SharedState;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "courier-daemon", version, about = "Courier session daemon")]
struct Args {
    /// Host to bind to
    #[arg(long, env = "COURIER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Root directory for per-session credential storage
    #[arg(long, env = "COURIER_DATA_DIR", default_value = ".courier_auth")]
    data_dir: PathBuf,

    /// Bridge program command line, shell-split
    #[arg(long, env = "COURIER_BRIDGE")]
    bridge: String,

    /// Directory for per-session transcripts
    #[arg(long, env = "COURIER_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Require `Authorization: Bearer <token>` on every request
    #[arg(long, env = "COURIER_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Largest accepted request body, in bytes
    #[arg(long, env = "COURIER_MAX_BODY_BYTES", default_value_t = courier_http::DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,
}

impl Args {
    fn bridge_config(&self) -> Result<BridgeConfig, String> {
        let mut config = BridgeConfig::from_command_line(&self.bridge, &self.data_dir)
            .map_err(|e| e.to_string())?;
        if let Some(dir) = &self.log_dir {
            config = config.log_dir(dir);
        }
        Ok(config)
    }

    fn shared_state(&self, controller: Arc<SessionController>) -> SharedState {
        SharedState::new(controller)
            .with_auth_token(self.auth_token.clone().filter(|t| !t.is_empty()))
            .with_max_body_bytes(self.max_body_bytes)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}

async fn run(args: Args) -> Result<(), String> {
    let factory = Arc::new(BridgeFactory::new(args.bridge_config()?));
    let controller = Arc::new(SessionController::new(factory));
    let state = Arc::new(args.shared_state(controller));

    if state.auth_token.is_some() {
        log::info!("Bearer token authentication enabled");
    }
    log::info!("Storing session data under {}", args.data_dir.display());

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

    courier_http::serve(listener, state, shutdown_signal())
        .await
        .map_err(|e| format!("Server error: {}", e))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
