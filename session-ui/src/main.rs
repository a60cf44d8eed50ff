//! Session snapshot server - read-only view of replayed envelope logs.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use clap::Parser;
use session::io::config::{DEFAULT_CONFIG_PATH, load_config};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "session-ui")]
#[command(about = "Read-only snapshot server for iteration envelope logs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Directory containing `<iteration_id>/envelopes.jsonl` logs
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Session config (TOML); missing file means defaults
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("session_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let dir = args.dir.canonicalize().unwrap_or(args.dir);
    let options = load_config(&args.config)?.session_options();
    info!(dir = %dir.display(), "starting session-ui");

    let state = AppState::new(dir, options);

    sse::start_file_watcher(state.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dir_and_port() {
        let args = Args::parse_from(["session-ui", "--dir", "logs", "--port", "4000"]);
        assert_eq!(args.dir, PathBuf::from("logs"));
        assert_eq!(args.port, 4000);
        assert_eq!(args.bind, "127.0.0.1");
    }
}
