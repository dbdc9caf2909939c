//! Telebridge MCP server entry point
//!
//! Loads configuration from the environment, assembles the runtime, and
//! serves the tool surface over stdio until the client disconnects or the
//! process receives an interrupt. Exit codes: 0 normal, 1 fatal
//! initialization failure, 2 configuration error.

use std::process::ExitCode;
use telebridge::config::Config;
use telebridge::observability::init_subscriber;
use telebridge::runtime::CoreRuntime;
use telebridge::server::serve_stdio;
use telebridge::time_provider::production_time_provider;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(2);
        }
    };

    if let Err(err) = init_subscriber(&config.log) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::from(1);
    }
    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        events_dir = %config.events_dir.display(),
        "starting telebridge"
    );

    let mut runtime = match CoreRuntime::build(config, production_time_provider()) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "runtime initialization failed");
            return ExitCode::from(1);
        }
    };
    runtime.start_background();

    let shutdown = runtime.shutdown_token();
    let dispatcher = std::sync::Arc::clone(&runtime.dispatcher);
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    serve_stdio(dispatcher, shutdown).await;
    runtime.shutdown().await;
    ExitCode::SUCCESS
}
