use clap::Parser;
use tracing::{error, info};

use carousel::cli::{Cli, Commands};
use carousel::{config::Config, reaper, server};

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Some(Commands::Probe { url, mode, timeout }) = cli.command {
        if let Err(e) = carousel::cli::run_probe(url, mode, timeout).await {
            error!("probe error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    info!(
        port = config.port,
        wait_timeout_seconds = config.wait_timeout_seconds,
        reap_interval_seconds = config.reap_interval_seconds,
        match_policy = ?config.match_policy,
        "starting carousel"
    );

    // The binary runs engine-less: media flows peer-to-peer or through an
    // externally deployed SFU; embedders attach one via the library API.
    let state = match server::build_state(config.clone(), None).await {
        Ok(state) => state,
        Err(e) => {
            error!("failed to initialize server state: {e}");
            std::process::exit(1);
        }
    };

    reaper::spawn(state.clone());

    let app = server::app(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    info!("carousel listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(server::shutdown_signal(state))
        .await
        .expect("server error");
}
