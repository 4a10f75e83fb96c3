use std::sync::Arc;

use clap::Parser;
use log::info;

use server::config::Config;
use server::provider::{SpotifyOauth, SpotifyProvider};
use server::registry::RoomRegistry;
use server::routes::{self, AppState};

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on; falls back to the PORT environment variable
    #[clap(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let config = Config::from_env();
    let port = args.port.unwrap_or(config.port);
    let addr = format!("{}:{}", args.host, port);

    let registry = Arc::new(RoomRegistry::new(config.room()));
    let state = AppState {
        oauth: Arc::new(SpotifyOauth::new(&config)),
        provider: Arc::new(SpotifyProvider::new()),
        registry,
        config: Arc::new(config),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Game server listening on {}", addr);

    axum::serve(listener, routes::router(state)).await?;

    Ok(())
}
