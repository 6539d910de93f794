use chrono::Utc;
use clap::Parser;
use log::info;
use server::RelayServer;
use shared::ReplayRecorder;
use std::path::PathBuf;

/// Main-method of the relay.
/// Parses command-line arguments, binds the listener and relays until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "1234")]
        port: u16,
        /// Maximum number of connected clients
        #[clap(short, long, default_value = "16")]
        max_clients: usize,
        /// Record all relayed traffic into a replay in this directory
        #[clap(short, long)]
        record_dir: Option<PathBuf>,
    }

    let args = Args::parse();

    let address = format!("{}:{}", args.host, args.port);
    let mut relay = RelayServer::bind(&address, args.max_clients).await?;

    if let Some(dir) = args.record_dir {
        let name = format!("relay-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        info!("Recording replay into {}", dir.display());
        relay = relay.with_recorder(ReplayRecorder::new(dir, name));
    }

    relay
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    Ok(())
}
