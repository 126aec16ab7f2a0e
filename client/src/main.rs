use clap::Parser;
use client::network::{ClientOptions, RoundClient};
use log::info;
use shared::DEFAULT_TOPIC;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8080")]
    server: String,

    /// Origin header to present, as a browser would
    #[arg(short = 'o', long)]
    origin: Option<String>,

    /// Bearer token identifying a player or an admin
    #[arg(short = 't', long)]
    token: Option<String>,

    /// Round topic to follow
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Place one bet of this amount per round on a random outcome
    #[arg(long)]
    auto_bet: Option<u64>,

    /// Outcomes to pick from when auto-betting
    #[arg(long, value_delimiter = ',', default_value = "red,green,violet,blue")]
    outcomes: Vec<String>,

    /// Admin only: submit this outcome as soon as the override window opens
    #[arg(long)]
    select: Option<String>,

    /// Length of the server's override window in milliseconds
    #[arg(long, default_value = "10000")]
    override_window_ms: u64,

    /// Use binary frames instead of JSON
    #[arg(short = 'b', long)]
    binary: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    info!("Connecting to: {}", args.server);
    if let Some(amount) = args.auto_bet {
        info!("Auto-betting {} per round", amount);
    }
    if let Some(outcome) = &args.select {
        info!("Will select {} in every override window", outcome);
    }

    let options = ClientOptions {
        server: args.server,
        origin: args.origin,
        token: args.token,
        topic: args.topic,
        auto_bet: args.auto_bet,
        outcomes: args.outcomes,
        select: args.select,
        override_window_ms: args.override_window_ms,
        binary: args.binary,
    };

    let mut client = RoundClient::connect(options).await?;
    client.run().await?;

    Ok(())
}
