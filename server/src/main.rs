use clap::Parser;
use log::{error, info};
use server::config::DefaultPolicyKind;
use server::{EngineConfig, InMemoryLedger, MonotonicClock, Server, StaticAuthenticator};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file; every missing value falls back to its default
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short = 'b', long)]
    bind: Option<String>,

    /// Default result policy when no admin selection is frozen
    #[arg(short = 'p', long, value_parser = parse_policy)]
    policy: Option<DefaultPolicyKind>,

    /// Seed for the default policy's random source
    #[arg(long)]
    seed: Option<u64>,

    /// Extra allowed browser origin, may be repeated
    #[arg(long = "allow-origin")]
    allow_origins: Vec<String>,
}

fn parse_policy(value: &str) -> Result<DefaultPolicyKind, String> {
    match value {
        "uniform_random" => Ok(DefaultPolicyKind::UniformRandom),
        "least_wagered" => Ok(DefaultPolicyKind::LeastWagered),
        other => Err(format!(
            "unknown policy '{}', expected uniform_random or least_wagered",
            other
        )),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            EngineConfig::load(path)?
        }
        None => EngineConfig::default(),
    };

    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(policy) = args.policy {
        config.resolver.default_policy = policy;
    }
    if args.seed.is_some() {
        config.resolver.seed = args.seed;
    }
    config.gateway.allowed_origins.extend(args.allow_origins);

    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }

    info!(
        "Round of {}ms ({}ms betting, {}ms lock, {}ms result), outcomes {:?}",
        config.schedule.round_length_ms(),
        config.schedule.betting_ms,
        config.schedule.lock_ms,
        config.schedule.result_ms,
        config.outcomes
    );
    info!(
        "Default policy {:?}, {} admin tokens",
        config.resolver.default_policy,
        config.admin_tokens.len()
    );

    let ledger = Arc::new(InMemoryLedger::new(config.ledger.starting_balance));
    let authenticator = Arc::new(StaticAuthenticator::new(config.admin_tokens.clone()));
    let server = Server::bind(config, Arc::new(MonotonicClock::new()), ledger, authenticator).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    Ok(())
}
