//! connect-auth - startup check and key provisioning for add-on deployments

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use connect_auth::{
    config::{Args, Command},
    hosts::InMemoryHostRepository,
    keys::{LocalKeyPair, DEFAULT_KEY_BITS},
    ConnectAuth,
};

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("connect_auth={},info", args.log_level).into());
    let (json_layer, text_layer) = if args.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    match args.command.clone().unwrap_or(Command::Check) {
        Command::Keygen => {
            let key_pair = LocalKeyPair::generate(DEFAULT_KEY_BITS)?;
            print!("{}", key_pair.public_pem());
            print!("{}", key_pair.private_pem());
        }
        Command::Check => {
            let state = match ConnectAuth::from_args(&args, Arc::new(InMemoryHostRepository::new())) {
                Ok(state) => state,
                Err(e) => {
                    error!("Configuration error: {}", e);
                    std::process::exit(1);
                }
            };

            info!("======================================");
            info!("  connect-auth");
            info!("======================================");
            info!("Add-on: {} ({})", state.addon_name, state.addon_key);
            info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
            info!("Session token expiry: {}s", args.token_expiry_secs);
            info!("Consumer info timeout: {}ms", args.consumer_info_timeout_ms);
            info!("======================================");
            info!("Configuration OK");
        }
    }

    Ok(())
}
