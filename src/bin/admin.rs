//! Admin CLI offering offline sanity-check subcommands against an
//! in-process `Gateway` over the in-memory repository, for local
//! experimentation without a running server.

use base64::Engine;
use clap::{Parser, Subcommand};
use rand::RngCore;
use relay_gateway::auth::hash_credential;
use relay_gateway::models::{Capabilities, Channel, ModelPrice, PricingMode};
use relay_gateway::repository::InMemoryRepository;
use relay_gateway::{Gateway, GatewayConfig};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "admin", about = "Relay gateway administration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a channel in a fresh in-process demo gateway and print the
    /// catalog back out, to sanity-check a channel definition offline.
    Channel {
        id: String,
        provider: String,
        base_url: String,
        #[arg(long, value_delimiter = ',')]
        models: Vec<String>,
        #[arg(long, default_value_t = 1)]
        weight: i32,
    },
    /// Evaluate a price for a given usage shape against a demo pricing
    /// table, useful for sanity-checking a price change before pushing it.
    Price {
        model: String,
        #[arg(long, default_value = "default")]
        group: String,
        #[arg(long)]
        input_price_per_1k: f64,
        #[arg(long)]
        output_price_per_1k: f64,
        #[arg(long)]
        prompt_tokens: u32,
        #[arg(long)]
        completion_tokens: u32,
    },
    /// Print the resolved configuration tree (file + env overlay) and exit.
    ShowConfig {
        #[arg(long)]
        file: Option<String>,
    },
    /// Generate a new opaque API key and print both the raw key (hand it
    /// to the caller once) and its SHA-256 hash (the value to store in
    /// `Token.hash` via `PUT /api/admin/tokens`).
    NewToken,
    /// Register a channel in a fresh in-process demo gateway, then disable
    /// it, printing the resulting status. Against a running server, use
    /// `POST /api/admin/channels/:id/disable` instead.
    DisableChannel {
        id: String,
        provider: String,
        base_url: String,
    },
    /// Register a channel, drive it to Unavailable via repeated failures,
    /// then recover it and print the resulting status. Against a running
    /// server, use `POST /api/admin/channels/:id/recover` instead.
    RecoverChannel {
        id: String,
        provider: String,
        base_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Channel { id, provider, base_url, models, weight } => {
            let repo = Arc::new(InMemoryRepository::new());
            let gateway = Gateway::new(GatewayConfig::default(), repo);
            let mut channel = Channel::new(&id, &id, &provider, &base_url);
            channel.models = models;
            channel.weight = weight;
            channel.capabilities = Capabilities { streaming: true, function_calling: true, vision: false };
            gateway.channels.upsert(channel).await;
            let registered = gateway.channels.get(&id).await?;
            let ch = registered.read().await;
            println!("registered channel {} ({}) for models {:?}", ch.id, ch.provider, ch.models);
        }
        Command::Price { model, group, input_price_per_1k, output_price_per_1k, prompt_tokens, completion_tokens } => {
            let price = ModelPrice {
                model,
                group,
                input_price_per_1k,
                output_price_per_1k,
                min_price: None,
                pricing_mode: PricingMode::ByToken,
                group_multiplier: 1.0,
                version: 1,
            };
            let usage = relay_gateway::models::Usage { prompt_tokens, completion_tokens, total_tokens: prompt_tokens + completion_tokens };
            let charge = relay_gateway::billing::pricing::evaluate(&price, &usage);
            println!("estimated charge: {charge:.6}");
        }
        Command::ShowConfig { file } => {
            let config = GatewayConfig::load(file.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::NewToken => {
            let mut raw_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut raw_bytes);
            let raw = format!("sk-{}", base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw_bytes));
            println!("raw key (give to the caller, not stored anywhere): {raw}");
            println!("hash (store as Token.hash):                        {}", hash_credential(&raw));
        }
        Command::DisableChannel { id, provider, base_url } => {
            let repo = Arc::new(InMemoryRepository::new());
            let gateway = Gateway::new(GatewayConfig::default(), repo);
            gateway.channels.upsert(Channel::new(&id, &id, &provider, &base_url)).await;
            let slot = gateway.channels.get(&id).await?;
            slot.write().await.disable();
            println!("channel {id} status: {:?}", slot.read().await.status);
        }
        Command::RecoverChannel { id, provider, base_url } => {
            let repo = Arc::new(InMemoryRepository::new());
            let gateway = Gateway::new(GatewayConfig::default(), repo);
            gateway.channels.upsert(Channel::new(&id, &id, &provider, &base_url)).await;
            let slot = gateway.channels.get(&id).await?;
            {
                let mut ch = slot.write().await;
                for _ in 0..10 {
                    ch.record_failure(0);
                }
            }
            slot.write().await.recover();
            println!("channel {id} status: {:?}", slot.read().await.status);
        }
    }

    Ok(())
}
