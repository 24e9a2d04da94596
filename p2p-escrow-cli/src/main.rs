//! P2P Escrow CLI Entry Point
//!
//! Drives an in-memory escrow node for local inspection.
//!
//! Configuration is loaded from an optional TOML file, then from
//! `P2P_ESCROW__*` environment variables (a `.env` file is honoured).
//!
//! Usage:
//!   p2p-escrow config        - Print the effective configuration
//!   p2p-escrow walkthrough   - Run one trade from advertisement to feedback
//!   p2p-escrow simulate      - Race concurrent trade requests against one advertisement

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use p2p_escrow::{
    models::{AdSide, DisputeOutcome},
    CreateAdRequest, EscrowNode, EscrowNodeConfig, OpenTradeRequest,
};
use rust_decimal::Decimal;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tracing::{info, Level};

const MAKER: &str = "maker";
const TAKER: &str = "taker";
const ASSET: &str = "USDT";
const PAYMENT_METHOD: &str = "sepa";

#[derive(Parser)]
#[command(name = "p2p-escrow")]
#[command(about = "Peer-to-peer trade escrow engine")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level regardless of the configured level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as JSON
    Config,

    /// Run one SELL advertisement through a full trade
    Walkthrough {
        /// Settle through a dispute instead of a seller confirmation
        #[arg(long)]
        dispute: bool,

        /// Quantity to trade
        #[arg(long, default_value = "2")]
        quantity: Decimal,
    },

    /// Fire concurrent trade requests at a single advertisement
    Simulate {
        /// Number of concurrent requests
        #[arg(short, long, default_value_t = 10)]
        requests: usize,

        /// Quantity each request asks for
        #[arg(short, long, default_value = "3")]
        quantity: Decimal,

        /// Quantity posted on the advertisement
        #[arg(long, default_value = "10")]
        ad_quantity: Decimal,

        /// Price per unit
        #[arg(long, default_value = "100")]
        price: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = EscrowNodeConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;

    init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Walkthrough { dispute, quantity } => {
            walkthrough(config, quantity, dispute).await?;
        }
        Commands::Simulate {
            requests,
            quantity,
            ad_quantity,
            price,
        } => {
            simulate(config, requests, quantity, ad_quantity, price).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &EscrowNodeConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config
            .log_level
            .parse::<Level>()
            .with_context(|| format!("Invalid log level {:?}", config.log_level))?
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn sell_ad(quantity: Decimal, price: Decimal) -> CreateAdRequest {
    CreateAdRequest {
        owner: MAKER.to_string(),
        side: AdSide::Sell,
        asset: ASSET.to_string(),
        fiat_currency: "EUR".to_string(),
        price,
        quantity,
        min_amount: None,
        max_amount: None,
        payment_methods: vec![PAYMENT_METHOD.into()],
        terms: Some("SEPA instant only".to_string()),
        auto_reply: Some("Hi, please pay within the time limit.".to_string()),
        time_limit_minutes: None,
    }
}

async fn walkthrough(config: EscrowNodeConfig, quantity: Decimal, dispute: bool) -> Result<()> {
    let (node, ledger) = EscrowNode::in_memory(config)?;
    ledger.deposit(MAKER, ASSET, Decimal::from(100)).await;
    node.spawn_sweeper().await;

    let mut request = sell_ad(Decimal::from(10), Decimal::from(100));
    request.min_amount = Some(Decimal::ONE);
    let ad = node.create_ad(request).await?;
    info!("Posted advertisement {}", ad.id);

    let trade = node
        .open_trade(OpenTradeRequest {
            ad_id: ad.id,
            requester: TAKER.to_string(),
            quantity,
            payment_method: PAYMENT_METHOD.into(),
            initial_message: Some("Hello, paying now.".to_string()),
        })
        .await?;
    node.mark_payment_sent(trade.id, TAKER).await?;

    let settled = if dispute {
        let raised = node
            .raise_dispute(trade.id, TAKER, "Paid but not released", vec![])
            .await?;
        node.resolve_dispute(
            raised.id,
            "arbitrator",
            DisputeOutcome::ReleaseToBuyer,
            Some("Bank statement confirms the transfer".to_string()),
        )
        .await?;
        node.get_trade(trade.id).await?
    } else {
        node.confirm_payment_received(trade.id, MAKER).await?
    };

    if !dispute {
        node.leave_feedback(trade.id, TAKER, 5, Some("Fast release".to_string()))
            .await?;
    }

    let report = serde_json::json!({
        "advertisement": node.get_ad(ad.id).await?,
        "trade": settled,
        "messages": node.list_messages(trade.id, TAKER, None).await?,
        "balances": {
            (MAKER): ledger.balance(MAKER, ASSET).await,
            (TAKER): ledger.balance(TAKER, ASSET).await,
        },
        "profiles": {
            (MAKER): node.trader_profile(MAKER).await,
            (TAKER): node.trader_profile(TAKER).await,
        },
        "health": node.health_check().await?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    node.shutdown().await?;
    Ok(())
}

async fn simulate(
    config: EscrowNodeConfig,
    requests: usize,
    quantity: Decimal,
    ad_quantity: Decimal,
    price: Decimal,
) -> Result<()> {
    let (node, ledger) = EscrowNode::in_memory(config)?;
    ledger.deposit(MAKER, ASSET, ad_quantity).await;

    let mut request = sell_ad(ad_quantity, price);
    request.min_amount = Some(quantity * price);
    let ad = node.create_ad(request).await?;

    let node = Arc::new(node);
    let handles: Vec<_> = (0..requests)
        .map(|i| {
            let node = node.clone();
            let request = OpenTradeRequest {
                ad_id: ad.id,
                requester: format!("{}-{}", TAKER, i),
                quantity,
                payment_method: PAYMENT_METHOD.into(),
                initial_message: None,
            };
            tokio::spawn(async move { node.open_trade(request).await })
        })
        .collect();

    let mut accepted = 0usize;
    let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
    for handle in handles {
        match handle.await? {
            Ok(_) => accepted += 1,
            Err(e) => *rejected.entry(format!("{:?}", e.kind())).or_default() += 1,
        }
    }

    let ad = node.get_ad(ad.id).await?;
    let report = serde_json::json!({
        "requests": requests,
        "accepted": accepted,
        "rejected": rejected,
        "reserved": ad.total_quantity - ad.remaining_quantity,
        "remaining": ad.remaining_quantity,
        "status": ad.status,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    node.shutdown().await?;
    Ok(())
}
