use broker_link::{config, ConsumerOptions, Message, Outcome, PublishOptions, RabbitMQClient};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct DonationCreated {
    donation_id: String,
    amount_cents: u64,
    currency: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::load()?;
    let heartbeat = config.heartbeat_interval();

    let client = RabbitMQClient::with_lapin(config)?;
    client.connect().await?;

    client
        .register_consumer(
            "donations.created",
            |message: Message| async move {
                match message.json::<DonationCreated>() {
                    Ok(donation) => {
                        info!(
                            donation_id = %donation.donation_id,
                            amount_cents = donation.amount_cents,
                            retry_count = message.retry_count(),
                            "Received donation"
                        );
                        Outcome::Ack
                    }
                    Err(e) => Outcome::DeadLetter(format!("undecodable payload: {}", e)),
                }
            },
            ConsumerOptions::default().bind("donations", "created"),
        )
        .await?;

    let donation = DonationCreated {
        donation_id: uuid::Uuid::new_v4().to_string(),
        amount_cents: 2500,
        currency: "EUR".to_string(),
        timestamp: chrono::Utc::now(),
    };
    if let Err(e) = client
        .publish_json("donations", "created", &donation, &PublishOptions::default())
        .await
    {
        error!("Failed to publish sample donation: {}", e);
    }

    info!("Service running. Press Ctrl+C to exit.");
    let mut health = interval(heartbeat);
    loop {
        tokio::select! {
            _ = health.tick() => {
                if client.health_check().await {
                    info!(state = ?client.state(), "Broker healthy");
                } else {
                    warn!(state = ?client.state(), "Broker unhealthy");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    client.close().await?;
    Ok(())
}
