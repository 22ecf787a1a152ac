//! Sale event consumer
//!
//! Reads completed sales from Kafka and hands them to the orchestrator,
//! which marks the affected rankings dirty and schedules a deferred
//! recompute. Other event types on the topic are skipped.

use crate::config::KafkaConfig;
use crate::error::{Error, Result};
use crate::ranking::orchestrator::RecomputeOrchestrator;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

const SALE_COMPLETED: &[&str] = &["sale_completed", "SaleCompleted"];

/// A completed marketplace sale
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaleEvent {
    pub artwork_id: i64,
    pub amount: f64,
    pub buyer_id: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event_type: String,
}

/// Decode a message payload; `None` for event types other than completed sales
pub fn parse_sale_event(payload: &[u8]) -> Result<Option<SaleEvent>> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    if !SALE_COMPLETED.contains(&envelope.event_type.as_str()) {
        debug!("Skipping {} event", envelope.event_type);
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(payload)?))
}

/// Consumes the sales topic until shutdown
pub struct EventProcessor {
    consumer: StreamConsumer,
    orchestrator: RecomputeOrchestrator,
    shutdown: broadcast::Receiver<()>,
}

impl EventProcessor {
    pub fn new(
        config: &KafkaConfig,
        orchestrator: RecomputeOrchestrator,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.group_id)
            .set("bootstrap.servers", &config.brokers)
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                config.session_timeout.as_millis().to_string(),
            )
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .create()
            .map_err(|e| Error::kafka(format!("Failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[config.sales_topic.as_str()])
            .map_err(|e| Error::kafka(format!("Failed to subscribe: {}", e)))?;

        Ok(Self {
            consumer,
            orchestrator,
            shutdown,
        })
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        info!("🎯 Starting sale event consumer");

        loop {
            tokio::select! {
                message = self.consumer.recv() => {
                    match message {
                        Ok(msg) => {
                            if let Err(e) = self.process_message(&msg).await {
                                error!(
                                    "Failed to process sale event at {}:{}: {}",
                                    msg.partition(),
                                    msg.offset(),
                                    e
                                );
                            }
                        }
                        Err(e) => {
                            error!("Kafka consumer error: {:?}", e);
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Sale event consumer shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<()> {
        let Some(payload) = message.payload() else {
            warn!("Empty payload at offset {}", message.offset());
            return Ok(());
        };

        if let Some(sale) = parse_sale_event(payload)? {
            self.orchestrator
                .on_sale_completed(sale.artwork_id, sale.amount, sale.buyer_id)
                .await?;
        }
        Ok(())
    }
}

/// Spawn the consumer; a setup failure is logged and ends the task
pub fn spawn_event_processor(
    config: KafkaConfig,
    orchestrator: RecomputeOrchestrator,
    shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let processor = match EventProcessor::new(&config, orchestrator, shutdown_rx) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to create sale event consumer: {}", e);
                return;
            }
        };

        if let Err(e) = processor.run().await {
            error!("Sale event consumer failed: {}", e);
        }
    })
}
