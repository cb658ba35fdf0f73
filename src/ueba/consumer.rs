//! Normalised-topic consumer feeding the scorer. Messages are applied in
//! arrival order; scoring is commutative within a day, so cross-partition
//! interleaving is harmless.

use std::sync::Arc;

use rdkafka::message::Message;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::kafka;

use super::scorer::Scorer;

pub async fn run(scorer: Arc<Scorer>, cfg: &Config) -> Result<()> {
    let topics = cfg.event_topics_list();
    if topics.is_empty() {
        warn!("no event topics configured, scorer consumer idle");
        return Ok(());
    }
    let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
    let consumer = kafka::consumer(&cfg.kafka_bootstrap, &cfg.kafka_group_id, &topic_refs)?;
    info!(topics = ?topics, group = %cfg.kafka_group_id, "scorer consumer started");

    loop {
        match consumer.recv().await {
            Ok(msg) => {
                if let Some(payload) = msg.payload() {
                    scorer.process_event(payload).await;
                }
            }
            Err(e) => warn!("consumer error: {}", e),
        }
    }
}
