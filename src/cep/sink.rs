//! Bus → index copiers for the CEP service: matched alerts into the daily
//! alert index, normalised events into the daily event-log index.

use chrono::Utc;
use rdkafka::message::Message;
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::indices;
use crate::kafka;
use crate::search::SearchClient;

/// Consume the alert topic and append every alert to today's alert index.
/// Malformed messages are dropped; index failures are logged and skipped
/// (alerts are redelivered by the engine on restart, not by us).
pub async fn run_alert_sink(cfg: &Config, search: SearchClient, clock: Clock) -> Result<()> {
    let group = format!("{}-alert-consumer", cfg.kafka_group_id);
    let consumer = kafka::consumer(&cfg.kafka_bootstrap, &group, &[&cfg.alert_topic])?;
    info!(topic = %cfg.alert_topic, "alert sink started");

    loop {
        match consumer.recv().await {
            Ok(msg) => {
                let Some(payload) = msg.payload() else { continue };
                let Ok(mut alert) = serde_json::from_slice::<Value>(payload) else {
                    continue;
                };
                if let Some(obj) = alert.as_object_mut() {
                    obj.entry("@timestamp")
                        .or_insert_with(|| Value::String(clock.rfc3339()));
                }
                let index = indices::daily_alerts_index(&cfg.index_prefix, &clock.today_index_day());
                let doc_id = Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string();
                if let Err(e) = search.put_doc(&index, &doc_id, &alert).await {
                    warn!("alert index write failed: {}", e);
                }
            }
            Err(e) => warn!("alert consumer error: {}", e),
        }
    }
}

/// Copy the normalised event stream into the daily event-log index so
/// baselines and aggregation recovery have history to work from.
pub async fn run_event_log_sink(cfg: &Config, search: SearchClient, clock: Clock) -> Result<()> {
    let group = format!("{}-log-sink", cfg.kafka_group_id);
    let topics = cfg.event_topics_list();
    let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
    let consumer = kafka::consumer(&cfg.kafka_bootstrap, &group, &topic_refs)?;
    info!(topics = ?topics, "event log sink started");

    loop {
        match consumer.recv().await {
            Ok(msg) => {
                let Some(payload) = msg.payload() else { continue };
                let Ok(mut event) = serde_json::from_slice::<Value>(payload) else {
                    continue;
                };
                if let Some(obj) = event.as_object_mut() {
                    obj.entry("@timestamp")
                        .or_insert_with(|| Value::String(clock.rfc3339()));
                }
                let index = indices::daily_logs_index(&cfg.index_prefix, &clock.today_index_day());
                if let Err(e) = search.post_doc(&index, &event).await {
                    warn!("event log write failed: {}", e);
                }
            }
            Err(e) => warn!("log sink consumer error: {}", e),
        }
    }
}
