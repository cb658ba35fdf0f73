//! Log sink: consumes the raw per-kind topics, normalises each event (CEF
//! label expansion, timestamp stamping), fans it out on the single
//! normalised topic and copies it into the daily event-log index.

use std::time::Duration;

use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::Value;
use tracing::{info, warn};

use crate::cef::expand_cef_labels;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::indices;
use crate::kafka;
use crate::search::SearchClient;

pub async fn run(cfg: &Config, search: SearchClient, clock: Clock) -> Result<()> {
    let topics = cfg.event_topics_list();
    let topic_refs: Vec<&str> = topics.iter().map(|s| s.as_str()).collect();
    let consumer = kafka::consumer(&cfg.kafka_bootstrap, &cfg.kafka_group_id, &topic_refs)?;
    let producer = kafka::producer(&cfg.kafka_bootstrap)?;

    info!(
        topics = topics.len(),
        out = %cfg.transformed_topic,
        "log sink started"
    );

    loop {
        match consumer.recv().await {
            Ok(msg) => {
                let Some(payload) = msg.payload() else { continue };
                process_message(payload, cfg, &producer, &search, &clock).await;
            }
            Err(e) => warn!("log sink consumer error: {}", e),
        }
    }
}

async fn process_message(
    payload: &[u8],
    cfg: &Config,
    producer: &FutureProducer,
    search: &SearchClient,
    clock: &Clock,
) {
    let Ok(mut event) = serde_json::from_slice::<Value>(payload) else {
        return;
    };
    let Some(obj) = event.as_object_mut() else {
        return;
    };
    obj.entry("@timestamp")
        .or_insert_with(|| Value::String(clock.rfc3339()));
    if let Some(ext) = obj.get_mut("cefExtensions").and_then(|e| e.as_object_mut()) {
        expand_cef_labels(ext);
    }

    let Ok(out) = serde_json::to_vec(&event) else {
        return;
    };

    let record: FutureRecord<'_, (), [u8]> = FutureRecord::to(&cfg.transformed_topic).payload(&out[..]);
    if let Err((e, _)) = producer.send(record, Duration::from_secs(10)).await {
        warn!("publish to {} failed: {}", cfg.transformed_topic, e);
    }

    let index = indices::daily_logs_index(&cfg.index_prefix, &clock.today_index_day());
    if let Err(e) = search.post_doc(&index, &event).await {
        warn!("event log write failed: {}", e);
    }
}
