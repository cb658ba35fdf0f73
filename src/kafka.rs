use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::FutureProducer;

use crate::error::{EngineError, Result};

/// Consumer tuned the way every service here reads the bus: newest offsets
/// (replays are reconstructed from storage, not from the log), auto-commit on.
pub fn consumer(bootstrap: &str, group_id: &str, topics: &[&str]) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", bootstrap)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "30000")
        .set("auto.offset.reset", "latest")
        .create()
        .map_err(|e| EngineError::kafka(format!("consumer create failed: {}", e)))?;

    consumer
        .subscribe(topics)
        .map_err(|e| EngineError::kafka(format!("subscribe {:?} failed: {}", topics, e)))?;
    Ok(consumer)
}

pub fn producer(bootstrap: &str) -> Result<FutureProducer> {
    ClientConfig::new()
        .set("bootstrap.servers", bootstrap)
        .set("message.timeout.ms", "10000")
        .create()
        .map_err(|e| EngineError::kafka(format!("producer create failed: {}", e)))
}
