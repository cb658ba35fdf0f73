use std::env;

/// Which service this process runs as. Mirrors the `cep` / `ueba` / `logsink`
/// subcommands; each gets its own consumer group and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Cep,
    Ueba,
    LogSink,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub opensearch_url: String,
    pub kafka_bootstrap: String,
    pub kafka_group_id: String,
    /// CSV of topics this service consumes. For `logsink` these are the raw
    /// per-message-kind topics; for `cep`/`ueba` it is the normalised topic.
    pub kafka_event_topics: String,
    pub transformed_topic: String,
    pub timezone: String,
    pub index_prefix: String,

    pub flink_sql_gateway: String,
    pub flink_rest_api: String,
    pub alert_topic: String,

    pub dashboard_url: String,
    pub health_warn_mb: f64,
    pub health_crit_mb: f64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn var_f64_or(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn var_port_or(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim_start_matches(':').parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env(service: Service) -> Self {
        let prefix = var_or("KAFKA_CONSUMER_GROUP_PREFIX", "siem");
        let transformed_topic = var_or("KAFKA_TRANSFORMED_TOPIC", "siem-events");
        let raw_topics = var_or(
            "KAFKA_EVENT_TOPICS",
            "MESSAGE_AGENT,MESSAGE_DEVICE,MESSAGE_NETWORK,MESSAGE_PROCESS,MESSAGE_PRINT,\
             MESSAGE_DRM,MESSAGE_CLIPBOARD,MESSAGE_CAPTURE,MESSAGE_PC",
        );

        let (port, group_id, event_topics) = match service {
            Service::LogSink => (0, format!("{prefix}-logsink"), raw_topics),
            Service::Cep => (
                var_port_or("CEP_PORT", 48084),
                format!("{prefix}-cep-sql"),
                transformed_topic.clone(),
            ),
            Service::Ueba => (
                var_port_or("UEBA_PORT", 48082),
                format!("{prefix}-ueba"),
                transformed_topic.clone(),
            ),
        };

        Config {
            port,
            opensearch_url: var_or("OPENSEARCH_URL", "http://localhost:9200"),
            kafka_bootstrap: var_or("KAFKA_BOOTSTRAP_SERVERS", "localhost:9092"),
            kafka_group_id: group_id,
            kafka_event_topics: event_topics,
            transformed_topic,
            timezone: var_or("TIMEZONE", "Asia/Seoul"),
            index_prefix: var_or("INDEX_PREFIX", "sec"),
            flink_sql_gateway: var_or("FLINK_SQL_GATEWAY", "http://localhost:8083"),
            flink_rest_api: var_or("FLINK_REST_API", "http://localhost:8081"),
            alert_topic: var_or("KAFKA_ALERT_TOPIC", "cep-alerts"),
            dashboard_url: var_or("DASHBOARD_URL", "http://localhost:8501"),
            health_warn_mb: var_f64_or("HEALTH_WARN_MB", 256.0),
            health_crit_mb: var_f64_or("HEALTH_CRIT_MB", 512.0),
        }
    }

    pub fn event_topics_list(&self) -> Vec<String> {
        self.kafka_event_topics
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}
