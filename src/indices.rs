//! Index-name helpers. Every index is `<prefix>-siem-<name>`; daily indices
//! append a `YYYY.MM.DD` suffix.

const SOLUTION: &str = "siem";

pub fn rules_index(prefix: &str) -> String {
    format!("{}-{}-common-rules", prefix, SOLUTION)
}

pub fn settings_index(prefix: &str) -> String {
    format!("{}-{}-common-settings", prefix, SOLUTION)
}

pub fn baselines_index(prefix: &str) -> String {
    format!("{}-{}-ueba-baselines", prefix, SOLUTION)
}

pub fn field_meta_index(prefix: &str) -> String {
    format!("{}-{}-common-field-meta", prefix, SOLUTION)
}

pub fn logs_index_pattern(prefix: &str) -> String {
    format!("{}-{}-event-logs-*", prefix, SOLUTION)
}

pub fn scores_index_pattern(prefix: &str) -> String {
    format!("{}-{}-ueba-scores-*", prefix, SOLUTION)
}

pub fn daily_logs_index(prefix: &str, day: &str) -> String {
    format!("{}-{}-event-logs-{}", prefix, SOLUTION, day)
}

pub fn daily_alerts_index(prefix: &str, day: &str) -> String {
    format!("{}-{}-cep-alerts-{}", prefix, SOLUTION, day)
}

pub fn daily_scores_index(prefix: &str, day: &str) -> String {
    format!("{}-{}-ueba-scores-{}", prefix, SOLUTION, day)
}
