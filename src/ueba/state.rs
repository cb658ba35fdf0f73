//! In-memory scoring state and the persisted document shapes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-user streaming state, exclusively owned by the scorer. Created on the
/// first event for a user (or reconstructed during recovery), cleared and
/// rolled at local midnight.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub risk_score: f64,
    pub rule_score: f64,
    pub rule_scores: HashMap<String, f64>,
    pub anomaly_score: f64,
    /// msgId → count for today; feeds the anomaly term.
    pub event_counts: HashMap<String, i64>,
    /// ruleName → aggregated value for today; feeds the rule term.
    pub event_values: HashMap<String, f64>,
    pub prev_score: f64,
    pub days_since_last: i64,
    pub cold_start: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(skip)]
    pub dirty: bool,
    /// ruleName → values seen today, for cardinality aggregation. Never
    /// persisted; recovery rebuilds counts from storage instead.
    #[serde(skip)]
    pub seen: HashMap<String, HashSet<String>>,
}

impl Default for UserState {
    fn default() -> Self {
        UserState {
            risk_score: 0.0,
            rule_score: 0.0,
            rule_scores: HashMap::new(),
            anomaly_score: 0.0,
            event_counts: HashMap::new(),
            event_values: HashMap::new(),
            prev_score: 0.0,
            days_since_last: 1,
            cold_start: false,
            last_updated: Utc::now(),
            dirty: false,
            seen: HashMap::new(),
        }
    }
}

impl UserState {
    pub fn seeded(prev_score: f64, days_since_last: i64) -> Self {
        UserState {
            prev_score,
            days_since_last,
            ..Default::default()
        }
    }

    /// Midnight roll: yesterday's risk becomes the decay base, all per-day
    /// aggregates reset.
    pub fn roll_over(&mut self) {
        self.prev_score = self.risk_score;
        self.days_since_last = 1;
        self.rule_score = 0.0;
        self.anomaly_score = 0.0;
        self.rule_scores.clear();
        self.event_counts.clear();
        self.event_values.clear();
        self.seen.clear();
        self.dirty = true;
    }
}

/// Historical mean/σ of daily counts for one (user, msgId) pair, keyed
/// `userId_msgId` in the baseline index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Baseline {
    pub mean: f64,
    pub stddev: f64,
    #[serde(rename = "sampleDays")]
    pub sample_days: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub z_threshold: f64,
    pub beta: f64,
    pub sigma_floor: f64,
    pub cold_start_min_days: i64,
    pub baseline_window_days: i64,
    pub frequency_function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub lambda: f64,
    pub weekend_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub green_max: f64,
    pub yellow_max: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub anomaly: AnomalyConfig,
    pub decay: DecayConfig,
    pub tiers: TierConfig,
}

impl Default for DecayConfig {
    fn default() -> Self {
        DecayConfig {
            lambda: 0.9,
            weekend_mode: String::new(),
        }
    }
}

impl Default for TierConfig {
    fn default() -> Self {
        TierConfig {
            green_max: 40.0,
            yellow_max: 99.0,
        }
    }
}

impl ScoringConfig {
    pub fn defaults() -> Self {
        ScoringConfig {
            anomaly: AnomalyConfig {
                z_threshold: 2.0,
                beta: 10.0,
                sigma_floor: 0.5,
                cold_start_min_days: 7,
                baseline_window_days: 7,
                frequency_function: "log".to_string(),
            },
            decay: DecayConfig::default(),
            tiers: TierConfig::default(),
        }
    }
}

pub fn classify_risk(score: f64, cfg: &ScoringConfig) -> &'static str {
    if score > cfg.tiers.yellow_max {
        "HIGH"
    } else if score > cfg.tiers.green_max {
        "MEDIUM"
    } else {
        "LOW"
    }
}

/// ln(1+x) by default; log2/log10/linear as configured.
pub fn frequency(value: f64, mode: &str) -> f64 {
    match mode {
        "log2" => (1.0 + value).log2(),
        "log10" => (1.0 + value).log10(),
        "linear" => value,
        _ => value.ln_1p(),
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// One hourly snapshot of a user's risk state, appended to the daily score
/// index under `<userId>_<HH>`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreDoc {
    pub user_id: String,
    pub risk_score: f64,
    pub risk_level: String,
    pub status: String,
    pub rule_score: f64,
    pub rule_scores: HashMap<String, f64>,
    pub anomaly_score: f64,
    pub daily_score: f64,
    pub decayed_prev: f64,
    pub prev_score: f64,
    pub event_counts: HashMap<String, i64>,
    pub event_values: HashMap<String, f64>,
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_boundaries() {
        let cfg = ScoringConfig::defaults();
        assert_eq!(classify_risk(0.0, &cfg), "LOW");
        assert_eq!(classify_risk(40.0, &cfg), "LOW");
        assert_eq!(classify_risk(40.01, &cfg), "MEDIUM");
        assert_eq!(classify_risk(99.0, &cfg), "MEDIUM");
        assert_eq!(classify_risk(99.01, &cfg), "HIGH");
    }

    #[test]
    fn frequency_modes() {
        assert!((frequency(3.0, "log") - 4.0f64.ln()).abs() < 1e-12);
        assert!((frequency(3.0, "log2") - 2.0).abs() < 1e-12);
        assert!((frequency(9.0, "log10") - 1.0).abs() < 1e-12);
        assert_eq!(frequency(7.0, "linear"), 7.0);
    }

    #[test]
    fn roll_over_resets_day() {
        let mut st = UserState::seeded(10.0, 3);
        st.risk_score = 25.5;
        st.event_counts.insert("M".into(), 4);
        st.event_values.insert("r".into(), 2.0);
        st.seen.entry("r".into()).or_default().insert("x".into());
        st.roll_over();
        assert_eq!(st.prev_score, 25.5);
        assert_eq!(st.days_since_last, 1);
        assert!(st.event_counts.is_empty());
        assert!(st.event_values.is_empty());
        assert!(st.seen.is_empty());
        assert!(st.dirty);
    }
}
