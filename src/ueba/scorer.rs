//! Online per-user risk scoring. Single logical owner of all per-user state,
//! mutated from the live event consumer and the periodic maintenance tasks
//! (midnight roll, baseline refresh, batch save).
//!
//! Score model, per user u on day d:
//!
//!   riskScore(u,d) = prevScore · λ^effectiveDays + ruleScore(u,d) + anomalyScore(u,d)
//!   ruleScore      = Σ over enabled rules  weight · f(aggregatedValue)
//!   anomalyScore   = Σ over msgIds         β · max(0, z − z*)
//!
//! Cold-start users (no prior score, not enough baseline history) are pinned
//! to zero until their baselines mature.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::indices;
use crate::rules::eval::{aggregation_delta, match_event, AggDelta};
use crate::rules::store::{RuleFilter, RuleStore};
use crate::rules::Rule;
use crate::search::SearchClient;

use super::state::{
    classify_risk, frequency, round2, Baseline, ScoreDoc, ScoringConfig, UserState,
};

pub struct Scorer {
    pub(crate) cfg: Config,
    pub(crate) clock: Clock,
    pub(crate) search: SearchClient,
    pub(crate) store: RuleStore,
    dashboard: reqwest::Client,

    pub(crate) scoring_cfg: RwLock<Option<Arc<ScoringConfig>>>,
    pub(crate) rules: RwLock<Option<Arc<Vec<Rule>>>>,
    pub(crate) states: RwLock<HashMap<String, UserState>>,
    pub(crate) baselines: RwLock<HashMap<String, Baseline>>,
    pub(crate) current_date: Mutex<String>,
}

impl Scorer {
    pub fn new(cfg: Config, clock: Clock, search: SearchClient, store: RuleStore) -> Self {
        Scorer {
            cfg,
            clock,
            search,
            store,
            dashboard: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            scoring_cfg: RwLock::new(None),
            rules: RwLock::new(None),
            states: RwLock::new(HashMap::new()),
            baselines: RwLock::new(HashMap::new()),
            current_date: Mutex::new(String::new()),
        }
    }

    /// Startup: caches, baselines, then aggregation-based state recovery.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        info!("scorer initializing");
        self.load_scoring_config().await;
        self.load_rules().await;
        self.load_all_baselines().await;
        self.ensure_baselines_fresh().await;
        *self.current_date.lock().await = self.clock.today();
        self.recover_today_state().await?;
        info!("scorer initialized");
        Ok(())
    }

    // ── caches ──

    /// Scoring parameters from the settings document; defaults when absent.
    pub async fn load_scoring_config(&self) -> Arc<ScoringConfig> {
        if let Some(cfg) = self.scoring_cfg.read().await.as_ref() {
            return cfg.clone();
        }
        let mut loaded = ScoringConfig::defaults();
        let index = indices::settings_index(&self.cfg.index_prefix);
        if let Ok(Some(doc)) = self.search.get_doc(&index, "settings").await {
            if let Ok(parsed) = serde_json::from_value::<ScoringConfig>(doc) {
                loaded = parsed;
            }
        }
        let arc = Arc::new(loaded);
        *self.scoring_cfg.write().await = Some(arc.clone());
        arc
    }

    /// Enabled UEBA rules; cached until the next reload.
    pub async fn load_rules(&self) -> Arc<Vec<Rule>> {
        if let Some(rules) = self.rules.read().await.as_ref() {
            return rules.clone();
        }
        let loaded = match self.store.list(RuleFilter::UebaActive).await {
            Ok(rules) => {
                info!("loaded {} UEBA rules", rules.len());
                rules
            }
            Err(e) => {
                warn!("rule load failed: {}", e);
                Vec::new()
            }
        };
        let arc = Arc::new(loaded);
        *self.rules.write().await = Some(arc.clone());
        arc
    }

    pub async fn reload_cache(&self) {
        *self.scoring_cfg.write().await = None;
        *self.rules.write().await = None;
        self.load_scoring_config().await;
        self.load_rules().await;
    }

    pub async fn load_all_baselines(&self) {
        let index = indices::baselines_index(&self.cfg.index_prefix);
        let body = json!({ "size": 10000, "query": { "match_all": {} } });
        let result = match self.search.search_raw(&index, &body).await {
            Ok(r) => r,
            Err(e) => {
                warn!("baseline load failed: {}", e);
                return;
            }
        };
        let mut map = self.baselines.write().await;
        map.clear();
        if let Some(hits) = result["hits"]["hits"].as_array() {
            for hit in hits {
                let (Some(id), Some(src)) = (hit["_id"].as_str(), hit.get("_source")) else {
                    continue;
                };
                if let Ok(bl) = serde_json::from_value::<Baseline>(src.clone()) {
                    map.insert(id.to_string(), bl);
                }
            }
        }
        info!("loaded {} baselines", map.len());
    }

    // ── event path ──

    /// Consume one raw bus message. Malformed JSON and events without a user
    /// or msgId are dropped silently.
    pub async fn process_event(self: &Arc<Self>, payload: &[u8]) {
        let Ok(event) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        let user_id = event
            .get("userId")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                event
                    .get("cefExtensions")
                    .and_then(|e| e.get("suid"))
                    .and_then(|v| v.as_str())
            })
            .unwrap_or("")
            .to_string();
        if user_id.is_empty() {
            return;
        }
        let Some(msg_id) = event.get("msgId").and_then(|v| v.as_str()).map(String::from) else {
            return;
        };
        if msg_id.is_empty() {
            return;
        }

        self.check_rollover().await;

        let rules = self.load_rules().await;

        // Evaluate lock-free, apply under the state guard.
        let mut deltas: Vec<(&Rule, AggDelta)> = Vec::new();
        for rule in rules.iter() {
            if !rule.enabled || !match_event(&event, rule, &self.clock) {
                continue;
            }
            deltas.push((rule, aggregation_delta(&event, rule, &self.clock)));
        }

        // Seed prevScore before taking the write guard; the fetch goes to
        // the network.
        let needs_seed = !self.states.read().await.contains_key(&user_id);
        let seed = if needs_seed {
            Some(self.prev_score(&user_id).await)
        } else {
            None
        };

        let matched = !deltas.is_empty();
        {
            let mut states = self.states.write().await;
            let state = states.entry(user_id.clone()).or_insert_with(|| {
                let (prev, days) = seed.unwrap_or((0.0, 1));
                UserState::seeded(prev, days)
            });

            *state.event_counts.entry(msg_id.clone()).or_insert(0) += 1;

            for (rule, delta) in deltas {
                let entry = state.event_values.entry(rule.name.clone()).or_insert(0.0);
                match delta {
                    AggDelta::Count => *entry += 1.0,
                    AggDelta::Sum(v) => *entry += v,
                    AggDelta::Cardinality(value) => {
                        if state.seen.entry(rule.name.clone()).or_default().insert(value) {
                            *entry += 1.0;
                        }
                    }
                }
            }
            state.last_updated = Utc::now();
            state.dirty = true;
        }

        self.recompute_score(&user_id).await;

        if matched {
            let score = self
                .states
                .read()
                .await
                .get(&user_id)
                .map(|s| s.risk_score)
                .unwrap_or(0.0);
            debug!(user = %user_id, msg = %msg_id, score, "rule match");
        }
        self.push_dashboard(&user_id).await;
    }

    /// Most recent pre-today score document for a user: (score, days since).
    pub(crate) async fn prev_score(&self, user_id: &str) -> (f64, i64) {
        let index = indices::scores_index_pattern(&self.cfg.index_prefix);
        let body = json!({
            "size": 1,
            "sort": [ { "@timestamp": "desc" } ],
            "query": { "bool": { "must": [
                { "term": { "userId": user_id } },
                { "range": { "@timestamp": { "lt": self.clock.today(),
                    "time_zone": crate::clock::offset_string(self.clock.offset()) } } },
            ]}},
            "_source": ["riskScore", "@timestamp"],
        });
        let Ok(result) = self.search.search_raw(&index, &body).await else {
            return (0.0, 1);
        };
        let Some(hit) = result["hits"]["hits"].as_array().and_then(|h| h.first()) else {
            return (0.0, 1);
        };
        let score = hit["_source"]["riskScore"].as_f64().unwrap_or(0.0);
        if score <= 0.0 {
            return (0.0, 1);
        }
        let days = hit["_source"]["@timestamp"]
            .as_str()
            .map(|ts| self.clock.days_since(ts))
            .unwrap_or(1);
        (score, days)
    }

    // ── score computation ──

    pub(crate) fn effective_days(&self, days: i64, mode: &str) -> i64 {
        let days = days.max(1);
        if mode != "skip" || days <= 1 {
            return days;
        }
        self.clock.weekdays_in_gap(days)
    }

    /// Recompute one user's score from their per-day aggregates. Runs outside
    /// the event hot-path guard: snapshot, compute, write back.
    pub async fn recompute_score(&self, user_id: &str) {
        let cfg = self.load_scoring_config().await;
        let rules = self.load_rules().await;

        let Some((event_values, event_counts, prev_score, days_since_last)) =
            self.states.read().await.get(user_id).map(|s| {
                (
                    s.event_values.clone(),
                    s.event_counts.clone(),
                    s.prev_score,
                    s.days_since_last,
                )
            })
        else {
            return;
        };

        let mut rule_score = 0.0;
        let mut rule_scores = HashMap::new();
        for rule in rules.iter().filter(|r| r.enabled) {
            let value = event_values.get(&rule.name).copied().unwrap_or(0.0);
            if value > 0.0 {
                let s = rule.weight * frequency(value, &cfg.anomaly.frequency_function);
                rule_score += s;
                rule_scores.insert(rule.name.clone(), round2(s));
            }
        }

        // Anomaly only counts msgIds covered by at least one enabled rule;
        // other surges are logged and ignored.
        let rule_msg_ids: std::collections::HashSet<&str> = rules
            .iter()
            .filter(|r| r.enabled)
            .filter_map(|r| r.match_.as_ref())
            .map(|m| m.msg_id.as_str())
            .collect();

        let mut anomaly_score = 0.0;
        {
            let baselines = self.baselines.read().await;
            for (msg_id, count) in &event_counts {
                let Some(bl) = baselines.get(&format!("{}_{}", user_id, msg_id)) else {
                    continue;
                };
                if bl.sample_days < cfg.anomaly.cold_start_min_days {
                    continue;
                }
                let stddev = bl.stddev.max(cfg.anomaly.sigma_floor);
                let z = (*count as f64 - bl.mean) / stddev;
                if z > cfg.anomaly.z_threshold {
                    let excess = cfg.anomaly.beta * (z - cfg.anomaly.z_threshold);
                    if rule_msg_ids.contains(msg_id.as_str()) {
                        anomaly_score += excess;
                    } else {
                        info!(user = %user_id, msg = %msg_id, count, z, "surge outside rule coverage");
                    }
                }
            }
        }

        let cold_start = prev_score <= 0.0
            && self.max_baseline_days(user_id).await < cfg.anomaly.cold_start_min_days;

        let risk_score = if cold_start {
            0.0
        } else {
            let days = self.effective_days(days_since_last, &cfg.decay.weekend_mode);
            let decayed = prev_score * cfg.decay.lambda.powi(days as i32);
            round2(decayed + rule_score + anomaly_score)
        };

        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(user_id) {
            state.rule_score = round2(rule_score);
            state.rule_scores = rule_scores;
            state.anomaly_score = round2(anomaly_score);
            state.cold_start = cold_start;
            state.risk_score = risk_score;
        }
    }

    async fn max_baseline_days(&self, user_id: &str) -> i64 {
        let prefix = format!("{}_", user_id);
        self.baselines
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, bl)| bl.sample_days)
            .max()
            .unwrap_or(0)
    }

    pub(crate) async fn has_baseline(&self, user_id: &str) -> bool {
        let prefix = format!("{}_", user_id);
        self.baselines
            .read()
            .await
            .keys()
            .any(|k| k.starts_with(&prefix))
    }

    // ── midnight rollover ──

    /// Checked on every event and on a timer; serialised on the date mutex.
    pub async fn check_rollover(self: &Arc<Self>) {
        let today = self.clock.today();
        let mut current = self.current_date.lock().await;
        if *current == today {
            return;
        }
        let previous = current.clone();
        info!(from = %previous, to = %today, "date rollover");

        // Flush the day that just ended into its own index.
        self.save_scores_for_day(&previous.replace('-', ".")).await;

        *current = today;
        drop(current);

        {
            let mut states = self.states.write().await;
            for state in states.values_mut() {
                state.roll_over();
            }
        }

        let scorer = self.clone();
        tokio::spawn(async move {
            scorer.update_baselines().await;
            scorer.mark_baselines_fresh().await;
        });
    }

    // ── persistence ──

    pub async fn save_scores_batch(&self) {
        self.save_scores_for_day(&self.clock.today_index_day()).await;
    }

    /// Write every dirty state as an hourly score document into the given
    /// day's index. Dirty bits are only cleared for states untouched since
    /// the snapshot; a failed bulk leaves everything dirty for the next tick.
    pub async fn save_scores_for_day(&self, day: &str) {
        let cfg = self.load_scoring_config().await;
        let index = indices::daily_scores_index(&self.cfg.index_prefix, day);
        let hour = self.clock.hour_label();
        let snapshot_at = Utc::now();
        let baseline_keys: Vec<String> = self.baselines.read().await.keys().cloned().collect();

        let mut bulk = String::new();
        let mut saved = Vec::new();
        {
            let states = self.states.read().await;
            for (user_id, state) in states.iter() {
                if !state.dirty {
                    continue;
                }
                let days = self.effective_days(state.days_since_last, &cfg.decay.weekend_mode);
                let decayed = state.prev_score * cfg.decay.lambda.powi(days as i32);
                let prefix = format!("{}_", user_id);
                let status = if state.cold_start {
                    "cold_start".to_string()
                } else if !baseline_keys.iter().any(|k| k.starts_with(&prefix)) {
                    "no_baseline".to_string()
                } else {
                    "active".to_string()
                };
                let doc = ScoreDoc {
                    user_id: user_id.clone(),
                    risk_score: state.risk_score,
                    risk_level: classify_risk(state.risk_score, &cfg).to_string(),
                    status,
                    rule_score: state.rule_score,
                    rule_scores: state.rule_scores.clone(),
                    anomaly_score: state.anomaly_score,
                    daily_score: round2(state.rule_score + state.anomaly_score),
                    decayed_prev: round2(decayed),
                    prev_score: state.prev_score,
                    event_counts: state.event_counts.clone(),
                    event_values: state.event_values.clone(),
                    timestamp: self.clock.rfc3339(),
                };
                bulk.push_str(&format!(
                    "{{\"index\":{{\"_index\":\"{}\",\"_id\":\"{}_{}\"}}}}\n",
                    index, user_id, hour
                ));
                bulk.push_str(&serde_json::to_string(&doc).unwrap_or_default());
                bulk.push('\n');
                saved.push(user_id.clone());
            }
        }

        if bulk.is_empty() {
            return;
        }
        match self.search.bulk(bulk).await {
            Ok(()) => {
                let mut states = self.states.write().await;
                for user_id in &saved {
                    if let Some(state) = states.get_mut(user_id) {
                        if state.last_updated <= snapshot_at {
                            state.dirty = false;
                        }
                    }
                }
                info!("saved {} user scores", saved.len());
            }
            Err(e) => warn!("score save failed, will retry: {}", e),
        }
    }

    // ── dashboard push ──

    /// Minimal live update for the dashboard; strictly best-effort.
    pub async fn push_dashboard(&self, user_id: &str) {
        let cfg = self.load_scoring_config().await;
        let Some((risk, prev)) = self
            .states
            .read()
            .await
            .get(user_id)
            .map(|s| (s.risk_score, s.prev_score))
        else {
            return;
        };
        let body = json!({
            "userId": user_id,
            "riskScore": risk,
            "riskLevel": classify_risk(risk, &cfg),
            "prevScore": prev,
        });
        let url = format!("{}/api/ueba/push", self.cfg.dashboard_url);
        let _ = self.dashboard.post(&url).json(&body).send().await;
    }

    // ── status & stats for the control plane ──

    pub async fn user_status(&self, user_id: &str) -> String {
        let cold = self
            .states
            .read()
            .await
            .get(user_id)
            .map(|s| s.cold_start)
            .unwrap_or(false);
        if cold {
            return "cold_start".to_string();
        }
        if !self.has_baseline(user_id).await {
            return "no_baseline".to_string();
        }
        "active".to_string()
    }

    /// (users, baselines, rules, events counted today)
    pub async fn stats(&self) -> (usize, usize, usize, i64) {
        let states = self.states.read().await;
        let users = states.len();
        let events = states
            .values()
            .flat_map(|s| s.event_counts.values())
            .sum::<i64>();
        drop(states);
        let baselines = self.baselines.read().await.len();
        let rules = self.load_rules().await.len();
        (users, baselines, rules, events)
    }

    pub async fn current_date(&self) -> String {
        self.current_date.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Endpoints point at a closed port: every network call fails fast and the
    // scorer falls back to its in-memory caches, which each test primes.
    fn test_config() -> Config {
        Config {
            port: 0,
            opensearch_url: "http://127.0.0.1:1".to_string(),
            kafka_bootstrap: "127.0.0.1:1".to_string(),
            kafka_group_id: "test".to_string(),
            kafka_event_topics: "siem-events".to_string(),
            transformed_topic: "siem-events".to_string(),
            timezone: "UTC".to_string(),
            index_prefix: "test".to_string(),
            flink_sql_gateway: "http://127.0.0.1:1".to_string(),
            flink_rest_api: "http://127.0.0.1:1".to_string(),
            alert_topic: "cep-alerts".to_string(),
            dashboard_url: "http://127.0.0.1:1".to_string(),
            health_warn_mb: 256.0,
            health_crit_mb: 512.0,
        }
    }

    async fn test_scorer(rules: Vec<Rule>) -> Arc<Scorer> {
        let cfg = test_config();
        let clock = Clock::from_tz("UTC");
        let search = SearchClient::new(&cfg.opensearch_url);
        let store = crate::rules::store::RuleStore::new(search.clone(), &cfg.index_prefix);
        let scorer = Arc::new(Scorer::new(cfg, clock, search, store));
        *scorer.scoring_cfg.write().await = Some(Arc::new(ScoringConfig::defaults()));
        *scorer.rules.write().await = Some(Arc::new(rules));
        *scorer.current_date.lock().await = scorer.clock.today();
        scorer
    }

    fn rule(v: serde_json::Value) -> Rule {
        Rule::from_doc(v["name"].as_str().unwrap_or("r"), &v).unwrap()
    }

    fn proc_event(act: &str) -> Vec<u8> {
        json!({
            "msgId": "MESSAGE_PROCESS",
            "@timestamp": "2025-03-01T10:00:00+00:00",
            "hostname": "host-1",
            "cefExtensions": { "suid": "u1", "act": act }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn single_filter_rule_scores_log_of_matches() {
        // S1: weight 5, three matching and two non-matching events
        let scorer = test_scorer(vec![rule(json!({
            "name": "proc-kill",
            "enabled": true,
            "weight": 5.0,
            "ueba": { "enabled": true },
            "match": { "msgId": "MESSAGE_PROCESS", "conditions": [
                { "field": "action", "op": "eq", "value": "kill" }
            ]}
        }))])
        .await;

        // mature baseline centered on today's count: anomaly term stays zero
        scorer.baselines.write().await.insert(
            "u1_MESSAGE_PROCESS".to_string(),
            Baseline { mean: 5.0, stddev: 1.0, sample_days: 10 },
        );
        scorer
            .states
            .write()
            .await
            .insert("u1".to_string(), UserState::seeded(0.0, 1));

        for _ in 0..3 {
            scorer.process_event(&proc_event("kill")).await;
        }
        for _ in 0..2 {
            scorer.process_event(&proc_event("open")).await;
        }

        let states = scorer.states.read().await;
        let s = states.get("u1").unwrap();
        assert_eq!(s.event_counts["MESSAGE_PROCESS"], 5);
        assert_eq!(s.event_values["proc-kill"], 3.0);
        let expected = 5.0 * 4.0f64.ln();
        assert!((s.rule_score - round2(expected)).abs() < 0.01);
        assert_eq!(s.anomaly_score, 0.0);
        assert!((s.risk_score - round2(expected)).abs() < 0.01);
        let cfg = ScoringConfig::defaults();
        assert_eq!(classify_risk(s.risk_score, &cfg), "LOW");
    }

    #[tokio::test]
    async fn cardinality_counts_distinct_values_once() {
        let scorer = test_scorer(vec![rule(json!({
            "name": "many-files",
            "enabled": true,
            "weight": 1.0,
            "ueba": { "enabled": true },
            "match": { "msgId": "MESSAGE_PROCESS" },
            "aggregate": { "type": "cardinality", "field": "fname" }
        }))])
        .await;
        scorer
            .states
            .write()
            .await
            .insert("u1".to_string(), UserState::seeded(0.0, 1));

        let ev = |fname: &str| {
            json!({
                "msgId": "MESSAGE_PROCESS",
                "cefExtensions": { "suid": "u1", "fname": fname }
            })
            .to_string()
            .into_bytes()
        };
        scorer.process_event(&ev("a.doc")).await;
        scorer.process_event(&ev("a.doc")).await;
        assert_eq!(
            scorer.states.read().await.get("u1").unwrap().event_values["many-files"],
            1.0
        );
        scorer.process_event(&ev("b.doc")).await;
        assert_eq!(
            scorer.states.read().await.get("u1").unwrap().event_values["many-files"],
            2.0
        );
    }

    #[tokio::test]
    async fn anomaly_trigger_on_covered_msg_id() {
        // S5: mean 2, σ 1, 10 events → z = 8, anomaly = 10·(8−2) = 60
        let scorer = test_scorer(vec![rule(json!({
            "name": "print-watch",
            "enabled": true,
            "weight": 1.0,
            "ueba": { "enabled": true },
            "match": { "msgId": "MESSAGE_PRINT", "conditions": [
                { "field": "action", "op": "eq", "value": "never-matches" }
            ]}
        }))])
        .await;
        scorer.baselines.write().await.insert(
            "u2_MESSAGE_PRINT".to_string(),
            Baseline { mean: 2.0, stddev: 1.0, sample_days: 10 },
        );
        scorer
            .states
            .write()
            .await
            .insert("u2".to_string(), UserState::seeded(0.0, 1));

        let ev = json!({
            "msgId": "MESSAGE_PRINT",
            "cefExtensions": { "suid": "u2", "act": "print" }
        })
        .to_string()
        .into_bytes();
        for _ in 0..10 {
            scorer.process_event(&ev).await;
        }

        let states = scorer.states.read().await;
        let s = states.get("u2").unwrap();
        assert_eq!(s.rule_score, 0.0);
        assert!((s.anomaly_score - 60.0).abs() < 0.01);
        assert!((s.risk_score - 60.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn uncovered_surge_does_not_score() {
        // baseline exists, but no enabled rule references the msgId
        let scorer = test_scorer(vec![rule(json!({
            "name": "other",
            "enabled": true,
            "ueba": { "enabled": true },
            "match": { "msgId": "MESSAGE_PROCESS" }
        }))])
        .await;
        scorer.baselines.write().await.insert(
            "u3_MESSAGE_CLIPBOARD".to_string(),
            Baseline { mean: 1.0, stddev: 0.5, sample_days: 10 },
        );
        let mut state = UserState::seeded(0.0, 1);
        state.event_counts.insert("MESSAGE_CLIPBOARD".to_string(), 50);
        scorer.states.write().await.insert("u3".to_string(), state);

        scorer.recompute_score("u3").await;
        let states = scorer.states.read().await;
        assert_eq!(states.get("u3").unwrap().anomaly_score, 0.0);
    }

    #[tokio::test]
    async fn decay_applies_lambda_over_effective_days() {
        // no events for 3 days: risk = prev · λ³
        let scorer = test_scorer(Vec::new()).await;
        scorer
            .states
            .write()
            .await
            .insert("u4".to_string(), UserState::seeded(50.0, 3));

        scorer.recompute_score("u4").await;
        let states = scorer.states.read().await;
        let s = states.get("u4").unwrap();
        let expected = 50.0 * 0.9f64.powi(3);
        assert!((s.risk_score - expected).abs() < 0.01);
    }

    #[tokio::test]
    async fn cold_start_pins_score_to_zero_until_baselines_mature() {
        let scorer = test_scorer(vec![rule(json!({
            "name": "r1",
            "enabled": true,
            "weight": 5.0,
            "ueba": { "enabled": true },
            "match": { "msgId": "MESSAGE_PROCESS" }
        }))])
        .await;
        scorer.baselines.write().await.insert(
            "u5_MESSAGE_PROCESS".to_string(),
            Baseline { mean: 1.0, stddev: 1.0, sample_days: 3 },
        );
        let mut state = UserState::seeded(0.0, 1);
        state.event_values.insert("r1".to_string(), 10.0);
        scorer.states.write().await.insert("u5".to_string(), state);

        scorer.recompute_score("u5").await;
        {
            let states = scorer.states.read().await;
            let s = states.get("u5").unwrap();
            assert!(s.cold_start);
            assert_eq!(s.risk_score, 0.0);
        }

        // baselines mature past the threshold: scoring resumes
        scorer.baselines.write().await.insert(
            "u5_MESSAGE_PROCESS".to_string(),
            Baseline { mean: 1.0, stddev: 1.0, sample_days: 10 },
        );
        scorer.recompute_score("u5").await;
        let states = scorer.states.read().await;
        let s = states.get("u5").unwrap();
        assert!(!s.cold_start);
        assert!((s.risk_score - 5.0 * 11.0f64.ln()).abs() < 0.01);
    }

    #[tokio::test]
    async fn rollover_rolls_every_state() {
        let scorer = test_scorer(Vec::new()).await;
        let mut state = UserState::seeded(0.0, 1);
        state.risk_score = 12.34;
        state.rule_score = 4.0;
        state.anomaly_score = 8.34;
        state.event_counts.insert("M".to_string(), 7);
        state.event_values.insert("r".to_string(), 7.0);
        state.dirty = true;
        scorer.states.write().await.insert("u6".to_string(), state);
        *scorer.current_date.lock().await = "2000-01-01".to_string();

        scorer.check_rollover().await;

        let states = scorer.states.read().await;
        let s = states.get("u6").unwrap();
        assert_eq!(s.prev_score, 12.34);
        assert_eq!(s.days_since_last, 1);
        assert_eq!(s.rule_score, 0.0);
        assert_eq!(s.anomaly_score, 0.0);
        assert!(s.event_counts.is_empty());
        assert!(s.event_values.is_empty());
        assert!(s.dirty);
        assert_eq!(*scorer.current_date.lock().await, scorer.clock.today());
    }

    #[tokio::test]
    async fn rollover_is_idempotent_for_same_day() {
        let scorer = test_scorer(Vec::new()).await;
        let mut state = UserState::seeded(0.0, 1);
        state.risk_score = 9.9;
        scorer.states.write().await.insert("u7".to_string(), state);

        // current date already today: nothing changes
        scorer.check_rollover().await;
        let states = scorer.states.read().await;
        assert_eq!(states.get("u7").unwrap().risk_score, 9.9);
        assert_eq!(states.get("u7").unwrap().prev_score, 0.0);
    }
}
