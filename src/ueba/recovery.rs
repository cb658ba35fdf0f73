//! Aggregation-based recovery. Two paths keep the in-memory scorer
//! consistent with storage: startup reconstruction of today's aggregates,
//! and re-aggregation after a rule change. Both page the search engine with
//! composite aggregations keyed by user.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::indices;
use crate::rules::query::{resolve_agg_field, rule_search_query};
use crate::rules::{AggKind, Rule};

use super::scorer::Scorer;
use super::state::UserState;

impl Scorer {
    /// Startup reconstruction: seed users from historical scores, rebuild
    /// today's per-rule aggregates and per-msgId counts, recompute, save.
    pub async fn recover_today_state(self: &std::sync::Arc<Self>) -> crate::error::Result<()> {
        let today = self.clock.today();
        info!(day = %today, "recovering state from aggregations");

        self.init_users_from_prev_scores().await;

        let rules = self.load_rules().await;
        for rule in rules.iter().filter(|r| r.enabled) {
            self.recover_rule_agg(rule, &today).await;
        }
        self.recover_event_counts(&today).await;

        let user_ids: Vec<String> = self.states.read().await.keys().cloned().collect();
        for user_id in &user_ids {
            if let Some(state) = self.states.write().await.get_mut(user_id) {
                state.dirty = true;
            }
            self.recompute_score(user_id).await;
        }
        info!("recovered {} users", user_ids.len());

        self.save_scores_batch().await;
        Ok(())
    }

    /// Users with a pre-today score get an in-memory state seeded with that
    /// score, so decay shows on the dashboard even with no events today.
    pub(crate) async fn init_users_from_prev_scores(&self) {
        let today = self.clock.today();
        let tz = crate::clock::offset_string(self.clock.offset());
        let query = json!({ "range": { "@timestamp": { "lt": today, "time_zone": tz } } });
        let sub_aggs = json!({ "latest": { "top_hits": {
            "size": 1,
            "sort": [ { "@timestamp": "desc" } ],
            "_source": ["riskScore", "@timestamp"],
        }}});

        let buckets = match self
            .search
            .composite_agg(
                &indices::scores_index_pattern(&self.cfg.index_prefix),
                json!([ { "user": { "terms": { "field": "userId.keyword" } } } ]),
                &query,
                Some(sub_aggs),
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!("previous-score scan failed: {}", e);
                return;
            }
        };

        let now = self.clock.now();
        let mut seeded = 0usize;
        let mut states = self.states.write().await;
        for bucket in &buckets {
            let Some(uid) = bucket["key"]["user"].as_str() else { continue };
            let Some(hit) = bucket["latest"]["hits"]["hits"].as_array().and_then(|h| h.first())
            else {
                continue;
            };
            let score = hit["_source"]["riskScore"].as_f64().unwrap_or(0.0);
            if score <= 0.0 {
                continue;
            }
            let days = hit["_source"]["@timestamp"]
                .as_str()
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(|t| ((now - t.with_timezone(&self.clock.offset())).num_hours() / 24 + 1).max(1))
                .unwrap_or(1);
            if !states.contains_key(uid) {
                let mut state = UserState::seeded(score, days);
                state.dirty = true;
                states.insert(uid.to_string(), state);
                seeded += 1;
            }
        }
        info!("seeded {} users from previous scores", seeded);
    }

    /// One rule's per-user aggregate for the given day, via the search-query
    /// emitter plus a sum/cardinality sub-aggregation when applicable.
    pub(crate) async fn recover_rule_agg(&self, rule: &Rule, today: &str) {
        let Some(query) = rule_search_query(rule, today, &self.clock) else {
            return;
        };

        let sub_aggs = match rule.aggregate.as_ref() {
            Some(agg) if agg.kind != AggKind::Count => {
                let Some(field) = agg.field.as_deref().filter(|f| !f.is_empty()) else {
                    return;
                };
                let path = resolve_agg_field(field);
                match agg.kind {
                    AggKind::Sum => Some(json!({ "val": { "sum": { "field": path } } })),
                    AggKind::Cardinality => {
                        Some(json!({ "val": { "cardinality": { "field": path } } }))
                    }
                    AggKind::Count => unreachable!(),
                }
            }
            _ => None,
        };

        let buckets = match self
            .search
            .composite_agg(
                &indices::logs_index_pattern(&self.cfg.index_prefix),
                json!([ { "user": { "terms": { "field": "cefExtensions.suid.keyword" } } } ]),
                &query,
                sub_aggs.clone(),
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!(rule = %rule.name, "rule aggregation failed: {}", e);
                return;
            }
        };

        let mut count = 0usize;
        for bucket in &buckets {
            let Some(uid) = bucket["key"]["user"].as_str() else { continue };
            let value = if sub_aggs.is_some() {
                bucket["val"]["value"].as_f64().unwrap_or(0.0)
            } else {
                bucket["doc_count"].as_f64().unwrap_or(0.0)
            };
            let seed = if !self.states.read().await.contains_key(uid) {
                Some(self.prev_score(uid).await)
            } else {
                None
            };
            let mut states = self.states.write().await;
            let state = states.entry(uid.to_string()).or_insert_with(|| {
                let (prev, days) = seed.unwrap_or((0.0, 1));
                UserState::seeded(prev, days)
            });
            state.event_values.insert(rule.name.clone(), value);
            count += 1;
        }
        info!(rule = %rule.name, users = count, "rule aggregate recovered");
    }

    /// (user × msgId) counts for the day, for the anomaly term.
    pub(crate) async fn recover_event_counts(&self, today: &str) {
        let tz = crate::clock::offset_string(self.clock.offset());
        let query = json!({ "range": { "@timestamp": {
            "gte": today, "lt": format!("{}||+1d", today), "time_zone": tz,
        }}});

        let buckets = match self
            .search
            .composite_agg(
                &indices::logs_index_pattern(&self.cfg.index_prefix),
                json!([
                    { "user": { "terms": { "field": "cefExtensions.suid.keyword" } } },
                    { "msg": { "terms": { "field": "msgId.keyword" } } },
                ]),
                &query,
                None,
            )
            .await
        {
            Ok(b) => b,
            Err(e) => {
                warn!("event-count aggregation failed: {}", e);
                return;
            }
        };

        let mut states = self.states.write().await;
        for bucket in &buckets {
            let (Some(uid), Some(msg_id)) =
                (bucket["key"]["user"].as_str(), bucket["key"]["msg"].as_str())
            else {
                continue;
            };
            let count = bucket["doc_count"].as_i64().unwrap_or(0);
            let state = states
                .entry(uid.to_string())
                .or_insert_with(|| UserState::seeded(0.0, 1));
            state.event_counts.insert(msg_id.to_string(), count);
        }
    }

    /// Rule-change reprocess: drop cached catalogues, clear the affected
    /// per-rule aggregates and re-derive them for today, then recompute and
    /// persist every user.
    pub async fn reprocess_rules(self: &std::sync::Arc<Self>) {
        self.reload_cache().await;
        let today = self.clock.today();
        let rules = self.load_rules().await;
        info!("rule change, re-aggregating {} rules", rules.len());

        {
            let mut states = self.states.write().await;
            for state in states.values_mut() {
                for rule in rules.iter() {
                    state.event_values.remove(&rule.name);
                    state.seen.remove(&rule.name);
                }
            }
        }

        for rule in rules.iter().filter(|r| r.enabled) {
            self.recover_rule_agg(rule, &today).await;
        }

        let user_ids: Vec<String> = self.states.read().await.keys().cloned().collect();
        for user_id in &user_ids {
            if let Some(state) = self.states.write().await.get_mut(user_id) {
                state.dirty = true;
            }
            self.recompute_score(user_id).await;
        }
        self.save_scores_batch().await;
        info!("reprocess complete ({} users)", user_ids.len());
    }

    /// Shared by the rule CRUD handlers: flush caches now, reprocess in the
    /// background.
    pub fn reload_and_reprocess(self: &std::sync::Arc<Self>) {
        let scorer = self.clone();
        tokio::spawn(async move {
            scorer.reprocess_rules().await;
        });
    }
}

// Raw rule documents pass through the control plane unchanged; only the
// fields the engine needs are validated and typed.
use crate::rules::validate_rule;

impl Scorer {
    pub async fn create_rule(
        self: &std::sync::Arc<Self>,
        mut doc: Value,
    ) -> crate::error::Result<String> {
        let errs = validate_rule(&doc);
        if !errs.is_empty() {
            return Err(crate::error::EngineError::RuleValidation(errs.join("; ")));
        }
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("id");
            obj.remove("_id");
            obj.insert("createdAt".into(), json!(self.clock.rfc3339()));
            obj.entry("severity").or_insert(json!("MEDIUM"));
        }
        let id = self.store.create(&doc).await?;
        self.reload_and_reprocess();
        Ok(id)
    }

    pub async fn update_rule(
        self: &std::sync::Arc<Self>,
        id: &str,
        mut doc: Value,
    ) -> crate::error::Result<()> {
        if let Some(obj) = doc.as_object_mut() {
            obj.remove("id");
            obj.remove("_id");
            obj.insert("updatedAt".into(), json!(self.clock.rfc3339()));
            obj.entry("severity").or_insert(json!("MEDIUM"));
        }
        self.store.put(id, &doc).await?;
        self.reload_and_reprocess();
        Ok(())
    }

    pub async fn delete_rule(self: &std::sync::Arc<Self>, id: &str) -> crate::error::Result<()> {
        self.store.delete(id).await?;
        self.reload_and_reprocess();
        Ok(())
    }
}
