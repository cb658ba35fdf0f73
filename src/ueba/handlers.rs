//! UEBA control plane: rule CRUD + validation, health/status/config,
//! settings, user listings and per-user drill-downs.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use sysinfo::System;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::offset_string;
use crate::error::{EngineError, Result};
use crate::indices;
use crate::rules::store::RuleFilter;
use crate::rules::validate_rule;
use crate::search::SearchClient;

use super::scorer::Scorer;
use super::state::classify_risk;

pub struct UebaState {
    pub scorer: Arc<Scorer>,
    pub started: Instant,
}

pub fn router(state: Arc<UebaState>) -> Router {
    let fieldmeta = crate::fieldmeta::router(Arc::new(crate::fieldmeta::FieldMetaState {
        search: state.scorer.search.clone(),
        prefix: state.scorer.cfg.index_prefix.clone(),
    }));

    Router::new()
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/validate", post(validate))
        .route("/api/rules/:id", put(update_rule).delete(delete_rule))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/config", get(config))
        .route("/api/settings", get(settings).post(settings_post))
        .route("/reload", get(reload))
        .route("/baseline", get(baseline))
        .route("/save", get(save))
        .route("/api/users", get(list_users))
        .route("/api/users/scores", get(user_scores))
        .route("/api/users/:id", get(get_user))
        .route("/api/users/:id/history", get(user_history))
        .route("/api/users/:id/hourly", get(user_hourly))
        .with_state(state)
        .merge(fieldmeta)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn search_of(st: &UebaState) -> &SearchClient {
    &st.scorer.search
}

// ── rules ──

async fn list_rules(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let rules = st.scorer.store.list_raw(RuleFilter::UebaActive).await?;
    Ok(Json(json!({ "rules": rules })))
}

async fn create_rule(
    State(st): State<Arc<UebaState>>,
    Json(doc): Json<Value>,
) -> Result<Json<Value>> {
    let id = st.scorer.create_rule(doc).await?;
    Ok(Json(json!({ "status": "ok", "id": id })))
}

async fn update_rule(
    State(st): State<Arc<UebaState>>,
    Path(id): Path<String>,
    Json(doc): Json<Value>,
) -> Result<Json<Value>> {
    st.scorer.update_rule(&id, doc).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn delete_rule(
    State(st): State<Arc<UebaState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    st.scorer.delete_rule(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn validate(Json(doc): Json<Value>) -> impl axum::response::IntoResponse {
    let errs = validate_rule(&doc);
    if errs.is_empty() {
        (axum::http::StatusCode::OK, Json(json!({ "valid": true })))
    } else {
        (
            axum::http::StatusCode::BAD_REQUEST,
            Json(json!({ "valid": false, "errors": errs })),
        )
    }
}

// ── health / status / config ──

async fn health(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let (users, baselines, rules, events) = st.scorer.stats().await;

    let mut rss_mb = 0.0;
    if let Ok(pid) = sysinfo::get_current_pid() {
        let mut sys = System::new();
        if sys.refresh_process(pid) {
            if let Some(proc_) = sys.process(pid) {
                rss_mb = proc_.memory() as f64 / 1024.0 / 1024.0;
            }
        }
    }

    let warn_mb = st.scorer.cfg.health_warn_mb;
    let crit_mb = st.scorer.cfg.health_crit_mb;
    let mut level = "healthy";
    let mut warnings: Vec<&str> = Vec::new();
    if rss_mb > crit_mb {
        level = "critical";
        warnings.push("memory critical");
    } else if rss_mb > warn_mb {
        level = "warning";
        warnings.push("memory high");
    }
    if rules == 0 {
        if level == "healthy" {
            level = "warning";
        }
        warnings.push("no rules loaded");
    }

    Ok(Json(json!({
        "status": level,
        "warnings": warnings,
        "uptime_secs": st.started.elapsed().as_secs(),
        "memory": { "rss_mb": (rss_mb * 100.0).round() / 100.0 },
        "data": {
            "users": users,
            "baselines": baselines,
            "rules": rules,
            "today_events": events,
        },
    })))
}

async fn status(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let (users, baselines, rules, _) = st.scorer.stats().await;
    Ok(Json(json!({
        "service": "ueba-scoring",
        "mode": "in-memory",
        "users": users,
        "baselines": baselines,
        "rules": rules,
        "currentDate": st.scorer.current_date().await,
    })))
}

async fn config(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let cfg = st.scorer.load_scoring_config().await;
    Ok(Json(serde_json::to_value(&*cfg)?))
}

// ── settings ──

async fn settings(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let index = indices::settings_index(&st.scorer.cfg.index_prefix);
    let mut doc = search_of(&st)
        .get_doc(&index, "settings")
        .await?
        .unwrap_or_else(|| json!({}));

    // per-rule weights ride along with the settings document
    let rules = st.scorer.store.list_raw(RuleFilter::UebaAny).await?;
    let mut weights = serde_json::Map::new();
    for rule in &rules {
        let Some(id) = rule.get("id").and_then(|v| v.as_str()) else { continue };
        let name = rule
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(id);
        weights.insert(
            id.to_string(),
            json!({
                "name": name,
                "weight": rule.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.0),
                "msgId": rule.get("match").and_then(|m| m.get("msgId")).cloned().unwrap_or_default(),
            }),
        );
    }
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("weights".into(), Value::Object(weights));
    }
    Ok(Json(doc))
}

async fn settings_post(
    State(st): State<Arc<UebaState>>,
    Json(mut doc): Json<Value>,
) -> Result<Json<Value>> {
    if let Some(weights) = doc.get("weights").and_then(|w| w.as_object()).cloned() {
        for (rule_id, entry) in weights {
            let weight = entry.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.0);
            if let Err(e) = st.scorer.store.update_weight(&rule_id, weight).await {
                tracing::warn!(rule = %rule_id, "weight update failed: {}", e);
            }
        }
    }
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("weights");
        obj.insert("updated_at".into(), json!(st.scorer.clock.rfc3339()));
    }
    let index = indices::settings_index(&st.scorer.cfg.index_prefix);
    let result = search_of(&st).put_doc(&index, "settings", &doc).await?;
    st.scorer.reload_cache().await;
    Ok(Json(json!({ "status": "ok", "result": result })))
}

// ── maintenance triggers ──

async fn reload(State(st): State<Arc<UebaState>>) -> Result<&'static str> {
    st.scorer.reload_cache().await;
    Ok("ok")
}

async fn baseline(State(st): State<Arc<UebaState>>) -> Result<&'static str> {
    let scorer = st.scorer.clone();
    tokio::spawn(async move {
        scorer.update_baselines().await;
        scorer.mark_baselines_fresh().await;
    });
    Ok("started")
}

async fn save(State(st): State<Arc<UebaState>>) -> Result<&'static str> {
    st.scorer.save_scores_batch().await;
    Ok("ok")
}

// ── users ──

async fn list_users(State(st): State<Arc<UebaState>>) -> Result<Json<Value>> {
    let cfg = st.scorer.load_scoring_config().await;
    let baseline_keys: Vec<String> = st.scorer.baselines.read().await.keys().cloned().collect();

    let states = st.scorer.states.read().await;
    let users: Vec<Value> = states
        .iter()
        .map(|(uid, s)| {
            let prefix = format!("{}_", uid);
            let status = if s.cold_start {
                "cold_start"
            } else if !baseline_keys.iter().any(|k| k.starts_with(&prefix)) {
                "no_baseline"
            } else {
                "active"
            };
            json!({
                "userId": uid,
                "riskScore": s.risk_score,
                "riskLevel": classify_risk(s.risk_score, &cfg),
                "ruleScore": s.rule_score,
                "anomalyScore": s.anomaly_score,
                "prevScore": s.prev_score,
                "coldStart": s.cold_start,
                "status": status,
                "lastUpdated": s.last_updated,
            })
        })
        .collect();
    Ok(Json(json!({ "users": users })))
}

async fn get_user(
    State(st): State<Arc<UebaState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let cfg = st.scorer.load_scoring_config().await;
    let status = st.scorer.user_status(&id).await;
    let states = st.scorer.states.read().await;
    let Some(s) = states.get(&id) else {
        return Err(EngineError::not_found(format!("user {}", id)));
    };
    let body = json!({
        "userId": id,
        "status": status,
        "riskScore": s.risk_score,
        "riskLevel": classify_risk(s.risk_score, &cfg),
        "ruleScore": s.rule_score,
        "ruleScores": s.rule_scores,
        "anomalyScore": s.anomaly_score,
        "eventCounts": s.event_counts,
        "eventValues": s.event_values,
        "prevScore": s.prev_score,
        "daysSinceLast": s.days_since_last,
        "coldStart": s.cold_start,
        "lastUpdated": s.last_updated,
    });
    drop(states);
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct ScoresQuery {
    #[serde(default)]
    draw: i64,
    #[serde(default)]
    start: usize,
    #[serde(default)]
    length: usize,
    #[serde(default)]
    search: String,
    #[serde(default)]
    order_dir: String,
}

/// DataTables listing over the latest persisted score per user.
async fn user_scores(
    State(st): State<Arc<UebaState>>,
    Query(q): Query<ScoresQuery>,
) -> Result<Json<Value>> {
    let length = if q.length == 0 { 10 } else { q.length };
    let desc = q.order_dir.is_empty() || q.order_dir == "desc";

    let buckets = search_of(&st)
        .composite_agg(
            &indices::scores_index_pattern(&st.scorer.cfg.index_prefix),
            json!([ { "user": { "terms": { "field": "userId.keyword" } } } ]),
            &json!({ "match_all": {} }),
            Some(json!({ "recent": { "top_hits": {
                "size": 1, "sort": [ { "@timestamp": "desc" } ],
            }}})),
        )
        .await?;

    let needle = q.search.to_lowercase();
    let mut rows: Vec<(String, f64, String, Value)> = Vec::new();
    for bucket in &buckets {
        let Some(hit) = bucket["recent"]["hits"]["hits"].as_array().and_then(|h| h.first())
        else {
            continue;
        };
        let src = &hit["_source"];
        let uid = src["userId"]
            .as_str()
            .or(bucket["key"]["user"].as_str())
            .unwrap_or("")
            .to_string();
        if uid.is_empty() {
            continue;
        }
        if !needle.is_empty() && !uid.to_lowercase().contains(&needle) {
            continue;
        }
        rows.push((
            uid,
            src["riskScore"].as_f64().unwrap_or(0.0),
            src["riskLevel"].as_str().unwrap_or("").to_string(),
            src.get("ruleScores").cloned().unwrap_or_default(),
        ));
    }

    rows.sort_by(|a, b| {
        let ord = a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal);
        if desc {
            ord.reverse()
        } else {
            ord
        }
    });

    let total = rows.len();
    let start = q.start.min(total);
    let end = (start + length).min(total);
    let data: Vec<Vec<Value>> = rows[start..end]
        .iter()
        .map(|(uid, score, level, scores)| {
            vec![json!(uid), json!(score), json!(level), scores.clone()]
        })
        .collect();

    Ok(Json(json!({
        "draw": q.draw,
        "recordsTotal": total,
        "recordsFiltered": total,
        "data": data,
    })))
}

/// 7-day daily maxima plus today's hourly rule/anomaly/decay breakdown.
async fn user_history(
    State(st): State<Arc<UebaState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let tz = offset_string(st.scorer.clock.offset());
    let index = indices::scores_index_pattern(&st.scorer.cfg.index_prefix);
    let today = st.scorer.clock.today();

    let daily = search_of(&st)
        .search_raw(
            &index,
            &json!({
                "size": 0,
                "query": { "bool": { "must": [
                    { "term": { "userId": id } },
                    { "range": { "@timestamp": { "gte": "now-6d/d", "lte": "now", "time_zone": tz } } },
                ]}},
                "aggs": { "daily": {
                    "date_histogram": {
                        "field": "@timestamp", "calendar_interval": "day", "format": "MM-dd",
                        "time_zone": tz, "min_doc_count": 0,
                        "extended_bounds": { "min": "now-6d/d", "max": "now/d" },
                    },
                    "aggs": { "max_score": { "max": { "field": "riskScore" } } },
                }},
            }),
        )
        .await
        .unwrap_or_default();

    let daily_data: Vec<Value> = daily["aggregations"]["daily"]["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .map(|b| {
                    json!({
                        "date": b["key_as_string"],
                        "label": b["key_as_string"],
                        "score": b["max_score"]["value"].as_f64().unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let hourly = search_of(&st)
        .search_raw(
            &index,
            &json!({
                "size": 0,
                "query": { "bool": { "must": [
                    { "term": { "userId": id } },
                    { "range": { "@timestamp": {
                        "gte": today, "lt": format!("{}||+1d", today), "time_zone": tz } } },
                    { "exists": { "field": "ruleScores" } },
                ]}},
                "aggs": { "hourly": {
                    "date_histogram": { "field": "@timestamp", "calendar_interval": "hour",
                        "format": "HH", "time_zone": tz },
                    "aggs": {
                        "ruleScore": { "max": { "field": "ruleScore" } },
                        "anomalyScore": { "max": { "field": "anomalyScore" } },
                        "decayScore": { "max": { "field": "decayedPrev" } },
                    },
                }},
            }),
        )
        .await
        .unwrap_or_default();

    let hourly_data: Vec<Value> = hourly["aggregations"]["hourly"]["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .map(|b| {
                    json!({
                        "hour": b["key_as_string"].as_str()
                            .and_then(|h| h.parse::<i64>().ok()).unwrap_or(0),
                        "ruleScore": b["ruleScore"]["value"].as_f64().unwrap_or(0.0),
                        "anomalyScore": b["anomalyScore"]["value"].as_f64().unwrap_or(0.0),
                        "decayScore": b["decayScore"]["value"].as_f64().unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({ "daily": daily_data, "hourly": hourly_data })))
}

/// Today's event counts per hour for one user, from the event-log index.
async fn user_hourly(
    State(st): State<Arc<UebaState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let tz = offset_string(st.scorer.clock.offset());
    let result = search_of(&st)
        .search_raw(
            &indices::logs_index_pattern(&st.scorer.cfg.index_prefix),
            &json!({
                "size": 0,
                "query": { "bool": { "must": [
                    { "term": { "cefExtensions.suid.keyword": id } },
                    { "range": { "@timestamp": { "gte": "now/d", "time_zone": tz } } },
                ]}},
                "aggs": { "hourly": {
                    "date_histogram": { "field": "@timestamp", "calendar_interval": "hour",
                        "format": "HH", "time_zone": tz },
                }},
            }),
        )
        .await
        .unwrap_or_default();

    let data: Vec<Value> = result["aggregations"]["hourly"]["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .map(|b| {
                    json!({
                        "hour": b["key_as_string"].as_str()
                            .and_then(|h| h.parse::<i64>().ok()).unwrap_or(0),
                        "count": b["doc_count"].as_i64().unwrap_or(0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!(data)))
}
