//! Field-metadata inspection API, shared by both control planes. Lets the
//! rule editor discover which CEF extension fields and values exist in the
//! recent event stream.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::indices;
use crate::search::SearchClient;

pub struct FieldMetaState {
    pub search: SearchClient,
    pub prefix: String,
}

pub fn router(state: Arc<FieldMetaState>) -> Router {
    Router::new()
        .route("/api/field-meta", get(get_meta).put(put_meta))
        .route("/api/field-meta/analyze", post(analyze))
        .route("/api/field-meta/analyze-field", post(analyze_field))
        .with_state(state)
}

async fn get_meta(State(st): State<Arc<FieldMetaState>>) -> Result<Json<Value>> {
    let index = indices::field_meta_index(&st.prefix);
    let docs = st
        .search
        .search_hits(
            &index,
            &json!({ "size": 1, "sort": [ { "migratedAt": "desc" } ] }),
        )
        .await?;
    match docs.into_iter().next() {
        Some(doc) => Ok(Json(doc)),
        None => Err(EngineError::not_found("field-meta")),
    }
}

async fn put_meta(
    State(st): State<Arc<FieldMetaState>>,
    Json(mut meta): Json<Value>,
) -> Result<Json<Value>> {
    if let Some(obj) = meta.as_object_mut() {
        obj.insert("migratedAt".into(), json!(chrono::Utc::now().to_rfc3339()));
    }
    let index = indices::field_meta_index(&st.prefix);
    st.search.put_doc(&index, "meta-latest", &meta).await?;
    st.search.refresh(&index).await;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    days: i64,
}

/// Either analyze the named event kinds, or scan `days` worth of logs for
/// every event kind seen.
async fn analyze(
    State(st): State<Arc<FieldMetaState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<Value>> {
    if req.days > 0 || req.events.is_empty() {
        return analyze_by_days(&st, req.days).await;
    }
    let mut result = serde_json::Map::new();
    for event in &req.events {
        result.insert(event.clone(), json!(event_fields(&st, event).await));
    }
    Ok(Json(Value::Object(result)))
}

async fn analyze_by_days(st: &FieldMetaState, days: i64) -> Result<Json<Value>> {
    let days = if days <= 0 { 7 } else { days };
    let raw = st
        .search
        .search_raw(
            &indices::logs_index_pattern(&st.prefix),
            &json!({
                "size": 0,
                "query": { "range": { "@timestamp": { "gte": format!("now-{}d/d", days) } } },
                "aggs": { "msgIds": { "terms": { "field": "msgId.keyword", "size": 100 } } },
            }),
        )
        .await?;

    let mut events = serde_json::Map::new();
    if let Some(buckets) = raw["aggregations"]["msgIds"]["buckets"].as_array() {
        for bucket in buckets {
            let Some(key) = bucket["key"].as_str().filter(|k| !k.is_empty()) else {
                continue;
            };
            events.insert(
                key.to_string(),
                json!({
                    "fields": event_fields(st, key).await,
                    "sampleCount": bucket["doc_count"].as_i64().unwrap_or(0),
                }),
            );
        }
    }
    Ok(Json(json!({ "events": events, "days": days })))
}

/// Extension field names observed on recent events of one kind.
async fn event_fields(st: &FieldMetaState, msg_id: &str) -> Vec<String> {
    let docs = st
        .search
        .search_hits(
            &indices::logs_index_pattern(&st.prefix),
            &json!({
                "size": 50,
                "query": { "term": { "msgId.keyword": msg_id } },
                "sort": [ { "@timestamp": "desc" } ],
            }),
        )
        .await
        .unwrap_or_default();

    let mut fields = std::collections::BTreeSet::new();
    for doc in &docs {
        if let Some(ext) = doc.get("cefExtensions").and_then(|e| e.as_object()) {
            for key in ext.keys() {
                fields.insert(key.clone());
            }
        }
    }
    fields.into_iter().collect()
}

#[derive(Debug, Deserialize)]
struct AnalyzeFieldRequest {
    #[serde(default)]
    event: String,
    #[serde(default)]
    field: String,
}

/// Value histogram for one field of one event kind, for select widgets.
async fn analyze_field(
    State(st): State<Arc<FieldMetaState>>,
    Json(req): Json<AnalyzeFieldRequest>,
) -> Result<Json<Value>> {
    let raw = st
        .search
        .search_raw(
            &indices::logs_index_pattern(&st.prefix),
            &json!({
                "size": 0,
                "query": { "term": { "msgId.keyword": req.event } },
                "aggs": { "vals": { "terms": {
                    "field": format!("cefExtensions.{}.keyword", req.field),
                    "size": 100,
                }}},
            }),
        )
        .await?;

    let values: Vec<Value> = raw["aggregations"]["vals"]["buckets"]
        .as_array()
        .map(|buckets| {
            buckets
                .iter()
                .filter(|b| b["key"].as_str().map(|k| !k.is_empty()).unwrap_or(false))
                .map(|b| json!({ "value": b["key"], "count": b["doc_count"] }))
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({ "field": req.field, "values": values })))
}
