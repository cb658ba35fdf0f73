//! CEP control plane: rule CRUD over the shared catalogue, SQL preview, job
//! submission/reload/status and the alert listing.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::indices;
use crate::rules::store::{RuleFilter, RuleStore};
use crate::rules::{sql, Rule};
use crate::search::SearchClient;

use super::flink::FlinkSession;
use super::reconciler::Reconciler;

pub struct CepState {
    pub cfg: Config,
    pub clock: Clock,
    pub search: SearchClient,
    pub store: RuleStore,
    pub flink: Arc<FlinkSession>,
    pub reconciler: Arc<Reconciler>,
}

pub fn router(state: Arc<CepState>) -> Router {
    let fieldmeta = crate::fieldmeta::router(Arc::new(crate::fieldmeta::FieldMetaState {
        search: state.search.clone(),
        prefix: state.cfg.index_prefix.clone(),
    }));

    Router::new()
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/:id", put(update_rule).delete(delete_rule))
        .route("/api/build-sql", post(build_sql_preview))
        .route("/api/submit", post(submit))
        .route("/api/reload", post(reload))
        .route("/api/status", get(status))
        .route("/api/alerts", get(list_alerts))
        .with_state(state)
        .merge(fieldmeta)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn list_rules(State(st): State<Arc<CepState>>) -> Result<Json<Value>> {
    let rules = st.store.list_raw(RuleFilter::CepAny).await?;
    Ok(Json(json!({ "rules": rules })))
}

fn compile_doc(id: &str, doc: &Value) -> Result<String> {
    let rule = Rule::from_doc(id, doc)
        .ok_or_else(|| EngineError::bad_request("rule document is not parseable"))?;
    let select = sql::build_sql(&rule);
    if select.contains("1=0") {
        return Err(EngineError::bad_request(
            "rule has no match, patterns or conditions to compile",
        ));
    }
    Ok(select)
}

async fn create_rule(
    State(st): State<Arc<CepState>>,
    Json(mut doc): Json<Value>,
) -> Result<Json<Value>> {
    let rule_id = doc
        .get("ruleId")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("rule-{}", Utc::now().timestamp()));

    let select = compile_doc(&rule_id, &doc)?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("ruleId".into(), json!(rule_id));
        obj.insert("sql".into(), json!(select));
        obj.insert("createdAt".into(), json!(st.clock.rfc3339()));
        // severity is its own field, never derived from the name
        obj.entry("severity").or_insert(json!("MEDIUM"));
    }
    st.store.put(&rule_id, &doc).await?;

    if doc.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false) {
        if let Some(rule) = Rule::from_doc(&rule_id, &doc) {
            let _ = st.reconciler.submit_rule(&rule).await;
        }
    }
    Ok(Json(json!({ "status": "ok", "ruleId": rule_id })))
}

async fn update_rule(
    State(st): State<Arc<CepState>>,
    Path(id): Path<String>,
    Json(mut doc): Json<Value>,
) -> Result<Json<Value>> {
    let select = compile_doc(&id, &doc)?;
    if let Some(obj) = doc.as_object_mut() {
        obj.insert("ruleId".into(), json!(id));
        obj.insert("sql".into(), json!(select));
        obj.insert("updatedAt".into(), json!(st.clock.rfc3339()));
        obj.entry("severity").or_insert(json!("MEDIUM"));
    }
    st.store.put(&id, &doc).await?;

    if doc.get("enabled").and_then(|v| v.as_bool()).unwrap_or(false) {
        if let Some(rule) = Rule::from_doc(&id, &doc) {
            let _ = st.reconciler.submit_rule(&rule).await;
        }
    } else {
        st.reconciler.cancel_rule(&id).await;
    }
    Ok(Json(json!({ "status": "ok" })))
}

async fn delete_rule(
    State(st): State<Arc<CepState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    st.reconciler.cancel_rule(&id).await;
    st.store.delete(&id).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn build_sql_preview(Json(doc): Json<Value>) -> Result<Json<Value>> {
    let rule = Rule::from_doc(
        doc.get("id").and_then(|v| v.as_str()).unwrap_or("preview"),
        &doc,
    )
    .ok_or_else(|| EngineError::bad_request("rule document is not parseable"))?;
    Ok(Json(json!({ "sql": sql::build_sql(&rule) })))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    #[serde(rename = "ruleId", default)]
    rule_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    sql: String,
    #[serde(default)]
    rule: Option<Value>,
}

async fn submit(
    State(st): State<Arc<CepState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<Json<Value>> {
    let select = if !req.sql.is_empty() {
        req.sql.clone()
    } else if let Some(rule_doc) = &req.rule {
        compile_doc(&req.rule_id, rule_doc)?
    } else {
        return Err(EngineError::bad_request("either sql or rule is required"));
    };
    let severity = if req.severity.is_empty() {
        "MEDIUM"
    } else {
        &req.severity
    };

    let job_id = st
        .reconciler
        .submit_sql(&req.rule_id, &req.name, severity, &select)
        .await?;
    Ok(Json(json!({ "status": "ok", "jobId": job_id })))
}

async fn reload(State(st): State<Arc<CepState>>) -> Result<Json<Value>> {
    let summary = st.reconciler.reconcile().await?;
    Ok(Json(json!({ "status": "ok", "result": summary })))
}

async fn status(State(st): State<Arc<CepState>>) -> Result<Json<Value>> {
    let running = st.flink.running_jobs().await.unwrap_or_default();
    let tracked = st.reconciler.tracked_jobs().await;
    Ok(Json(json!({
        "running": running.len(),
        "tracked": tracked.len(),
        "trackedJobs": tracked,
    })))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    draw: i64,
    #[serde(default)]
    start: usize,
    #[serde(default)]
    length: usize,
    #[serde(default)]
    search: String,
    #[serde(default)]
    rule: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    order_col: usize,
    #[serde(default)]
    order_dir: String,
    /// Optional `YYYY.MM.DD` to list an older daily index.
    #[serde(default)]
    date: String,
}

async fn list_alerts(
    State(st): State<Arc<CepState>>,
    Query(q): Query<AlertsQuery>,
) -> Result<Json<Value>> {
    let length = if q.length == 0 { 10 } else { q.length };
    let order_dir = if q.order_dir.is_empty() {
        "desc"
    } else {
        &q.order_dir
    };
    let sort_field = match q.order_col {
        1 => "ruleName.keyword",
        2 => "userId.keyword",
        _ => "@timestamp",
    };

    let mut must: Vec<Value> = Vec::new();
    if !q.search.is_empty() {
        must.push(json!({ "multi_match": {
            "query": q.search,
            "fields": ["userId", "ruleName", "hostname"],
        }}));
    }
    if !q.rule.is_empty() {
        must.push(json!({ "term": { "ruleId.keyword": q.rule } }));
    }
    if !q.severity.is_empty() {
        must.push(json!({ "term": { "severity.keyword": q.severity } }));
    }
    let query = if must.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "must": must } })
    };

    let day = if q.date.is_empty() {
        st.clock.today_index_day()
    } else {
        q.date.clone()
    };
    let index = indices::daily_alerts_index(&st.cfg.index_prefix, &day);

    let total = st.search.count(&index, &query).await.unwrap_or(0);
    let docs = st
        .search
        .search_hits(
            &index,
            &json!({
                "query": query,
                "from": q.start,
                "size": length,
                "sort": [ { sort_field: order_dir } ],
            }),
        )
        .await
        .unwrap_or_default();

    // columns: 0=timestamp 1=ruleName 2=ruleId 3=severity 4=userId 5=hostname
    let data: Vec<Vec<Value>> = docs
        .iter()
        .map(|doc| {
            vec![
                doc.get("@timestamp").cloned().unwrap_or_default(),
                doc.get("ruleName").cloned().unwrap_or_default(),
                doc.get("ruleId").cloned().unwrap_or_default(),
                doc.get("severity").cloned().unwrap_or_default(),
                doc.get("userId").cloned().unwrap_or_default(),
                doc.get("hostname").cloned().unwrap_or_default(),
            ]
        })
        .collect();

    Ok(Json(json!({
        "draw": q.draw,
        "recordsTotal": total,
        "recordsFiltered": total,
        "data": data,
    })))
}
