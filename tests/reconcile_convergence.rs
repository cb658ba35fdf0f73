//! Reconciler convergence against a mocked SQL gateway, job REST API and
//! rule store: stale jobs are cancelled, missing rules submitted, and a
//! second reconcile with an unchanged catalogue is a no-op.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use siem_analytics_engine::cep::flink::FlinkSession;
use siem_analytics_engine::cep::reconciler::Reconciler;
use siem_analytics_engine::config::Config;
use siem_analytics_engine::rules::store::RuleStore;
use siem_analytics_engine::search::SearchClient;

#[derive(Debug, Clone)]
struct MockJob {
    jid: String,
    name: String,
    state: String,
}

#[derive(Debug, Default)]
struct Mock {
    jobs: Vec<MockJob>,
    next_jid: u64,
    pipeline_name: String,
    statements: Vec<String>,
    /// documents served for every `_search`
    rule_hits: Vec<Value>,
    /// (doc id, partial) recorded from `_update`
    updates: Vec<(String, Value)>,
}

type Shared = Arc<Mutex<Mock>>;

// ── SQL gateway + job REST mock ──

async fn create_session() -> Json<Value> {
    Json(json!({ "sessionHandle": "sess-1" }))
}

async fn run_statement(State(mock): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let stmt = body["statement"].as_str().unwrap_or("").to_string();
    let mut m = mock.lock().unwrap();
    if let Some(rest) = stmt.strip_prefix("SET 'pipeline.name' = '") {
        m.pipeline_name = rest.trim_end_matches('\'').replace("''", "'");
    } else if stmt.starts_with("INSERT") {
        m.next_jid += 1;
        let job = MockJob {
            jid: format!("job-{}", m.next_jid),
            name: m.pipeline_name.clone(),
            state: "RUNNING".to_string(),
        };
        m.jobs.push(job);
    }
    m.statements.push(stmt);
    Json(json!({}))
}

async fn jobs_overview(State(mock): State<Shared>) -> Json<Value> {
    let m = mock.lock().unwrap();
    let jobs: Vec<Value> = m
        .jobs
        .iter()
        .map(|j| json!({ "jid": j.jid, "name": j.name, "state": j.state }))
        .collect();
    Json(json!({ "jobs": jobs }))
}

async fn cancel_job(State(mock): State<Shared>, Path(jid): Path<String>) -> Json<Value> {
    let mut m = mock.lock().unwrap();
    for job in m.jobs.iter_mut().filter(|j| j.jid == jid) {
        job.state = "CANCELED".to_string();
    }
    Json(json!({}))
}

// ── search engine mock ──

async fn search_index(State(mock): State<Shared>) -> Json<Value> {
    let m = mock.lock().unwrap();
    Json(json!({ "hits": { "hits": m.rule_hits } }))
}

async fn update_doc(
    State(mock): State<Shared>,
    Path((_index, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Json<Value> {
    mock.lock()
        .unwrap()
        .updates
        .push((id, body["doc"].clone()));
    Json(json!({ "result": "updated" }))
}

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn setup(mock: Shared) -> (Reconciler, Config) {
    let gateway = Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id/statements", post(run_statement))
        .route("/jobs/overview", get(jobs_overview))
        .route("/jobs/:id", patch(cancel_job))
        .with_state(mock.clone());
    let search_srv = Router::new()
        .route("/:index/_search", post(search_index))
        .route("/:index/_update/:id", post(update_doc))
        .with_state(mock);

    let gw_addr = spawn_server(gateway).await;
    let search_addr = spawn_server(search_srv).await;

    let cfg = Config {
        port: 0,
        opensearch_url: format!("http://{}", search_addr),
        kafka_bootstrap: "127.0.0.1:1".to_string(),
        kafka_group_id: "test-cep".to_string(),
        kafka_event_topics: "siem-events".to_string(),
        transformed_topic: "siem-events".to_string(),
        timezone: "UTC".to_string(),
        index_prefix: "test".to_string(),
        flink_sql_gateway: format!("http://{}", gw_addr),
        flink_rest_api: format!("http://{}", gw_addr),
        alert_topic: "cep-alerts".to_string(),
        dashboard_url: "http://127.0.0.1:1".to_string(),
        health_warn_mb: 256.0,
        health_crit_mb: 512.0,
    };

    let search = SearchClient::new(&cfg.opensearch_url);
    let store = RuleStore::new(search, &cfg.index_prefix);
    let flink = Arc::new(FlinkSession::new(&cfg));
    (Reconciler::new(flink, store), cfg)
}

fn rule_hit(id: &str, name: &str) -> Value {
    json!({
        "_id": id,
        "_source": {
            "name": name,
            "severity": "HIGH",
            "enabled": true,
            "cep": { "enabled": true },
            "match": { "msgId": "MESSAGE_PROCESS" }
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn reconcile_converges_and_is_idempotent() {
    let mock: Shared = Arc::new(Mutex::new(Mock::default()));
    {
        let mut m = mock.lock().unwrap();
        m.rule_hits = vec![rule_hit("ry", "Y")];
        // a live job with no backing rule
        m.jobs.push(MockJob {
            jid: "job-x".to_string(),
            name: "CEP: X".to_string(),
            state: "RUNNING".to_string(),
        });
    }

    let (reconciler, _cfg) = setup(mock.clone()).await;

    // first pass: X cancelled, Y submitted
    let summary = reconciler.reconcile().await.expect("reconcile");
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(summary.unchanged, 0);
    assert_eq!(summary.failed, 0);

    {
        let m = mock.lock().unwrap();
        let x = m.jobs.iter().find(|j| j.name == "CEP: X").unwrap();
        assert_eq!(x.state, "CANCELED");
        let y: Vec<_> = m
            .jobs
            .iter()
            .filter(|j| j.name == "CEP: Y" && j.state == "RUNNING")
            .collect();
        assert_eq!(y.len(), 1, "exactly one job for rule Y");
        // rule document carries the fresh binding
        let (id, doc) = m.updates.last().unwrap();
        assert_eq!(id, "ry");
        assert_eq!(doc["jobStatus"], "RUNNING");
        assert!(doc["jobId"].as_str().unwrap().starts_with("job-"));
    }

    // second pass with the same catalogue: nothing moves
    let statements_before = mock.lock().unwrap().statements.len();
    let summary = reconciler.reconcile().await.expect("reconcile");
    assert_eq!(summary.submitted, 0);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(summary.unchanged, 1);

    let m = mock.lock().unwrap();
    let inserts_after: usize = m.statements[statements_before..]
        .iter()
        .filter(|s| s.starts_with("INSERT"))
        .count();
    assert_eq!(inserts_after, 0, "idempotent reconcile submits nothing");
    let running: Vec<_> = m.jobs.iter().filter(|j| j.state == "RUNNING").collect();
    assert_eq!(running.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn submission_failure_marks_rule_failed() {
    // a gateway that rejects INSERT statements
    async fn failing_statement(
        State(mock): State<Shared>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        let stmt = body["statement"].as_str().unwrap_or("").to_string();
        let failed = stmt.starts_with("INSERT");
        mock.lock().unwrap().statements.push(stmt);
        if failed {
            Json(json!({ "errors": ["table on fire"] }))
        } else {
            Json(json!({}))
        }
    }

    let mock: Shared = Arc::new(Mutex::new(Mock::default()));
    mock.lock().unwrap().rule_hits = vec![rule_hit("rz", "Z")];

    let gateway = Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/:id/statements", post(failing_statement))
        .route("/jobs/overview", get(jobs_overview))
        .route("/jobs/:id", patch(cancel_job))
        .with_state(mock.clone());
    let search_srv = Router::new()
        .route("/:index/_search", post(search_index))
        .route("/:index/_update/:id", post(update_doc))
        .with_state(mock.clone());

    let gw_addr = spawn_server(gateway).await;
    let search_addr = spawn_server(search_srv).await;

    let cfg = Config {
        port: 0,
        opensearch_url: format!("http://{}", search_addr),
        kafka_bootstrap: "127.0.0.1:1".to_string(),
        kafka_group_id: "test-cep".to_string(),
        kafka_event_topics: "siem-events".to_string(),
        transformed_topic: "siem-events".to_string(),
        timezone: "UTC".to_string(),
        index_prefix: "test".to_string(),
        flink_sql_gateway: format!("http://{}", gw_addr),
        flink_rest_api: format!("http://{}", gw_addr),
        alert_topic: "cep-alerts".to_string(),
        dashboard_url: "http://127.0.0.1:1".to_string(),
        health_warn_mb: 256.0,
        health_crit_mb: 512.0,
    };
    let search = SearchClient::new(&cfg.opensearch_url);
    let store = RuleStore::new(search, &cfg.index_prefix);
    let reconciler = Reconciler::new(Arc::new(FlinkSession::new(&cfg)), store);

    let summary = reconciler.reconcile().await.expect("reconcile");
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.submitted, 0);

    let m = mock.lock().unwrap();
    let (id, doc) = m.updates.last().unwrap();
    assert_eq!(id, "rz");
    assert_eq!(doc["jobStatus"], "FAILED");
    assert!(doc["jobId"].is_null());
}
