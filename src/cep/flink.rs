//! Streaming-SQL session manager. Owns the single long-lived session against
//! the SQL gateway: lazy creation, input/output table DDL, statement
//! execution with a one-shot rebuild when the gateway forgets the session.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{EngineError, Result};

#[derive(Debug, Default)]
struct SessionState {
    id: Option<String>,
    ddl_applied: bool,
}

#[derive(Debug)]
pub struct FlinkSession {
    gateway_url: String,
    rest_url: String,
    kafka_bootstrap: String,
    alert_topic: String,
    group_id: String,
    event_topics: String,
    client: reqwest::Client,
    state: Mutex<SessionState>,
}

#[derive(Debug, Clone)]
pub struct JobOverview {
    pub jid: String,
    pub name: String,
    pub state: String,
}

impl FlinkSession {
    pub fn new(cfg: &Config) -> Self {
        FlinkSession {
            gateway_url: cfg.flink_sql_gateway.trim_end_matches('/').to_string(),
            rest_url: cfg.flink_rest_api.trim_end_matches('/').to_string(),
            kafka_bootstrap: cfg.kafka_bootstrap.clone(),
            alert_topic: cfg.alert_topic.clone(),
            group_id: cfg.kafka_group_id.clone(),
            event_topics: cfg.kafka_event_topics.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            state: Mutex::new(SessionState::default()),
        }
    }

    fn events_ddl(&self) -> String {
        // Flink separates multiple topics with semicolons.
        let topics = self.event_topics.replace(',', ";");
        format!(
            "CREATE TABLE IF NOT EXISTS events (\
             \x20 msgId STRING, hostname STRING,\
             \x20 cefExtensions MAP<STRING, STRING>,\
             \x20 userId AS cefExtensions['suid'],\
             \x20 userName AS cefExtensions['suser'],\
             \x20 userIp AS cefExtensions['src'],\
             \x20 proctime AS PROCTIME()\
             ) WITH (\
             \x20 'connector' = 'kafka',\
             \x20 'topic' = '{}',\
             \x20 'properties.bootstrap.servers' = '{}',\
             \x20 'properties.group.id' = '{}',\
             \x20 'scan.startup.mode' = 'latest-offset',\
             \x20 'format' = 'json',\
             \x20 'json.fail-on-missing-field' = 'false',\
             \x20 'json.ignore-parse-errors' = 'true'\
             )",
            topics, self.kafka_bootstrap, self.group_id
        )
    }

    fn alerts_ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS alerts (\
             \x20 ruleId STRING, ruleName STRING, severity STRING, userId STRING,\
             \x20 hostname STRING, userIp STRING, cnt BIGINT, ts TIMESTAMP(3)\
             ) WITH (\
             \x20 'connector' = 'kafka',\
             \x20 'topic' = '{}',\
             \x20 'properties.bootstrap.servers' = '{}',\
             \x20 'format' = 'json'\
             )",
            self.alert_topic, self.kafka_bootstrap
        )
    }

    async fn open_session(&self) -> Result<String> {
        let url = format!("{}/v1/sessions", self.gateway_url);
        let resp = self.client.post(&url).json(&json!({})).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::sql_gateway(format!(
                "session create failed: {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let handle = body
            .get("sessionHandle")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::sql_gateway("no sessionHandle in response"))?
            .to_string();
        info!(session = %handle, "SQL gateway session opened");
        Ok(handle)
    }

    /// Lazily create the session and apply the input/output DDL. Cheap when
    /// already established.
    pub async fn ensure_session(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if state.id.is_none() {
            state.id = Some(self.open_session().await?);
            state.ddl_applied = false;
        }
        let sid = state.id.clone().unwrap();
        if !state.ddl_applied {
            self.statement(&sid, &self.events_ddl()).await?;
            self.statement(&sid, &self.alerts_ddl()).await?;
            state.ddl_applied = true;
            info!("events/alerts tables created");
        }
        Ok(sid)
    }

    /// One statement against a known session. Distinguishes session expiry
    /// from other failures so the caller can rebuild.
    async fn statement(&self, session_id: &str, sql: &str) -> Result<Value> {
        let flat = sql.replace('\n', " ");
        let url = format!("{}/v1/sessions/{}/statements", self.gateway_url, session_id);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "statement": flat }))
            .send()
            .await?;
        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND || raw.contains("does not exist") {
            return Err(EngineError::SessionExpired);
        }
        let body: Value = serde_json::from_str(&raw).unwrap_or_else(|_| json!({}));
        if let Some(errs) = body.get("errors") {
            return Err(EngineError::sql_gateway(format!("statement failed: {}", errs)));
        }
        Ok(body)
    }

    /// Execute a statement, rebuilding the session and retrying once when it
    /// expired underneath us. A second failure surfaces to the caller.
    pub async fn exec_sql(&self, sql: &str) -> Result<Value> {
        let sid = self.ensure_session().await?;
        match self.statement(&sid, sql).await {
            Err(EngineError::SessionExpired) => {
                warn!("SQL session expired, rebuilding");
                {
                    let mut state = self.state.lock().await;
                    state.id = None;
                    state.ddl_applied = false;
                }
                let sid = self.ensure_session().await?;
                self.statement(&sid, sql).await
            }
            other => other,
        }
    }

    /// Live job overview from the engine's REST API.
    pub async fn jobs_overview(&self) -> Result<Vec<JobOverview>> {
        let url = format!("{}/jobs/overview", self.rest_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::sql_gateway(format!(
                "jobs overview failed: {}",
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        let jobs = body
            .get("jobs")
            .and_then(|j| j.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(jobs
            .iter()
            .map(|j| JobOverview {
                jid: j.get("jid").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                name: j.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                state: j.get("state").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            })
            .collect())
    }

    /// RUNNING jobs as name → jid.
    pub async fn running_jobs(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .jobs_overview()
            .await?
            .into_iter()
            .filter(|j| j.state == "RUNNING")
            .map(|j| (j.name, j.jid))
            .collect())
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/jobs/{}?mode=cancel", self.rest_url, job_id);
        let resp = self.client.patch(&url).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::sql_gateway(format!(
                "cancel of {} failed: {}",
                job_id,
                resp.status()
            )));
        }
        Ok(())
    }
}
