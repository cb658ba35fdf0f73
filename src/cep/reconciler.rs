//! CEP job reconciler. Converges the set of running streaming jobs to the
//! rule catalogue: every enabled CEP rule gets exactly one `CEP: <name>` job,
//! every `CEP: *` job without a backing rule is cancelled. Reconcile is
//! idempotent — an unchanged catalogue submits nothing and cancels nothing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::rules::store::{RuleFilter, RuleStore};
use crate::rules::{sql, Rule};

use super::flink::FlinkSession;

pub const JOB_NAME_PREFIX: &str = "CEP: ";

const SUBMIT_POLLS: usize = 6;
const CANCEL_POLLS: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileSummary {
    pub submitted: usize,
    pub cancelled: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct Reconciler {
    flink: Arc<FlinkSession>,
    rules: RuleStore,
    /// ruleId → jobId for jobs this process submitted.
    jobs: RwLock<HashMap<String, String>>,
    /// Submission is serialised: `SET 'pipeline.name'` is session-global.
    lock: Mutex<()>,
}

pub fn job_name(rule_name: &str) -> String {
    format!("{}{}", JOB_NAME_PREFIX, rule_name)
}

impl Reconciler {
    pub fn new(flink: Arc<FlinkSession>, rules: RuleStore) -> Self {
        Reconciler {
            flink,
            rules,
            jobs: RwLock::new(HashMap::new()),
            lock: Mutex::new(()),
        }
    }

    pub async fn tracked_jobs(&self) -> HashMap<String, String> {
        self.jobs.read().await.clone()
    }

    /// Full reconcile pass. Cancellation happens before submission so a
    /// renamed rule never runs twice.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let _guard = self.lock.lock().await;
        self.flink.ensure_session().await?;

        let desired_rules = self.rules.list(RuleFilter::CepActive).await?;
        let desired: HashMap<String, &Rule> = desired_rules
            .iter()
            .map(|r| (job_name(&r.name), r))
            .collect();

        let live: HashMap<String, String> = self
            .flink
            .running_jobs()
            .await?
            .into_iter()
            .filter(|(name, _)| name.starts_with(JOB_NAME_PREFIX))
            .collect();

        let mut summary = ReconcileSummary::default();

        // 1) cancel stale jobs
        let mut cancelling = Vec::new();
        for (name, jid) in &live {
            if desired.contains_key(name) {
                continue;
            }
            match self.flink.cancel_job(jid).await {
                Ok(()) => {
                    info!(job = %name, jid = %jid, "cancelled stale CEP job");
                    cancelling.push(jid.clone());
                    summary.cancelled += 1;
                }
                // next reload retries
                Err(e) => warn!(job = %name, "cancel failed: {}", e),
            }
        }
        if !cancelling.is_empty() {
            self.wait_for_cancelled(&cancelling).await;
        }
        self.jobs
            .write()
            .await
            .retain(|_, jid| !cancelling.contains(jid));

        // 2) submit missing rules
        for (name, rule) in &desired {
            if let Some(jid) = live.get(name) {
                summary.unchanged += 1;
                self.jobs
                    .write()
                    .await
                    .insert(rule.id.clone(), jid.clone());
                continue;
            }
            match self.submit_locked(rule).await {
                Ok(jid) => {
                    summary.submitted += 1;
                    self.persist_job_state(&rule.id, jid.as_deref(), job_status(&jid))
                        .await;
                }
                Err(e) => {
                    error!(rule = %rule.name, "submission failed: {}", e);
                    summary.failed += 1;
                    self.persist_job_state(&rule.id, None, "FAILED").await;
                }
            }
        }

        info!(
            submitted = summary.submitted,
            cancelled = summary.cancelled,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "reconcile complete"
        );
        Ok(summary)
    }

    /// Single-rule submit used by create/update: a reconcile of one element.
    pub async fn submit_rule(&self, rule: &Rule) -> Result<Option<String>> {
        let select = sql::build_sql(rule);
        self.submit_sql(&rule.id, &rule.name, rule.severity.as_str(), &select)
            .await
    }

    /// Same as [`submit_rule`] but from an already-compiled SELECT; used by
    /// the `/api/submit` endpoint which accepts raw SQL.
    pub async fn submit_sql(
        &self,
        rule_id: &str,
        rule_name: &str,
        severity: &str,
        select_sql: &str,
    ) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        self.flink.ensure_session().await?;

        if let Some(prior) = self.jobs.write().await.remove(rule_id) {
            if let Err(e) = self.flink.cancel_job(&prior).await {
                warn!(rule = %rule_id, "cancel of prior job failed: {}", e);
            } else {
                self.wait_for_cancelled(std::slice::from_ref(&prior)).await;
            }
        }

        match self
            .submit_locked_sql(rule_id, rule_name, severity, select_sql)
            .await
        {
            Ok(jid) => {
                self.persist_job_state(rule_id, jid.as_deref(), job_status(&jid))
                    .await;
                Ok(jid)
            }
            Err(e) => {
                self.persist_job_state(rule_id, None, "FAILED").await;
                Err(e)
            }
        }
    }

    /// Cancel a rule's tracked job, e.g. on delete or disable. Returns
    /// whether a cancellation was issued.
    pub async fn cancel_rule(&self, rule_id: &str) -> bool {
        let Some(jid) = self.jobs.write().await.remove(rule_id) else {
            return false;
        };
        match self.flink.cancel_job(&jid).await {
            Ok(()) => {
                info!(rule = %rule_id, jid = %jid, "job cancelled");
                true
            }
            Err(e) => {
                warn!(rule = %rule_id, "cancel failed: {}", e);
                false
            }
        }
    }

    /// Caller holds `self.lock`. Sets the pipeline name, runs the INSERT and
    /// polls for the new RUNNING job with the matching name.
    async fn submit_locked(&self, rule: &Rule) -> Result<Option<String>> {
        let select = sql::build_sql(rule);
        self.submit_locked_sql(&rule.id, &rule.name, rule.severity.as_str(), &select)
            .await
    }

    async fn submit_locked_sql(
        &self,
        rule_id: &str,
        rule_name: &str,
        severity: &str,
        select_sql: &str,
    ) -> Result<Option<String>> {
        let insert = sql::build_insert(rule_id, rule_name, severity, select_sql);
        let wanted = job_name(rule_name);

        let before: HashSet<String> = self
            .flink
            .running_jobs()
            .await
            .unwrap_or_default()
            .into_values()
            .collect();

        self.flink
            .exec_sql(&format!(
                "SET 'pipeline.name' = '{}'",
                sql::escape_sql_value(&wanted)
            ))
            .await?;
        self.flink.exec_sql(&insert).await?;

        for _ in 0..SUBMIT_POLLS {
            sleep(POLL_INTERVAL).await;
            let Ok(running) = self.flink.running_jobs().await else {
                continue;
            };
            if let Some(jid) = running
                .iter()
                .find(|(name, jid)| **name == wanted && !before.contains(*jid))
                .map(|(_, jid)| jid.clone())
            {
                self.jobs
                    .write()
                    .await
                    .insert(rule_id.to_string(), jid.clone());
                info!(rule = %rule_name, jid = %jid, "rule submitted");
                return Ok(Some(jid));
            }
        }
        warn!(rule = %rule_name, "submitted but job id not confirmed");
        Ok(None)
    }

    /// Wait for cancelled job ids to drain from the running set, bounded at
    /// 10 s so a wedged cancel cannot stall the reconcile.
    async fn wait_for_cancelled(&self, jids: &[String]) {
        for _ in 0..CANCEL_POLLS {
            sleep(POLL_INTERVAL).await;
            match self.flink.running_jobs().await {
                Ok(running) => {
                    let still: HashSet<&String> = running.values().collect();
                    if jids.iter().all(|j| !still.contains(j)) {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
        warn!("cancelled jobs still draining after 10s");
    }

    async fn persist_job_state(&self, rule_id: &str, job_id: Option<&str>, status: &str) {
        if let Err(e) = self.rules.set_job_state(rule_id, job_id, status).await {
            warn!(rule = %rule_id, "failed to persist job state: {}", e);
        }
    }
}

fn job_status(jid: &Option<String>) -> &'static str {
    if jid.is_some() {
        "RUNNING"
    } else {
        "SUBMITTED"
    }
}
