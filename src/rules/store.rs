//! Rule catalogue persistence. The catalogue is shared across processes via
//! the search engine; each process caches a snapshot and reloads on demand.

use serde_json::{json, Value};

use crate::error::Result;
use crate::indices;
use crate::search::SearchClient;

use super::Rule;

const MAX_RULES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFilter {
    All,
    /// `cep.enabled`, regardless of the master toggle (control-plane listing).
    CepAny,
    /// `enabled ∧ cep.enabled` (reconciler's desired set).
    CepActive,
    /// `enabled ∧ ueba.enabled` (scorer's working set).
    UebaActive,
    /// `ueba.enabled` (settings/weights listing).
    UebaAny,
}

impl RuleFilter {
    fn query(&self) -> Value {
        match self {
            RuleFilter::All => json!({ "match_all": {} }),
            RuleFilter::CepAny => json!({ "term": { "cep.enabled": true } }),
            RuleFilter::UebaAny => json!({ "term": { "ueba.enabled": true } }),
            RuleFilter::CepActive => json!({ "bool": { "must": [
                { "term": { "enabled": true } },
                { "term": { "cep.enabled": true } },
            ]}}),
            RuleFilter::UebaActive => json!({ "bool": { "must": [
                { "term": { "enabled": true } },
                { "term": { "ueba.enabled": true } },
            ]}}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleStore {
    search: SearchClient,
    prefix: String,
}

impl RuleStore {
    pub fn new(search: SearchClient, prefix: &str) -> Self {
        RuleStore {
            search,
            prefix: prefix.to_string(),
        }
    }

    fn index(&self) -> String {
        indices::rules_index(&self.prefix)
    }

    /// Raw rule documents with `id` injected; kept raw so the control plane
    /// round-trips fields the typed model does not know about.
    pub async fn list_raw(&self, filter: RuleFilter) -> Result<Vec<Value>> {
        let body = json!({ "size": MAX_RULES, "query": filter.query() });
        let mut docs = self.search.search_hits(&self.index(), &body).await?;
        for doc in &mut docs {
            if let Some(obj) = doc.as_object_mut() {
                let id = obj.get("_id").cloned().unwrap_or_default();
                obj.insert("id".to_string(), id);
                obj.remove("_id");
            }
        }
        Ok(docs)
    }

    pub async fn list(&self, filter: RuleFilter) -> Result<Vec<Rule>> {
        let docs = self.list_raw(filter).await?;
        Ok(docs
            .iter()
            .filter_map(|doc| {
                let id = doc.get("id").and_then(|v| v.as_str()).unwrap_or_default();
                Rule::from_doc(id, doc)
            })
            .collect())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Value>> {
        self.search.get_doc(&self.index(), id).await
    }

    pub async fn put(&self, id: &str, doc: &Value) -> Result<()> {
        self.search.put_doc(&self.index(), id, doc).await?;
        self.search.refresh(&self.index()).await;
        Ok(())
    }

    pub async fn create(&self, doc: &Value) -> Result<String> {
        let id = self.search.post_doc(&self.index(), doc).await?;
        self.search.refresh(&self.index()).await;
        Ok(id)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.search.delete_doc(&self.index(), id).await?;
        self.search.refresh(&self.index()).await;
        Ok(())
    }

    pub async fn update_weight(&self, id: &str, weight: f64) -> Result<()> {
        self.search
            .update_doc(&self.index(), id, &json!({ "weight": weight }))
            .await
    }

    /// Reconciler bookkeeping: persist the job binding on the rule document.
    pub async fn set_job_state(&self, id: &str, job_id: Option<&str>, status: &str) -> Result<()> {
        self.search
            .update_doc(
                &self.index(),
                id,
                &json!({ "jobId": job_id, "jobStatus": status }),
            )
            .await
    }
}
