use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::error::{EngineError, Result};

/// Page size for composite-aggregation paging. A page shorter than this ends
/// the scan.
pub const COMPOSITE_PAGE_SIZE: usize = 1000;

/// Thin JSON-over-HTTP client for the search engine. Shared and reusable;
/// every call is bounded by the client-wide timeout.
#[derive(Debug, Clone)]
pub struct SearchClient {
    base: String,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        SearchClient {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Reachability probe used at startup. A failure here is fatal.
    pub async fn ping(&self) -> Result<()> {
        let resp = self.client.get(&self.base).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::search(format!(
                "search engine returned {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn search_raw(&self, index: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}/_search", self.base, index);
        let resp = self.client.post(&url).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(EngineError::search(format!(
                "search on {} failed: {}",
                index,
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }

    /// `_search` returning hit sources with the document id injected as `_id`.
    pub async fn search_hits(&self, index: &str, body: &Value) -> Result<Vec<Value>> {
        let result = self.search_raw(index, body).await?;
        let mut docs = Vec::new();
        if let Some(hits) = result
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(|h| h.as_array())
        {
            for hit in hits {
                if let Some(mut src) = hit.get("_source").cloned() {
                    if let (Some(obj), Some(id)) = (src.as_object_mut(), hit.get("_id")) {
                        obj.insert("_id".to_string(), id.clone());
                    }
                    docs.push(src);
                }
            }
        }
        Ok(docs)
    }

    /// `_doc/{id}` source, or None when the document does not exist.
    pub async fn get_doc(&self, index: &str, id: &str) -> Result<Option<Value>> {
        let url = format!("{}/{}/_doc/{}", self.base, index, id);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(EngineError::search(format!(
                "get {}/{} failed: {}",
                index,
                id,
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        Ok(body.get("_source").cloned())
    }

    pub async fn put_doc(&self, index: &str, id: &str, doc: &Value) -> Result<Value> {
        let url = format!("{}/{}/_doc/{}", self.base, index, id);
        let resp = self.client.put(&url).json(doc).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::search(format!("put {}/{} failed: {} {}", index, id, status, body)));
        }
        Ok(resp.json().await?)
    }

    /// Index a document with an engine-assigned id; returns the new `_id`.
    pub async fn post_doc(&self, index: &str, doc: &Value) -> Result<String> {
        let url = format!("{}/{}/_doc", self.base, index);
        let resp = self.client.post(&url).json(doc).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::search(format!("index into {} failed: {} {}", index, status, body)));
        }
        let body: Value = resp.json().await?;
        Ok(body
            .get("_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string())
    }

    /// Partial update via `_update` with a `doc` body.
    pub async fn update_doc(&self, index: &str, id: &str, partial: &Value) -> Result<()> {
        let url = format!("{}/{}/_update/{}", self.base, index, id);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "doc": partial }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::search(format!(
                "update {}/{} failed: {}",
                index,
                id,
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn delete_doc(&self, index: &str, id: &str) -> Result<()> {
        let url = format!("{}/{}/_doc/{}", self.base, index, id);
        let resp = self.client.delete(&url).send().await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::search(format!(
                "delete {}/{} failed: {}",
                index,
                id,
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn count(&self, index: &str, query: &Value) -> Result<u64> {
        let url = format!("{}/{}/_count", self.base, index);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "query": query }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::search(format!(
                "count on {} failed: {}",
                index,
                resp.status()
            )));
        }
        let body: Value = resp.json().await?;
        Ok(body.get("count").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    /// NDJSON `_bulk`. Item-level failures are logged, not surfaced; callers
    /// keep their dirty flags and retry on the next tick.
    pub async fn bulk(&self, body: String) -> Result<()> {
        let url = format!("{}/_bulk", self.base);
        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EngineError::search(format!("bulk failed: {}", resp.status())));
        }
        let result: Value = resp.json().await?;
        if result.get("errors").and_then(|v| v.as_bool()).unwrap_or(false) {
            warn!("bulk request completed with item errors");
        }
        Ok(())
    }

    /// Best-effort refresh after control-plane writes.
    pub async fn refresh(&self, index: &str) {
        let url = format!("{}/{}/_refresh", self.base, index);
        let _ = self.client.post(&url).send().await;
    }

    /// Composite aggregation with `after_key` paging. `sources` is the
    /// composite sources array; each returned bucket carries its `key`,
    /// `doc_count` and any sub-aggregation results. Paging stops at the
    /// first short page.
    pub async fn composite_agg(
        &self,
        index: &str,
        sources: Value,
        query: &Value,
        sub_aggs: Option<Value>,
    ) -> Result<Vec<Value>> {
        let mut buckets = Vec::new();
        let mut after_key: Option<Value> = None;

        loop {
            let mut composite = json!({
                "size": COMPOSITE_PAGE_SIZE,
                "sources": sources,
            });
            if let Some(after) = &after_key {
                composite["after"] = after.clone();
            }
            let mut agg = json!({ "composite": composite });
            if let Some(sub) = &sub_aggs {
                agg["aggs"] = sub.clone();
            }
            let body = json!({
                "size": 0,
                "query": query,
                "aggs": { "buckets": agg },
            });

            let result = self.search_raw(index, &body).await?;
            let agg_result = result
                .get("aggregations")
                .and_then(|a| a.get("buckets"))
                .cloned()
                .unwrap_or_default();
            let page = agg_result
                .get("buckets")
                .and_then(|b| b.as_array())
                .cloned()
                .unwrap_or_default();

            let page_len = page.len();
            buckets.extend(page);

            if page_len < COMPOSITE_PAGE_SIZE {
                break;
            }
            after_key = agg_result.get("after_key").cloned();
            if after_key.is_none() {
                break;
            }
        }
        Ok(buckets)
    }
}
