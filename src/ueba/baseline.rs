//! Baseline computation: once per local day, mean and population σ of daily
//! event counts per (user, msgId) over the last `baseline_window_days`
//! complete days. Freshness is tracked by an `updated_at` marker document so
//! a restart does not recompute.

use serde_json::json;
use tracing::{info, warn};

use crate::indices;

use super::scorer::Scorer;
use super::state::Baseline;

pub fn mean_stddev(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    (mean, variance.sqrt())
}

impl Scorer {
    /// Skip recomputation when the marker says baselines already cover
    /// yesterday; otherwise recompute and stamp the marker.
    pub async fn ensure_baselines_fresh(&self) {
        let today = self.clock.today();
        let index = indices::settings_index(&self.cfg.index_prefix);
        if let Ok(Some(meta)) = self.search.get_doc(&index, "baseline_meta").await {
            if meta.get("updated_at").and_then(|v| v.as_str()) == Some(today.as_str()) {
                info!("baselines fresh for {}", today);
                return;
            }
        }
        info!("baselines stale, recomputing");
        self.update_baselines().await;
        self.mark_baselines_fresh().await;
    }

    pub async fn mark_baselines_fresh(&self) {
        let index = indices::settings_index(&self.cfg.index_prefix);
        let meta = json!({ "updated_at": self.clock.today() });
        if let Err(e) = self.search.put_doc(&index, "baseline_meta", &meta).await {
            warn!("baseline marker write failed: {}", e);
        }
    }

    /// Recompute every (user, msgId) baseline from the event-log indices and
    /// bulk-save the results, refreshing the in-memory map as we go.
    pub async fn update_baselines(&self) {
        let cfg = self.load_scoring_config().await;
        let window = cfg.anomaly.baseline_window_days.max(1);
        let start = self.clock.day_offset(-window);
        let yesterday = self.clock.day_offset(-1);

        let body = json!({
            "size": 0,
            "query": { "range": { "@timestamp": { "gte": start, "lte": yesterday } } },
            "aggs": { "by_user": {
                "terms": { "field": "cefExtensions.suid.keyword", "size": 100000 },
                "aggs": { "by_msg": {
                    "terms": { "field": "msgId.keyword", "size": 50 },
                    "aggs": { "daily": {
                        "date_histogram": { "field": "@timestamp", "calendar_interval": "day" }
                    }},
                }},
            }},
        });

        let index = indices::logs_index_pattern(&self.cfg.index_prefix);
        let result = match self.search.search_raw(&index, &body).await {
            Ok(r) => r,
            Err(e) => {
                warn!("baseline aggregation failed: {}", e);
                return;
            }
        };

        let baselines_index = indices::baselines_index(&self.cfg.index_prefix);
        let mut bulk = String::new();
        let mut count = 0usize;

        let user_buckets = result["aggregations"]["by_user"]["buckets"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut map = self.baselines.write().await;
        for ub in &user_buckets {
            let Some(user) = ub["key"].as_str() else { continue };
            let msg_buckets = ub["by_msg"]["buckets"].as_array().cloned().unwrap_or_default();
            for mb in &msg_buckets {
                let Some(msg_id) = mb["key"].as_str() else { continue };
                let counts: Vec<f64> = mb["daily"]["buckets"]
                    .as_array()
                    .map(|days| {
                        days.iter()
                            .filter_map(|d| d["doc_count"].as_f64())
                            .collect()
                    })
                    .unwrap_or_default();
                if counts.is_empty() {
                    continue;
                }
                let (mean, stddev) = mean_stddev(&counts);
                let baseline = Baseline {
                    mean,
                    stddev,
                    sample_days: counts.len() as i64,
                };
                let key = format!("{}_{}", user, msg_id);
                bulk.push_str(&format!(
                    "{{\"index\":{{\"_index\":\"{}\",\"_id\":\"{}\"}}}}\n",
                    baselines_index, key
                ));
                bulk.push_str(&serde_json::to_string(&baseline).unwrap_or_default());
                bulk.push('\n');
                map.insert(key, baseline);
                count += 1;
            }
        }
        drop(map);

        if !bulk.is_empty() {
            if let Err(e) = self.search.bulk(bulk).await {
                warn!("baseline bulk save failed: {}", e);
            }
        }
        info!("updated {} baselines", count);
    }
}
