//! Crawl engine (C6): the alternative extraction path for servers that
//! don't support (or shouldn't be asked for) bulk export — per-patient
//! paginated search, walked through the bounded concurrent processor (C4).
//!
//! Grounded in `original_source/smart_fetch/crawl_utils.py`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::bulk::{BulkExportLogWriter, CLIENT_NAME, CLIENT_VERSION};
use crate::client::FhirClient;
use crate::concurrency::{default_peek_at, run_bounded};
use crate::error::ClientError;
use crate::ndjson::NdjsonWriter;
use crate::resources;
use crate::timing;

/// Per-type maximum "updated"/"created" timestamp seen so far, tracked while
/// crawling so the run's done-timestamp can be capped at `min(crawl_start,
/// max_seen)` — this guarantees the next incremental export won't miss
/// records created mid-crawl, at the cost of some re-fetch.
#[derive(Default)]
pub struct TransactionTimes {
    max_seen: Mutex<BTreeMap<String, chrono::DateTime<chrono::Utc>>>,
}

impl TransactionTimes {
    pub fn update(&self, res_type: &str, resource: &Value, crawl_start: chrono::DateTime<chrono::Utc>) {
        let candidates = [resources::get_updated_date(resource), resources::get_created_date(resource)];
        let mut guard = self.max_seen.lock().unwrap();
        for candidate in candidates.into_iter().flatten() {
            let Some(parsed) = crate::timing::parse_datetime(Some(&candidate)) else { continue };
            if parsed > crawl_start {
                // Future-dated values are typos; ignore them.
                continue;
            }
            let entry = guard.entry(res_type.to_string()).or_insert(parsed);
            if parsed > *entry {
                *entry = parsed;
            }
        }
    }

    /// Final done-timestamp for `res_type`: `min(crawl_start, max_seen)`.
    pub fn done_timestamp(&self, res_type: &str, crawl_start: chrono::DateTime<chrono::Utc>) -> String {
        let guard = self.max_seen.lock().unwrap();
        let max_seen = guard.get(res_type).copied().unwrap_or(crawl_start);
        max_seen.min(crawl_start).to_rfc3339()
    }
}

/// Per-type ID pool, only allocated for types with >= 2 OR-ed filter
/// entries (where duplicates across filter entries can actually occur).
pub struct IdPool {
    seen: Mutex<HashSet<(String, String)>>,
}

impl IdPool {
    pub fn new() -> Self {
        Self { seen: Mutex::new(HashSet::new()) }
    }

    /// Returns true if this is the first time we've seen `(type, id)`.
    pub fn insert(&self, res_type: &str, id: &str) -> bool {
        self.seen.lock().unwrap().insert((res_type.to_string(), id.to_string()))
    }
}

pub fn needs_id_pool(params: &std::collections::BTreeSet<String>) -> bool {
    params.len() >= 2
}

/// Produces one search URL per `(patient_id, param-set entry)` pair for a
/// non-Patient type. An empty parameter set yields `Type?patient=ID`.
pub fn resource_urls(base: &str, res_type: &str, patient_id: &str, params: &std::collections::BTreeSet<String>) -> Vec<String> {
    let base = base.trim_end_matches('/');
    if params.is_empty() {
        return vec![format!("{base}/{res_type}?patient={patient_id}")];
    }
    params
        .iter()
        .map(|p| format!("{base}/{res_type}?patient={patient_id}&{p}"))
        .collect()
}

/// Partitions patient IDs into URLs with the since-derived param (known
/// patients — only need what's new) vs. without it (new patients — need
/// full history), per spec.md §4.6 "New-patient handling".
pub fn resource_urls_with_new_patients(
    base: &str,
    res_type: &str,
    params: &std::collections::BTreeSet<String>,
    known_patients: &[String],
    new_patients: &[String],
    since_param: Option<&str>,
) -> Vec<String> {
    let mut urls = Vec::new();
    for pid in new_patients {
        urls.extend(resource_urls(base, res_type, pid, params));
    }
    for pid in known_patients {
        if let Some(since_param) = since_param {
            let mut augmented = params.clone();
            if augmented.is_empty() {
                augmented.insert(since_param.to_string());
            } else {
                augmented = augmented.iter().map(|p| format!("{p}&{since_param}")).collect();
            }
            urls.extend(resource_urls(base, res_type, pid, &augmented));
        } else {
            urls.extend(resource_urls(base, res_type, pid, params));
        }
    }
    urls
}

/// Walks a single URL's Bundle page chain, yielding each `entry[*].resource`.
/// `OperationOutcome`s (real or synthesized from a network error) are routed
/// to the error sink instead of the main callback.
pub async fn crawl_bundle_chain<F>(
    client: &FhirClient,
    start_url: &str,
    mut on_resource: F,
    error_writer: &mut NdjsonWriter,
) -> Result<(), ClientError>
where
    F: FnMut(Value),
{
    let mut next_url = Some(start_url.to_string());
    while let Some(url) = next_url.take() {
        let bundle = match client.search(&url).await {
            Ok(b) => b,
            Err(err) => {
                let outcome = json!({
                    "resourceType": "OperationOutcome",
                    "issue": [{
                        "severity": "error",
                        "code": "transient",
                        "diagnostics": err.message(),
                    }],
                });
                error_writer
                    .write(&outcome)
                    .await
                    .map_err(|e| ClientError::Fatal(e.to_string()))?;
                return Ok(());
            }
        };

        for entry in bundle.get("entry").and_then(|v| v.as_array()).into_iter().flatten() {
            let Some(resource) = entry.get("resource") else { continue };
            if resource.get("resourceType").and_then(|v| v.as_str()) == Some(resources::OPERATION_OUTCOME) {
                error_writer
                    .write(resource)
                    .await
                    .map_err(|e| ClientError::Fatal(e.to_string()))?;
                continue;
            }
            on_resource(resource.clone());
        }

        next_url = bundle
            .get("link")
            .and_then(|v| v.as_array())
            .and_then(|links| {
                links.iter().find(|l| l.get("relation").and_then(|r| r.as_str()) == Some("next"))
            })
            .and_then(|l| l.get("url"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
    }
    Ok(())
}

/// Runs the crawl for one resource type across all its generated URLs,
/// through the bounded concurrent processor, deduping via `id_pool` (only
/// present for types with >= 2 OR-ed filter entries) and tracking
/// transaction times.
pub async fn crawl_type(
    client: &FhirClient,
    res_type: &str,
    urls: Vec<String>,
    writer: Arc<tokio::sync::Mutex<NdjsonWriter>>,
    error_writer: Arc<tokio::sync::Mutex<NdjsonWriter>>,
    id_pool: Option<Arc<IdPool>>,
    transaction_times: Arc<TransactionTimes>,
    crawl_start: chrono::DateTime<chrono::Utc>,
) -> Result<(), ClientError> {
    let peek_at = default_peek_at(client.pool_size());
    let res_type_owned = res_type.to_string();
    run_bounded(
        peek_at,
        move |tx: tokio::sync::mpsc::Sender<String>| async move {
            for url in urls {
                if tx.send(url).await.is_err() {
                    break;
                }
            }
        },
        move |url: String| {
            let client = client.clone();
            let writer = writer.clone();
            let error_writer = error_writer.clone();
            let id_pool = id_pool.clone();
            let transaction_times = transaction_times.clone();
            let res_type = res_type_owned.clone();
            async move {
                let mut to_write: Vec<Value> = Vec::new();
                {
                    let mut err_guard = error_writer.lock().await;
                    crawl_bundle_chain(
                        &client,
                        &url,
                        |resource| {
                            let id = resource.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                            if let Some(pool) = &id_pool
                                && !pool.insert(&res_type, &id)
                            {
                                return;
                            }
                            transaction_times.update(&res_type, &resource, crawl_start);
                            to_write.push(resource);
                        },
                        &mut err_guard,
                    )
                    .await?;
                }

                // Writes happen inline and are joined here, so `crawl_type`
                // only returns once every resource it dispatched has actually
                // landed on disk (callers rely on this to safely unwrap the
                // writer's `Arc` afterward).
                let mut w = writer.lock().await;
                for resource in to_write {
                    w.write(&resource).await.map_err(|e| ClientError::Fatal(e.to_string()))?;
                }
                Ok(())
            }
        },
    )
    .await
}

/// Synthesizes a bulk-shaped `log.ndjson` for crawl output (a "fake" export
/// ID plus a single kickoff/status_complete pair) so downstream bulk-log
/// tooling works identically against crawl output.
pub async fn create_fake_log(dest: &Path, types: &[String], transaction_time: &str) -> Result<(), ClientError> {
    let fake_export_id = format!("crawl-{}", uuid::Uuid::new_v4());
    let mut log = BulkExportLogWriter::new(dest, &fake_export_id);
    let mut params = BTreeMap::new();
    params.insert("_type".to_string(), types.join(","));
    log.kickoff(&params).await?;
    log.status_complete(transaction_time).await?;
    log.close().await?;
    let _ = CLIENT_NAME;
    let _ = CLIENT_VERSION;
    let _ = timing::now();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn empty_params_yields_patient_only_query() {
        let urls = resource_urls("https://ehr.example.com", "Condition", "p1", &BTreeSet::new());
        assert_eq!(urls, vec!["https://ehr.example.com/Condition?patient=p1"]);
    }

    #[test]
    fn or_ed_params_each_produce_their_own_url() {
        let params: BTreeSet<String> = ["status=final".to_string(), "identifier=X".to_string()].into();
        let urls = resource_urls("https://ehr.example.com", "Observation", "p1", &params);
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn new_patients_never_receive_since_param() {
        let params = BTreeSet::new();
        let urls = resource_urls_with_new_patients(
            "https://ehr.example.com",
            "Condition",
            &params,
            &["known1".to_string()],
            &["new1".to_string()],
            Some("_lastUpdated=gt2022-01-01"),
        );
        assert!(urls.iter().any(|u| u.contains("new1") && !u.contains("_lastUpdated")));
        assert!(urls.iter().any(|u| u.contains("known1") && u.contains("_lastUpdated")));
    }

    #[test]
    fn id_pool_dedupes_type_and_id_pairs() {
        let pool = IdPool::new();
        assert!(pool.insert("Observation", "1"));
        assert!(!pool.insert("Observation", "1"));
        assert!(pool.insert("Observation", "2"));
    }

    #[test]
    fn needs_id_pool_only_for_multi_filter_types() {
        let one: BTreeSet<String> = ["a".to_string()].into();
        let two: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        assert!(!needs_id_pool(&one));
        assert!(needs_id_pool(&two));
    }

    #[test]
    fn transaction_time_ignores_future_dates() {
        let tt = TransactionTimes::default();
        let start = chrono::Utc::now();
        let future = json!({"meta": {"lastUpdated": (start + chrono::Duration::days(1)).to_rfc3339()}});
        tt.update("Patient", &future, start);
        assert_eq!(tt.done_timestamp("Patient", start), start.to_rfc3339());
    }

    #[test]
    fn transaction_time_caps_at_crawl_start() {
        let tt = TransactionTimes::default();
        let start = chrono::Utc::now();
        let past = json!({"meta": {"lastUpdated": (start - chrono::Duration::days(1)).to_rfc3339()}});
        tt.update("Patient", &past, start);
        let done = tt.done_timestamp("Patient", start);
        assert_ne!(done, start.to_rfc3339());
    }
}
