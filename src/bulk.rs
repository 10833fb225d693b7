//! Bulk export orchestrator (C5): kickoff → poll → download manifest →
//! stream files → delete, with resume, retry, and a 30-day cumulative
//! timeout.
//!
//! Grounded in `original_source/smart_fetch/bulk_utils.py` (`BulkExporter`,
//! `BulkExportLogWriter`, `combine_filters`, `_format_kickoff_url`), using
//! C4 ([`crate::concurrency`]) for the parallel manifest-file downloads and
//! C1 ([`crate::ndjson`]) for the per-file writers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use url::form_urlencoded;

use crate::client::{numbered_path, FhirClient, PollOutcome};
use crate::concurrency::{default_peek_at, run_bounded};
use crate::error::ClientError;
use crate::filtering::Filters;
use crate::metadata::OutputMetadata;
use crate::ndjson::NdjsonWriter;
use crate::timing;

/// Maximum cumulative wait for a bulk poll loop. Kept configurable per
/// spec.md §9's open question — 30 days is generous but explicit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const CLIENT_NAME: &str = "smart-fetch-rs";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Builds the `$export` kickoff URL query string. Each filter-set entry
/// becomes its own `_typeFilter` parameter (`Type?params`, percent-encoded,
/// with any comma *inside* params additionally quoted as `%2C` so it isn't
/// mistaken for a list separator — servers known to handle this correctly
/// include Epic, HAPI, and Kodjin). `_type` is collapsed to a single
/// comma-joined value since some servers (Cerner) don't support it repeated.
pub fn combine_filters(filters: &Filters) -> (String, Vec<String>) {
    let type_list = filters.keys().cloned().collect::<Vec<_>>().join(",");

    let mut type_filters = Vec::new();
    for (res_type, params) in filters {
        for p in params {
            let quoted_commas = p.replace(',', "%2C");
            let raw = format!("{res_type}?{quoted_commas}");
            let encoded: String = form_urlencoded::byte_serialize(raw.as_bytes()).collect();
            type_filters.push(encoded);
        }
    }

    (type_list, type_filters)
}

/// Appends `$export` if the base URL doesn't already end with it, and
/// attaches `_type`/`_typeFilter`/`_since` per [`combine_filters`].
pub fn kickoff_url(base: &str, group: Option<&str>, filters: &Filters, since: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let mut url = match group {
        Some(g) => format!("{base}/Group/{g}/$export"),
        None => format!("{base}/$export"),
    };
    if !url.ends_with("$export") {
        url.push_str("/$export");
    }

    let (type_list, type_filters) = combine_filters(filters);
    let mut query = vec![format!("_type={type_list}")];
    for tf in &type_filters {
        query.push(format!("_typeFilter={tf}"));
    }
    if let Some(since) = since {
        query.push(format!("_since={since}"));
    }

    url.push('?');
    url.push_str(&query.join("&"));
    url
}

#[derive(Debug, Serialize)]
struct LogEvent<'a> {
    #[serde(rename = "exportId")]
    export_id: &'a str,
    timestamp: String,
    #[serde(rename = "eventId")]
    event_id: &'a str,
    #[serde(rename = "eventDetail")]
    event_detail: Value,
}

/// Appends fixed-taxonomy events to `<dest>/log.ndjson`. Grounded in
/// `BulkExportLogWriter`.
pub struct BulkExportLogWriter {
    writer: NdjsonWriter,
    export_id: String,
}

impl BulkExportLogWriter {
    pub fn new(dest: &Path, export_id: impl Into<String>) -> Self {
        Self {
            writer: NdjsonWriter::new(dest.join("log.ndjson"), true),
            export_id: export_id.into(),
        }
    }

    async fn log(&mut self, event_id: &str, detail: Value) -> Result<(), ClientError> {
        let event = LogEvent {
            export_id: &self.export_id,
            timestamp: timing::now().to_rfc3339(),
            event_id,
            event_detail: detail,
        };
        let value = serde_json::to_value(&event).map_err(|e| ClientError::Fatal(e.to_string()))?;
        self.writer.write(&value).await.map_err(|e| ClientError::Fatal(e.to_string()))
    }

    /// `params` has already had `patient` stripped by the caller, per spec.
    pub async fn kickoff(&mut self, params: &BTreeMap<String, String>) -> Result<(), ClientError> {
        self.log(
            "kickoff",
            json!({
                "_client": CLIENT_NAME,
                "_clientVersion": CLIENT_VERSION,
                "request": params,
            }),
        )
        .await
    }

    pub async fn status_complete(&mut self, transaction_time: &str) -> Result<(), ClientError> {
        self.log("status_complete", json!({ "transactionTime": transaction_time })).await
    }

    pub async fn status_page_complete(&mut self, x_progress: Option<&str>) -> Result<(), ClientError> {
        self.log("status_page_complete", json!({ "xProgress": x_progress })).await
    }

    pub async fn manifest_complete(&mut self, file_count: usize) -> Result<(), ClientError> {
        self.log("manifest_complete", json!({ "fileCount": file_count })).await
    }

    pub async fn status_error(&mut self, message: &str) -> Result<(), ClientError> {
        self.log("status_error", json!({ "message": message })).await
    }

    pub async fn download_request(&mut self, url: &str) -> Result<(), ClientError> {
        self.log("download_request", json!({ "url": url })).await
    }

    pub async fn download_complete(&mut self, url: &str, resource_count: usize) -> Result<(), ClientError> {
        self.log("download_complete", json!({ "url": url, "resourceCount": resource_count })).await
    }

    pub async fn download_error(&mut self, url: &str, message: &str) -> Result<(), ClientError> {
        self.log("download_error", json!({ "url": url, "message": message })).await
    }

    pub async fn export_complete(&mut self, duration_s: f64) -> Result<(), ClientError> {
        self.log("export_complete", json!({ "duration": duration_s })).await
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.writer.close().await.map_err(|e| ClientError::Fatal(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestKind {
    Output,
    Error,
    Deleted,
}

impl ManifestKind {
    fn subdir(self) -> Option<&'static str> {
        match self {
            ManifestKind::Output => None,
            ManifestKind::Error => Some("error"),
            ManifestKind::Deleted => Some("deleted"),
        }
    }

    fn manifest_key(self) -> &'static str {
        match self {
            ManifestKind::Output => "output",
            ManifestKind::Error => "error",
            ManifestKind::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone)]
struct ManifestFile {
    res_type: String,
    url: String,
    kind: ManifestKind,
}

fn parse_manifest_files(manifest: &Value) -> Vec<ManifestFile> {
    let mut files = Vec::new();
    for kind in [ManifestKind::Output, ManifestKind::Error, ManifestKind::Deleted] {
        let Some(entries) = manifest.get(kind.manifest_key()).and_then(|v| v.as_array()) else {
            continue;
        };
        for entry in entries {
            let Some(url) = entry.get("url").and_then(|v| v.as_str()) else { continue };
            let res_type = entry
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("Bundle")
                .to_string();
            files.push(ManifestFile { res_type, url: url.to_string(), kind });
        }
    }
    files
}

/// Result of a completed bulk export: the destination directory now holds
/// the downloaded files, and `transaction_time` is the watermark to record
/// as `done` for each requested type.
pub struct BulkExportResult {
    pub transaction_time: String,
    pub had_fatal_errors: bool,
}

/// Runs the full kickoff→poll→download→delete state machine, resuming from
/// `metadata`'s stored bulk-status URL if one is present.
pub async fn run_bulk_export(
    client: &FhirClient,
    dest: &Path,
    base_url: &str,
    group: Option<&str>,
    filters: &Filters,
    since: Option<&str>,
    metadata: &mut OutputMetadata,
    timeout: Duration,
) -> Result<BulkExportResult, ClientError> {
    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| ClientError::Fatal(e.to_string()))?;

    let status_url = match metadata.get_bulk_status_url() {
        Some(url) => url.to_string(),
        None => {
            let url = kickoff_url(base_url, group, filters, since);
            let status_url = client.bulk_kickoff(&url).await?;
            metadata
                .set_bulk_status_url(Some(&status_url))
                .await
                .map_err(|e| ClientError::Fatal(e.to_string()))?;

            let mut log = BulkExportLogWriter::new(dest, &status_url);
            let mut params: BTreeMap<String, String> = BTreeMap::new();
            let (type_list, _) = combine_filters(filters);
            params.insert("_type".to_string(), type_list);
            if let Some(since) = since {
                params.insert("_since".to_string(), since.to_string());
            }
            // `patient` is explicitly stripped from logged kickoff params.
            params.remove("patient");
            log.kickoff(&params).await?;
            log.close().await?;

            status_url
        }
    };

    let mut log = BulkExportLogWriter::new(dest, &status_url);
    let start = tokio::time::Instant::now();
    let manifest = loop {
        if start.elapsed() > timeout {
            log.status_error("bulk export poll timed out").await?;
            log.close().await?;
            return Err(ClientError::Fatal("bulk export poll exceeded timeout".to_string()));
        }
        match client.bulk_poll(&status_url).await {
            Ok(PollOutcome::Manifest(manifest)) => break manifest,
            Ok(PollOutcome::KeepWaiting { retry_after, x_progress }) => {
                log.status_page_complete(x_progress.as_deref()).await?;
                tokio::time::sleep(retry_after).await;
            }
            Err(err) => {
                log.status_error(err.message()).await?;
                log.close().await?;
                return Err(err);
            }
        }
    };

    let transaction_time = manifest
        .get("transactionTime")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| timing::now().to_rfc3339());
    log.status_complete(&transaction_time).await?;

    let files = parse_manifest_files(&manifest);
    log.manifest_complete(files.len()).await?;

    let peek_at = default_peek_at(client.pool_size());
    let mut counters: BTreeMap<(String, ManifestKind), usize> = BTreeMap::new();
    let indices: Vec<usize> = (0..files.len())
        .map(|i| {
            let key = (files[i].res_type.clone(), files[i].kind);
            let next = counters.entry(key).or_insert(0);
            *next += 1;
            *next
        })
        .collect();

    let dest_owned = dest.to_path_buf();
    let status_url_for_log = status_url.clone();
    let client_for_workers = client.clone();
    let outcome = run_bounded(
        peek_at,
        move |tx: tokio::sync::mpsc::Sender<(ManifestFile, usize)>| async move {
            for (file, index) in files.into_iter().zip(indices) {
                if tx.send((file, index)).await.is_err() {
                    break;
                }
            }
        },
        move |(file, index): (ManifestFile, usize)| {
            let client = client_for_workers.clone();
            let dest = dest_owned.clone();
            async move { download_one(&client, &file, index, &dest).await }
        },
    )
    .await;

    log.close().await?;
    let mut log = BulkExportLogWriter::new(dest, &status_url_for_log);

    let had_fatal_errors = outcome.is_err();
    if let Err(err) = &outcome {
        log.status_error(err.message()).await?;
    }

    // Courtesy DELETE regardless of download outcome: non-fatal if it fails.
    let _ = client.delete(&status_url).await;
    metadata
        .set_bulk_status_url(None)
        .await
        .map_err(|e| ClientError::Fatal(e.to_string()))?;

    let had_fatal_errors = had_fatal_errors || scan_error_folder_for_fatal(dest).await;

    let elapsed = start.elapsed().as_secs_f64();
    log.export_complete(elapsed).await?;
    log.close().await?;

    if let Err(err) = outcome {
        return Err(err);
    }

    Ok(BulkExportResult { transaction_time, had_fatal_errors })
}

async fn download_one(
    client: &FhirClient,
    file: &ManifestFile,
    index: usize,
    dest: &Path,
) -> Result<(), ClientError> {
    let subdir = match file.kind.subdir() {
        Some(sub) => {
            let dir = dest.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ClientError::Fatal(e.to_string()))?;
            dir
        }
        None => dest.to_path_buf(),
    };
    let path = numbered_path(&subdir, &file.res_type, index, true);
    let mut writer = NdjsonWriter::new(&path, false);
    client.download_to(&file.url, &mut writer).await?;
    writer.close().await.map_err(|e| ClientError::Fatal(e.to_string()))?;
    Ok(())
}

/// Scans `<dest>/error/OperationOutcome*.ndjson[.gz]` for any issue with
/// severity `fatal` or `error`; non-fatal issues are left logged but don't
/// fail the run.
async fn scan_error_folder_for_fatal(dest: &Path) -> bool {
    let error_dir = dest.join("error");
    let Ok(mut entries) = tokio::fs::read_dir(&error_dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(count) = crate::ndjson::read_local_line_count(&path).await else { continue };
        if count == 0 {
            continue;
        }
        let Ok(raw) = tokio::fs::read(&path).await else { continue };
        let bytes = if path.extension().is_some_and(|e| e == "gz") {
            use std::io::Read;
            let mut out = Vec::new();
            if flate2::read::GzDecoder::new(&raw[..]).read_to_end(&mut out).is_err() {
                continue;
            }
            out
        } else {
            raw
        };
        for line in bytes.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_slice::<Value>(line) else { continue };
            if let Some(issues) = value.get("issue").and_then(|v| v.as_array()) {
                for issue in issues {
                    if matches!(issue.get("severity").and_then(|v| v.as_str()), Some("fatal") | Some("error")) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn filters_of(pairs: &[(&str, &[&str])]) -> Filters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>()))
            .collect()
    }

    #[test]
    fn type_list_is_comma_joined() {
        let filters = filters_of(&[("Patient", &[]), ("Device", &[])]);
        let (type_list, _) = combine_filters(&filters);
        assert_eq!(type_list, "Device,Patient");
    }

    #[test]
    fn inner_commas_are_percent_encoded_before_urlencoding() {
        let filters = filters_of(&[("Observation", &["category=laboratory,vital-signs"])]);
        let (_, type_filters) = combine_filters(&filters);
        assert_eq!(type_filters.len(), 1);
        // The inner comma became %2C before the whole string was urlencoded,
        // so the percent sign itself gets re-encoded to %25.
        assert!(type_filters[0].contains("%252C"));
    }

    #[test]
    fn multiple_or_ed_filters_become_separate_typefilter_entries() {
        let filters = filters_of(&[("Observation", &["status=final", "status=amended"])]);
        let (_, type_filters) = combine_filters(&filters);
        assert_eq!(type_filters.len(), 2);
    }

    #[test]
    fn kickoff_url_appends_export_and_since() {
        let filters = filters_of(&[("Device", &[])]);
        let url = kickoff_url("https://ehr.example.com/api/FHIR/R4", None, &filters, Some("2022-03-23"));
        assert!(url.starts_with("https://ehr.example.com/api/FHIR/R4/$export?"));
        assert!(url.contains("_type=Device"));
        assert!(url.contains("_since=2022-03-23"));
    }

    #[test]
    fn kickoff_url_uses_group_path_when_given() {
        let filters = filters_of(&[("Patient", &[])]);
        let url = kickoff_url("https://ehr.example.com", Some("abc123"), &filters, None);
        assert!(url.starts_with("https://ehr.example.com/Group/abc123/$export?"));
    }

    #[test]
    fn manifest_files_default_to_bundle_type_for_deleted() {
        let manifest = json!({
            "output": [{"type": "Patient", "url": "http://x/Patient1.ndjson"}],
            "error": [{"type": "OperationOutcome", "url": "http://x/err1.ndjson"}],
            "deleted": [{"url": "http://x/del1.ndjson"}],
        });
        let files = parse_manifest_files(&manifest);
        assert_eq!(files.len(), 3);
        let deleted = files.iter().find(|f| f.kind == ManifestKind::Deleted).unwrap();
        assert_eq!(deleted.res_type, "Bundle");
    }
}
