//! Metadata store (C2): typed, atomically-written per-folder state files.
//!
//! Backs a JSON document at `<folder>/.metadata`. All updates go through
//! read-modify-atomic-write (temp file + fsync + rename), so a reader never
//! observes a partially-written document (§9 "Atomic metadata updates").
//!
//! Grounded in `original_source/smart_fetch/lifecycle.py`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::filtering::{filters_covered_by, Filters, SinceMode};
use crate::timing;

const METADATA_VERSION: u32 = 1;
const FILE_NAME: &str = ".metadata";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid metadata JSON at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} is not a {1} folder")]
    KindMismatch(PathBuf, &'static str),
    #[error("{0}")]
    ContextMismatch(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputDoc {
    kind: String,
    timestamp: String,
    version: u32,
    #[serde(default)]
    filters: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    since: Option<String>,
    #[serde(default, rename = "sinceMode")]
    since_mode: Option<String>,
    #[serde(default)]
    done: BTreeMap<String, String>,
    #[serde(default, rename = "bulk-status")]
    bulk_status: Option<String>,
    #[serde(default, rename = "newPatients")]
    new_patients: Option<Vec<String>>,
    #[serde(default)]
    complete: Option<bool>,
}

impl Default for OutputDoc {
    fn default() -> Self {
        Self {
            kind: "output".to_string(),
            timestamp: timing::now().to_rfc3339(),
            version: METADATA_VERSION,
            filters: None,
            since: None,
            since_mode: None,
            done: BTreeMap::new(),
            bulk_status: None,
            new_patients: None,
            complete: None,
        }
    }
}

/// A single output subfolder's persisted state.
pub struct OutputMetadata {
    folder: PathBuf,
    doc: OutputDoc,
}

fn folder_name(folder: &Path) -> String {
    folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.display().to_string())
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), MetadataError> {
    let tmp = path.with_extension("metadata.tmp");
    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| MetadataError::Io { path: tmp.clone(), source: e })?;
    use tokio::io::AsyncWriteExt;
    file.write_all(bytes)
        .await
        .map_err(|e| MetadataError::Io { path: tmp.clone(), source: e })?;
    file.sync_all()
        .await
        .map_err(|e| MetadataError::Io { path: tmp.clone(), source: e })?;
    drop(file);
    fs::rename(&tmp, path)
        .await
        .map_err(|e| MetadataError::Io { path: path.to_path_buf(), source: e })?;
    Ok(())
}

fn filters_to_wire(filters: &Filters) -> BTreeMap<String, Vec<String>> {
    filters
        .iter()
        .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
        .collect()
}

fn filters_from_wire(wire: &BTreeMap<String, Vec<String>>) -> Filters {
    wire.iter()
        .map(|(k, v)| (k.clone(), v.iter().cloned().collect()))
        .collect()
}

impl OutputMetadata {
    /// Loads (or lazily creates, in memory) the metadata for `folder`.
    /// Fails if a file exists there with a different `kind`.
    pub async fn load(folder: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let folder = folder.into();
        let path = folder.join(FILE_NAME);
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| MetadataError::Io { path: path.clone(), source: e })?;
            let doc: OutputDoc = serde_json::from_str(&content)
                .map_err(|e| MetadataError::Json { path: path.clone(), source: e })?;
            if doc.kind != "output" {
                return Err(MetadataError::KindMismatch(folder, "output"));
            }
            doc
        } else {
            OutputDoc::default()
        };
        Ok(Self { folder, doc })
    }

    async fn persist(&self) -> Result<(), MetadataError> {
        let path = self.folder.join(FILE_NAME);
        let bytes = serde_json::to_vec_pretty(&self.doc)
            .map_err(|e| MetadataError::Json { path: path.clone(), source: e })?;
        atomic_write(&path, &bytes).await
    }

    /// Write-once context: `filters`/`since`/`since_mode`. The first call
    /// records the context; subsequent calls with a differing value fail
    /// with a diff-style message naming the folder.
    pub async fn note_context(
        &mut self,
        filters: &Filters,
        since: Option<&str>,
        since_mode: SinceMode,
    ) -> Result<(), MetadataError> {
        let name = folder_name(&self.folder);

        match &self.doc.filters {
            None => self.doc.filters = Some(filters_to_wire(filters)),
            Some(existing) => {
                let existing_filters = filters_from_wire(existing);
                if &existing_filters != filters {
                    return Err(MetadataError::ContextMismatch(format!(
                        "Folder {name} is for a different set of types and/or filters. Expected:\n{:#?}\n\nbut found:\n{:#?}",
                        filters, existing_filters,
                    )));
                }
            }
        }

        match &self.doc.since {
            None => self.doc.since = since.map(str::to_string),
            Some(found) => {
                let expected = since.unwrap_or("");
                if expected != found {
                    return Err(MetadataError::ContextMismatch(format!(
                        "Folder {name} is for a different --since time. Expected {expected} but found {found}."
                    )));
                }
            }
        }

        match &self.doc.since_mode {
            None => self.doc.since_mode = Some(since_mode.as_str().to_string()),
            Some(found) => {
                if found != since_mode.as_str() {
                    return Err(MetadataError::ContextMismatch(format!(
                        "Folder {name} is for a different --since-mode. Expected '{}' but found '{found}'.",
                        since_mode.as_str(),
                    )));
                }
            }
        }

        self.persist().await
    }

    /// Used by the managed director to pick a subfolder to resume: exact
    /// equality of filters/since/since_mode (not subset-of-OR — resuming an
    /// in-flight run needs the identical context, not merely a covering one).
    pub fn has_same_context(&self, filters: &Filters, since: Option<&str>, since_mode: SinceMode) -> bool {
        let stored_filters = self.doc.filters.as_ref().map(filters_from_wire);
        stored_filters.as_ref() == Some(filters)
            && self.doc.since.as_deref() == since
            && self.doc.since_mode.as_deref() == Some(since_mode.as_str())
    }

    pub fn filters(&self) -> Option<Filters> {
        self.doc.filters.as_ref().map(filters_from_wire)
    }

    pub fn since_mode(&self) -> Option<SinceMode> {
        self.doc.since_mode.as_deref().and_then(SinceMode::parse)
    }

    pub fn is_done(&self, tag: &str) -> bool {
        self.doc.done.contains_key(tag)
    }

    pub async fn mark_done(&mut self, tag: &str, timestamp: &str) -> Result<(), MetadataError> {
        self.doc.done.insert(tag.to_string(), timestamp.to_string());
        self.persist().await
    }

    pub fn get_earliest_done_date(&self) -> Option<&str> {
        self.doc.done.values().map(String::as_str).min()
    }

    pub fn done_for(&self, tag: &str) -> Option<&str> {
        self.doc.done.get(tag).map(String::as_str)
    }

    pub async fn set_bulk_status_url(&mut self, url: Option<&str>) -> Result<(), MetadataError> {
        self.doc.bulk_status = url.map(str::to_string);
        self.persist().await
    }

    pub fn get_bulk_status_url(&self) -> Option<&str> {
        self.doc.bulk_status.as_deref()
    }

    pub async fn note_new_patients(&mut self, ids: &[String]) -> Result<(), MetadataError> {
        self.doc.new_patients = Some(ids.to_vec());
        self.persist().await
    }

    pub fn get_new_patients(&self) -> &[String] {
        self.doc.new_patients.as_deref().unwrap_or(&[])
    }

    /// For each type in `filters` whose stored filter set is a subset of
    /// `filters`'s set for that type (a broader/prior export covers a
    /// narrower/current query), and whose since-mode matches, returns the
    /// recorded done-timestamp.
    pub fn get_matching_timestamps(&self, filters: &Filters, since_mode: SinceMode) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Some(stored_mode) = self.since_mode() else { return out };
        if stored_mode != since_mode {
            return out;
        }
        let Some(stored_filters) = self.filters() else { return out };
        if !filters_covered_by(&stored_filters, filters) {
            return out;
        }
        for res_type in filters.keys() {
            if let Some(done) = self.doc.done.get(res_type) {
                out.insert(res_type.clone(), done.clone());
            }
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.doc.complete.unwrap_or(false)
    }

    pub async fn mark_complete(&mut self) -> Result<(), MetadataError> {
        self.doc.complete = Some(true);
        self.persist().await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedDoc {
    kind: String,
    timestamp: String,
    version: u32,
    #[serde(default, rename = "fhir-url")]
    fhir_url: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

impl Default for ManagedDoc {
    fn default() -> Self {
        Self {
            kind: "managed".to_string(),
            timestamp: timing::now().to_rfc3339(),
            version: METADATA_VERSION,
            fhir_url: None,
            group: None,
        }
    }
}

/// A managed-folder root's persisted state: server base URL and group, both
/// write-once.
pub struct ManagedMetadata {
    folder: PathBuf,
    doc: ManagedDoc,
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

impl ManagedMetadata {
    pub async fn load(folder: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let folder = folder.into();
        let path = folder.join(FILE_NAME);
        let doc = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| MetadataError::Io { path: path.clone(), source: e })?;
            let doc: ManagedDoc = serde_json::from_str(&content)
                .map_err(|e| MetadataError::Json { path: path.clone(), source: e })?;
            if doc.kind != "managed" {
                return Err(MetadataError::KindMismatch(folder, "managed"));
            }
            doc
        } else {
            ManagedDoc::default()
        };
        Ok(Self { folder, doc })
    }

    async fn persist(&self) -> Result<(), MetadataError> {
        let path = self.folder.join(FILE_NAME);
        let bytes = serde_json::to_vec_pretty(&self.doc)
            .map_err(|e| MetadataError::Json { path: path.clone(), source: e })?;
        atomic_write(&path, &bytes).await
    }

    pub async fn note_context(&mut self, fhir_url: &str, group: Option<&str>) -> Result<(), MetadataError> {
        let name = folder_name(&self.folder);
        let fhir_url = normalize_url(fhir_url);

        match &self.doc.fhir_url {
            None => self.doc.fhir_url = Some(fhir_url),
            Some(found) => {
                if found != &fhir_url {
                    return Err(MetadataError::ContextMismatch(format!(
                        "Target folder {name} is for a different FHIR URL.\nExpected {fhir_url}\nBut found {found}"
                    )));
                }
            }
        }

        match &self.doc.group {
            None => self.doc.group = group.map(str::to_string),
            Some(found) => {
                if Some(found.as_str()) != group {
                    let group = group.unwrap_or("<none>");
                    return Err(MetadataError::ContextMismatch(format!(
                        "Target folder {name} is for a different Group.\nExpected {group}, but found {found}."
                    )));
                }
            }
        }

        self.persist().await
    }

    pub fn fhir_url(&self) -> Option<&str> {
        self.doc.fhir_url.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.doc.group.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn filters_of(pairs: &[(&str, &[&str])]) -> Filters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[tokio::test]
    async fn note_context_write_once_then_rejects_mismatch() {
        let dir = tempdir().unwrap();
        let mut meta = OutputMetadata::load(dir.path()).await.unwrap();
        let filters = filters_of(&[("Patient", &[])]);
        meta.note_context(&filters, Some("2022-01-01"), SinceMode::Updated).await.unwrap();

        let other_filters = filters_of(&[("Patient", &["active=true"])]);
        let err = meta
            .note_context(&other_filters, Some("2022-01-01"), SinceMode::Updated)
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::ContextMismatch(_)));
    }

    #[tokio::test]
    async fn since_mode_mismatch_message_format() {
        let dir = tempdir().unwrap();
        let mut meta = OutputMetadata::load(dir.path()).await.unwrap();
        let filters = filters_of(&[("Patient", &[])]);
        meta.note_context(&filters, None, SinceMode::Updated).await.unwrap();
        let err = meta.note_context(&filters, None, SinceMode::Created).await.unwrap_err();
        let MetadataError::ContextMismatch(msg) = err else { panic!() };
        assert!(msg.contains("different --since-mode"));
        assert!(msg.contains("'created'"));
        assert!(msg.contains("'updated'"));
    }

    #[tokio::test]
    async fn mark_done_then_reload_round_trips_atomically() {
        let dir = tempdir().unwrap();
        {
            let mut meta = OutputMetadata::load(dir.path()).await.unwrap();
            meta.mark_done("Patient", "2022-01-01T00:00:00Z").await.unwrap();
        }
        let meta = OutputMetadata::load(dir.path()).await.unwrap();
        assert!(meta.is_done("Patient"));
        assert_eq!(meta.done_for("Patient"), Some("2022-01-01T00:00:00Z"));
        assert!(!dir.path().join(".metadata.tmp").exists());
    }

    #[tokio::test]
    async fn matching_timestamps_requires_subset_and_matching_mode() {
        let dir = tempdir().unwrap();
        let mut meta = OutputMetadata::load(dir.path()).await.unwrap();
        let stored = filters_of(&[("Observation", &["status=final"])]);
        meta.note_context(&stored, None, SinceMode::Updated).await.unwrap();
        meta.mark_done("Observation", "2022-06-01T00:00:00Z").await.unwrap();

        let broader = filters_of(&[("Observation", &["status=final", "status=amended"])]);
        let matches = meta.get_matching_timestamps(&broader, SinceMode::Updated);
        assert_eq!(matches.get("Observation").map(String::as_str), Some("2022-06-01T00:00:00Z"));

        let wrong_mode = meta.get_matching_timestamps(&broader, SinceMode::Created);
        assert!(wrong_mode.is_empty());

        let narrower = filters_of(&[("Observation", &["status=final"])]);
        let narrower_current = filters_of(&[("Observation", &["status=amended"])]);
        let not_covered = meta.get_matching_timestamps(&narrower_current, SinceMode::Updated);
        assert!(not_covered.is_empty());
        let _ = narrower;
    }

    #[tokio::test]
    async fn managed_metadata_rejects_different_fhir_url() {
        let dir = tempdir().unwrap();
        let mut meta = ManagedMetadata::load(dir.path()).await.unwrap();
        meta.note_context("https://example.org/fhir/", Some("grp1")).await.unwrap();
        assert_eq!(meta.fhir_url(), Some("https://example.org/fhir"));

        let err = meta.note_context("https://other.org/fhir", Some("grp1")).await.unwrap_err();
        let MetadataError::ContextMismatch(msg) = err else { panic!() };
        assert!(msg.contains("different FHIR URL"));
    }

    #[tokio::test]
    async fn managed_metadata_rejects_different_group() {
        let dir = tempdir().unwrap();
        let mut meta = ManagedMetadata::load(dir.path()).await.unwrap();
        meta.note_context("https://example.org/fhir", Some("grp1")).await.unwrap();
        let err = meta.note_context("https://example.org/fhir", Some("grp2")).await.unwrap_err();
        let MetadataError::ContextMismatch(msg) = err else { panic!() };
        assert!(msg.contains("different Group"));
    }
}
