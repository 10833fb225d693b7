//! Cohort-selection file parsing (`--id-file`/`--mrn-file`), supplemented
//! from the distilled spec per §3: a bare newline-delimited ID list, or a
//! CSV with a case-insensitively-matched `id` or `mrn` header column.
//!
//! Grounded in `original_source/smart_fetch/crawl_utils.py::load_specified_ids`.

use std::collections::BTreeSet;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CohortError {
    #[error("failed to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse CSV {path}: {source}")]
    Csv { path: String, source: csv::Error },
    #[error("ID file {0} has no 'id' or 'mrn' header")]
    MissingHeader(String),
}

/// Loads a set of IDs from a plain or CSV file, ignoring blank lines/rows.
pub fn load_ids(path: &Path) -> Result<BTreeSet<String>, CohortError> {
    let path_str = path.display().to_string();
    let is_csv = path_str.to_lowercase().ends_with(".csv");

    if is_csv {
        load_csv_ids(path, &path_str)
    } else {
        let content = std::fs::read_to_string(path).map_err(|e| CohortError::Io { path: path_str.clone(), source: e })?;
        Ok(content.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}

fn load_csv_ids(path: &Path, path_str: &str) -> Result<BTreeSet<String>, CohortError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| CohortError::Csv { path: path_str.to_string(), source: e })?;
    let headers = reader.headers().map_err(|e| CohortError::Csv { path: path_str.to_string(), source: e })?.clone();

    let column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("id"))
        .or_else(|| headers.iter().position(|h| h.eq_ignore_ascii_case("mrn")))
        .ok_or_else(|| CohortError::MissingHeader(path_str.to_string()))?;

    let mut ids = BTreeSet::new();
    for record in reader.records() {
        let record = record.map_err(|e| CohortError::Csv { path: path_str.to_string(), source: e })?;
        if let Some(value) = record.get(column) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                ids.insert(trimmed.to_string());
            }
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plain_file_ignores_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.txt");
        std::fs::write(&path, "abc\n\ndef\n").unwrap();
        let ids = load_ids(&path).unwrap();
        assert_eq!(ids, BTreeSet::from(["abc".to_string(), "def".to_string()]));
    }

    #[test]
    fn csv_file_prefers_id_column_case_insensitively() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "Name,ID\nAlice,1\nBob,2\n").unwrap();
        let ids = load_ids(&path).unwrap();
        assert_eq!(ids, BTreeSet::from(["1".to_string(), "2".to_string()]));
    }

    #[test]
    fn csv_file_falls_back_to_mrn_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "mrn\n12345\n").unwrap();
        let ids = load_ids(&path).unwrap();
        assert_eq!(ids, BTreeSet::from(["12345".to_string()]));
    }

    #[test]
    fn csv_file_with_no_recognized_header_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        std::fs::write(&path, "foo,bar\n1,2\n").unwrap();
        let err = load_ids(&path).unwrap_err();
        assert!(matches!(err, CohortError::MissingHeader(_)));
    }
}
