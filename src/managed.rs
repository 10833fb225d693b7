//! Managed-directory lifecycle (C8 director): resolves which numbered
//! subfolder an export run should use, calculates `--since auto`, and ties
//! together patient-delta detection and symlink refresh once a run
//! finishes.
//!
//! Grounded in `original_source/smart_fetch/cli/export.py`
//! (`find_workdir`/`calculate_since`/`list_workdirs`/`finish_resource`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::CliError;
use crate::filtering::{Filters, SinceMode};
use crate::metadata::OutputMetadata;
use crate::timing;

/// One entry from scanning a managed root's immediate subfolders: the
/// `NNN.nickname` name split into its number and nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkdirEntry {
    pub folder: String,
    pub number: u32,
    pub nickname: String,
}

/// Lists `{num}.{nickname}` subfolders of `source_dir`, newest-first. A
/// missing directory yields an empty list (there's simply no history yet).
pub fn list_workdirs(source_dir: &Path) -> Vec<WorkdirEntry> {
    let Ok(entries) = std::fs::read_dir(source_dir) else { return Vec::new() };

    let mut found: Vec<WorkdirEntry> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            let (num_str, nickname) = name.split_once('.')?;
            let number: u32 = num_str.parse().ok()?;
            Some(WorkdirEntry { folder: name.clone(), number, nickname: nickname.to_string() })
        })
        .collect();

    found.sort_by(|a, b| b.number.cmp(&a.number));
    found
}

/// Picks (or creates the name for) the subfolder this run should write into.
///
/// 1. An exact nickname match against an existing subfolder is always
///    reused, regardless of its recorded context — an explicit `--nickname`
///    is the user saying "this is the same logical export".
/// 2. Otherwise, a subfolder whose recorded context (filters/since/mode)
///    exactly matches this run's is reused (resuming a same-context run).
/// 3. Otherwise, a new `NNN.nickname` folder name is minted, where NNN is
///    one past the highest existing number and nickname defaults to
///    today's date.
pub async fn resolve_workdir(
    source_dir: &Path,
    filters: &Filters,
    since: Option<&str>,
    since_mode: SinceMode,
    nickname: Option<&str>,
) -> Result<String, CliError> {
    let workdirs = list_workdirs(source_dir);

    if let Some(nickname) = nickname
        && let Some(existing) = workdirs.iter().find(|w| w.nickname == nickname)
    {
        return Ok(existing.folder.clone());
    }

    for entry in &workdirs {
        let meta = OutputMetadata::load(source_dir.join(&entry.folder))
            .await
            .map_err(|e| CliError::Other(e.into()))?;
        if meta.has_same_context(filters, since, since_mode) {
            return Ok(entry.folder.clone());
        }
    }

    let next_num = workdirs.first().map(|w| w.number + 1).unwrap_or(1);
    let nickname = nickname.map(str::to_string).unwrap_or_else(|| timing::now().format("%Y-%m-%d").to_string());
    Ok(format!("{next_num:03}.{nickname}"))
}

/// Resolves `--since auto`: the oldest "done" timestamp across all
/// requested types, each taken from the most recent prior subfolder whose
/// recorded filters cover that type's current query. Errors if any
/// requested type has no matching prior export to anchor to.
pub async fn auto_since(source_dir: &Path, filters: &Filters, since_mode: SinceMode) -> Result<String, CliError> {
    let mut max_dones: BTreeMap<String, String> = BTreeMap::new();

    for entry in list_workdirs(source_dir) {
        let meta = OutputMetadata::load(source_dir.join(&entry.folder))
            .await
            .map_err(|e| CliError::Other(e.into()))?;
        for (res_type, timestamp) in meta.get_matching_timestamps(filters, since_mode) {
            let slot = max_dones.entry(res_type).or_insert_with(|| timestamp.clone());
            if timestamp.as_str() > slot.as_str() {
                *slot = timestamp;
            }
        }
    }

    if max_dones.is_empty() {
        return Err(CliError::UserError(
            "Could not detect a since value to use from previous exports.\n\
             Try without a --since parameter, or provide a specific timestamp."
                .to_string(),
        ));
    }

    let missing: Vec<&str> = filters.keys().filter(|t| !max_dones.contains_key(*t)).map(String::as_str).collect();
    if !missing.is_empty() {
        return Err(CliError::UserError(format!(
            "No previous export covers resource type(s): {}.\n\
             Try without a --since parameter, or provide a specific timestamp.",
            missing.join(", "),
        )));
    }

    Ok(max_dones.into_values().min().expect("checked non-empty above"))
}

/// Absolute path to a run's workdir, given the managed root and resolved
/// subfolder name.
pub fn workdir_path(source_dir: &Path, subfolder: &str) -> PathBuf {
    source_dir.join(subfolder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn filters(pairs: &[(&str, &[&str])]) -> Filters {
        pairs.iter().map(|(t, p)| (t.to_string(), p.iter().map(|s| s.to_string()).collect())).collect()
    }

    #[test]
    fn list_workdirs_sorted_newest_first() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("001.first")).unwrap();
        std::fs::create_dir(dir.path().join("003.third")).unwrap();
        std::fs::create_dir(dir.path().join("002.second")).unwrap();
        std::fs::create_dir(dir.path().join("not-numbered")).unwrap();

        let found = list_workdirs(dir.path());
        assert_eq!(found.iter().map(|w| w.number).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn list_workdirs_on_missing_dir_is_empty() {
        let found = list_workdirs(Path::new("/nonexistent/does/not/exist"));
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn resolve_workdir_reuses_exact_nickname_regardless_of_context() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("001.mine")).unwrap();
        let f = filters(&[("Patient", &[])]);
        let got = resolve_workdir(dir.path(), &f, None, SinceMode::Updated, Some("mine")).await.unwrap();
        assert_eq!(got, "001.mine");
    }

    #[tokio::test]
    async fn resolve_workdir_reuses_matching_context() {
        let dir = tempdir().unwrap();
        let f = filters(&[("Patient", &[])]);
        std::fs::create_dir_all(dir.path().join("001.prior")).unwrap();
        let mut meta = OutputMetadata::load(dir.path().join("001.prior")).await.unwrap();
        meta.note_context(&f, None, SinceMode::Updated).await.unwrap();

        let got = resolve_workdir(dir.path(), &f, None, SinceMode::Updated, None).await.unwrap();
        assert_eq!(got, "001.prior");
    }

    #[tokio::test]
    async fn resolve_workdir_creates_new_numbered_folder() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("005.old")).unwrap();
        let f = filters(&[("Patient", &[])]);
        let got = resolve_workdir(dir.path(), &f, None, SinceMode::Updated, Some("fresh")).await.unwrap();
        assert_eq!(got.split_once('.').unwrap().0, "006");
        assert!(got.ends_with("fresh"));
    }

    #[tokio::test]
    async fn auto_since_errors_without_prior_exports() {
        let dir = tempdir().unwrap();
        let f = filters(&[("Patient", &[])]);
        let err = auto_since(dir.path(), &f, SinceMode::Updated).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn auto_since_picks_oldest_of_matching_types() {
        let dir = tempdir().unwrap();
        let f = filters(&[("Patient", &[]), ("Observation", &[])]);

        std::fs::create_dir_all(dir.path().join("001.a")).unwrap();
        let mut meta_a = OutputMetadata::load(dir.path().join("001.a")).await.unwrap();
        meta_a.note_context(&f, None, SinceMode::Updated).await.unwrap();
        meta_a.mark_done("Patient", "2022-01-01T00:00:00Z").await.unwrap();
        meta_a.mark_done("Observation", "2022-03-01T00:00:00Z").await.unwrap();

        let since = auto_since(dir.path(), &f, SinceMode::Updated).await.unwrap();
        assert_eq!(since, "2022-01-01T00:00:00Z");
    }
}
