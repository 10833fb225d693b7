//! Symlink view (C8's `refresh_symlinks`): recomputes the flat, numbered
//! `Type.NNN.ndjson[.gz]` view at a managed folder's root from the subfolder
//! history.
//!
//! Grounded in `original_source/smart_fetch/symlinks.py`
//! (`_find_active_resource_workdirs`/`reset_res_links`).

use std::collections::BTreeSet;
use std::path::Path;

use crate::filtering::Filters;

/// The filter/since context a single subfolder ran with, as needed by the
/// symlink-refresh algorithm. Newest-first ordering is the caller's
/// responsibility (by subfolder number, descending).
pub struct SubfolderContext {
    pub name: String,
    pub filters: Filters,
    pub since: Option<String>,
}

/// For one resource type, walks subfolders newest-first and decides which
/// ones contribute "active" (not-yet-obsoleted) files:
///
/// 1. Track a running union of "covered" filter-parameter-strings.
/// 2. A subfolder whose filter set for this type is a subset of what's
///    already covered is skipped — a newer export obsoletes it.
/// 3. Otherwise its files are active, and its filter set is folded into the
///    covered set.
/// 4. If that filter set was empty AND the subfolder was a full (non-since)
///    export, nothing older can possibly be needed — stop. A `since` export
///    with an empty filter set still needs an older full export to anchor
///    it, so walking continues.
pub fn find_active_resource_workdirs(subfolders_newest_first: &[SubfolderContext], res_type: &str) -> Vec<String> {
    let mut covered: BTreeSet<String> = BTreeSet::new();
    let mut active = Vec::new();

    for sf in subfolders_newest_first {
        let Some(params) = sf.filters.get(res_type) else { continue };

        if params.is_subset(&covered) {
            continue;
        }

        active.push(sf.name.clone());
        covered.extend(params.iter().cloned());

        if params.is_empty() && sf.since.is_none() {
            break;
        }
    }

    active
}

/// Removes every existing `Type.*.ndjson[.gz]` symlink at `root` and creates
/// fresh ones, numbered sequentially oldest-first, pointing at `targets`
/// (already in oldest-first order, one real file path per entry).
pub fn rewrite_symlinks(root: &Path, res_type: &str, targets_oldest_first: &[std::path::PathBuf]) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root)?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix(&format!("{res_type}.")) {
            let is_numbered = rest.split('.').next().is_some_and(|n| n.chars().all(|c| c.is_ascii_digit()));
            if is_numbered && entry.path().is_symlink() {
                std::fs::remove_file(entry.path())?;
            }
        }
    }

    for (i, target) in targets_oldest_first.iter().enumerate() {
        let ext = if target.extension().is_some_and(|e| e == "gz") { "ndjson.gz" } else { "ndjson" };
        let link_path = root.join(format!("{res_type}.{:03}.{ext}", i + 1));
        #[cfg(unix)]
        std::os::unix::fs::symlink(target, &link_path)?;
        #[cfg(not(unix))]
        std::fs::copy(target, &link_path).map(|_| ())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str, filters: &[(&str, &[&str])], since: Option<&str>) -> SubfolderContext {
        SubfolderContext {
            name: name.to_string(),
            filters: filters
                .iter()
                .map(|(t, p)| (t.to_string(), p.iter().map(|s| s.to_string()).collect()))
                .collect(),
            since: since.map(str::to_string),
        }
    }

    #[test]
    fn stops_at_unfiltered_full_export() {
        let subfolders = vec![
            ctx("003.delta", &[("Patient", &["active=true"])], Some("2022-01-01")),
            ctx("002.full", &[("Patient", &[])], None),
            ctx("001.older", &[("Patient", &[])], None),
        ];
        let active = find_active_resource_workdirs(&subfolders, "Patient");
        assert_eq!(active, vec!["003.delta".to_string(), "002.full".to_string()]);
    }

    #[test]
    fn since_export_with_empty_filters_does_not_stop_walk() {
        let subfolders = vec![
            ctx("002.delta", &[("Patient", &[])], Some("2022-06-01")),
            ctx("001.full", &[("Patient", &[])], None),
        ];
        let active = find_active_resource_workdirs(&subfolders, "Patient");
        assert_eq!(active, vec!["002.delta".to_string(), "001.full".to_string()]);
    }

    #[test]
    fn obsoleted_subset_is_skipped() {
        let subfolders = vec![
            ctx("002.broad", &[("Observation", &["status=final", "status=amended"])], None),
            ctx("001.narrow", &[("Observation", &["status=final"])], None),
        ];
        let active = find_active_resource_workdirs(&subfolders, "Observation");
        // 001 is a subset of what 002 already covers (empty-filter, non-since
        // stop doesn't apply here since 002's filter set isn't empty), so
        // 001 contributes nothing new.
        assert_eq!(active, vec!["002.broad".to_string()]);
    }

    #[test]
    fn refresh_is_idempotent() {
        let subfolders = vec![ctx("001.full", &[("Patient", &[])], None)];
        let first = find_active_resource_workdirs(&subfolders, "Patient");
        let second = find_active_resource_workdirs(&subfolders, "Patient");
        assert_eq!(first, second);
    }
}
