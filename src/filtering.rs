//! Filter planner (C3): builds per-resource-type query parameters from user
//! input, server type, and since-mode.
//!
//! Grounded in `original_source/smart_fetch/filtering.py`.

use std::collections::{BTreeMap, BTreeSet};

use crate::resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinceMode {
    Auto,
    Updated,
    Created,
}

impl SinceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinceMode::Auto => "auto",
            SinceMode::Updated => "updated",
            SinceMode::Created => "created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "updated" => Some(Self::Updated),
            "created" => Some(Self::Created),
            _ => None,
        }
    }

    /// Resolves `auto` given whether the target server is known to lack
    /// last-modified support (Epic).
    pub fn resolve(self, server_is_epic: bool) -> SinceMode {
        match self {
            SinceMode::Auto => {
                if server_is_epic {
                    SinceMode::Created
                } else {
                    SinceMode::Updated
                }
            }
            other => other,
        }
    }
}

/// A mapping from resource-type name to a set of query-parameter strings,
/// "OR" semantics between set members. An empty set means "fetch all of this
/// type, no filter". This is the canonical identity of an export context —
/// stored literally in metadata, not hashed, so a human can read a subfolder
/// and know what it is.
pub type Filters = BTreeMap<String, BTreeSet<String>>;

/// True iff `stored`'s parameter set for every type is a subset of `current`'s
/// — i.e. `current` is at least as broad as `stored`, so `stored`'s prior
/// results cover what `current` is asking for.
pub fn filters_covered_by(stored: &Filters, current: &Filters) -> bool {
    stored.iter().all(|(res_type, stored_params)| {
        current
            .get(res_type)
            .is_some_and(|cur_params| stored_params.is_subset(cur_params))
    })
}

const EPIC_UNSUPPORTED_CATEGORIES: &[&str] = &["procedure", "therapy", "activity"];

fn default_observation_category_filter(server_is_epic: bool) -> String {
    let mut categories = vec![
        "social-history",
        "vital-signs",
        "imaging",
        "laboratory",
        "survey",
        "exam",
    ];
    if !server_is_epic {
        categories.extend(EPIC_UNSUPPORTED_CATEGORIES);
    }
    format!("category={}", categories.join(","))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("type-filter '{0}' must look like 'Type?params'")]
    MalformedTypeFilter(String),
    #[error("type-filter references '{0}', which is not in the requested type list")]
    TypeNotRequested(String),
}

use thiserror::Error;

pub struct FilterPlan {
    pub filters: Filters,
    pub since_mode: SinceMode,
}

/// Builds the `Filters` value from user input.
///
/// `type_filters` are raw `Type?params` strings from `--type-filter`, one per
/// occurrence (multiple entries for the same type OR together).
pub fn build_filters(
    requested_types: &[String],
    type_filters: &[String],
    since_mode: SinceMode,
    server_is_epic: bool,
    since: Option<&str>,
) -> Result<Filters, FilterError> {
    let mut filters: Filters = requested_types
        .iter()
        .map(|t| (t.clone(), BTreeSet::new()))
        .collect();

    for tf in type_filters {
        let (res_type, params) = tf
            .split_once('?')
            .ok_or_else(|| FilterError::MalformedTypeFilter(tf.clone()))?;
        if !filters.contains_key(res_type) {
            return Err(FilterError::TypeNotRequested(res_type.to_string()));
        }
        filters.get_mut(res_type).unwrap().insert(params.to_string());
    }

    if let Some(obs) = filters.get_mut(resources::OBSERVATION)
        && obs.is_empty()
    {
        obs.insert(default_observation_category_filter(server_is_epic));
    }

    if since_mode == SinceMode::Created {
        apply_created_filters(&mut filters, since);
    }

    Ok(filters)
}

/// Attaches a per-type creation-time parameter to every existing parameter
/// string, or inserts a lone one if the set was empty. Types with no known
/// creation field are left untouched.
fn apply_created_filters(filters: &mut Filters, since: Option<&str>) {
    let Some(since) = since else { return };
    for (res_type, params) in filters.iter_mut() {
        let Some(field) = resources::created_search_field(res_type) else {
            continue;
        };
        let addition = format!("{field}=gt{since}");
        if params.is_empty() {
            params.insert(addition);
        } else {
            let merged: BTreeSet<String> = params
                .iter()
                .map(|existing| format!("{existing}&{addition}"))
                .collect();
            *params = merged;
        }
    }
}

/// Attaches `_lastUpdated=gtTS` to every parameter string (non-bulk `updated`
/// search mode only — for bulk, the since value is carried as `_since`
/// instead).
fn apply_updated_filters(filters: &mut Filters, since: &str) {
    let addition = format!("_lastUpdated=gt{since}");
    for params in filters.values_mut() {
        if params.is_empty() {
            params.insert(addition.clone());
        } else {
            let merged: BTreeSet<String> = params
                .iter()
                .map(|existing| format!("{existing}&{addition}"))
                .collect();
            *params = merged;
        }
    }
}

/// Produces the per-resource-type REST search parameters for crawl mode
/// (`with_since` applies the watermark; bulk mode never calls this since the
/// since value travels as `_since` there instead, except in `created` mode
/// where it's baked into `filters` up front).
pub fn params_for_search(
    filters: &Filters,
    since_mode: SinceMode,
    since: Option<&str>,
) -> Filters {
    let mut out = filters.clone();
    if since_mode == SinceMode::Updated
        && let Some(since) = since
    {
        apply_updated_filters(&mut out, since);
    }
    out
}

/// For bulk kickoff: `created` mode never emits a bulk `_since` (it's baked
/// into `_typeFilter` instead); `updated` mode carries the since value as the
/// bulk `_since` kickoff parameter.
pub fn bulk_since(since_mode: SinceMode, since: Option<&str>) -> Option<String> {
    match since_mode {
        SinceMode::Created => None,
        _ => since.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn default_observation_filter_excludes_categories_on_epic() {
        let filters = build_filters(
            &types(&["Observation"]),
            &[],
            SinceMode::Updated,
            true,
            None,
        )
        .unwrap();
        let obs = &filters["Observation"];
        assert_eq!(obs.len(), 1);
        assert!(!obs.iter().next().unwrap().contains("procedure"));
    }

    #[test]
    fn default_observation_filter_includes_categories_off_epic() {
        let filters =
            build_filters(&types(&["Observation"]), &[], SinceMode::Updated, false, None).unwrap();
        let obs = &filters["Observation"];
        assert!(obs.iter().next().unwrap().contains("procedure"));
    }

    #[test]
    fn type_filter_must_reference_requested_type() {
        let err = build_filters(
            &types(&["Patient"]),
            &["Observation?status=final".to_string()],
            SinceMode::Updated,
            false,
            None,
        )
        .unwrap_err();
        assert_eq!(err, FilterError::TypeNotRequested("Observation".to_string()));
    }

    #[test]
    fn malformed_type_filter_rejected() {
        let err = build_filters(
            &types(&["Patient"]),
            &["Patient-no-question-mark".to_string()],
            SinceMode::Updated,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FilterError::MalformedTypeFilter(_)));
    }

    #[test]
    fn created_mode_rewrites_filters_with_gt_prefix() {
        let filters = build_filters(
            &types(&["Condition"]),
            &[],
            SinceMode::Created,
            false,
            Some("2022-01-05"),
        )
        .unwrap();
        let cond = &filters["Condition"];
        assert_eq!(cond.iter().next().unwrap(), "recorded-date=gt2022-01-05");
    }

    #[test]
    fn subset_covers_direction() {
        let mut stored = Filters::new();
        stored.insert("Observation".into(), ["status=final".to_string()].into());
        let mut current = Filters::new();
        current.insert(
            "Observation".into(),
            ["status=final".to_string(), "status=amended".to_string()].into(),
        );
        assert!(filters_covered_by(&stored, &current));
        assert!(!filters_covered_by(&current, &stored));
    }

    #[test]
    fn bulk_since_absent_in_created_mode() {
        assert_eq!(bulk_since(SinceMode::Created, Some("2022-01-01")), None);
        assert_eq!(
            bulk_since(SinceMode::Updated, Some("2022-01-01")),
            Some("2022-01-01".to_string())
        );
    }
}
