//! Patient delta detection: new/deleted patients between successive Patient
//! exports, used by the managed director (C8).
//!
//! Grounded in `original_source/smart_fetch/merges.py`.

use std::collections::HashSet;

use serde_json::Value;

fn replaces_links(patient: &Value) -> HashSet<String> {
    patient
        .get("link")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter(|l| l.get("type").and_then(|t| t.as_str()) == Some("replaces"))
        .filter_map(|l| l.get("other").and_then(|o| o.get("reference")).and_then(|r| r.as_str()))
        .map(str::to_string)
        .collect()
}

fn patient_id(patient: &Value) -> Option<String> {
    patient.get("id").and_then(|v| v.as_str()).map(str::to_string)
}

/// Compares the most recent prior Patient export against the just-completed
/// one. Returns (new_ids, deleted_ids). A patient whose `replaces` set grew
/// relative to the prior snapshot is also reported as new, even if its ID
/// was already present — its replaced-patient graph changed shape.
pub fn find_new_patients(prior: &[Value], current: &[Value]) -> (Vec<String>, Vec<String>) {
    let prior_ids: HashSet<String> = prior.iter().filter_map(patient_id).collect();
    let current_ids: HashSet<String> = current.iter().filter_map(patient_id).collect();

    let mut prior_replaces: std::collections::HashMap<String, HashSet<String>> = Default::default();
    for p in prior {
        if let Some(id) = patient_id(p) {
            prior_replaces.insert(id, replaces_links(p));
        }
    }

    let mut new_ids = HashSet::new();
    for p in current {
        let Some(id) = patient_id(p) else { continue };
        if !prior_ids.contains(&id) {
            new_ids.insert(id);
            continue;
        }
        let current_replaces = replaces_links(p);
        let prior_replaces_for_id = prior_replaces.get(&id).cloned().unwrap_or_default();
        if !current_replaces.is_subset(&prior_replaces_for_id) {
            new_ids.insert(id);
        }
    }

    let deleted_ids: Vec<String> = prior_ids.difference(&current_ids).cloned().collect();
    let mut new_ids: Vec<String> = new_ids.into_iter().collect();
    new_ids.sort();
    let mut deleted_ids = deleted_ids;
    deleted_ids.sort();
    (new_ids, deleted_ids)
}

/// Builds the one-DELETE-Bundle-per-line payload used to record deleted
/// resources (`<workdir>/deleted/Type.ndjson[.gz]`).
pub fn delete_bundle(res_type: &str, id: &str) -> Value {
    serde_json::json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": [{
            "request": {
                "method": "DELETE",
                "url": format!("{res_type}/{id}"),
            }
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_new_and_deleted_ids() {
        let prior = vec![json!({"resourceType": "Patient", "id": "1"}), json!({"resourceType": "Patient", "id": "2"})];
        let current = vec![json!({"resourceType": "Patient", "id": "1"}), json!({"resourceType": "Patient", "id": "3"})];
        let (new_ids, deleted_ids) = find_new_patients(&prior, &current);
        assert_eq!(new_ids, vec!["3".to_string()]);
        assert_eq!(deleted_ids, vec!["2".to_string()]);
    }

    #[test]
    fn gained_replaces_link_marks_existing_patient_new() {
        let prior = vec![json!({"resourceType": "Patient", "id": "1", "link": []})];
        let current = vec![json!({
            "resourceType": "Patient",
            "id": "1",
            "link": [{"type": "replaces", "other": {"reference": "Patient/old-1"}}],
        })];
        let (new_ids, deleted_ids) = find_new_patients(&prior, &current);
        assert_eq!(new_ids, vec!["1".to_string()]);
        assert!(deleted_ids.is_empty());
    }

    #[test]
    fn delete_bundle_has_expected_shape() {
        let bundle = delete_bundle("Patient", "42");
        assert_eq!(bundle["entry"][0]["request"]["url"], "Patient/42");
        assert_eq!(bundle["entry"][0]["request"]["method"], "DELETE");
    }
}
