//! Location-graph hydration tasks: each walks a small set of reference
//! paths off one input type and downloads whatever `Location` those
//! references point at, into a shared `Location.ndjson.gz`.
//!
//! Grounded in `original_source/smart_fetch/tasks/loc.py`. Its nine classes
//! all subclass a `hydrate_utils.ReferenceDownloadTask` base that isn't
//! actually defined anywhere in the retrieved source (the same version-drift
//! gap as `tasks/inline.py`'s missing `Task` base) — generalized here as one
//! [`LocationTask`] struct parameterized by a `REFS`-equivalent path list,
//! instantiated from a declarative table mirroring the Python file's own
//! `LOCATION_TASKS` list.

use std::collections::HashSet;

use serde_json::Value;

use super::super::{download_reference, HydrationTask, SingleResult, TaskResultReason};
use crate::client::FhirClient;
use crate::error::ClientError;
use crate::resources;

/// Walks a dot-separated reference path off `resource`. A segment ending in
/// `*` means the field at that point is an array; its elements replace the
/// current node set and the walk continues from there. The nodes left after
/// the full path are expected to be FHIR `Reference` objects, and each one's
/// `reference` string is collected (silently skipping nodes that aren't
/// References or don't carry one).
pub fn collect_references(resource: &Value, path: &str) -> Vec<String> {
    let mut nodes: Vec<&Value> = vec![resource];
    for segment in path.split('.') {
        let (name, is_array) = match segment.strip_suffix('*') {
            Some(stripped) => (stripped, true),
            None => (segment, false),
        };
        let mut next = Vec::new();
        for node in nodes {
            let Some(field) = node.get(name) else { continue };
            if is_array {
                if let Some(arr) = field.as_array() {
                    next.extend(arr.iter());
                }
            } else {
                next.push(field);
            }
        }
        nodes = next;
    }
    nodes
        .into_iter()
        .filter_map(|n| n.get("reference").and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

/// One reference-following hydration task: `refs` is a list of dotted paths
/// (per [`collect_references`]) evaluated against every `input_type`
/// resource, each surviving reference downloaded as `output_type`.
pub struct LocationTask {
    name: &'static str,
    input_type: &'static str,
    refs: &'static [&'static str],
}

#[async_trait::async_trait]
impl HydrationTask for LocationTask {
    fn name(&self) -> &'static str {
        self.name
    }

    fn input_type(&self) -> &'static str {
        self.input_type
    }

    fn output_type(&self) -> &'static str {
        resources::LOCATION
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        let mut references = Vec::new();
        for path in self.refs {
            references.extend(collect_references(resource, path));
        }
        if references.is_empty() {
            return Ok(vec![(None, TaskResultReason::Ignored)]);
        }

        let mut results = Vec::with_capacity(references.len());
        for reference in references {
            results.push(download_reference(client, id_pool, Some(&reference), resources::LOCATION).await);
        }
        Ok(results)
    }
}

const LOCATION_TASKS: &[(&str, &str, &[&str])] = &[
    ("dev-loc", resources::DEVICE, &["location"]),
    ("dxr-loc", resources::DIAGNOSTIC_REPORT, &["subject"]),
    (
        "enc-loc",
        resources::ENCOUNTER,
        &["hospitalization.origin", "hospitalization.destination", "location*.location"],
    ),
    ("imm-loc", resources::IMMUNIZATION, &["location"]),
    ("obs-loc", resources::OBSERVATION, &["subject"]),
    ("practrole-loc", resources::PRACTITIONER_ROLE, &["location*"]),
    ("proc-loc", resources::PROCEDURE, &["location"]),
    ("servreq-loc", resources::SERVICE_REQUEST, &["subject", "locationReference*"]),
    ("loc-loc", resources::LOCATION, &["partOf"]),
];

/// The nine `*-loc` tasks, in the same order as Python's `LOCATION_TASKS`.
pub fn location_tasks() -> Vec<Box<dyn HydrationTask>> {
    LOCATION_TASKS
        .iter()
        .map(|&(name, input_type, refs)| Box::new(LocationTask { name, input_type, refs }) as Box<dyn HydrationTask>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_nested_field_path() {
        let enc = json!({
            "hospitalization": {"origin": {"reference": "Location/1"}},
        });
        assert_eq!(collect_references(&enc, "hospitalization.origin"), vec!["Location/1"]);
    }

    #[test]
    fn array_of_backbone_with_nested_reference() {
        let enc = json!({
            "location": [
                {"location": {"reference": "Location/1"}, "status": "active"},
                {"location": {"reference": "Location/2"}, "status": "completed"},
            ],
        });
        let refs = collect_references(&enc, "location*.location");
        assert_eq!(refs, vec!["Location/1", "Location/2"]);
    }

    #[test]
    fn array_of_references_directly() {
        let role = json!({
            "location": [{"reference": "Location/1"}, {"reference": "Location/2"}],
        });
        let refs = collect_references(&role, "location*");
        assert_eq!(refs, vec!["Location/1", "Location/2"]);
    }

    #[test]
    fn missing_path_yields_no_references() {
        let device = json!({});
        assert!(collect_references(&device, "location").is_empty());
    }

    #[test]
    fn location_tasks_cover_all_nine_names() {
        let tasks = location_tasks();
        assert_eq!(tasks.len(), 9);
        assert!(tasks.iter().all(|t| t.output_type() == resources::LOCATION));
        let names: Vec<&str> = tasks.iter().map(|t| t.name()).collect();
        assert!(names.contains(&"servreq-loc"));
        assert!(names.contains(&"loc-loc"));
    }
}
