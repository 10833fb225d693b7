//! `dxr-results` and `obs-members` tasks: DiagnosticReport → Observation
//! results, and recursive Observation → Observation member chasing.
//!
//! Grounded in `original_source/smart_fetch/tasks/obs.py`.

use std::collections::HashSet;

use serde_json::Value;

use super::super::{download_reference, HydrationTask, SingleResult};
use crate::client::FhirClient;
use crate::error::ClientError;
use crate::resources;

pub struct ObsDxrTask;

#[async_trait::async_trait]
impl HydrationTask for ObsDxrTask {
    fn name(&self) -> &'static str {
        "dxr-results"
    }

    fn input_type(&self) -> &'static str {
        resources::DIAGNOSTIC_REPORT
    }

    fn output_type(&self) -> &'static str {
        resources::OBSERVATION
    }

    fn file_slug(&self) -> Option<&'static str> {
        Some("results")
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        let mut results = Vec::new();
        for result in resource.get("result").and_then(|v| v.as_array()).into_iter().flatten() {
            let reference = result.get("reference").and_then(|v| v.as_str());
            results.push(download_reference(client, id_pool, reference, resources::OBSERVATION).await);
        }
        Ok(results)
    }
}

pub struct ObsMembersTask;

#[async_trait::async_trait]
impl HydrationTask for ObsMembersTask {
    fn name(&self) -> &'static str {
        "obs-members"
    }

    fn input_type(&self) -> &'static str {
        resources::OBSERVATION
    }

    fn output_type(&self) -> &'static str {
        resources::OBSERVATION
    }

    fn file_slug(&self) -> Option<&'static str> {
        Some("members")
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        download_members(client, resource, id_pool).await
    }
}

/// Recursively chases `hasMember` references: a downloaded member that
/// itself has members is immediately expanded too, so a single pass over
/// the input file fully resolves any member chain (not just one level).
fn download_members<'a>(
    client: &'a FhirClient,
    resource: &'a Value,
    id_pool: &'a mut HashSet<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<SingleResult>, ClientError>> + Send + 'a>> {
    Box::pin(async move {
        let mut results = Vec::new();
        for member in resource.get("hasMember").and_then(|v| v.as_array()).into_iter().flatten() {
            let reference = member.get("reference").and_then(|v| v.as_str());
            let result = download_reference(client, id_pool, reference, resources::OBSERVATION).await;
            let child = result.0.clone();
            results.push(result);
            if let Some(child) = child {
                results.extend(download_members(client, &child, id_pool).await?);
            }
        }
        Ok(results)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dxr_task_writes_to_results_slug() {
        let task = ObsDxrTask;
        assert_eq!(task.file_slug(), Some("results"));
        assert_eq!(task.output_type(), resources::OBSERVATION);
    }

    #[test]
    fn members_task_has_matching_input_and_output() {
        let task = ObsMembersTask;
        assert_eq!(task.input_type(), resources::OBSERVATION);
        assert_eq!(task.output_type(), resources::OBSERVATION);
        assert_eq!(task.file_slug(), Some("members"));
    }
}
