//! `meds` task: MedicationRequest → Medication.
//!
//! Grounded in `original_source/smart_fetch/tasks/meds.py`.

use std::collections::HashSet;

use serde_json::Value;

use super::super::{download_reference, HydrationTask, SingleResult};
use crate::client::FhirClient;
use crate::error::ClientError;
use crate::resources;

pub struct MedsTask;

#[async_trait::async_trait]
impl HydrationTask for MedsTask {
    fn name(&self) -> &'static str {
        "meds"
    }

    fn input_type(&self) -> &'static str {
        resources::MEDICATION_REQUEST
    }

    fn output_type(&self) -> &'static str {
        resources::MEDICATION
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        let reference = resource.pointer("/medicationReference/reference").and_then(|v| v.as_str());
        Ok(vec![download_reference(client, id_pool, reference, resources::MEDICATION).await])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_identity_matches_registry() {
        let task = MedsTask;
        assert_eq!(task.input_type(), resources::MEDICATION_REQUEST);
        assert_eq!(task.output_type(), resources::MEDICATION);
        assert!(task.append());
    }

    #[test]
    fn extracts_medication_reference() {
        let resource = json!({
            "resourceType": "MedicationRequest",
            "medicationReference": {"reference": "Medication/abc"},
        });
        let reference = resource.pointer("/medicationReference/reference").and_then(|v| v.as_str());
        assert_eq!(reference, Some("Medication/abc"));
    }
}
