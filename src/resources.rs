//! Resource-type name constants and the small "what field encodes
//! creation/update time" table. Data, not logic — kept deliberately dumb.

use serde_json::Value;

pub const ALLERGY_INTOLERANCE: &str = "AllergyIntolerance";
pub const BINARY: &str = "Binary";
pub const BUNDLE: &str = "Bundle";
pub const CONDITION: &str = "Condition";
pub const DEVICE: &str = "Device";
pub const DIAGNOSTIC_REPORT: &str = "DiagnosticReport";
pub const DOCUMENT_REFERENCE: &str = "DocumentReference";
pub const ENCOUNTER: &str = "Encounter";
pub const IMMUNIZATION: &str = "Immunization";
pub const LOCATION: &str = "Location";
pub const MEDICATION: &str = "Medication";
pub const MEDICATION_REQUEST: &str = "MedicationRequest";
pub const OBSERVATION: &str = "Observation";
pub const OPERATION_OUTCOME: &str = "OperationOutcome";
pub const ORGANIZATION: &str = "Organization";
pub const PATIENT: &str = "Patient";
pub const PRACTITIONER: &str = "Practitioner";
pub const PRACTITIONER_ROLE: &str = "PractitionerRole";
pub const PROCEDURE: &str = "Procedure";
pub const SERVICE_REQUEST: &str = "ServiceRequest";

/// Resources linked to patients, in the order we like to process them:
/// Patient first, Encounter next, then everything else.
pub const PATIENT_TYPES: &[&str] = &[
    PATIENT,
    ENCOUNTER,
    ALLERGY_INTOLERANCE,
    CONDITION,
    DEVICE,
    DIAGNOSTIC_REPORT,
    DOCUMENT_REFERENCE,
    IMMUNIZATION,
    MEDICATION_REQUEST,
    OBSERVATION,
    PROCEDURE,
    SERVICE_REQUEST,
];

pub fn is_patient_type(res_type: &str) -> bool {
    PATIENT_TYPES.contains(&res_type)
}

pub fn is_scope_type(res_type: &str) -> bool {
    is_patient_type(res_type) || res_type == BINARY || res_type == MEDICATION
}

/// Search field to use for an emulated "created" filter, per type. Types
/// without an administrative creation date to search on are absent.
pub fn created_search_field(res_type: &str) -> Option<&'static str> {
    Some(match res_type {
        ALLERGY_INTOLERANCE => "date",
        CONDITION => "recorded-date",
        DIAGNOSTIC_REPORT => "issued",
        DOCUMENT_REFERENCE => "date",
        ENCOUNTER => "date",
        IMMUNIZATION => "date",
        MEDICATION_REQUEST => "authoredon",
        OBSERVATION => "date",
        PROCEDURE => "date",
        SERVICE_REQUEST => "authored",
        _ => return None,
    })
}

/// The FHIR field corresponding to the search field above, for extracting a
/// resource's own creation-date value after the fact (transaction-time
/// tracking in crawl mode). Kept in lock-step with `created_search_field`.
pub fn get_created_date(resource: &Value) -> Option<String> {
    let res_type = resource.get("resourceType")?.as_str()?;
    let s = |v: Option<&Value>| v.and_then(|v| v.as_str()).map(str::to_string);

    match res_type {
        ALLERGY_INTOLERANCE => s(resource.get("recordedDate")),
        CONDITION => s(resource.get("recordedDate")),
        DIAGNOSTIC_REPORT => s(resource.get("issued")),
        DOCUMENT_REFERENCE => s(resource.get("date")),
        ENCOUNTER => s(resource.get("period").and_then(|p| p.get("start")))
            .or_else(|| s(resource.get("period").and_then(|p| p.get("end")))),
        IMMUNIZATION => s(resource.get("occurrenceDateTime")),
        MEDICATION_REQUEST => s(resource.get("authoredOn")),
        OBSERVATION => s(resource.get("effectiveDateTime"))
            .or_else(|| s(resource.get("effectiveInstant")))
            .or_else(|| s(resource.get("effectivePeriod").and_then(|p| p.get("start"))))
            .or_else(|| s(resource.get("effectivePeriod").and_then(|p| p.get("end")))),
        PROCEDURE => s(resource.get("performedDateTime"))
            .or_else(|| s(resource.get("performedPeriod").and_then(|p| p.get("start"))))
            .or_else(|| s(resource.get("performedPeriod").and_then(|p| p.get("end")))),
        SERVICE_REQUEST => s(resource.get("authoredOn")),
        _ => None,
    }
}

pub fn get_updated_date(resource: &Value) -> Option<String> {
    resource
        .get("meta")
        .and_then(|m| m.get("lastUpdated"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn created_date_prefers_start_of_period() {
        let enc = json!({
            "resourceType": "Encounter",
            "period": {"start": "2020-01-01", "end": "2020-01-02"},
        });
        assert_eq!(get_created_date(&enc).as_deref(), Some("2020-01-01"));
    }

    #[test]
    fn created_date_none_for_untracked_type() {
        let device = json!({"resourceType": "Device"});
        assert_eq!(created_search_field("Device"), None);
        assert_eq!(get_created_date(&device), None);
    }

    #[test]
    fn updated_date_reads_meta_last_updated() {
        let obs = json!({"resourceType": "Observation", "meta": {"lastUpdated": "2021-05-01T00:00:00Z"}});
        assert_eq!(get_updated_date(&obs).as_deref(), Some("2021-05-01T00:00:00Z"));
    }
}
