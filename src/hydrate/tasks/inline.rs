//! `doc-inline`/`dxr-inline` tasks: fetch attachment bodies referenced by
//! `url` and write them back inline as base64 `data`, for
//! DocumentReference.content and DiagnosticReport.presentedForm.
//!
//! Grounded in `original_source/smart_fetch/tasks/inline.py`.

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use sha1::{Digest, Sha1};

use super::super::{HydrationTask, SingleResult, TaskResultReason};
use crate::client::FhirClient;
use crate::error::ClientError;
use crate::resources;

const DEFAULT_MIMETYPES: &[&str] = &["text/plain", "text/html", "application/xhtml+xml"];

fn content_mimetype(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or(content_type).trim()
}

/// Builds the replacement `contentType` from the response actually received,
/// not the attachment's stale pre-fetch value: `"mime; charset=enc"`, taking
/// the charset straight from the response header when present and falling
/// back to UTF-8 otherwise (FHIR attachment `data` is always base64 of the
/// raw bytes, so the charset only matters for the retrieval metadata).
fn response_content_type_value(response_mimetype: &str, response_content_type: Option<&str>) -> String {
    match response_content_type.filter(|ct| ct.contains("charset=")) {
        Some(ct) => ct.to_string(),
        None => format!("{response_mimetype}; charset=utf-8"),
    }
}

fn attachments_of<'a>(resource: &'a Value) -> Vec<&'a Value> {
    match resource.get("resourceType").and_then(|v| v.as_str()) {
        Some("DiagnosticReport") => resource
            .get("presentedForm")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().collect())
            .unwrap_or_default(),
        Some("DocumentReference") => resource
            .get("content")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("attachment"))
            .collect(),
        _ => Vec::new(),
    }
}

async fn inline_attachment(client: &FhirClient, attachment: &mut Value, mimetypes: &HashSet<String>) -> TaskResultReason {
    let Some(content_type) = attachment.get("contentType").and_then(|v| v.as_str()).map(str::to_string) else {
        return TaskResultReason::Ignored;
    };
    let mimetype = content_mimetype(&content_type).to_string();
    if !mimetypes.contains(&mimetype) {
        return TaskResultReason::Ignored;
    }
    if attachment.get("data").is_some() {
        return TaskResultReason::AlreadyDone;
    }
    let Some(url) = attachment.get("url").and_then(|v| v.as_str()).map(str::to_string) else {
        return TaskResultReason::Ignored;
    };

    let (bytes, response_content_type) = match client.get_bytes(&url, &mimetype).await {
        Ok(v) => v,
        Err(ClientError::Fatal(_)) => return TaskResultReason::FatalError,
        Err(ClientError::Transient(_)) => return TaskResultReason::RetryError,
    };

    let response_mimetype = response_content_type.as_deref().map(content_mimetype).unwrap_or_default();
    if response_mimetype != mimetype {
        return TaskResultReason::FatalError;
    }

    let new_content_type = response_content_type_value(response_mimetype, response_content_type.as_deref());
    let hash = Sha1::digest(&bytes);
    let obj = attachment.as_object_mut().expect("attachment is an object");
    obj.insert("data".to_string(), Value::String(BASE64.encode(&bytes)));
    obj.insert("contentType".to_string(), Value::String(new_content_type));
    obj.insert("size".to_string(), Value::Number(bytes.len().into()));
    obj.insert("hash".to_string(), Value::String(BASE64.encode(hash)));

    TaskResultReason::NewlyDone
}

async fn inline_resource(client: &FhirClient, resource: &Value, mimetypes: &HashSet<String>) -> Vec<SingleResult> {
    if attachments_of(resource).is_empty() {
        return vec![(Some(resource.clone()), TaskResultReason::Ignored)];
    }

    let mut updated = resource.clone();
    let mut reasons = Vec::new();

    match updated.get("resourceType").and_then(|v| v.as_str()) {
        Some("DiagnosticReport") => {
            if let Some(arr) = updated.get_mut("presentedForm").and_then(|v| v.as_array_mut()) {
                for attachment in arr.iter_mut() {
                    reasons.push(inline_attachment(client, attachment, mimetypes).await);
                }
            }
        }
        Some("DocumentReference") => {
            if let Some(arr) = updated.get_mut("content").and_then(|v| v.as_array_mut()) {
                for content in arr.iter_mut() {
                    if let Some(attachment) = content.get_mut("attachment") {
                        reasons.push(inline_attachment(client, attachment, mimetypes).await);
                    }
                }
            }
        }
        _ => {}
    }

    let mut results: Vec<SingleResult> = reasons.into_iter().map(|r| (None, r)).collect();
    if let Some(first) = results.first_mut() {
        first.0 = Some(updated);
    }
    results
}

pub fn default_mimetypes() -> HashSet<String> {
    DEFAULT_MIMETYPES.iter().map(|s| s.to_string()).collect()
}

/// Parses `--mimetypes`' comma-separated value, falling back to
/// [`default_mimetypes`] when unset or empty.
pub fn parse_mimetypes(raw: Option<&str>) -> HashSet<String> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => {
            raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
        }
        _ => default_mimetypes(),
    }
}

pub struct InlineDocTask {
    pub mimetypes: HashSet<String>,
}

impl InlineDocTask {
    pub fn new(mimetypes: HashSet<String>) -> Self {
        Self { mimetypes }
    }
}

#[async_trait::async_trait]
impl HydrationTask for InlineDocTask {
    fn name(&self) -> &'static str {
        "doc-inline"
    }

    fn input_type(&self) -> &'static str {
        resources::DOCUMENT_REFERENCE
    }

    fn output_type(&self) -> &'static str {
        resources::DOCUMENT_REFERENCE
    }

    fn append(&self) -> bool {
        false
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        _id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        Ok(inline_resource(client, resource, &self.mimetypes).await)
    }
}

pub struct InlineDxrTask {
    pub mimetypes: HashSet<String>,
}

impl InlineDxrTask {
    pub fn new(mimetypes: HashSet<String>) -> Self {
        Self { mimetypes }
    }
}

#[async_trait::async_trait]
impl HydrationTask for InlineDxrTask {
    fn name(&self) -> &'static str {
        "dxr-inline"
    }

    fn input_type(&self) -> &'static str {
        resources::DIAGNOSTIC_REPORT
    }

    fn output_type(&self) -> &'static str {
        resources::DIAGNOSTIC_REPORT
    }

    fn append(&self) -> bool {
        false
    }

    async fn process_one(
        &self,
        client: &FhirClient,
        resource: &Value,
        _id_pool: &mut HashSet<String>,
    ) -> Result<Vec<SingleResult>, ClientError> {
        Ok(inline_resource(client, resource, &self.mimetypes).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_mimetype_strips_charset_parameter() {
        assert_eq!(content_mimetype("text/html; charset=utf-8"), "text/html");
    }

    #[test]
    fn attachments_of_reads_presented_form() {
        let resource = json!({
            "resourceType": "DiagnosticReport",
            "presentedForm": [{"contentType": "text/plain", "url": "http://x/1"}],
        });
        assert_eq!(attachments_of(&resource).len(), 1);
    }

    #[test]
    fn attachments_of_reads_document_reference_content() {
        let resource = json!({
            "resourceType": "DocumentReference",
            "content": [{"attachment": {"contentType": "text/html", "url": "http://x/1"}}],
        });
        assert_eq!(attachments_of(&resource).len(), 1);
    }

    #[test]
    fn resource_with_no_attachments_is_ignored_but_kept() {
        let resource = json!({"resourceType": "DocumentReference", "content": []});
        assert!(attachments_of(&resource).is_empty());
    }

    #[test]
    fn tasks_rewrite_in_place_not_append() {
        let doc = InlineDocTask::new(default_mimetypes());
        let dxr = InlineDxrTask::new(default_mimetypes());
        assert!(!doc.append());
        assert!(!dxr.append());
        assert_eq!(doc.input_type(), doc.output_type());
    }

    #[test]
    fn parse_mimetypes_falls_back_to_default_when_unset() {
        assert_eq!(parse_mimetypes(None), default_mimetypes());
        assert_eq!(parse_mimetypes(Some("  ")), default_mimetypes());
    }

    #[test]
    fn parse_mimetypes_splits_comma_separated_list() {
        let parsed = parse_mimetypes(Some("text/plain, application/pdf"));
        assert!(parsed.contains("text/plain"));
        assert!(parsed.contains("application/pdf"));
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    fn response_content_type_prefers_response_charset() {
        assert_eq!(
            response_content_type_value("text/plain", Some("text/plain; charset=iso-8859-1")),
            "text/plain; charset=iso-8859-1"
        );
        assert_eq!(response_content_type_value("text/plain", None), "text/plain; charset=utf-8");
    }
}
