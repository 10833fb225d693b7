//! FHIR wire client: REST reads/searches plus the bulk-export kickoff/poll/
//! download primitives, with the two-class Fatal/Transient error model and
//! the fixed `{1,2,4,8,16}`s retry policy (§7, §9).
//!
//! Grounded in `octofhir-cli`'s `client.rs` for the request-building shape,
//! generalized with the streaming download and retry/poll logic from
//! `original_source/smart_fetch/bulk_utils.py`.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::Value;

use crate::auth::AuthHeader;
use crate::error::ClientError;
use crate::ndjson::NdjsonWriter;

/// Five attempts, exponential backoff: {1, 2, 4, 8, 16}s.
const RETRY_DELAYS: [u64; 5] = [1, 2, 4, 8, 16];

/// `reqwest`'s default per-host idle pool; we don't pin a hard cap on the
/// client, so this is the number used to derive `peek_at = 2 x pool_size`.
pub const DEFAULT_POOL_SIZE: usize = 10;

#[derive(Clone)]
pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<AuthHeader>,
    pool_size: usize,
}

pub enum PollOutcome {
    Manifest(Value),
    KeepWaiting { retry_after: Duration, x_progress: Option<String> },
}

impl FhirClient {
    pub fn new(base_url: &str, auth: Option<AuthHeader>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, url);
        match &self.auth {
            Some(AuthHeader::Basic { username, password }) => {
                req = req.basic_auth(username, Some(password));
            }
            Some(AuthHeader::Bearer { token }) => {
                req = req.bearer_auth(token);
            }
            None => {}
        }
        req
    }

    fn fhir_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Classifies an HTTP response status into Fatal vs. Transient, per §7:
    /// 4xx other than 429 is fatal; 429 and 5xx are transient.
    fn classify_status(status: StatusCode, body: &str) -> ClientError {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ClientError::Transient(format!("HTTP {status}: {body}"))
        } else {
            ClientError::Fatal(format!("HTTP {status}: {body}"))
        }
    }

    /// Runs `attempt` up to five times with the fixed backoff schedule,
    /// retrying only on `Transient` errors; a `Fatal` error aborts
    /// immediately without consuming the retry budget.
    async fn with_retries<T, F, Fut>(&self, mut attempt: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut last_err = None;
        for (tries, delay) in std::iter::once(0).chain(RETRY_DELAYS).enumerate() {
            if tries > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match attempt().await {
                Ok(v) => return Ok(v),
                Err(err @ ClientError::Fatal(_)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ClientError::Transient("exhausted retries".to_string())))
    }

    pub async fn get(&self, url: &str) -> Result<Value, ClientError> {
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::GET, url)
                .header("Accept", "application/fhir+json")
                .send()
                .await
                .map_err(|e| ClientError::Transient(e.to_string()))?;
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !status.is_success() {
                return Err(Self::classify_status(status, &body));
            }
            serde_json::from_str(&body).map_err(|e| ClientError::Fatal(e.to_string()))
        })
        .await
    }

    pub async fn read(&self, resource_type: &str, id: &str) -> Result<Value, ClientError> {
        self.get(&self.fhir_url(&format!("{resource_type}/{id}"))).await
    }

    pub async fn search(&self, url: &str) -> Result<Value, ClientError> {
        self.get(url).await
    }

    /// Kicks off a bulk export. Builds `$export` with `Prefer:
    /// respond-async`; on 202, returns the `Content-Location` poll URL.
    pub async fn bulk_kickoff(&self, url: &str) -> Result<String, ClientError> {
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::GET, url)
                .header("Accept", "application/fhir+json")
                .header("Prefer", "respond-async")
                .send()
                .await
                .map_err(|e| ClientError::Transient(e.to_string()))?;
            let status = resp.status();
            if status != StatusCode::ACCEPTED {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            resp.headers()
                .get("content-location")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ClientError::Fatal("202 response missing Content-Location".to_string()))
        })
        .await
    }

    /// Polls the status URL once. 200 is the manifest; 202 means keep
    /// waiting (caller sleeps `min(Retry-After, 300s)` and calls again);
    /// anything else is a hard error.
    pub async fn bulk_poll(&self, status_url: &str) -> Result<PollOutcome, ClientError> {
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::GET, status_url)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| ClientError::Transient(e.to_string()))?;
            let status = resp.status();
            if status == StatusCode::OK {
                let body = resp.text().await.unwrap_or_default();
                let manifest: Value =
                    serde_json::from_str(&body).map_err(|e| ClientError::Fatal(e.to_string()))?;
                return Ok(PollOutcome::Manifest(manifest));
            }
            if status == StatusCode::ACCEPTED {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60)
                    .min(300);
                let x_progress = resp
                    .headers()
                    .get("x-progress")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                return Ok(PollOutcome::KeepWaiting {
                    retry_after: Duration::from_secs(retry_after),
                    x_progress,
                });
            }
            let body = resp.text().await.unwrap_or_default();
            Err(Self::classify_status(status, &body))
        })
        .await
    }

    /// Streams a manifest file URL straight to `writer`, never buffering the
    /// whole body in memory.
    pub async fn download_to(&self, url: &str, writer: &mut NdjsonWriter) -> Result<usize, ClientError> {
        self.with_retries_stream(url, writer).await
    }

    async fn with_retries_stream(
        &self,
        url: &str,
        writer: &mut NdjsonWriter,
    ) -> Result<usize, ClientError> {
        // Streaming bodies can't be cheaply retried mid-stream; we retry the
        // whole request, which is safe since the writer only starts lazily.
        let mut last_err = None;
        for (tries, delay) in std::iter::once(0).chain(RETRY_DELAYS).enumerate() {
            if tries > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            match self.stream_once(url, writer).await {
                Ok(n) => return Ok(n),
                Err(err @ ClientError::Fatal(_)) => return Err(err),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ClientError::Transient("exhausted retries".to_string())))
    }

    async fn stream_once(&self, url: &str, writer: &mut NdjsonWriter) -> Result<usize, ClientError> {
        let resp = self
            .request(reqwest::Method::GET, url)
            .header("Accept", "application/fhir+ndjson")
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        let mut count = 0usize;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transient(e.to_string()))?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line = buf.drain(..=pos).collect::<Vec<_>>();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                let value: Value = serde_json::from_slice(line)
                    .map_err(|e| ClientError::Fatal(format!("invalid NDJSON line: {e}")))?;
                writer
                    .write(&value)
                    .await
                    .map_err(|e| ClientError::Fatal(e.to_string()))?;
                count += 1;
            }
        }
        if !buf.is_empty() {
            let value: Value = serde_json::from_slice(&buf)
                .map_err(|e| ClientError::Fatal(format!("invalid NDJSON line: {e}")))?;
            writer
                .write(&value)
                .await
                .map_err(|e| ClientError::Fatal(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// DELETE on the status URL (or any absolute URL): used both for the
    /// post-download courtesy cleanup and operator-initiated cancellation.
    /// Failure here is a warning, never fatal to the caller.
    pub async fn delete(&self, url: &str) -> Result<(), ClientError> {
        let resp = self
            .request(reqwest::Method::DELETE, url)
            .send()
            .await
            .map_err(|e| ClientError::Transient(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != StatusCode::ACCEPTED {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body));
        }
        Ok(())
    }

    /// Downloads a file to a local path without NDJSON parsing (used for
    /// attachment bytes, which are arbitrary binary content).
    pub async fn get_bytes(&self, url: &str, accept: &str) -> Result<(Vec<u8>, Option<String>), ClientError> {
        self.with_retries(|| async {
            let resp = self
                .request(reqwest::Method::GET, url)
                .header("Accept", accept)
                .send()
                .await
                .map_err(|e| ClientError::Transient(e.to_string()))?;
            let status = resp.status();
            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::classify_status(status, &body));
            }
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| ClientError::Transient(e.to_string()))?
                .to_vec();
            Ok((bytes, content_type))
        })
        .await
    }
}

/// `output_path` helper shared by C5/C6: numbered-per-type filenames under a
/// subdirectory, e.g. `<dest>/Patient.001.ndjson.gz`.
pub fn numbered_path(dir: &Path, res_type: &str, index: usize, compress: bool) -> std::path::PathBuf {
    let ext = if compress { "ndjson.gz" } else { "ndjson" };
    dir.join(format!("{res_type}.{index:03}.{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit_as_transient() {
        let err = FhirClient::classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(!err.is_fatal());
    }

    #[test]
    fn classifies_not_found_as_fatal() {
        let err = FhirClient::classify_status(StatusCode::NOT_FOUND, "nope");
        assert!(err.is_fatal());
    }

    #[test]
    fn classifies_server_error_as_transient() {
        let err = FhirClient::classify_status(StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(!err.is_fatal());
    }

    #[test]
    fn numbered_path_pads_index() {
        let p = numbered_path(Path::new("/tmp/out"), "Patient", 1, true);
        assert_eq!(p, Path::new("/tmp/out/Patient.001.ndjson.gz"));
    }
}
