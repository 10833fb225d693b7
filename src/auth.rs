//! Authentication is explicitly out of scope (§1): the HTTP client is a
//! collaborator that signs requests and surfaces fatal vs. transient errors,
//! not a credential/token-refresh engine. This module is intentionally thin:
//! it just carries whatever header the CLI was handed.
//!
//! The one piece of real logic here is the REST-vs-bulk token fallback
//! (`AuthContext::bulk_header`), grounded in
//! `original_source/smart_fetch/cli_utils.py::prepare` — per spec.md §9, we
//! follow `smart_fetch`'s fallback (bulk token if given, else the REST
//! token), not `smart_extract`'s `bulk_key = bulk_key` typo that silently
//! dropped the fallback entirely.

#[derive(Debug, Clone)]
pub enum AuthHeader {
    Basic { username: String, password: String },
    Bearer { token: String },
}

/// Holds the REST bearer token and an optional, separately-scoped bulk
/// token.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub rest_token: Option<String>,
    pub bulk_token: Option<String>,
}

impl AuthContext {
    pub fn rest_header(&self) -> Option<AuthHeader> {
        self.rest_token.clone().map(|token| AuthHeader::Bearer { token })
    }

    /// A dedicated bulk token wins; otherwise fall back to the REST token.
    pub fn bulk_header(&self) -> Option<AuthHeader> {
        self.bulk_token
            .clone()
            .or_else(|| self.rest_token.clone())
            .map(|token| AuthHeader::Bearer { token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_header_prefers_dedicated_bulk_token() {
        let ctx = AuthContext {
            rest_token: Some("rest".to_string()),
            bulk_token: Some("bulk".to_string()),
        };
        match ctx.bulk_header().unwrap() {
            AuthHeader::Bearer { token } => assert_eq!(token, "bulk"),
            _ => panic!(),
        }
    }

    #[test]
    fn bulk_header_falls_back_to_rest_token() {
        let ctx = AuthContext { rest_token: Some("rest".to_string()), bulk_token: None };
        match ctx.bulk_header().unwrap() {
            AuthHeader::Bearer { token } => assert_eq!(token, "rest"),
            _ => panic!(),
        }
    }

    #[test]
    fn bulk_header_none_when_nothing_configured() {
        let ctx = AuthContext::default();
        assert!(ctx.bulk_header().is_none());
    }
}
