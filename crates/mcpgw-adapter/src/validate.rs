//! Request validation applied before any translation to the child.
//!
//! Everything here is allowlist-shaped: unknown methods are rejected,
//! unknown headers are dropped, suspicious bytes are stripped. The child
//! only ever sees sanitized input.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, Method};
use thiserror::Error;

/// Methods the adapter will translate.
const ALLOWED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS",
];

/// Headers forwarded to the child; everything else is dropped.
const ALLOWED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "authorization",
    "accept",
    "accept-encoding",
    "accept-language",
    "user-agent",
    "x-forwarded-for",
    "x-real-ip",
    "host",
];

const MAX_URL_LENGTH: usize = 2048;
const MAX_HEADER_VALUE_LENGTH: usize = 1024;

/// Characters never allowed in URLs or header values.
const FORBIDDEN_CHARS: &[char] = &['<', '>', '"', '\''];

/// A request rejected before translation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Method '{0}' is not allowed")]
    InvalidMethod(String),

    #[error("Invalid request URL")]
    InvalidUrl,

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
}

/// Uppercase and check the method against the allowlist.
pub fn validate_method(method: &Method) -> Result<String, RequestError> {
    let upper = method.as_str().to_uppercase();
    if ALLOWED_METHODS.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(RequestError::InvalidMethod(upper))
    }
}

/// Non-empty, bounded length, no markup characters.
pub fn validate_url(url: &str) -> Result<(), RequestError> {
    if url.is_empty() || url.len() > MAX_URL_LENGTH || url.contains(FORBIDDEN_CHARS) {
        return Err(RequestError::InvalidUrl);
    }
    Ok(())
}

/// Keep only allowlisted headers, with sanitized values.
///
/// Values are stripped of CR/LF and markup characters, trimmed, and must
/// land in 1..=1024 bytes; values outside that range are dropped rather
/// than failing the request. Keys come out lowercased.
pub fn sanitize_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut sanitized = BTreeMap::new();
    for (name, value) in headers {
        let key = name.as_str().to_lowercase();
        if !ALLOWED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        let Ok(raw) = value.to_str() else {
            continue;
        };
        let cleaned: String = raw
            .chars()
            .filter(|c| *c != '\r' && *c != '\n' && !FORBIDDEN_CHARS.contains(c))
            .collect();
        let trimmed = cleaned.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_HEADER_VALUE_LENGTH {
            continue;
        }
        sanitized.insert(key, trimmed.to_string());
    }
    sanitized
}

/// Enforce the size cap and strip null bytes.
pub fn sanitize_body(body: &[u8], limit: usize) -> Result<Vec<u8>, RequestError> {
    if body.len() > limit {
        return Err(RequestError::BodyTooLarge { limit });
    }
    Ok(body.iter().copied().filter(|b| *b != 0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn known_methods_pass_uppercased() {
        assert_eq!(validate_method(&Method::GET).unwrap(), "GET");
        assert_eq!(validate_method(&Method::OPTIONS).unwrap(), "OPTIONS");
    }

    #[test]
    fn trace_is_rejected() {
        assert_eq!(
            validate_method(&Method::TRACE),
            Err(RequestError::InvalidMethod("TRACE".to_string()))
        );
    }

    #[test]
    fn url_length_boundary() {
        let ok = format!("/{}", "a".repeat(MAX_URL_LENGTH - 1));
        assert_eq!(ok.len(), MAX_URL_LENGTH);
        assert!(validate_url(&ok).is_ok());

        let too_long = format!("/{}", "a".repeat(MAX_URL_LENGTH));
        assert_eq!(validate_url(&too_long), Err(RequestError::InvalidUrl));
    }

    #[test]
    fn url_rejects_markup_and_empty() {
        assert_eq!(validate_url(""), Err(RequestError::InvalidUrl));
        assert_eq!(validate_url("/a<script>"), Err(RequestError::InvalidUrl));
        assert!(validate_url("/ok?x=1").is_ok());
    }

    #[test]
    fn headers_are_filtered_and_sanitized() {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("X-Evil", HeaderValue::from_static("nope"));
        headers.insert(
            "User-Agent",
            HeaderValue::from_static("agent<1>\"quoted\" "),
        );

        let sanitized = sanitize_headers(&headers);
        assert_eq!(
            sanitized.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert!(!sanitized.contains_key("x-evil"));
        assert_eq!(
            sanitized.get("user-agent").map(String::as_str),
            Some("agent1quoted")
        );
    }

    #[test]
    fn oversized_header_values_are_dropped() {
        let mut headers = HeaderMap::new();
        let long = "v".repeat(MAX_HEADER_VALUE_LENGTH + 1);
        headers.insert("Accept", HeaderValue::from_str(&long).unwrap());
        assert!(sanitize_headers(&headers).is_empty());
    }

    #[test]
    fn body_boundary_and_null_stripping() {
        let exact = vec![b'x'; 64];
        assert_eq!(sanitize_body(&exact, 64).unwrap().len(), 64);

        let over = vec![b'x'; 65];
        assert_eq!(
            sanitize_body(&over, 64),
            Err(RequestError::BodyTooLarge { limit: 64 })
        );

        assert_eq!(sanitize_body(b"a\0b", 64).unwrap(), b"ab".to_vec());
    }
}
