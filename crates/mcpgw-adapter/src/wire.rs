//! The line-delimited JSON wire format spoken with stdio children.
//!
//! One request object per line on stdin, one reply object per line on
//! stdout. The reply's `statusCode` defaults to 200. Only values that
//! match the reply shape are unpacked; anything else, such as a child
//! that simply echoes the request line back, is passed through whole and
//! still produces a well-formed 200 response.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// One translated HTTP request, written to the child's stdin.
#[derive(Debug, Serialize)]
pub struct StdioRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl StdioRequest {
    /// Serialize to a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// One reply read back from the child's stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioReply {
    pub status_code: u16,
    pub body: String,
}

impl StdioReply {
    /// Interpret a raw JSON value as a reply.
    ///
    /// Only a value that matches the reply shape is unpacked: an object
    /// carrying `statusCode` (with out-of-range values falling back to
    /// 200), or an object whose sole key is `body`. A string `body` is
    /// taken verbatim and any other `body` is re-serialized. Everything
    /// else, notably a child that echoes the translated request back
    /// (`{method,url,headers,body}`), is itself the body.
    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self {
                status_code: 200,
                body: value.to_string(),
            };
        };

        let has_status = object.contains_key("statusCode");
        let body_only = object.len() == 1 && object.contains_key("body");
        if !has_status && !body_only {
            return Self {
                status_code: 200,
                body: value.to_string(),
            };
        }

        let status_code = object
            .get("statusCode")
            .and_then(Value::as_u64)
            .and_then(|code| u16::try_from(code).ok())
            .filter(|code| (100..=599).contains(code))
            .unwrap_or(200);

        let body = match object.get("body") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        };

        Self { status_code, body }
    }

    /// Parse one stdout line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        Ok(Self::from_value(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_on_one_line() {
        let request = StdioRequest {
            method: "POST".to_string(),
            url: "/ping?x=1".to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: "hi".to_string(),
        };
        let line = request.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line[..line.len() - 1].contains('\n'));
        assert!(line.contains("\"method\":\"POST\""));
        assert!(line.contains("\"url\":\"/ping?x=1\""));
    }

    #[test]
    fn reply_with_status_and_body() {
        let reply = StdioReply::from_line(r#"{"statusCode":404,"body":"missing"}"#).unwrap();
        assert_eq!(reply.status_code, 404);
        assert_eq!(reply.body, "missing");
    }

    #[test]
    fn status_code_defaults_to_200() {
        let reply = StdioReply::from_line(r#"{"body":"pong"}"#).unwrap();
        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.body, "pong");
    }

    #[test]
    fn echoed_request_passes_through_whole() {
        let echo = r#"{"method":"POST","url":"/ping","headers":{},"body":"x"}"#;
        let reply = StdioReply::from_line(echo).unwrap();
        assert_eq!(reply.status_code, 200);
        // No statusCode and extra keys: this is not a reply object, so
        // the client sees the translated request verbatim.
        let round_tripped: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(round_tripped, serde_json::from_str::<serde_json::Value>(echo).unwrap());
        assert_eq!(round_tripped["method"], "POST");
        assert_eq!(round_tripped["url"], "/ping");
        assert_eq!(round_tripped["body"], "x");
    }

    #[test]
    fn object_without_body_passes_through_whole() {
        let reply = StdioReply::from_line(r#"{"ok":true,"items":[1,2]}"#).unwrap();
        assert_eq!(reply.status_code, 200);
        let round_tripped: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(round_tripped["ok"], true);
        assert_eq!(round_tripped["items"][1], 2);
    }

    #[test]
    fn status_code_with_extra_keys_is_still_a_reply() {
        let reply =
            StdioReply::from_line(r#"{"statusCode":404,"body":"missing","detail":"x"}"#).unwrap();
        assert_eq!(reply.status_code, 404);
        assert_eq!(reply.body, "missing");
    }

    #[test]
    fn non_string_body_is_reserialized() {
        let reply = StdioReply::from_line(r#"{"statusCode":201,"body":{"id":7}}"#).unwrap();
        assert_eq!(reply.status_code, 201);
        assert_eq!(reply.body, r#"{"id":7}"#);
    }

    #[test]
    fn out_of_range_status_falls_back() {
        let reply = StdioReply::from_line(r#"{"statusCode":99,"body":"x"}"#).unwrap();
        assert_eq!(reply.status_code, 200);
    }
}
