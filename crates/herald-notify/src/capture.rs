//! Extraction of a [`NotificationRecord`] from one request/response pair.
//!
//! Capture only reads buffers the transport has already collected. The
//! transport is responsible for handing the caller the original bytes; this
//! module never sees the live body streams.

use std::collections::BTreeMap;

use crate::record::NotificationRecord;

/// Value recorded in place of a redacted header.
pub const REDACTED: &str = "[redacted]";

/// What capture keeps and what it masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Bodies longer than this are truncated in the record.
    pub max_body_bytes: usize,
    /// Header names (case-insensitive) whose values are replaced by [`REDACTED`].
    pub redact_headers: Vec<String>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: 64 * 1024,
            redact_headers: vec!["authorization".to_string(), "cookie".to_string()],
        }
    }
}

/// The inbound half of an audited call, already buffered.
#[derive(Debug, Clone, Default)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Header pairs in arrival order; repeated names are joined.
    pub headers: Vec<(String, String)>,
    pub query: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub client_host: Option<String>,
    /// Resolved caller identity; `None` when unauthenticated or when
    /// resolution failed.
    pub actor_id: Option<i64>,
}

/// The outbound half of an audited call, already buffered.
#[derive(Debug, Clone, Default)]
pub struct CapturedResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Builds exactly one record from a request/response pair.
pub fn capture(
    settings: &CaptureSettings,
    request: &CapturedRequest,
    response: &CapturedResponse,
) -> NotificationRecord {
    let mut record = NotificationRecord::new(request.method.clone(), request.path.clone());
    record.user_id = request.actor_id;
    record.request_body = body_text(&request.body, settings.max_body_bytes);
    record.response_body = body_text(&response.body, settings.max_body_bytes);
    record.status_code = Some(response.status);
    record.headers = collect_headers(&request.headers, &settings.redact_headers);
    record.client_host = request.client_host.clone();
    record.query_params = (!request.query.is_empty()).then(|| request.query.clone());
    record
}

/// Decodes a body for the record. Empty bodies become `None`; invalid UTF-8
/// is replaced rather than rejected.
fn body_text(body: &[u8], max_bytes: usize) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let mut text = String::from_utf8_lossy(body).into_owned();
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    Some(text)
}

fn collect_headers(
    headers: &[(String, String)],
    redact: &[String],
) -> Option<BTreeMap<String, String>> {
    if headers.is_empty() {
        return None;
    }
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        let value = if redact.iter().any(|r| r.eq_ignore_ascii_case(&name)) {
            REDACTED.to_string()
        } else {
            value.clone()
        };
        map.entry(name)
            .and_modify(|existing| {
                if existing != REDACTED {
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
            })
            .or_insert(value);
    }
    Some(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_health() -> CapturedRequest {
        CapturedRequest {
            method: "GET".to_string(),
            path: "/health".to_string(),
            client_host: Some("127.0.0.1".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn minimal_request_keeps_nulls() {
        let record = capture(
            &CaptureSettings::default(),
            &get_health(),
            &CapturedResponse {
                status: 200,
                body: Vec::new(),
            },
        );

        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/health");
        assert_eq!(record.user_id, None);
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.request_body, None);
        assert_eq!(record.response_body, None);
        assert_eq!(record.headers, None);
        assert_eq!(record.query_params, None);
        assert_eq!(record.client_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(record.timestamp, None, "timestamp is assigned by the store");
    }

    #[test]
    fn bodies_and_query_are_recorded() {
        let mut request = get_health();
        request.method = "POST".to_string();
        request.path = "/api/users".to_string();
        request.actor_id = Some(42);
        request.body = br#"{"name":"ada"}"#.to_vec();
        request.query.insert("page".to_string(), "2".to_string());

        let record = capture(
            &CaptureSettings::default(),
            &request,
            &CapturedResponse {
                status: 422,
                body: br#"{"error":"duplicate"}"#.to_vec(),
            },
        );

        assert_eq!(record.user_id, Some(42));
        assert_eq!(record.request_body.as_deref(), Some(r#"{"name":"ada"}"#));
        assert_eq!(record.response_body.as_deref(), Some(r#"{"error":"duplicate"}"#));
        assert_eq!(record.status_code, Some(422));
        assert_eq!(
            record.query_params.and_then(|q| q.get("page").cloned()).as_deref(),
            Some("2")
        );
    }

    #[test]
    fn configured_headers_are_redacted() {
        let mut request = get_health();
        request.headers = vec![
            ("Authorization".to_string(), "Bearer secret".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
            ("X-Trace".to_string(), "a".to_string()),
            ("x-trace".to_string(), "b".to_string()),
        ];

        let record = capture(
            &CaptureSettings::default(),
            &request,
            &CapturedResponse::default(),
        );
        let headers = record.headers.expect("headers recorded");

        assert_eq!(headers["authorization"], REDACTED);
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers["x-trace"], "a, b");
    }

    #[test]
    fn long_bodies_truncate_on_char_boundary() {
        let settings = CaptureSettings {
            max_body_bytes: 5,
            ..Default::default()
        };
        // "é" is two bytes wide.
        let text = body_text("héllo!".as_bytes(), settings.max_body_bytes).expect("non-empty");
        assert_eq!(text, "héll");

        let tiny = body_text("éé".as_bytes(), 1).expect("non-empty");
        assert_eq!(tiny, "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let text = body_text(&[0x66, 0x6f, 0xff], 1024).expect("non-empty");
        assert_eq!(text, "fo\u{fffd}");
    }
}
