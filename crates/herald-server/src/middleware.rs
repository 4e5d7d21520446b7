//! Audit capture middleware.
//!
//! Copies each request and response body, hands identical bytes on to the
//! inner service and back to the caller, and feeds the copy to the
//! notification pipeline on a spawned task. Bodies over
//! [`MAX_REQUEST_BODY_BYTES`] stream through uncaptured. The caller's
//! response never depends on whether capture, persistence or broadcast
//! succeeded.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Query},
    http::{header, request::Parts, HeaderMap, Request, Uri},
    middleware::Next,
    response::Response,
};
use futures_util::StreamExt;
use herald_notify::{CapturedRequest, CapturedResponse, NotificationPipeline};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::{AppState, MAX_REQUEST_BODY_BYTES, WS_PATH};

/// Header carrying the caller's numeric user id when no authentication
/// layer has already resolved one.
pub const ACTOR_HEADER: &str = "x-actor-id";

/// Caller identity resolved by an authentication layer, stored in request
/// extensions. Takes precedence over [`ACTOR_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorId(pub i64);

/// Middleware that audits every request/response cycle.
///
/// The push endpoint is never audited, whatever `capture.skip_paths` says.
pub async fn audit_middleware(req: Request<Body>, next: Next) -> Response {
    let Some(state) = req.extensions().get::<Arc<AppState>>().cloned() else {
        tracing::error!("audit middleware running without AppState; request not audited");
        return next.run(req).await;
    };

    let path = req.uri().path();
    if path == WS_PATH || state.audit_skip_paths.iter().any(|p| p == path) {
        return next.run(req).await;
    }

    let (parts, body) = req.into_parts();
    let (body, request_bytes) =
        match tee_body(body, MAX_REQUEST_BODY_BYTES, &parts.headers).await {
            Teed::Complete(bytes) => (Body::from(bytes.clone()), bytes.to_vec()),
            Teed::Uncaptured(body) => {
                tracing::debug!(path = %parts.uri.path(), "request body not captured");
                (body, Vec::new())
            }
            Teed::Failed(body) => (body, Vec::new()),
        };

    let captured_request = CapturedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: header_pairs(&parts.headers),
        query: query_map(&parts.uri),
        body: request_bytes,
        client_host: client_host(&parts),
        actor_id: resolve_actor(&parts),
    };

    let response = next.run(Request::from_parts(parts, body)).await;

    if is_streaming(response.headers()) {
        let captured_response = CapturedResponse {
            status: response.status().as_u16(),
            body: Vec::new(),
        };
        spawn_ingest(state.pipeline.clone(), captured_request, captured_response);
        return response;
    }

    let (parts, body) = response.into_parts();
    let status = parts.status.as_u16();
    let (body, response_bytes) =
        match tee_body(body, MAX_REQUEST_BODY_BYTES, &parts.headers).await {
            Teed::Complete(bytes) => (Body::from(bytes.clone()), bytes.to_vec()),
            Teed::Uncaptured(body) => (body, Vec::new()),
            Teed::Failed(body) => {
                tracing::error!(
                    path = %captured_request.path,
                    status,
                    "response body failed mid-stream; request not audited"
                );
                return Response::from_parts(parts, body);
            }
        };

    let captured_response = CapturedResponse {
        status,
        body: response_bytes,
    };
    spawn_ingest(state.pipeline.clone(), captured_request, captured_response);

    Response::from_parts(parts, body)
}

/// Outcome of copying a body for the audit record.
enum Teed {
    /// The whole body, within the limit.
    Complete(Bytes),
    /// Too large to capture; the body is handed on unchanged.
    Uncaptured(Body),
    /// Reading failed; the body replays what was read, then the error.
    Failed(Body),
}

/// Buffers `body` up to `limit` bytes. Whatever happens, the returned body
/// yields exactly the bytes (and error) the original would have.
async fn tee_body(body: Body, limit: usize, headers: &HeaderMap) -> Teed {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > limit) {
        return Teed::Uncaptured(body);
    }

    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut read = 0usize;

    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                read += chunk.len();
                chunks.push(chunk);
                if read > limit {
                    let prefix = futures_util::stream::iter(chunks.into_iter().map(Ok));
                    return Teed::Uncaptured(Body::from_stream(prefix.chain(stream)));
                }
            }
            Err(e) => {
                tracing::warn!("failed to read body: {}", e);
                let replay = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(e)));
                return Teed::Failed(Body::from_stream(futures_util::stream::iter(replay)));
            }
        }
    }

    let bytes = match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.swap_remove(0),
        _ => Bytes::from(chunks.concat()),
    };
    Teed::Complete(bytes)
}

fn spawn_ingest(
    pipeline: NotificationPipeline,
    request: CapturedRequest,
    response: CapturedResponse,
) {
    tokio::spawn(async move {
        match pipeline.on_request_complete(&request, &response).await {
            Ok(result) if result.persisted => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    delivered = result.delivered(),
                    recipients = result.delivery.len(),
                    "request audited"
                );
            }
            Ok(result) => {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path,
                    failure = result.failure.as_deref().unwrap_or("unknown"),
                    "request audit not persisted"
                );
            }
            Err(e) => {
                tracing::warn!(method = %request.method, path = %request.path, "request audit rejected: {}", e);
            }
        }
    });
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn query_map(uri: &Uri) -> BTreeMap<String, String> {
    match Query::<BTreeMap<String, String>>::try_from_uri(uri) {
        Ok(Query(map)) => map,
        Err(e) => {
            tracing::debug!(uri = %uri, "unparseable query string: {}", e);
            BTreeMap::new()
        }
    }
}

fn client_host(parts: &Parts) -> Option<String> {
    if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip().to_string());
    }
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves the caller's user id. Failure is never fatal: an absent or
/// malformed credential just yields `None`.
fn resolve_actor(parts: &Parts) -> Option<i64> {
    if let Some(ActorId(id)) = parts.extensions.get::<ActorId>() {
        return Some(*id);
    }
    let raw = parts.headers.get(ACTOR_HEADER)?;
    match raw.to_str().ok().and_then(|v| v.trim().parse().ok()) {
        Some(id) => Some(id),
        None => {
            tracing::debug!("ignoring malformed {} header", ACTOR_HEADER);
            None
        }
    }
}

fn is_streaming(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}
