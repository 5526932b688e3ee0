//! Link streaming handlers (GET / HEAD)

use crate::auth::Identity;
use crate::link::LinkId;
use crate::middleware::RequestId;
use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::{Extension, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use linkstream_core::{Admission, ByteRange, CoreError};
use linkstream_upstream::FileMeta;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Query parameters accepted on link paths
#[derive(Debug, Default, Deserialize)]
pub struct LinkQuery {
    pub hash: Option<String>,
}

/// What a validated request will serve
struct Resolved {
    meta: FileMeta,
    /// `None` when no `Range` header was sent
    requested: Option<ByteRange>,
}

impl Resolved {
    fn range(&self) -> Option<ByteRange> {
        self.requested.or_else(|| ByteRange::full(self.meta.size_bytes))
    }

    fn status(&self) -> StatusCode {
        if self.requested.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }
}

/// GET /{link} - stream a file or a byte range of it
pub async fn stream_file(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<LinkQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    serve(&state, &identity, &request_id, &uri, query, &headers)
        .await
        .map_err(|e| e.with_request_id(&request_id))
}

/// HEAD /{link} - headers only, no admission
pub async fn head_file(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<LinkQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve(&state, &uri, query, &headers)
        .await
        .map_err(|e| e.with_request_id(&request_id))?;
    let response_headers = file_headers(&resolved.meta, resolved.range(), resolved.requested.is_some());
    Ok((resolved.status(), response_headers, Body::empty()).into_response())
}

async fn serve(
    state: &AppState,
    identity: &Identity,
    request_id: &str,
    uri: &Uri,
    query: LinkQuery,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let resolved = resolve(state, uri, query, headers).await?;

    let Some(range) = resolved.range() else {
        // empty file, nothing to fetch
        let response_headers = file_headers(&resolved.meta, None, false);
        return Ok((StatusCode::OK, response_headers, Body::empty()).into_response());
    };

    let class = state
        .classifier
        .classify(identity, state.authorizer.as_ref())
        .await;
    match state.admission.admit(&identity.user_id, class) {
        Admission::Admitted => {}
        Admission::Queued(ticket) => {
            info!(
                request_id,
                user_id = %identity.user_id,
                class = %class,
                position = ticket.position(),
                "request queued"
            );
            ticket.wait().await.map_err(CoreError::Throttled)?;
            debug!(request_id, "queued request admitted");
        }
        Admission::Rejected(reason) => return Err(CoreError::Throttled(reason).into()),
    }

    let session = state.streamer.open(request_id, &resolved.meta, range).await?;
    let response_headers = file_headers(&resolved.meta, Some(range), resolved.requested.is_some());
    let body = Body::from_stream(session.into_stream());

    Ok((resolved.status(), response_headers, body).into_response())
}

/// Link → file reference → metadata → secret check → range
async fn resolve(
    state: &AppState,
    uri: &Uri,
    query: LinkQuery,
    headers: &HeaderMap,
) -> Result<Resolved, ApiError> {
    let link = LinkId::parse(uri.path(), query.hash.as_deref())?;

    let file_ref = state
        .file_store
        .lookup_file_ref(link.message_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No file for message {}", link.message_id)))?;

    let meta = state.streamer.resolve_meta(&file_ref).await?;
    if !link.matches(&meta) {
        debug!(message_id = link.message_id, "link secret mismatch");
        return Err(ApiError::forbidden("Invalid security credentials"));
    }

    let requested = match headers.get(header::RANGE) {
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                ApiError::from(CoreError::InvalidRange {
                    reason: "non-ascii range header".to_string(),
                    size: meta.size_bytes,
                })
            })?;
            Some(ByteRange::parse(value, meta.size_bytes)?)
        }
        None => None,
    };

    Ok(Resolved { meta, requested })
}

/// Response headers for serving `range` of `meta`
pub fn file_headers(meta: &FileMeta, range: Option<ByteRange>, partial: bool) -> HeaderMap {
    let mime_type = meta.effective_mime_type();
    let disposition = if mime_type.starts_with("video/") || mime_type.starts_with("audio/") {
        "inline"
    } else {
        "attachment"
    };
    let content_length = range.map_or(0, |r| r.len());

    let mut headers = HeaderMap::new();
    let mut set = |name: header::HeaderName, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    set(header::CONTENT_TYPE, mime_type.clone());
    set(header::CONTENT_LENGTH, content_length.to_string());
    set(
        header::CONTENT_DISPOSITION,
        format!(
            "{}; filename*=UTF-8''{}",
            disposition,
            urlencoding::encode(&download_name(meta))
        ),
    );
    set(header::ACCEPT_RANGES, "bytes".to_string());
    set(
        header::CACHE_CONTROL,
        "public, max-age=31536000, immutable".to_string(),
    );
    if let (true, Some(range)) = (partial, range) {
        set(header::CONTENT_RANGE, range.content_range(meta.size_bytes));
    }
    headers
}

/// File name safe to place in `Content-Disposition`
fn download_name(meta: &FileMeta) -> String {
    let name = match meta.file_name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => urlencoding::decode(name)
            .map(|decoded| decoded.into_owned())
            .unwrap_or_else(|_| name.to_string()),
        None => format!("file_{:08x}", rand::random::<u32>()),
    };
    name.chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '"' | ';'))
        .collect()
}
