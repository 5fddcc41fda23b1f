//! OCSP-over-HTTP responder handler
//!
//! Serves the standard transport from RFC 6960 appendix A: a POST of the
//! DER request to `/`, or a GET with the base64 request as the path. The
//! handler never blocks on upstream work; it answers from the cache and
//! degrades to OCSP-layer error responses, always with HTTP 200 and the
//! `application/ocsp-response` content type, the way deployed responders
//! behave.
//!
//! A cached response past its nextUpdate is normally answered with
//! `tryLater` so the terminator keeps its previous staple; operators who
//! prefer availability over freshness can set `dont_die_on_stale_response`
//! to serve the stale bytes instead.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::prelude::{Engine, BASE64_STANDARD};
use staple_cache::{parse_request, status_response, Cache, Clock, OcspErrorStatus};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Content type of every OCSP body, error replies included
pub const OCSP_RESPONSE_CONTENT_TYPE: &str = "application/ocsp-response";

/// Shared state behind the responder routes
#[derive(Clone)]
pub struct ResponderState {
    pub cache: Arc<Cache>,
    pub clock: Arc<dyn Clock>,
    pub dont_die_on_stale_response: bool,
}

/// Build the responder router
pub fn router(state: ResponderState) -> Router {
    Router::new()
        .route("/", post(ocsp_post).get(ocsp_root))
        .route("/{*encoded}", get(ocsp_get))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ocsp_post(State(state): State<ResponderState>, body: Bytes) -> Response {
    respond(&state, &body).await
}

/// A bare GET of `/` carries no request at all
async fn ocsp_root() -> Response {
    ocsp_error(OcspErrorStatus::MalformedRequest)
}

async fn ocsp_get(State(state): State<ResponderState>, Path(encoded): Path<String>) -> Response {
    match BASE64_STANDARD.decode(encoded.as_bytes()) {
        Ok(der) => respond(&state, &der).await,
        Err(err) => {
            debug!(error = %err, "request path is not valid base64");
            ocsp_error(OcspErrorStatus::MalformedRequest)
        }
    }
}

async fn respond(state: &ResponderState, der: &[u8]) -> Response {
    let request = match parse_request(der) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "rejecting inbound request");
            return ocsp_error(OcspErrorStatus::MalformedRequest);
        }
    };

    let Some(snapshot) = state.cache.lookup_response(&request).await else {
        debug!(serial = ?request.serial, "no entry for request");
        return ocsp_error(OcspErrorStatus::Unauthorized);
    };

    if snapshot.next_update <= state.clock.now() {
        if state.dont_die_on_stale_response {
            warn!(serial = ?request.serial, "serving response past its nextUpdate");
            return ocsp_body(snapshot.bytes);
        }
        warn!(serial = ?request.serial, "response is stale, answering tryLater");
        return ocsp_error(OcspErrorStatus::TryLater);
    }

    ocsp_body(snapshot.bytes)
}

fn ocsp_body(bytes: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, OCSP_RESPONSE_CONTENT_TYPE)], bytes).into_response()
}

fn ocsp_error(status: OcspErrorStatus) -> Response {
    (
        [(header::CONTENT_TYPE, OCSP_RESPONSE_CONTENT_TYPE)],
        status_response(status),
    )
        .into_response()
}
