//! Edge HTTP gateway.
//!
//! The daemon fronts the whole deployment on one port. Every request that is
//! not one of the host endpoints lands here and is routed by path priority:
//!
//! - release metadata queries to the releases service,
//! - platform APIs, the management UI and domain verification to the
//!   platform container,
//! - the console/player UI straight from disk,
//! - media server APIs and media delivery to their loopback ports.
//!
//! Anything that matches nothing answers with a plain greeting, which
//! doubles as a liveness probe.

pub mod proxy;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use tower::util::ServiceExt;
use tower_http::services::ServeDir;

use crate::state::AppState;

/// Loopback port of the releases metadata service.
pub const RELEASES_PORT: u16 = 2023;
/// Loopback port of the platform application.
pub const PLATFORM_PORT: u16 = 2024;
/// Loopback port of the media server HTTP API.
pub const SRS_API_PORT: u16 = 1985;
/// Loopback port of the media server HTTP delivery.
pub const SRS_HTTP_PORT: u16 = 8080;

/// UI prefixes served from disk rather than proxied. The platform rewrites
/// this tree for DVR pages, so it must be served here, not from inside the
/// platform container.
const UI_PREFIXES: [&str; 3] = ["/console/", "/players/", "/tools/"];

/// HTML entry points that must always be re-fetched. Everything else under
/// the UI prefixes carries a long-lived cache header.
const UNCACHED_ENTRY_POINTS: [&str; 2] = ["/console/player.html", "/tools/player.html"];

const LONG_CACHE: &str = "public, max-age=31536000";

/// Suffixes delivered by the media server over HTTP, whatever their prefix.
const MEDIA_SUFFIXES: [&str; 5] = [".flv", ".m3u8", ".ts", ".aac", ".mp3"];

/// Routing decision for one path. Priority is encoded in [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Releases,
    Platform,
    Ui,
    SrsApi,
    SrsHttp,
    Hello,
}

/// Decide where a path goes. Order matters: release queries win over the
/// generic platform prefix, UI prefixes win over media suffixes.
pub fn classify(path: &str) -> Route {
    if path.starts_with("/terraform/v1/releases") {
        return Route::Releases;
    }

    // Everything else under /terraform/ belongs to the platform, as does
    // the /mgmt UI.
    if path.starts_with("/terraform/") || path.starts_with("/mgmt") {
        return Route::Platform;
    }

    if UI_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Route::Ui;
    }

    // ACME and similar domain verification is answered by the platform.
    if path.starts_with("/.well-known/") {
        return Route::Platform;
    }

    if path.starts_with("/api/") || path.starts_with("/rtc/") {
        return Route::SrsApi;
    }

    if MEDIA_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
        return Route::SrsHttp;
    }

    Route::Hello
}

/// Fallback handler behind the host endpoints.
pub async fn route(State(state): State<AppState>, req: Request) -> Response {
    match classify(req.uri().path()) {
        Route::Releases => state.proxy().forward(RELEASES_PORT, req).await,
        Route::Platform => state.proxy().forward(PLATFORM_PORT, req).await,
        Route::Ui => serve_ui(&state, req).await,
        Route::SrsApi => state.proxy().forward(SRS_API_PORT, req).await,
        Route::SrsHttp => state.proxy().forward(SRS_HTTP_PORT, req).await,
        Route::Hello => "Hello world!".into_response(),
    }
}

/// Serve a UI asset from `containers/www`.
async fn serve_ui(state: &AppState, req: Request) -> Response {
    let cacheable = !UNCACHED_ENTRY_POINTS.contains(&req.uri().path());

    let mut response = match ServeDir::new(state.www_dir()).oneshot(req).await {
        Ok(response) => response.map(Body::new),
        Err(infallible) => match infallible {},
    };

    if cacheable {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static(LONG_CACHE));
    }
    response
}
