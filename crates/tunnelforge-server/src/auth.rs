use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use tunnelforge_core::auth::keys_match;

use crate::state::AppState;

/// Extract `X-API-Key` and compare against the configured key in constant
/// time (§4.8). Used directly by `verify`, `status` and `connect` — there is
/// no per-subdomain capability model, so a single check suffices everywhere.
pub fn check_api_key(state: &AppState, headers: &HeaderMap) -> bool {
    let candidate = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    keys_match(candidate, &state.config.api_key)
}

pub async fn verify(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    if check_api_key(&state, &headers) {
        StatusCode::OK
    } else {
        StatusCode::UNAUTHORIZED
    }
}
