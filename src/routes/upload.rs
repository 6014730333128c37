use axum::{
    body::Bytes, extract::State, http::StatusCode, response::IntoResponse, routing::post, Json,
    Router,
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::batch;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/upload", post(handler))
}

/// Handle `POST /upload` - one complete sighting batch per request.
///
/// Only a structurally unreadable payload (empty body, non-UTF-8 bytes) is
/// rejected; every partial-validity condition inside a readable batch is
/// absorbed by the batch processor and reported in the returned summary.
async fn handler(
    State((tracker, uploads, config)): State<AppState>,
    body: Bytes,
) -> impl IntoResponse {
    // ---
    info!("POST /upload - Received {} bytes", body.len());

    // Step 1: structural validation
    if body.is_empty() {
        warn!("Rejecting upload: no data received");
        return (StatusCode::BAD_REQUEST, Json("No data received")).into_response();
    }
    let Ok(text) = std::str::from_utf8(&body) else {
        warn!("Rejecting upload: payload is not valid UTF-8");
        return (StatusCode::BAD_REQUEST, Json("Payload is not valid UTF-8")).into_response();
    };

    let received_at = Utc::now();

    // Step 2: archive the raw payload (failure is non-fatal, see UploadStore)
    debug!("POST /upload - Step 2: archive raw payload");
    uploads.archive(received_at, &body).await;

    // Step 3: normalize rows and feed the tracker in batch order
    debug!("POST /upload - Step 3: normalize and track");
    let parsed = batch::parse_batch(text, &config.device_key_field, received_at);
    for sighting in &parsed.sightings {
        tracker.observe(sighting, received_at).await;
    }

    info!(
        "Batch processed: {} accepted, {} missing key, {} fallback timestamps, {} contacts tracked",
        parsed.summary.accepted,
        parsed.summary.missing_key,
        parsed.summary.fallback_timestamps,
        tracker.tracked().await,
    );
    (StatusCode::OK, Json(parsed.summary)).into_response()
}
