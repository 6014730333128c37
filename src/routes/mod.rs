use std::sync::Arc;

use axum::Router;

use crate::upload_store::UploadStore;
use crate::{Config, ContactTracker};

mod health;
mod upload;

// ---

/// Shared state handed to every route handler.
pub type AppState = (Arc<ContactTracker>, UploadStore, Config);

pub fn router(tracker: Arc<ContactTracker>, uploads: UploadStore, config: Config) -> Router {
    // ---
    Router::new()
        .merge(upload::router())
        .merge(health::router())
        .with_state((tracker, uploads, config))
}
