//! Application state shared across handlers.

use axum::http::{HeaderMap, HeaderName};
use labterm_session::LabEngine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<LabEngine>,
    owner_header: HeaderName,
}

impl AppState {
    pub fn new(engine: Arc<LabEngine>) -> Self {
        let owner_header = HeaderName::from_bytes(engine.config().server.owner_header.as_bytes())
            .unwrap_or_else(|_| HeaderName::from_static("x-owner-id"));
        Self {
            engine,
            owner_header,
        }
    }

    /// Owner id set by the upstream proxy, if any
    pub fn owner_from(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.owner_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}
