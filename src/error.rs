use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::dom::DomError;

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Element #{0} did not appear within the discovery window")]
    DiscoveryTimeout(String),

    #[error("Rate relay network error: {0}")]
    Network(String),

    #[error("Rate relay timed out after {0}ms")]
    Timeout(u64),

    #[error("Rate relay returned a malformed body: {0}")]
    Malformed(String),

    #[error("Rate cache is empty; no successful fetch yet")]
    CacheEmpty,

    #[error("Rates unavailable for {0}")]
    RatesUnavailable(String),

    #[error("Unknown conversion key: {0}")]
    InvalidConversion(String),

    #[error("Observer callback fault: {0}")]
    ObserverFault(String),

    #[error("DOM error: {0}")]
    Dom(#[from] DomError),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("Unknown setting: {0}")]
    UnknownSetting(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

impl IntoResponse for OverlayError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            OverlayError::InvalidConversion(_) | OverlayError::Json(_) => StatusCode::BAD_REQUEST,
            OverlayError::UnknownSetting(_) => StatusCode::NOT_FOUND,
            OverlayError::CacheEmpty | OverlayError::RatesUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OverlayError::Network(_) | OverlayError::Timeout(_) | OverlayError::Malformed(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
