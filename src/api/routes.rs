use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value;

use crate::api::health::StatusSnapshot;
use crate::api::latency::LatencySummary;
use crate::error::{OverlayError, Result};
use crate::session::PageSession;
use crate::settings::keys;
use crate::state::GateSettings;
use crate::supervisor::HealthSnapshot;
use crate::types::{conversion_spec, ConversionSpec, CONVERSIONS};

#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<PageSession>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/settings", get(get_settings))
        .route("/settings/:key", put(put_setting))
        .route("/conversions", get(get_conversions))
        .route("/rates/refresh", post(post_rates_refresh))
        .route("/reconcile", post(post_reconcile))
        .route("/stats/latency", get(get_stats_latency))
        .route("/page", get(get_page))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub observer: HealthSnapshot,
    pub engine: StatusSnapshot,
    pub rates_cached: bool,
    pub tracked_values: usize,
}

#[derive(Serialize)]
pub struct SettingsResponse {
    pub active_currency: String,
    #[serde(flatten)]
    pub features: GateSettings,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub tokens: usize,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let s = &state.session;
    Json(HealthResponse {
        observer: s.health.snapshot(),
        engine: s.status.snapshot(),
        rates_cached: s.cache.is_populated(),
        tracked_values: s.tracked_values(),
    })
}

async fn get_settings(State(state): State<ApiState>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        active_currency: state.session.conversion.get(),
        features: state.session.gate.current(),
    })
}

/// Writes through the settings store; the session picks the change up from
/// the store's change feed like any other writer.
async fn put_setting(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(value): Json<Value>,
) -> Result<StatusCode> {
    let Some(key) = keys::ALL.iter().copied().find(|k| *k == key) else {
        return Err(OverlayError::UnknownSetting(key));
    };
    if key == keys::ACTIVE_CURRENCY {
        let wanted = value.as_str().unwrap_or_default();
        if conversion_spec(wanted).is_none() {
            return Err(OverlayError::InvalidConversion(wanted.to_string()));
        }
    }
    state.session.settings.set(key, value).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_conversions() -> Json<&'static [ConversionSpec]> {
    Json(CONVERSIONS)
}

async fn post_rates_refresh(State(state): State<ApiState>) -> Result<Json<RefreshResponse>> {
    let tokens = state.session.refresh_rates().await?;
    Ok(Json(RefreshResponse { tokens }))
}

async fn post_reconcile(State(state): State<ApiState>) -> StatusCode {
    state.session.reconcile_now().await;
    StatusCode::ACCEPTED
}

async fn get_stats_latency(State(state): State<ApiState>) -> Json<LatencySummary> {
    Json(state.session.latency.summary())
}

async fn get_page(State(state): State<ApiState>) -> impl IntoResponse {
    let dom = &state.session.dom;
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        dom.markup(dom.root()),
    )
}
