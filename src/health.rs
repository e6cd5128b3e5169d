use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::cache::MirrorLayout;
use crate::metrics::Metrics;
use crate::store::MetadataStore;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub mirrors: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub store: MetadataStore,
    pub layout: MirrorLayout,
    pub metrics: Arc<Metrics>,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_store(store: &MetadataStore) -> CheckResult {
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.check()).await {
        Ok(Ok(())) => CheckResult::healthy(),
        Ok(Err(e)) => CheckResult::unhealthy(format!("metadata store unreadable: {e}")),
        Err(e) => CheckResult::unhealthy(format!("store check task failed: {e}")),
    }
}

async fn check_mirrors(layout: &MirrorLayout, metrics: &Metrics) -> CheckResult {
    if !tokio::fs::metadata(&layout.base_path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        return CheckResult::unhealthy(format!(
            "mirror directory {} is missing",
            layout.base_path.display()
        ));
    }

    let layout = layout.clone();
    match tokio::task::spawn_blocking(move || layout.list_mirrors()).await {
        Ok(Ok(keys)) => {
            metrics.mirrors_total.set(keys.len() as i64);
            CheckResult {
                ok: true,
                detail: Some(format!("{} mirrors on disk", keys.len())),
            }
        }
        Ok(Err(e)) => CheckResult::unhealthy(format!("failed to list mirrors: {e:#}")),
        Err(e) => CheckResult::unhealthy(format!("mirror listing task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Mirrors directories are recreated on the next clone; the store is not.
    if !checks.store.ok {
        HealthStatus::Unhealthy
    } else if !checks.mirrors.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (store, mirrors) = tokio::join!(
        check_store(&state.store),
        check_mirrors(&state.layout, &state.metrics),
    );

    let checks = HealthChecks { store, mirrors };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}
