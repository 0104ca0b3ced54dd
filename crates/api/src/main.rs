use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use painel_core::aggregate::service::PipelineService;
use painel_core::domain::aggregate::PipelineAggregate;
use painel_core::storage::cache::{CacheOptions, CacheStatus, OpportunityCache};
use painel_core::time::range::DateFilter;
use painel_core::upstream::error::FailureKind;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = painel_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let cache = Arc::new(OpportunityCache::new(CacheOptions::from_env()));
    let service = match PipelineService::from_settings(&settings, cache) {
        Ok(service) => Some(service),
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "pipelines client not configured; starting API in degraded mode");
            None
        }
    };

    let state = AppState { service };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/pipelines/summary", get(get_summary))
        .route("/pipelines/cache", get(get_cache_status))
        .route("/pipelines/cache/clear", post(clear_cache))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    service: Option<PipelineService>,
}

impl AppState {
    fn service(&self) -> Result<&PipelineService, StatusCode> {
        self.service.as_ref().ok_or(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SummaryQuery {
    date_from: Option<String>,
    date_to: Option<String>,
}

async fn get_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<(StatusCode, Json<PipelineAggregate>), StatusCode> {
    let service = state.service()?;
    let filter = DateFilter::parse(query.date_from.as_deref(), query.date_to.as_deref())
        .map_err(|e| {
            tracing::debug!(error = %format!("{e:#}"), "rejecting summary query");
            StatusCode::BAD_REQUEST
        })?;

    let agg = service.get_pipelines_data(&filter).await;
    let status = match agg.error_kind {
        None => StatusCode::OK,
        Some(FailureKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(FailureKind::Auth | FailureKind::Forbidden) => {
            sentry::capture_message(
                agg.error.as_deref().unwrap_or("pipelines authentication failed"),
                sentry::Level::Error,
            );
            StatusCode::BAD_GATEWAY
        }
        Some(_) => StatusCode::BAD_GATEWAY,
    };
    Ok((status, Json(agg)))
}

async fn get_cache_status(State(state): State<AppState>) -> Result<Json<CacheStatus>, StatusCode> {
    let service = state.service()?;
    service.cache_status().map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn clear_cache(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    state.service()?.clear_opportunities_cache();
    Ok(StatusCode::NO_CONTENT)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &painel_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
