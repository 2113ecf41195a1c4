use std::sync::Arc;

use crate::model::{ObservationQuery, ObservationResponse};
use crate::store::Store;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::error;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
}

pub fn create_router(store: Arc<dyn Store>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/api/v1/observations", get(get_observations))
        .with_state(state)
}

async fn get_observations(
    State(state): State<AppState>,
    Query(params): Query<ObservationQuery>,
) -> Result<Json<ObservationResponse>, AppError> {
    let limit = params.limit.unwrap_or(100).min(1000);
    let offset = params.offset.unwrap_or(0);

    let observations = state.store.observations(&params).await.map_err(|e| {
        error!("Storage error: {}", e);
        AppError(anyhow::anyhow!("Observation query failed: {}", e))
    })?;
    let total = state.store.count_observations(&params).await.map_err(|e| {
        error!("Storage error: {}", e);
        AppError(anyhow::anyhow!("Observation count failed: {}", e))
    })?;

    Ok(Json(ObservationResponse {
        total,
        data: observations,
        limit,
        offset,
    }))
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
