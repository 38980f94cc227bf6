use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};

use super::{ApiError, SharedState};

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/breakers", get(list_breakers))
        .route("/breakers/{name}/open", post(open_breaker))
        .route("/breakers/{name}/close", post(close_breaker))
}

async fn list_breakers(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.breakers.all_status().await?))
}

async fn open_breaker(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let breaker = known_breaker(&state, &name).await?;
    breaker.force_open().await;
    Ok(Json(breaker.status().await))
}

async fn close_breaker(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let breaker = known_breaker(&state, &name).await?;
    breaker.force_close().await;
    Ok(Json(breaker.status().await))
}

/// Manual overrides only apply to breakers that already exist.
async fn known_breaker(
    state: &SharedState,
    name: &str,
) -> Result<std::sync::Arc<crate::breaker::CircuitBreaker>, ApiError> {
    if !state.breakers.all_status().await?.contains_key(name) {
        return Err(ApiError::NotFound(format!("Unknown circuit breaker: {}", name)));
    }
    Ok(state.breakers.get(name).await?)
}
