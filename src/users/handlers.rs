use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};

use super::dto::{
    DeleteUserRequest, MessageResponse, PublicUser, RegisterRequest, UpdateUserRequest,
    UserSummary,
};
use crate::{
    auth::middleware::{require_owner, AuthUser},
    error::AppError,
    extract::AppJson,
    state::AppState,
};

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/user", post(register))
        .route("/users", get(list_users))
}

/// Routes acting on `:uID`, reachable only with a token for that user.
pub fn owner_routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route(
            "/user/:uID",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route_layer(middleware::from_fn_with_state(state, require_owner))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    AppJson(payload): AppJson<RegisterRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AppError> {
    let user = state.directory.insert_user(payload).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
) -> Result<Json<Vec<UserSummary>>, AppError> {
    let users = state.directory.get_basic_user_data_list().await?;
    Ok(Json(users.into_iter().map(UserSummary::from).collect()))
}

#[instrument(skip(state))]
pub async fn get_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AppError> {
    let user = state.directory.get_user_by_id(user_id).await?;
    Ok(Json(user.into()))
}

#[instrument(skip(state, payload))]
pub async fn update_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    AppJson(payload): AppJson<UpdateUserRequest>,
) -> Result<Json<PublicUser>, AppError> {
    let user = state.directory.update_user(user_id, payload).await?;
    Ok(Json(user.into()))
}

/// Body is optional; without one the delete is soft.
#[instrument(skip(state, body))]
pub async fn delete_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    body: Bytes,
) -> Result<Json<MessageResponse>, AppError> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        DeleteUserRequest::default()
    } else {
        serde_json::from_slice::<DeleteUserRequest>(&body).map_err(|e| {
            warn!(error = %e, "invalid delete body");
            AppError::Validation("invalid delete request body".into())
        })?
    };
    state.directory.delete_user(user_id, req.hard).await?;
    Ok(Json(MessageResponse { message: "ok" }))
}
