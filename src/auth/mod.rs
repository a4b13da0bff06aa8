use crate::state::AppState;
use axum::Router;

pub mod claims;
pub mod delegate;
pub mod dto;
pub mod handlers;
pub mod jwt;
pub mod middleware;
pub mod password;

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
