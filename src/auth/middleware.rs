//! Ownership-scoped authorization for `/user/:uID` routes.
//!
//! A request passes only with `Authorization: Bearer <token>` whose token validates
//! and whose subject is the user named in the path. Any other valid token is
//! rejected the same way as an invalid one.
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::warn;
use uuid::Uuid;

use super::jwt::TokenService;
use crate::error::{AppError, AuthError};

const BEARER_PREFIX: &str = "Bearer ";

/// Authenticated subject, published into request extensions by [`require_owner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .copied()
            .ok_or(AppError::Auth(AuthError::MissingToken))
    }
}

/// Extracts the token from an exact `Bearer <token>` header value.
fn bearer_token(header: Option<&HeaderValue>) -> Result<&str, AuthError> {
    let value = header
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix(BEARER_PREFIX)
        .ok_or(AuthError::MissingToken)?;
    if token.is_empty() || token.chars().any(|c| c.is_ascii_whitespace()) {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

pub fn authorize(
    tokens: &TokenService,
    header: Option<&HeaderValue>,
    target: &str,
) -> Result<AuthUser, AuthError> {
    let token = bearer_token(header)?;
    let claims = tokens.validate(token)?;
    let owner = Uuid::parse_str(target).map_err(|_| AuthError::Forbidden)?;
    if claims.sub != owner {
        return Err(AuthError::Forbidden);
    }
    Ok(AuthUser(claims.sub))
}

/// Route layer for owner-only routes.
pub async fn require_owner(
    State(tokens): State<TokenService>,
    Path(target): Path<String>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let user = authorize(&tokens, req.headers().get(AUTHORIZATION), &target).map_err(|e| {
        warn!(reason = %e, target = %target, "request rejected");
        e
    })?;
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
