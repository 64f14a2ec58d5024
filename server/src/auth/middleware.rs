//! Authentication extractor.
//!
//! Bearer tokens come in two forms. Without `AUTH_SECRET` the token is
//! taken as the user id and a missing header means anonymous. With it the
//! token must read `<user_id>:<secret>` and anonymous callers are refused.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use lagless_engine::UserId;

use crate::error::AppError;
use crate::AppState;

/// Caller identity extracted from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    /// `None` for anonymous callers
    pub user_id: Option<UserId>,
}

impl AuthUser {
    /// Check an `Authorization` header value.
    pub fn authenticate(header: Option<&str>, secret: Option<&str>) -> Result<Self, AppError> {
        let Some(header) = header else {
            return match secret {
                None => Ok(AuthUser { user_id: None }),
                Some(_) => Err(AppError::Unauthorized("Missing authorization header")),
            };
        };

        let token = header
            .strip_prefix("Bearer ")
            .ok_or(AppError::Unauthorized("Invalid authorization header format"))?
            .trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized("Empty bearer token"));
        }

        let user_id = match secret {
            None => token,
            Some(secret) => match token.rsplit_once(':') {
                Some((user_id, given)) if given == secret && !user_id.is_empty() => user_id,
                _ => return Err(AppError::Unauthorized("Invalid token")),
            },
        };

        Ok(AuthUser {
            user_id: Some(user_id.to_string()),
        })
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        let user = Self::authenticate(header, state.config.auth_secret.as_deref());
        if let Err(e) = &user {
            tracing::debug!("Rejected connection: {}", e);
        }
        user
    }
}
