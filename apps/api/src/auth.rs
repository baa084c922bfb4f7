//! Bearer-token guards for operator and scheduled-job endpoints.
//!
//! Session verification lives with the upstream auth provider; this service only
//! compares bearer tokens against the ones it was configured with.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};

use crate::errors::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Admin,
}

/// An authenticated operator. Reads need any role; writes need `Admin`.
#[derive(Debug, Clone, Copy)]
pub struct Operator {
    pub role: Role,
}

impl Operator {
    pub fn require_admin(&self) -> Result<(), AppError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::Viewer => Err(AppError::Forbidden),
        }
    }
}

/// Marker for requests carrying the scheduled-job shared secret.
#[derive(Debug, Clone, Copy)]
pub struct CronCaller;

/// Compares without short-circuiting on the first differing byte.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn bearer_token(parts: &mut Parts) -> Result<String, AppError> {
    let TypedHeader(Authorization(bearer)) = parts
        .extract::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| AppError::Unauthorized)?;
    Ok(bearer.token().to_string())
}

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).await?;

        if tokens_match(&token, &state.config.admin_api_token) {
            return Ok(Operator { role: Role::Admin });
        }
        match &state.config.viewer_api_token {
            Some(viewer) if tokens_match(&token, viewer) => Ok(Operator { role: Role::Viewer }),
            _ => Err(AppError::Unauthorized),
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for CronCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).await?;
        if tokens_match(&token, &state.config.cron_secret) {
            Ok(CronCaller)
        } else {
            Err(AppError::Unauthorized)
        }
    }
}
