//! Request authentication for the render server.
//!
//! `external` trusts an upstream collaborator and lets everything through.
//! `simple-token` accepts a single configured bearer token.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header::AUTHORIZATION},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::OffsetDateTime;

use crate::{
    application::error::ErrorReport,
    config::{AuthSettings, TokenSettings},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("bearer token missing")]
    Missing,
    #[error("bearer token invalid")]
    Invalid,
    #[error("bearer token expired")]
    Expired,
}

/// Who a request was authenticated as, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub mode: &'static str,
    pub token_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Authenticator {
    External,
    SimpleToken(Arc<TokenSettings>),
}

impl Authenticator {
    pub fn from_settings(settings: &AuthSettings) -> Self {
        match settings {
            AuthSettings::External => Self::External,
            AuthSettings::SimpleToken(token) => Self::SimpleToken(Arc::new(token.clone())),
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        self.authenticate_at(headers, OffsetDateTime::now_utc())
    }

    pub fn authenticate_at(
        &self,
        headers: &HeaderMap,
        now: OffsetDateTime,
    ) -> Result<Principal, AuthError> {
        let settings = match self {
            Self::External => {
                return Ok(Principal {
                    mode: "external",
                    token_id: None,
                });
            }
            Self::SimpleToken(settings) => settings,
        };

        let provided = extract_token(headers.get(AUTHORIZATION)).ok_or(AuthError::Missing)?;
        let matches: bool = provided
            .as_bytes()
            .ct_eq(settings.token.as_bytes())
            .into();
        if !matches {
            return Err(AuthError::Invalid);
        }
        if settings.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(AuthError::Expired);
        }

        Ok(Principal {
            mode: "simple-token",
            token_id: settings.token_id.clone(),
        })
    }
}

pub async fn require_auth(
    State(auth): State<Authenticator>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match auth.authenticate(request.headers()) {
        Ok(principal) => {
            request.extensions_mut().insert(principal.clone());
            let mut response = next.run(request).await;
            response.extensions_mut().insert(principal);
            response
        }
        Err(err) => unauthorized(err),
    }
}

fn unauthorized(err: AuthError) -> Response {
    let mut response =
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response();
    ErrorReport::from_error("infra::http::auth", StatusCode::UNAUTHORIZED, &err)
        .attach(&mut response);
    response
}

/// `Authorization: Bearer <token>` with a case-insensitive scheme.
pub fn extract_token(header: Option<&HeaderValue>) -> Option<&str> {
    let raw = header?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
