use std::{any::Any, error::Error as StdError, time::Duration};

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{
    application::mock_server::MockServerError, domain::error::ConfigurationError,
    infra::error::InfraError,
};

/// Error chain captured for the response-logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableKind {
    /// No correlated response arrived before the deadline.
    Timeout,
    /// The transport refused or dropped the request.
    Transport,
}

/// The out-of-process renderer could not be reached or never answered.
#[derive(Debug, Clone, Error)]
#[error("Unable to reach rendering server{}. {reason}", endpoint_suffix(.endpoint))]
pub struct RenderServerUnavailable {
    pub kind: UnavailableKind,
    pub endpoint: Option<String>,
    pub reason: String,
    pub elapsed: Option<Duration>,
}

fn endpoint_suffix(endpoint: &Option<String>) -> String {
    endpoint
        .as_deref()
        .map(|endpoint| format!(" at {endpoint}"))
        .unwrap_or_default()
}

impl RenderServerUnavailable {
    pub fn timed_out(endpoint: Option<String>, elapsed: Duration) -> Self {
        Self {
            kind: UnavailableKind::Timeout,
            endpoint,
            reason: format!(
                "No render response was received within {}ms.",
                elapsed.as_millis()
            ),
            elapsed: Some(elapsed),
        }
    }

    pub fn unreachable(endpoint: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            kind: UnavailableKind::Transport,
            endpoint,
            reason: reason.into(),
            elapsed: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == UnavailableKind::Timeout
    }
}

/// The wrapped renderer itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("render failed: {message}")]
pub struct RenderFailure {
    pub message: String,
}

impl RenderFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn from_error(error: &dyn StdError) -> Self {
        Self::new(error.to_string())
    }

    /// Builds a failure from a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(format!("renderer panicked: {detail}"))
    }
}

/// Everything that can abort one queued render.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Unavailable(#[from] RenderServerUnavailable),
    #[error(transparent)]
    Failed(#[from] RenderFailure),
    #[error(transparent)]
    MockServer(#[from] MockServerError),
    #[error("render queue is closed")]
    QueueClosed,
}

/// Top-level error for the binary entry points.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
