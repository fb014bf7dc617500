use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::{ErrorReport, RenderError};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const CONFIGURATION: &str = "configuration_error";
    pub const RENDER_SERVER_UNAVAILABLE: &str = "render_server_unavailable";
    pub const RENDER_TIMEOUT: &str = "render_timeout";
    pub const RENDER_FAILED: &str = "render_failed";
    pub const MOCK_SERVER: &str = "mock_server_error";
    pub const QUEUE_CLOSED: &str = "queue_closed";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    chain: Vec<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            chain: Vec::new(),
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn with_chain(mut self, error: &dyn std::error::Error) -> Self {
        self.chain = ErrorReport::from_error("infra::http::render", self.status, error).messages;
        self
    }
}

impl From<RenderError> for ApiError {
    fn from(err: RenderError) -> Self {
        let hint = Some(err.to_string());
        let api = match &err {
            RenderError::Configuration(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::CONFIGURATION,
                "Story configuration is invalid",
                hint,
            ),
            RenderError::Unavailable(unavailable) if unavailable.is_timeout() => Self::new(
                StatusCode::GATEWAY_TIMEOUT,
                codes::RENDER_TIMEOUT,
                "Rendering server did not respond in time",
                hint,
            ),
            RenderError::Unavailable(_) => Self::new(
                StatusCode::BAD_GATEWAY,
                codes::RENDER_SERVER_UNAVAILABLE,
                "Rendering server is unavailable",
                hint,
            ),
            RenderError::Failed(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::RENDER_FAILED,
                "Render failed",
                hint,
            ),
            RenderError::MockServer(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::MOCK_SERVER,
                "Mock server could not be started",
                hint,
            ),
            RenderError::QueueClosed => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::QUEUE_CLOSED,
                "Render queue is shutting down",
                None,
            ),
        };
        api.with_chain(&err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint.clone(),
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        let report = if self.chain.is_empty() {
            ErrorReport::from_message(
                "infra::http::render",
                self.status,
                format!("{}: {}", self.code, self.hint.as_deref().unwrap_or(self.message)),
            )
        } else {
            ErrorReport {
                source: "infra::http::render",
                status: self.status,
                messages: self.chain,
            }
        };
        report.attach(&mut response);
        response
    }
}
