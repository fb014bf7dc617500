//! HTTP client for a remote render server.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use storyrender_wire::RenderStoryRequest;
use tracing::debug;
use url::Url;

use crate::{
    application::{
        error::{RenderError, RenderFailure, RenderServerUnavailable},
        renderer::{ComponentRenderer, ComponentRequest},
    },
    infra::error::InfraError,
};

const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// Posts render requests to `<base>/render`.
#[derive(Debug, Clone)]
pub struct HttpRenderClient {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpRenderClient {
    pub fn new(base: &Url, token: Option<String>, timeout: Duration) -> Result<Self, InfraError> {
        let endpoint = render_endpoint(base)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            token,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn render_story(&self, request: &RenderStoryRequest) -> Result<String, RenderError> {
        let started = Instant::now();
        let mut builder = self.client.post(self.endpoint.clone()).json(request);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| self.unavailable(&err, started))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.unavailable(&err, started))?;

        debug!(
            target = "storyrender::http::client",
            endpoint = %self.endpoint,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "render response received"
        );

        if !status.is_success() {
            return Err(RenderFailure::new(format!(
                "render server responded with {status}: {}",
                preview(&body)
            ))
            .into());
        }
        Ok(body)
    }

    fn unavailable(&self, err: &reqwest::Error, started: Instant) -> RenderError {
        let endpoint = Some(self.endpoint.to_string());
        if err.is_timeout() {
            RenderServerUnavailable::timed_out(endpoint, started.elapsed()).into()
        } else {
            RenderServerUnavailable::unreachable(endpoint, err.to_string()).into()
        }
    }
}

#[async_trait]
impl ComponentRenderer for HttpRenderClient {
    async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError> {
        let mut story_request = RenderStoryRequest::new(request.component.clone())
            .with_args(request.args.clone())
            .with_slots(request.slots.clone());
        story_request.story = request.story.clone();
        self.render_story(&story_request).await
    }
}

fn render_endpoint(base: &Url) -> Result<Url, InfraError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("render")
        .map_err(|err| InfraError::http_client(format!("invalid render server URL: {err}")))
}

fn preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    let mut preview: String = trimmed.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
    if trimmed.chars().count() > ERROR_BODY_PREVIEW_CHARS {
        preview.push('…');
    }
    preview
}
