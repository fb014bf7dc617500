//! The process-wide mock HTTP server and its per-render handler set.
//!
//! One axum listener is bound lazily on the first [`MockServer::apply_handlers`]
//! call. Every render replaces the per-story handler list wholesale; base
//! handlers loaded at startup stay installed behind it. Updates go through a
//! single async mutex, and the active set is swapped as one `Arc`, so a request
//! never observes a merge of two renders' handlers.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
        header::{CONTENT_TYPE, HOST},
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    domain::{error::ConfigurationError, pattern::WildcardPattern},
    util::lock::{mutex_lock, rw_read, rw_write},
};

const LOCK_OWNER: &str = "application::mock_server";

#[derive(Debug, Error)]
pub enum MockServerError {
    #[error("failed to bind mock server on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}

/// Canned response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum MockBody {
    #[default]
    Empty,
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: MockBody,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: MockBody::Empty,
        }
    }
}

impl MockResponse {
    fn to_response(&self) -> Response {
        let mut response = match &self.body {
            MockBody::Empty => self.status.into_response(),
            MockBody::Text(text) => (
                self.status,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                text.clone(),
            )
                .into_response(),
            MockBody::Json(value) => (self.status, Json(value.clone())).into_response(),
        };
        for (name, value) in &self.headers {
            response.headers_mut().insert(name.clone(), value.clone());
        }
        response
    }
}

/// A stand-in response for requests matching an optional method and a
/// wildcard URL pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct MockHandler {
    method: Option<Method>,
    url: WildcardPattern,
    response: MockResponse,
}

impl MockHandler {
    /// Matches any method.
    pub fn any(url: &str) -> Self {
        Self {
            method: None,
            url: WildcardPattern::new(url),
            response: MockResponse::default(),
        }
    }

    pub fn new(method: Method, url: &str) -> Self {
        Self {
            method: Some(method),
            ..Self::any(url)
        }
    }

    pub fn get(url: &str) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.response.status = status;
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.response.headers.insert(name, value);
        self
    }

    pub fn with_text(mut self, body: impl Into<String>) -> Self {
        self.response.body = MockBody::Text(body.into());
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.response.body = MockBody::Json(body);
        self
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    pub fn response(&self) -> &MockResponse {
        &self.response
    }

    pub fn matches(&self, method: &Method, candidates: &[String]) -> bool {
        if self.method.as_ref().is_some_and(|expected| expected != method) {
            return false;
        }
        candidates
            .iter()
            .any(|candidate| self.url.is_match(candidate))
    }
}

/// Declarative handler as written in TOML files.
#[derive(Debug, Clone, Deserialize)]
pub struct MockHandlerSpec {
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub json: Option<Value>,
}

impl MockHandlerSpec {
    /// Validate into a handler; `option` names the entry in error messages.
    pub fn into_handler(self, option: &str) -> Result<MockHandler, ConfigurationError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigurationError::invalid(
                format!("{option}.url"),
                "cannot be empty",
            ));
        }

        let mut handler = match self.method.as_deref().map(str::trim) {
            None | Some("") | Some("*") => MockHandler::any(url),
            Some(method) => {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|err| {
                        ConfigurationError::invalid(format!("{option}.method"), err.to_string())
                    })?;
                MockHandler::new(method, url)
            }
        };

        if let Some(status) = self.status {
            let status = StatusCode::from_u16(status).map_err(|err| {
                ConfigurationError::invalid(format!("{option}.status"), err.to_string())
            })?;
            handler = handler.with_status(status);
        }

        for (name, value) in self.headers {
            let header = format!("{option}.headers.{name}");
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ConfigurationError::invalid(&header, err.to_string()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|err| ConfigurationError::invalid(&header, err.to_string()))?;
            handler = handler.with_header(name, value);
        }

        handler = match (self.body, self.json) {
            (Some(_), Some(_)) => {
                return Err(ConfigurationError::invalid(
                    option,
                    "`body` and `json` are mutually exclusive",
                ));
            }
            (Some(body), None) => handler.with_text(body),
            (None, Some(json)) => handler.with_json(json),
            (None, None) => handler,
        };

        Ok(handler)
    }
}

#[derive(Debug, Deserialize)]
struct HandlersFile {
    #[serde(default)]
    handlers: Vec<MockHandlerSpec>,
}

/// Load base handlers from a TOML file with `[[handlers]]` tables.
pub async fn load_handlers_file(path: &Path) -> Result<Vec<MockHandler>, ConfigurationError> {
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ConfigurationError::MissingFile {
                path: path.to_path_buf(),
            },
            _ => ConfigurationError::Read {
                path: path.to_path_buf(),
                source,
            },
        })?;
    let file: HandlersFile = toml::from_str(&source).map_err(|err| ConfigurationError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    file.handlers
        .into_iter()
        .enumerate()
        .map(|(index, spec)| spec.into_handler(&format!("handlers[{index}]")))
        .collect()
}

/// Handlers active for the current render, per-story first.
#[derive(Debug, Default)]
pub struct HandlerSet {
    story: Vec<MockHandler>,
    base: Arc<Vec<MockHandler>>,
}

impl HandlerSet {
    pub fn story_handlers(&self) -> &[MockHandler] {
        &self.story
    }

    pub fn find(&self, method: &Method, candidates: &[String]) -> Option<&MockHandler> {
        self.story
            .iter()
            .chain(self.base.iter())
            .find(|handler| handler.matches(method, candidates))
    }
}

type SharedHandlers = Arc<RwLock<Arc<HandlerSet>>>;

#[derive(Debug, Clone)]
pub struct MockServerSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MockServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }
}

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MockServer {
    settings: MockServerSettings,
    base: Arc<Vec<MockHandler>>,
    active: SharedHandlers,
    running: tokio::sync::Mutex<Option<RunningServer>>,
    address: Mutex<Option<SocketAddr>>,
}

impl MockServer {
    pub fn new(settings: MockServerSettings, base: Vec<MockHandler>) -> Self {
        let base = Arc::new(base);
        let initial = HandlerSet {
            story: Vec::new(),
            base: Arc::clone(&base),
        };
        Self {
            settings,
            base,
            active: Arc::new(RwLock::new(Arc::new(initial))),
            running: tokio::sync::Mutex::new(None),
            address: Mutex::new(None),
        }
    }

    pub fn disabled() -> Self {
        Self::new(
            MockServerSettings {
                enabled: false,
                ..MockServerSettings::default()
            },
            Vec::new(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Replace the per-story handler set, starting the server if needed.
    ///
    /// Calls are serialized; when the server is disabled this only waits its
    /// turn and returns.
    pub async fn apply_handlers(&self, handlers: Vec<MockHandler>) -> Result<(), MockServerError> {
        let mut running = self.running.lock().await;
        if !self.settings.enabled {
            debug!(
                target = "storyrender::mock_server",
                handlers = handlers.len(),
                "mock server disabled; handlers ignored"
            );
            return Ok(());
        }

        if running.is_none() {
            *running = Some(self.start().await?);
        }

        let count = handlers.len();
        self.swap(handlers);
        debug!(
            target = "storyrender::mock_server",
            handlers = count,
            "mock handlers applied"
        );
        Ok(())
    }

    /// Drop every per-story handler. Does not start the server.
    pub async fn reset(&self) {
        let _running = self.running.lock().await;
        self.swap(Vec::new());
    }

    fn swap(&self, story: Vec<MockHandler>) {
        let next = Arc::new(HandlerSet {
            story,
            base: Arc::clone(&self.base),
        });
        *rw_write(&self.active, LOCK_OWNER, "swap") = next;
    }

    pub fn active_handlers(&self) -> Arc<HandlerSet> {
        Arc::clone(&rw_read(&self.active, LOCK_OWNER, "active_handlers"))
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        *mutex_lock(&self.address, LOCK_OWNER, "addr")
    }

    pub fn base_url(&self) -> Option<String> {
        self.addr().map(|addr| format!("http://{addr}"))
    }

    /// Stop the listener. A later `apply_handlers` binds a fresh one.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        if let Some(server) = running.take() {
            let _ = server.shutdown.send(());
            if let Err(err) = server.task.await {
                error!(
                    target = "storyrender::mock_server",
                    error = %err,
                    "mock server task did not stop cleanly"
                );
            }
        }
        mutex_lock(&self.address, LOCK_OWNER, "shutdown").take();
    }

    async fn start(&self) -> Result<RunningServer, MockServerError> {
        let address = format!("{}:{}", self.settings.host, self.settings.port);
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| MockServerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local = listener
            .local_addr()
            .map_err(|source| MockServerError::Bind { address, source })?;

        let router = Router::new()
            .fallback(dispatch)
            .with_state(Arc::clone(&self.active));
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = signal.await;
            });
            if let Err(err) = serve.await {
                error!(
                    target = "storyrender::mock_server",
                    error = %err,
                    "mock server stopped with error"
                );
            }
        });

        *mutex_lock(&self.address, LOCK_OWNER, "start") = Some(local);
        info!(
            target = "storyrender::mock_server",
            addr = %local,
            "mock server listening"
        );
        Ok(RunningServer { shutdown, task })
    }
}

async fn dispatch(State(active): State<SharedHandlers>, request: Request<Body>) -> Response {
    let handlers = Arc::clone(&rw_read(&active, LOCK_OWNER, "dispatch"));
    let candidates = url_candidates(&request);
    let method = request.method();

    match handlers.find(method, &candidates) {
        Some(handler) => handler.response.to_response(),
        None => {
            debug!(
                target = "storyrender::mock_server",
                method = %method,
                uri = %request.uri(),
                "no mock handler matched"
            );
            (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": "No mock handler matched the request",
                    "method": method.as_str(),
                    "url": request.uri().to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// URL forms a handler pattern may be written against.
fn url_candidates(request: &Request<Body>) -> Vec<String> {
    let uri = request.uri();
    let path = uri.path().to_string();
    let path_and_query = uri
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let mut candidates = Vec::with_capacity(6);
    if uri.scheme().is_some() {
        candidates.push(uri.to_string());
    }
    if let Some(host) = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
    {
        candidates.push(format!("http://{host}{path_and_query}"));
        candidates.push(format!("http://{host}{path}"));
    }
    candidates.push(path_and_query);
    candidates.push(path);
    candidates.dedup();
    candidates
}
