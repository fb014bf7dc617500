pub mod auth;
pub mod client;
pub mod error;
mod middleware;

pub use auth::{AuthError, Authenticator, Principal, extract_token};
pub use client::HttpRenderClient;
pub use error::ApiError;
pub use middleware::RequestContext;

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{Method, header},
    middleware as axum_middleware,
    response::Html,
    routing::{get, post},
};
use storyrender_wire::RenderStoryRequest;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::application::queue::RenderQueue;

use self::middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub queue: RenderQueue,
}

/// `GET /` health check and `POST /render`, behind CORS and authentication.
pub fn build_router(state: HttpState, auth: Authenticator) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/render", post(render_story))
        .with_state(state)
        .layer(axum_middleware::from_fn_with_state(auth, auth::require_auth))
        .layer(cors_layer())
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn health() -> &'static str {
    "OK"
}

async fn render_story(
    State(state): State<HttpState>,
    payload: Result<Json<RenderStoryRequest>, JsonRejection>,
) -> Result<Html<String>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        ApiError::bad_request("Invalid render request", Some(rejection.body_text()))
    })?;
    if request.component.trim().is_empty() {
        return Err(ApiError::bad_request("Component is required", None));
    }

    let html = state.queue.render(request).await?;
    Ok(Html(html))
}

/// Serve `router` on `listener` until the task is cancelled or `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    if let Some(addr) = addr {
        info!(target = "storyrender::http", addr = %addr, "render server listening");
    }
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
