//! Router-level coverage: the full pipeline behind `POST /render`, driven with
//! `tower::ServiceExt::oneshot` so no socket is needed.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use storyrender::{
    application::{
        error::{RenderError, RenderFailure},
        mock_server::MockServerSettings,
        module_mocks::resolve_module_mock,
        renderer::{ComponentRenderer, FnRenderer},
        rules::StoryMode,
        sanitization::SanitizationPolicy,
    },
    config::{
        AuthSettings, LogFormat, LoggingSettings, MockServerConfig, RenderSettings,
        RulesSettings, ServerSettings, Settings, TokenSettings,
    },
    infra::{
        http::{Authenticator, HttpState, build_router},
        runtime::RenderRuntime,
    },
};
use tempfile::TempDir;
use tower::ServiceExt;
use tracing::level_filters::LevelFilter;

const RULES: &str = r#"
[[rules]]
match = "example-card/*"
use = [
  { kind = "mock-module", specifier = "~/lib/api", replacement = "/fixtures/api.ts" },
]
"#;

fn settings(rules_file: Option<PathBuf>, auth: AuthSettings) -> Settings {
    Settings {
        server: ServerSettings {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        },
        logging: LoggingSettings {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        },
        render: RenderSettings {
            mode: StoryMode::Development,
            timeout: Duration::from_secs(5),
            backend: None,
        },
        rules: RulesSettings {
            config_file: rules_file,
        },
        sanitization: SanitizationPolicy::disabled(),
        mock_server: MockServerConfig {
            server: MockServerSettings {
                enabled: false,
                ..MockServerSettings::default()
            },
            handlers_file: None,
        },
        auth,
    }
}

fn echo_renderer() -> Arc<dyn ComponentRenderer> {
    Arc::new(FnRenderer::new(|request| {
        if request.component == "Broken" {
            return Err(RenderFailure::new("component threw").into());
        }
        let api = resolve_module_mock("~/lib/api").unwrap_or_else(|| "real".to_string());
        let title = request
            .args
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("untitled");
        Ok::<_, RenderError>(format!(
            "<div data-component=\"{}\" data-api=\"{api}\">{title}</div>",
            request.component
        ))
    }))
}

struct Harness {
    router: Router,
    runtime: RenderRuntime,
    _dir: TempDir,
}

async fn harness(auth: AuthSettings) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let rules_path = dir.path().join("rules.toml");
    std::fs::write(&rules_path, RULES).expect("write rules");

    let settings = settings(Some(rules_path), auth.clone());
    let runtime = RenderRuntime::with_renderer(&settings, echo_renderer())
        .await
        .expect("runtime");
    let router = build_router(
        HttpState {
            queue: runtime.queue.clone(),
        },
        Authenticator::from_settings(&auth),
    );

    Harness {
        router,
        runtime,
        _dir: dir,
    }
}

fn render_request(body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/render")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

#[tokio::test]
async fn health_check_answers_ok() {
    let Harness {
        router, runtime, ..
    } = harness(AuthSettings::External).await;

    let response = router
        .oneshot(Request::get("/").body(Body::empty()).expect("request"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "OK");
    runtime.shutdown().await;
}

#[tokio::test]
async fn render_applies_story_rules_and_returns_html() {
    let Harness {
        router, runtime, ..
    } = harness(AuthSettings::External).await;

    let response = router
        .clone()
        .oneshot(render_request(json!({
            "component": "Card",
            "args": { "title": "Hello" },
            "story": { "id": "example-card--primary" }
        })))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/html"), "{content_type}");
    assert_eq!(
        body_text(response).await,
        r#"<div data-component="Card" data-api="/fixtures/api.ts">Hello</div>"#
    );

    let unmatched = router
        .oneshot(render_request(json!({
            "component": "Card",
            "story": { "id": "example-badge--default" }
        })))
        .await
        .expect("response");
    assert_eq!(
        body_text(unmatched).await,
        r#"<div data-component="Card" data-api="real">untitled</div>"#
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn malformed_and_empty_requests_are_bad_requests() {
    let Harness {
        router, runtime, ..
    } = harness(AuthSettings::External).await;

    let malformed = Request::builder()
        .method(Method::POST)
        .uri("/render")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let response = router.clone().oneshot(malformed).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body["error"]["code"], "bad_request");

    let response = router
        .oneshot(render_request(json!({ "component": "  " })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    runtime.shutdown().await;
}

#[tokio::test]
async fn renderer_failure_maps_to_render_failed() {
    let Harness {
        router, runtime, ..
    } = harness(AuthSettings::External).await;

    let response = router
        .clone()
        .oneshot(render_request(json!({ "component": "Broken" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body["error"]["code"], "render_failed");

    let response = router
        .oneshot(render_request(json!({ "component": "Card" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    runtime.shutdown().await;
}

#[tokio::test]
async fn simple_token_guards_every_route() {
    let auth = AuthSettings::SimpleToken(TokenSettings {
        token: "s3cret".into(),
        token_id: Some("ci".into()),
        expires_at: None,
    });
    let Harness {
        router, runtime, ..
    } = harness(auth).await;

    let response = router
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body_text(response).await).expect("json");
    assert_eq!(body, json!({ "error": "Unauthorized" }));

    let mut request = render_request(json!({ "component": "Card" }));
    request.headers_mut().insert(
        header::AUTHORIZATION,
        "Bearer s3cret".parse().expect("header"),
    );
    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    runtime.shutdown().await;
}

#[tokio::test]
async fn cors_preflight_skips_authentication() {
    let auth = AuthSettings::SimpleToken(TokenSettings {
        token: "s3cret".into(),
        token_id: None,
        expires_at: None,
    });
    let Harness {
        router, runtime, ..
    } = harness(auth).await;

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/render")
        .header(header::ORIGIN, "http://catalog.test")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .expect("request");
    let response = router.oneshot(preflight).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
    runtime.shutdown().await;
}

#[tokio::test]
async fn missing_rules_file_fails_startup() {
    let dir = TempDir::new().expect("tempdir");
    let settings = settings(
        Some(dir.path().join("absent.toml")),
        AuthSettings::External,
    );

    let result = RenderRuntime::with_renderer(&settings, echo_renderer()).await;
    let err = match result {
        Ok(_) => panic!("startup should fail"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("absent.toml"), "{err}");
}
