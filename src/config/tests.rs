use serde_json::json;
use time::macros::datetime;

use super::*;

#[test]
fn defaults_describe_a_local_development_server() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr, "127.0.0.1:3000".parse().expect("addr"));
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.render.mode, StoryMode::Development);
    assert_eq!(
        settings.render.timeout,
        Duration::from_millis(DEFAULT_RENDER_TIMEOUT_MS)
    );
    assert!(settings.render.backend.is_none());
    assert!(settings.rules.config_file.is_none());
    assert!(!settings.sanitization.enabled);
    assert!(settings.mock_server.server.enabled);
    assert_eq!(settings.mock_server.server.port, 0);
    assert_eq!(settings.auth, AuthSettings::External);
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());
    raw.render.url = Some("http://renderer.internal:3000".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        render_command: Some(PathBuf::from("node")),
        render_args: vec!["renderer.mjs".to_string()],
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(
        settings.render.backend,
        Some(RenderBackend::Process {
            command: PathBuf::from("node"),
            args: vec!["renderer.mjs".to_string()],
        })
    );
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_port_and_timeout_are_rejected() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "server.port", .. }));

    let mut raw = RawSettings::default();
    raw.render.timeout_ms = Some(0);
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "render.timeout_ms",
            ..
        }
    ));
}

#[test]
fn render_backends_are_mutually_exclusive() {
    let mut raw = RawSettings::default();
    raw.render.command = Some(PathBuf::from("node"));
    raw.render.url = Some("http://localhost:4000".to_string());

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "render", .. }));
}

#[test]
fn http_backend_requires_http_scheme() {
    let mut raw = RawSettings::default();
    raw.render.url = Some("ftp://renderer".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "render.url", .. }));

    let mut raw = RawSettings::default();
    raw.render.url = Some("https://renderer.test/base/".to_string());
    raw.render.token = Some("  secret ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    match settings.render.backend {
        Some(RenderBackend::Http { url, token }) => {
            assert_eq!(url.as_str(), "https://renderer.test/base/");
            assert_eq!(token.as_deref(), Some("secret"));
        }
        other => panic!("unexpected backend: {other:?}"),
    }
}

#[test]
fn render_mode_accepts_short_forms() {
    let mut raw = RawSettings::default();
    raw.render.mode = Some("prod".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.render.mode, StoryMode::Production);

    let mut raw = RawSettings::default();
    raw.render.mode = Some("staging".to_string());
    assert!(matches!(
        Settings::from_raw(raw).unwrap_err(),
        LoadError::Invalid {
            key: "render.mode",
            ..
        }
    ));
}

#[test]
fn sanitization_errors_name_the_option() {
    let mut raw = RawSettings::default();
    raw.sanitization = Some(json!({ "args": ["title", 3] }));

    match Settings::from_raw(raw).unwrap_err() {
        LoadError::Configuration(err) => assert_eq!(err.option(), Some("sanitization.args[1]")),
        other => panic!("unexpected error: {other:?}"),
    }

    let mut raw = RawSettings::default();
    raw.sanitization = Some(json!({ "args": ["title"] }));
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.sanitization.enabled);
    assert_eq!(settings.sanitization.arg_patterns.len(), 1);
}

#[test]
fn simple_token_auth_requires_a_token() {
    let mut raw = RawSettings::default();
    raw.auth.mode = Some("simple-token".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "auth.token", .. }));

    let mut raw = RawSettings::default();
    raw.auth.mode = Some("Simple-Token".to_string());
    raw.auth.token = Some("abc".to_string());
    raw.auth.token_id = Some("ci".to_string());
    raw.auth.token_expires_at = Some("2030-01-02T03:04:05Z".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(
        settings.auth,
        AuthSettings::SimpleToken(TokenSettings {
            token: "abc".to_string(),
            token_id: Some("ci".to_string()),
            expires_at: Some(datetime!(2030-01-02 03:04:05 UTC)),
        })
    );
}

#[test]
fn malformed_token_expiry_is_rejected() {
    let mut raw = RawSettings::default();
    raw.auth.mode = Some("simple-token".to_string());
    raw.auth.token = Some("abc".to_string());
    raw.auth.token_expires_at = Some("tomorrow".to_string());

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "auth.token_expires_at",
            ..
        }
    ));
}

#[test]
fn unknown_auth_mode_is_rejected() {
    let mut raw = RawSettings::default();
    raw.auth.mode = Some("oauth".to_string());
    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "auth.mode", .. }));
}

#[test]
fn check_overrides_only_touch_rules() {
    let mut raw = RawSettings::default();
    let args = CheckArgs {
        rules_config_file: Some(PathBuf::from("rules.toml")),
        ..Default::default()
    };

    raw.apply_check_overrides(&args);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.rules.config_file.as_deref(),
        Some(std::path::Path::new("rules.toml"))
    );
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["storyrender"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "storyrender",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--render-command",
        "node",
        "--render-arg",
        "renderer.mjs",
        "--render-arg",
        "dev",
        "--mock-server-enabled",
        "no",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(serve.overrides.render_args, ["renderer.mjs", "dev"]);
            assert_eq!(serve.overrides.mock_server_enabled, Some(false));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_check_arguments() {
    let args = CliArgs::parse_from([
        "storyrender",
        "check",
        "--rules-config-file",
        "/tmp/rules",
        "--story-id",
        "astro-card--default",
        "--title",
        "Astro/Card",
    ]);

    match args.command.expect("check command") {
        Command::Check(check) => {
            assert_eq!(
                check.rules_config_file.as_deref(),
                Some(std::path::Path::new("/tmp/rules"))
            );
            assert_eq!(check.story.story_id.as_deref(), Some("astro-card--default"));
            assert_eq!(check.story.title.as_deref(), Some("Astro/Card"));
            assert!(check.story.name.is_none());
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_render_arguments() {
    let args = CliArgs::parse_from([
        "storyrender",
        "render",
        "Card",
        "--url",
        "http://127.0.0.1:3000",
        "--args",
        r#"{"title":"Hi"}"#,
    ]);

    match args.command.expect("render command") {
        Command::Render(render) => {
            assert_eq!(render.component, "Card");
            assert_eq!(
                render.url.as_ref().map(Url::as_str),
                Some("http://127.0.0.1:3000/")
            );
            assert_eq!(render.args.as_deref(), Some(r#"{"title":"Hi"}"#));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn title_requires_story_id() {
    let result = CliArgs::try_parse_from(["storyrender", "check", "--title", "Astro/Card"]);
    assert!(result.is_err());
}
