use std::{process, time::Duration};

use serde_json::Value;
use storyrender::{
    application::{
        error::AppError,
        rules::select_story_rules,
        sanitization::{self, SanitizationPolicy},
    },
    config,
    domain::{error::ConfigurationError, story::StoryIdentity},
    infra::{
        error::InfraError,
        http::{self, Authenticator, HttpRenderClient, HttpState},
        runtime::{RenderRuntime, open_rules},
        telemetry,
    },
};
use storyrender_wire::{PropMap, RenderStoryRequest, StoryInput};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Check(args) => run_check(settings, args).await,
        config::Command::Render(args) => run_render(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let mut runtime = RenderRuntime::start(&settings).await?;
    watch_rules_on_hangup(&mut runtime);
    let router = http::build_router(
        HttpState {
            queue: runtime.queue.clone(),
        },
        Authenticator::from_settings(&settings.auth),
    );

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    let result = http::serve(listener, router, shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    runtime.shutdown().await;
    result
}

#[cfg(unix)]
fn watch_rules_on_hangup(runtime: &mut RenderRuntime) {
    if runtime.rules.source().is_none() {
        return;
    }
    match storyrender::infra::runtime::hangup_triggers() {
        Ok(triggers) => {
            runtime.watch_rules(triggers);
            info!(target = "storyrender::serve", "SIGHUP reloads story rules");
        }
        Err(err) => warn!(
            target = "storyrender::serve",
            error = %err,
            "listening for SIGHUP failed; story rules will not reload"
        ),
    }
}

#[cfg(not(unix))]
fn watch_rules_on_hangup(_runtime: &mut RenderRuntime) {}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target = "storyrender::serve", "shutdown requested"),
        Err(err) => warn!(
            target = "storyrender::serve",
            error = %err,
            "listening for ctrl-c failed; serving until killed"
        ),
    }
}

async fn run_check(settings: config::Settings, args: config::CheckArgs) -> Result<(), AppError> {
    let rules = open_rules(&settings.rules).await?;
    let rule_set = rules.current();

    println!("mode: {}", settings.render.mode);
    match settings.render.backend.as_ref() {
        Some(config::RenderBackend::Process { command, .. }) => {
            println!("renderer: process {}", command.display())
        }
        Some(config::RenderBackend::Http { url, .. }) => println!("renderer: http {url}"),
        None => println!("renderer: <not configured>"),
    }
    print_sanitization(&settings.sanitization);
    match rules.source() {
        Some(path) => println!("rules: {} from {}", rule_set.len(), path.display()),
        None => println!("rules: none configured"),
    }

    let Some(story_id) = args.story.story_id.as_deref() else {
        return Ok(());
    };
    let story = StoryIdentity::new(
        story_id,
        args.story.title.as_deref(),
        args.story.name.as_deref(),
    );
    let selection = select_story_rules(&rule_set, &story, settings.render.mode).await?;

    println!("story: {}", story.id());
    println!("  matched rules: {:?}", selection.matched_rules);
    for (specifier, replacement) in &selection.module_mocks {
        println!("  module {specifier} -> {replacement}");
    }
    for handler in &selection.mock_handlers {
        let method = handler
            .method()
            .map(|method| method.as_str())
            .unwrap_or("*");
        println!("  http {method} {}", handler.url());
    }
    Ok(())
}

fn print_sanitization(policy: &SanitizationPolicy) {
    for (key, value) in sanitization::describe(policy) {
        println!("sanitization.{key}: {value}");
    }
}

async fn run_render(settings: config::Settings, args: config::RenderArgs) -> Result<(), AppError> {
    let base = match args.url {
        Some(url) => url,
        None => Url::parse(&format!("http://{}", settings.server.addr))
            .map_err(|err| AppError::unexpected(format!("invalid server address: {err}")))?,
    };
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(settings.render.timeout);
    let client = HttpRenderClient::new(&base, args.token, timeout)?;

    let mut request = RenderStoryRequest::new(args.component)
        .with_args(parse_props("args", args.args.as_deref())?)
        .with_slots(parse_props("slots", args.slots.as_deref())?);
    if let Some(id) = args.story.story_id {
        let mut story = StoryInput::new(id);
        story.title = args.story.title;
        story.name = args.story.name;
        request = request.with_story(story);
    }

    let html = client.render_story(&request).await?;
    println!("{html}");
    Ok(())
}

fn parse_props(option: &'static str, raw: Option<&str>) -> Result<PropMap, ConfigurationError> {
    let Some(raw) = raw else {
        return Ok(PropMap::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ConfigurationError::invalid(option, "expected a JSON object")),
        Err(err) => Err(ConfigurationError::invalid(
            option,
            format!("invalid JSON: {err}"),
        )),
    }
}
