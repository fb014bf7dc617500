//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::{
    application::{
        mock_server::MockServerSettings, rules::StoryMode, sanitization::SanitizationPolicy,
    },
    domain::error::ConfigurationError,
};

pub use cli::{CheckArgs, CliArgs, Command, RenderArgs, ServeArgs, ServeOverrides, StoryArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "storyrender";
const ENV_PREFIX: &str = "STORYRENDER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MOCK_SERVER_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_RENDER_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub render: RenderSettings,
    pub rules: RulesSettings,
    pub sanitization: SanitizationPolicy,
    pub mock_server: MockServerConfig,
    pub auth: AuthSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub mode: StoryMode,
    pub timeout: Duration,
    /// `None` only passes validation for commands that never render.
    pub backend: Option<RenderBackend>,
}

/// Where rendering is delegated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderBackend {
    /// A child process speaking newline-delimited JSON over stdio.
    Process { command: PathBuf, args: Vec<String> },
    /// Another render server reached over HTTP.
    Http { url: Url, token: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct RulesSettings {
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct MockServerConfig {
    pub server: MockServerSettings,
    pub handlers_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSettings {
    /// An upstream collaborator authenticates requests.
    External,
    SimpleToken(TokenSettings),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSettings {
    pub token: String,
    pub token_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Check(args)) => raw.apply_check_overrides(args),
        Some(Command::Render(_)) => {}
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    render: RawRenderSettings,
    rules: RawRulesSettings,
    sanitization: Option<Value>,
    mock_server: RawMockServerSettings,
    auth: RawAuthSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(mode) = overrides.render_mode.as_ref() {
            self.render.mode = Some(mode.clone());
        }
        if let Some(timeout) = overrides.render_timeout_ms {
            self.render.timeout_ms = Some(timeout);
        }
        if let Some(command) = overrides.render_command.as_ref() {
            self.render.command = Some(command.clone());
            self.render.url = None;
        }
        if !overrides.render_args.is_empty() {
            self.render.args = Some(overrides.render_args.clone());
        }
        if let Some(url) = overrides.render_url.as_ref() {
            self.render.url = Some(url.clone());
            self.render.command = None;
            self.render.args = None;
        }
        if let Some(token) = overrides.render_token.as_ref() {
            self.render.token = Some(token.clone());
        }
        if let Some(path) = overrides.rules_config_file.as_ref() {
            self.rules.config_file = Some(path.clone());
        }
        if let Some(enabled) = overrides.mock_server_enabled {
            self.mock_server.enabled = Some(enabled);
        }
        if let Some(port) = overrides.mock_server_port {
            self.mock_server.port = Some(port);
        }
        if let Some(path) = overrides.mock_server_handlers_file.as_ref() {
            self.mock_server.handlers_file = Some(path.clone());
        }
        if let Some(mode) = overrides.auth_mode.as_ref() {
            self.auth.mode = Some(mode.clone());
        }
        if let Some(token) = overrides.auth_token.as_ref() {
            self.auth.token = Some(token.clone());
        }
    }

    fn apply_check_overrides(&mut self, args: &CheckArgs) {
        if let Some(path) = args.rules_config_file.as_ref() {
            self.rules.config_file = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            render,
            rules,
            sanitization,
            mock_server,
            auth,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render)?;
        let rules = build_rules_settings(rules)?;
        let sanitization = SanitizationPolicy::resolve(sanitization.as_ref())?;
        let mock_server = build_mock_server_settings(mock_server)?;
        let auth = build_auth_settings(auth)?;

        Ok(Self {
            server,
            logging,
            render,
            rules,
            sanitization,
            mock_server,
            auth,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let mode = match render.mode {
        Some(mode) => StoryMode::from_str(&mode)
            .map_err(|reason| LoadError::invalid("render.mode", reason))?,
        None => StoryMode::Development,
    };

    let timeout_ms = render.timeout_ms.unwrap_or(DEFAULT_RENDER_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "render.timeout_ms",
            "must be greater than zero",
        ));
    }

    let command = render
        .command
        .filter(|command| !command.as_os_str().is_empty());
    let url = non_blank(render.url);
    let token = non_blank(render.token);

    let backend = match (command, url) {
        (Some(_), Some(_)) => {
            return Err(LoadError::invalid(
                "render",
                "`command` and `url` are mutually exclusive",
            ));
        }
        (Some(command), None) => {
            if token.is_some() {
                return Err(LoadError::invalid("render.token", "requires `render.url`"));
            }
            Some(RenderBackend::Process {
                command,
                args: render.args.unwrap_or_default(),
            })
        }
        (None, Some(url)) => {
            if render.args.as_ref().is_some_and(|args| !args.is_empty()) {
                return Err(LoadError::invalid("render.args", "requires `render.command`"));
            }
            Some(RenderBackend::Http {
                url: parse_http_url(&url)
                    .map_err(|reason| LoadError::invalid("render.url", reason))?,
                token,
            })
        }
        (None, None) => {
            if render.args.as_ref().is_some_and(|args| !args.is_empty()) {
                return Err(LoadError::invalid("render.args", "requires `render.command`"));
            }
            None
        }
    };

    Ok(RenderSettings {
        mode,
        timeout: Duration::from_millis(timeout_ms),
        backend,
    })
}

fn build_rules_settings(rules: RawRulesSettings) -> Result<RulesSettings, LoadError> {
    let config_file = match rules.config_file {
        Some(path) if path.as_os_str().is_empty() => {
            return Err(LoadError::invalid(
                "rules.config_file",
                "path must not be empty",
            ));
        }
        other => other,
    };
    Ok(RulesSettings { config_file })
}

fn build_mock_server_settings(
    mock_server: RawMockServerSettings,
) -> Result<MockServerConfig, LoadError> {
    let host = non_blank(mock_server.host).unwrap_or_else(|| DEFAULT_MOCK_SERVER_HOST.to_string());
    let port = mock_server.port.unwrap_or(0);
    parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("mock_server.host", reason))?;

    Ok(MockServerConfig {
        server: MockServerSettings {
            enabled: mock_server.enabled.unwrap_or(true),
            host,
            port,
        },
        handlers_file: mock_server.handlers_file,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let mode = auth
        .mode
        .map(|mode| mode.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "external".to_string());

    match mode.as_str() {
        "external" => Ok(AuthSettings::External),
        "simple-token" => {
            let token = non_blank(auth.token).ok_or_else(|| {
                LoadError::invalid("auth.token", "required when auth.mode is simple-token")
            })?;
            let expires_at = non_blank(auth.token_expires_at)
                .map(|value| {
                    OffsetDateTime::parse(&value, &Rfc3339).map_err(|err| {
                        LoadError::invalid(
                            "auth.token_expires_at",
                            format!("expected an RFC 3339 timestamp: {err}"),
                        )
                    })
                })
                .transpose()?;
            Ok(AuthSettings::SimpleToken(TokenSettings {
                token,
                token_id: non_blank(auth.token_id),
                expires_at,
            }))
        }
        other => Err(LoadError::invalid(
            "auth.mode",
            format!("unknown mode `{other}`; expected `external` or `simple-token`"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    mode: Option<String>,
    timeout_ms: Option<u64>,
    command: Option<PathBuf>,
    args: Option<Vec<String>>,
    url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRulesSettings {
    config_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMockServerSettings {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    handlers_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    mode: Option<String>,
    token: Option<String>,
    token_id: Option<String>,
    token_expires_at: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn parse_http_url(value: &str) -> Result<Url, String> {
    let url = Url::parse(value).map_err(|err| format!("invalid URL `{value}`: {err}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme `{other}`; expected http or https")),
    }
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
