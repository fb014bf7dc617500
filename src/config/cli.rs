use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use url::Url;

/// Command-line arguments for the storyrender binary.
#[derive(Debug, Parser)]
#[command(
    name = "storyrender",
    version,
    about = "Render coordination server for component stories"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "STORYRENDER_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the render server.
    Serve(Box<ServeArgs>),
    /// Validate settings and story rules, optionally previewing one story.
    Check(CheckArgs),
    /// Send one render request to a running server and print the HTML.
    Render(RenderArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the story mode (development|production).
    #[arg(long = "render-mode", value_name = "MODE")]
    pub render_mode: Option<String>,

    /// Override how long a render may take before it is abandoned.
    #[arg(long = "render-timeout-ms", value_name = "MILLIS")]
    pub render_timeout_ms: Option<u64>,

    /// Renderer executable speaking newline-delimited JSON on stdio.
    #[arg(
        long = "render-command",
        value_name = "PROGRAM",
        value_hint = ValueHint::CommandName
    )]
    pub render_command: Option<PathBuf>,

    /// Argument passed to the renderer executable; repeatable.
    #[arg(long = "render-arg", value_name = "ARG")]
    pub render_args: Vec<String>,

    /// Base URL of another render server to delegate to.
    #[arg(long = "render-url", value_name = "URL", value_hint = ValueHint::Url)]
    pub render_url: Option<String>,

    /// Bearer token for the delegated render server.
    #[arg(long = "render-token", value_name = "TOKEN")]
    pub render_token: Option<String>,

    /// Override the story rules file.
    #[arg(
        long = "rules-config-file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub rules_config_file: Option<PathBuf>,

    /// Toggle the mock HTTP server.
    #[arg(
        long = "mock-server-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub mock_server_enabled: Option<bool>,

    /// Override the mock HTTP server port (0 picks a free port).
    #[arg(long = "mock-server-port", value_name = "PORT")]
    pub mock_server_port: Option<u16>,

    /// Override the base mock handlers file.
    #[arg(
        long = "mock-server-handlers-file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub mock_server_handlers_file: Option<PathBuf>,

    /// Override the auth mode (external|simple-token).
    #[arg(long = "auth-mode", value_name = "MODE")]
    pub auth_mode: Option<String>,

    /// Override the accepted bearer token for simple-token auth.
    #[arg(long = "auth-token", value_name = "TOKEN")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckArgs {
    /// Override the story rules file.
    #[arg(
        long = "rules-config-file",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub rules_config_file: Option<PathBuf>,

    #[command(flatten)]
    pub story: StoryArgs,
}

/// Story metadata used to select rules.
#[derive(Debug, Args, Default, Clone)]
pub struct StoryArgs {
    #[arg(long = "story-id", value_name = "ID")]
    pub story_id: Option<String>,

    #[arg(long = "title", value_name = "TITLE", requires = "story_id")]
    pub title: Option<String>,

    #[arg(long = "name", value_name = "NAME", requires = "story_id")]
    pub name: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Component to render.
    #[arg(value_name = "COMPONENT")]
    pub component: String,

    /// Render server base URL; defaults to the configured listener.
    #[arg(long = "url", value_name = "URL", value_hint = ValueHint::Url)]
    pub url: Option<Url>,

    /// Bearer token sent to the render server.
    #[arg(long = "token", env = "STORYRENDER_TOKEN", value_name = "TOKEN")]
    pub token: Option<String>,

    /// Component args as a JSON object.
    #[arg(long = "args", value_name = "JSON")]
    pub args: Option<String>,

    /// Slots as a JSON object of HTML strings.
    #[arg(long = "slots", value_name = "JSON")]
    pub slots: Option<String>,

    #[command(flatten)]
    pub story: StoryArgs,

    /// Give up after this many milliseconds.
    #[arg(long = "timeout-ms", value_name = "MILLIS")]
    pub timeout_ms: Option<u64>,
}
