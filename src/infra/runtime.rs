//! Assembles the render pipeline from settings.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    application::{
        error::AppError,
        mock_server::{MockServer, load_handlers_file},
        queue::{RenderPipeline, RenderQueue},
        renderer::ComponentRenderer,
        rules::{RuleSet, RulesStore},
    },
    config::{MockServerConfig, RenderBackend, RulesSettings, Settings},
    domain::error::ConfigurationError,
    infra::{http::HttpRenderClient, process::ProcessRenderer},
};

/// The rules store for `settings`; an empty fixed set when no file is configured.
pub async fn open_rules(settings: &RulesSettings) -> Result<RulesStore, ConfigurationError> {
    match settings.config_file.as_deref() {
        Some(path) => RulesStore::open(path).await,
        None => Ok(RulesStore::fixed(RuleSet::empty())),
    }
}

pub async fn open_mock_server(config: &MockServerConfig) -> Result<MockServer, ConfigurationError> {
    let base = match config.handlers_file.as_deref() {
        Some(path) => load_handlers_file(path).await?,
        None => Vec::new(),
    };
    Ok(MockServer::new(config.server.clone(), base))
}

/// Re-read the rules file each time `triggers` yields, until it closes.
///
/// A failed reload keeps the previous rules; `RulesStore::invalidate` logs it.
pub fn spawn_rules_reloader(
    rules: Arc<RulesStore>,
    mut triggers: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while triggers.recv().await.is_some() {
            let _ = rules.invalidate().await;
        }
        debug!(target = "storyrender::runtime", "rules reload trigger closed");
    })
}

/// Forward SIGHUP as rules reload triggers.
#[cfg(unix)]
pub fn hangup_triggers() -> std::io::Result<mpsc::Receiver<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangups = signal(SignalKind::hangup())?;
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            // A full channel already has a reload pending.
            if let Err(mpsc::error::TrySendError::Closed(())) = tx.try_send(()) {
                break;
            }
        }
    });
    Ok(rx)
}

enum Backend {
    Process(Arc<ProcessRenderer>),
    Other,
}

/// A running render queue and the shared collaborators behind it.
pub struct RenderRuntime {
    pub queue: RenderQueue,
    pub rules: Arc<RulesStore>,
    pub mock_server: Arc<MockServer>,
    backend: Backend,
    worker: JoinHandle<()>,
    reloader: Option<JoinHandle<()>>,
}

impl RenderRuntime {
    /// Start with the renderer named by `settings.render.backend`.
    pub async fn start(settings: &Settings) -> Result<Self, AppError> {
        let timeout = settings.render.timeout;
        let (renderer, backend): (Arc<dyn ComponentRenderer>, Backend) =
            match settings.render.backend.as_ref() {
                Some(RenderBackend::Process { command, args }) => {
                    let renderer = Arc::new(ProcessRenderer::spawn(command, args, timeout)?);
                    (renderer.clone(), Backend::Process(renderer))
                }
                Some(RenderBackend::Http { url, token }) => {
                    let client = HttpRenderClient::new(url, token.clone(), timeout)?;
                    info!(
                        target = "storyrender::runtime",
                        endpoint = %client.endpoint(),
                        "delegating renders over HTTP"
                    );
                    (Arc::new(client), Backend::Other)
                }
                None => {
                    return Err(ConfigurationError::invalid(
                        "render",
                        "set `render.command` or `render.url` to choose a renderer",
                    )
                    .into());
                }
            };

        Self::assemble(settings, renderer, backend).await
    }

    /// Start with a caller-supplied renderer.
    pub async fn with_renderer(
        settings: &Settings,
        renderer: Arc<dyn ComponentRenderer>,
    ) -> Result<Self, AppError> {
        Self::assemble(settings, renderer, Backend::Other).await
    }

    async fn assemble(
        settings: &Settings,
        renderer: Arc<dyn ComponentRenderer>,
        backend: Backend,
    ) -> Result<Self, AppError> {
        let rules = Arc::new(open_rules(&settings.rules).await?);
        let mock_server = Arc::new(open_mock_server(&settings.mock_server).await?);

        let (queue, worker) = RenderQueue::spawn(RenderPipeline {
            renderer,
            rules: Arc::clone(&rules),
            mock_server: Arc::clone(&mock_server),
            sanitization: Arc::new(settings.sanitization.clone()),
            mode: settings.render.mode,
        });

        info!(
            target = "storyrender::runtime",
            mode = %settings.render.mode,
            rules = rules.current().len(),
            sanitization = settings.sanitization.enabled,
            mock_server = mock_server.is_enabled(),
            "render pipeline ready"
        );

        Ok(Self {
            queue,
            rules,
            mock_server,
            backend,
            worker,
            reloader: None,
        })
    }

    /// Reload the rules file whenever `triggers` yields.
    pub fn watch_rules(&mut self, triggers: mpsc::Receiver<()>) {
        if let Some(previous) = self.reloader.replace(spawn_rules_reloader(
            Arc::clone(&self.rules),
            triggers,
        )) {
            previous.abort();
        }
    }

    /// Stop the worker, the mock server and any renderer process.
    pub async fn shutdown(self) {
        let Self {
            queue,
            mock_server,
            backend,
            worker,
            reloader,
            ..
        } = self;
        if let Some(reloader) = reloader {
            reloader.abort();
        }
        drop(queue);
        worker.abort();
        let _ = worker.await;
        mock_server.shutdown().await;
        if let Backend::Process(renderer) = backend {
            renderer.shutdown().await;
        }
        info!(target = "storyrender::runtime", "render pipeline stopped");
    }
}
