//! The seam between the coordination layer and an actual component renderer.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use storyrender_wire::{PropMap, RenderComponentInput, RenderRequestMessage, StoryInput};

use crate::application::{
    correlation::RenderCorrelator, error::RenderError, module_mocks::ModuleMocks,
};

/// Everything a renderer needs for one render, already sanitized.
///
/// The module-mock table is carried explicitly as well as being installed as
/// the task-local scope, so renderers that hand work to other tasks or
/// processes can forward it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentRequest {
    pub component: String,
    pub args: PropMap,
    pub slots: PropMap,
    pub story: Option<StoryInput>,
    pub module_mocks: Arc<ModuleMocks>,
    pub mock_server_url: Option<String>,
}

impl ComponentRequest {
    pub fn resolve_module(&self, specifier: &str) -> Option<&str> {
        self.module_mocks.get(specifier).map(String::as_str)
    }
}

#[async_trait]
pub trait ComponentRenderer: Send + Sync {
    async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError>;
}

/// Adapts a synchronous function into a [`ComponentRenderer`].
pub struct FnRenderer<F>(F);

impl<F> FnRenderer<F>
where
    F: Fn(&ComponentRequest) -> Result<String, RenderError> + Send + Sync,
{
    pub fn new(render: F) -> Self {
        Self(render)
    }
}

#[async_trait]
impl<F> ComponentRenderer for FnRenderer<F>
where
    F: Fn(&ComponentRequest) -> Result<String, RenderError> + Send + Sync,
{
    async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError> {
        (self.0)(request)
    }
}

/// Renders through the correlation protocol, forwarding per-render context
/// in the wire request.
#[derive(Clone)]
pub struct CorrelatedRenderer {
    correlator: RenderCorrelator,
    timeout: Duration,
}

impl CorrelatedRenderer {
    pub fn new(correlator: RenderCorrelator, timeout: Duration) -> Self {
        Self {
            correlator,
            timeout,
        }
    }

    pub fn correlator(&self) -> &RenderCorrelator {
        &self.correlator
    }
}

#[async_trait]
impl ComponentRenderer for CorrelatedRenderer {
    async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError> {
        let mut message = RenderRequestMessage::new(
            String::new(),
            RenderComponentInput {
                component: request.component.clone(),
                args: request.args.clone(),
                slots: request.slots.clone(),
            },
        );
        message.story = request.story.clone();
        message.module_mocks = request.module_mocks.as_ref().clone();
        message.mock_server_url = request.mock_server_url.clone();

        let rendered = self
            .correlator
            .render_message(message, self.timeout)
            .await?;
        Ok(rendered.html)
    }
}

#[cfg(test)]
mod tests {
    use storyrender_wire::{Message, RenderResponseMessage};
    use tokio::sync::mpsc;

    use super::*;
    use crate::application::correlation::ChannelTransport;

    #[tokio::test]
    async fn correlated_renderer_forwards_render_context() {
        let (tx, mut rx) = mpsc::channel(4);
        let correlator = RenderCorrelator::new(Arc::new(ChannelTransport::new(tx)));
        let renderer = CorrelatedRenderer::new(correlator.clone(), Duration::from_secs(5));

        let responder = correlator.clone();
        let seen = tokio::spawn(async move {
            let Some(Message::Request(request)) = rx.recv().await else {
                panic!("expected request");
            };
            responder.handle_response(RenderResponseMessage::ok(request.id.clone(), "<p>ok</p>"));
            request
        });

        let request = ComponentRequest {
            component: "Card".into(),
            module_mocks: Arc::new(ModuleMocks::from([("pkg/a".into(), "/a.ts".into())])),
            mock_server_url: Some("http://127.0.0.1:4000".into()),
            story: Some(StoryInput::new("card--default")),
            ..ComponentRequest::default()
        };
        assert_eq!(request.resolve_module("pkg/a"), Some("/a.ts"));

        let html = renderer.render(&request).await.expect("html");
        let sent = seen.await.expect("join");

        assert_eq!(html, "<p>ok</p>");
        assert_eq!(sent.module_mocks["pkg/a"], "/a.ts");
        assert_eq!(sent.mock_server_url.as_deref(), Some("http://127.0.0.1:4000"));
        assert_eq!(sent.story.map(|story| story.id).as_deref(), Some("card--default"));
    }
}
