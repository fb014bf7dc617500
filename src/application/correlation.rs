//! Request/response correlation with an out-of-process renderer.
//!
//! Each request gets a fresh UUID and a [`PendingRender`] entry holding the
//! caller's completion channel. The entry leaves the map exactly once: when
//! the matching response arrives, when its timer fires, when the transport
//! refuses the request, or when the response stream closes. A caller that
//! drops its future leaves the entry until the timer fires.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use storyrender_wire::{Message, RenderComponentInput, RenderRequestMessage, RenderResponseMessage};
use tokio::{
    sync::{mpsc, oneshot},
    task::{AbortHandle, JoinHandle},
    time::Instant,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::error::{RenderError, RenderFailure, RenderServerUnavailable};

pub(crate) const METRIC_PENDING_RENDERS: &str = "storyrender_pending_renders";
pub(crate) const METRIC_RENDER_TIMEOUT_TOTAL: &str = "storyrender_render_timeout_total";

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_millis(5000);

/// Ships tagged requests to the renderer. Responses come back separately
/// through [`RenderCorrelator::handle_response`].
#[async_trait]
pub trait RenderTransport: Send + Sync {
    /// Fails only when the request could not be handed over at all.
    async fn send(&self, request: RenderRequestMessage) -> Result<(), RenderServerUnavailable>;

    /// Human-readable location of the renderer, used in error messages.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

type Completion = oneshot::Sender<Result<String, RenderError>>;

struct PendingRender {
    completion: Completion,
    timer: Option<AbortHandle>,
    deadline: Instant,
}

/// In-flight requests keyed by correlation id.
#[derive(Clone, Default)]
pub struct PendingRenders {
    inner: Arc<DashMap<String, PendingRender>>,
}

impl PendingRenders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    /// Time left before `id` times out.
    pub fn remaining(&self, id: &str) -> Option<Duration> {
        self.inner
            .get(id)
            .map(|entry| entry.deadline.saturating_duration_since(Instant::now()))
    }

    fn register(&self, id: String, completion: Completion, deadline: Instant) {
        self.inner.insert(
            id,
            PendingRender {
                completion,
                timer: None,
                deadline,
            },
        );
        self.record_gauge();
    }

    fn attach_timer(&self, id: &str, timer: AbortHandle) {
        match self.inner.get_mut(id) {
            Some(mut entry) => entry.timer = Some(timer),
            // Already settled; the timer has nothing left to do.
            None => timer.abort(),
        }
    }

    /// Settle `id` with `outcome`. Returns `false` for unknown ids.
    fn settle(&self, id: &str, outcome: Result<String, RenderError>) -> bool {
        let Some((_, pending)) = self.inner.remove(id) else {
            return false;
        };
        self.record_gauge();
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        // The caller may have given up; nothing to deliver to then.
        let _ = pending.completion.send(outcome);
        true
    }

    /// Reject every in-flight request, e.g. when the response stream closed.
    pub fn reject_all(&self, error: &RenderServerUnavailable) -> usize {
        let ids: Vec<String> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter(|id| self.settle(id, Err(RenderError::Unavailable(error.clone()))))
            .count()
    }

    fn record_gauge(&self) {
        gauge!(METRIC_PENDING_RENDERS).set(self.inner.len() as f64);
    }
}

/// Rendered markup together with the correlation id it answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelatedRender {
    pub id: String,
    pub html: String,
}

/// Client side of the correlation protocol.
#[derive(Clone)]
pub struct RenderCorrelator {
    transport: Arc<dyn RenderTransport>,
    pending: PendingRenders,
}

impl RenderCorrelator {
    pub fn new(transport: Arc<dyn RenderTransport>) -> Self {
        Self {
            transport,
            pending: PendingRenders::new(),
        }
    }

    pub fn pending(&self) -> &PendingRenders {
        &self.pending
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn render(
        &self,
        input: RenderComponentInput,
        timeout: Duration,
    ) -> Result<CorrelatedRender, RenderError> {
        self.render_message(RenderRequestMessage::new(String::new(), input), timeout)
            .await
    }

    /// Send a fully populated request. Its `id` is replaced with a fresh one.
    pub async fn render_message(
        &self,
        mut request: RenderRequestMessage,
        timeout: Duration,
    ) -> Result<CorrelatedRender, RenderError> {
        let id = Uuid::new_v4().to_string();
        request.id = id.clone();

        let (completion, outcome) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.pending.register(id.clone(), completion, deadline);
        let timer = self.spawn_timer(id.clone(), timeout);
        self.pending.attach_timer(&id, timer);

        debug!(
            target = "storyrender::correlation",
            render_id = %id,
            component = %request.component,
            timeout_ms = timeout.as_millis() as u64,
            "render request sent"
        );

        // A transport that cannot take the request before the deadline is left
        // to the timer.
        if let Ok(Err(err)) = tokio::time::timeout_at(deadline, self.transport.send(request)).await
        {
            warn!(
                target = "storyrender::correlation",
                render_id = %id,
                error = %err,
                "render transport refused request"
            );
            self.pending.settle(&id, Err(RenderError::Unavailable(err)));
        }

        let html = match outcome.await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RenderServerUnavailable::unreachable(
                    self.transport.endpoint(),
                    "The render request was dropped before a response arrived.",
                )
                .into());
            }
        };

        Ok(CorrelatedRender { id, html })
    }

    fn spawn_timer(&self, id: String, timeout: Duration) -> AbortHandle {
        let pending = self.pending.clone();
        let endpoint = self.transport.endpoint();
        let task: JoinHandle<()> = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let error = RenderServerUnavailable::timed_out(endpoint, timeout);
            if pending.settle(&id, Err(RenderError::Unavailable(error))) {
                counter!(METRIC_RENDER_TIMEOUT_TOTAL).increment(1);
                warn!(
                    target = "storyrender::correlation",
                    render_id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "render request timed out"
                );
            }
        });
        task.abort_handle()
    }

    /// Deliver a correlated response. Unknown or already settled ids are ignored.
    pub fn handle_response(&self, response: RenderResponseMessage) -> bool {
        let RenderResponseMessage { id, html, error } = response;
        let outcome = match error {
            Some(message) => Err(RenderError::Failed(RenderFailure::new(message))),
            None => Ok(html),
        };

        let delivered = self.pending.settle(&id, outcome);
        if !delivered {
            debug!(
                target = "storyrender::correlation",
                render_id = %id,
                "ignoring response for unknown render id"
            );
        }
        delivered
    }

    /// Feed responses from an event channel until it closes, then reject
    /// whatever is still pending.
    pub fn spawn_response_pump(&self, mut responses: mpsc::Receiver<Message>) -> JoinHandle<()> {
        let correlator = self.clone();
        tokio::spawn(async move {
            while let Some(message) = responses.recv().await {
                match message {
                    Message::Response(response) => {
                        correlator.handle_response(response);
                    }
                    other => debug!(
                        target = "storyrender::correlation",
                        event = other.event_name(),
                        "ignoring non-response event"
                    ),
                }
            }
            let closed = RenderServerUnavailable::unreachable(
                correlator.transport.endpoint(),
                "The render response channel closed.",
            );
            let rejected = correlator.pending.reject_all(&closed);
            if rejected > 0 {
                warn!(
                    target = "storyrender::correlation",
                    rejected,
                    "render response channel closed with requests in flight"
                );
            }
        })
    }
}

/// Event-channel transport: requests go out as `render:request` events.
#[derive(Clone)]
pub struct ChannelTransport {
    requests: mpsc::Sender<Message>,
    name: Option<String>,
}

impl ChannelTransport {
    pub fn new(requests: mpsc::Sender<Message>) -> Self {
        Self {
            requests,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl RenderTransport for ChannelTransport {
    async fn send(&self, request: RenderRequestMessage) -> Result<(), RenderServerUnavailable> {
        self.requests
            .send(Message::Request(request))
            .await
            .map_err(|_| {
                RenderServerUnavailable::unreachable(
                    self.endpoint(),
                    "The render request channel is closed.",
                )
            })
    }

    fn endpoint(&self) -> Option<String> {
        self.name.clone()
    }
}
