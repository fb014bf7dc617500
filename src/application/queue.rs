//! The render serialization queue.
//!
//! One worker task owns the pipeline and runs jobs strictly in admission
//! order, one at a time, from rule selection to result delivery. The mock
//! server and the module-mock scope are shared per process, so this is what
//! keeps one render from observing another's overrides.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use futures::FutureExt;
use metrics::{counter, gauge, histogram};
use storyrender_wire::{Message, RenderResponseMessage, RenderStoryRequest};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    application::{
        error::{RenderError, RenderFailure},
        mock_server::MockServer,
        module_mocks::with_module_mocks,
        renderer::{ComponentRenderer, ComponentRequest},
        rules::{RulesStore, StoryMode, select_story_rules},
        sanitization::{RenderPayload, SanitizationPolicy, sanitize_payload},
    },
    domain::story::StoryIdentity,
};

pub(crate) const METRIC_RENDER_TOTAL: &str = "storyrender_render_total";
pub(crate) const METRIC_RENDER_FAILED_TOTAL: &str = "storyrender_render_failed_total";
pub(crate) const METRIC_RENDER_MS: &str = "storyrender_render_ms";
pub(crate) const METRIC_QUEUE_DEPTH: &str = "storyrender_queue_depth";

/// The collaborators one render passes through.
#[derive(Clone)]
pub struct RenderPipeline {
    pub renderer: Arc<dyn ComponentRenderer>,
    pub rules: Arc<RulesStore>,
    pub mock_server: Arc<MockServer>,
    pub sanitization: Arc<SanitizationPolicy>,
    pub mode: StoryMode,
}

impl RenderPipeline {
    /// Run one render end to end. The mock handler set is reset afterwards
    /// whatever the outcome, including a panic in a rule effect or renderer.
    pub async fn run(&self, request: RenderStoryRequest) -> Result<String, RenderError> {
        let story = StoryIdentity::from_input(request.story.as_ref());
        let component = request.component.clone();
        let started = Instant::now();

        let outcome = AssertUnwindSafe(self.run_scoped(request, &story))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(RenderFailure::from_panic(panic).into()));
        self.mock_server.reset().await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let status = if outcome.is_ok() { "ok" } else { "error" };
        counter!(METRIC_RENDER_TOTAL, "status" => status).increment(1);
        histogram!(METRIC_RENDER_MS).record(elapsed_ms);

        match &outcome {
            Ok(html) => debug!(
                target = "storyrender::queue",
                story_id = story.id(),
                component = %component,
                elapsed_ms,
                bytes = html.len(),
                "render completed"
            ),
            Err(err) => {
                counter!(METRIC_RENDER_FAILED_TOTAL).increment(1);
                warn!(
                    target = "storyrender::queue",
                    story_id = story.id(),
                    component = %component,
                    elapsed_ms,
                    error = %err,
                    "render failed"
                );
            }
        }

        outcome
    }

    async fn run_scoped(
        &self,
        request: RenderStoryRequest,
        story: &StoryIdentity,
    ) -> Result<String, RenderError> {
        let rules = self.rules.current();
        let selection = select_story_rules(&rules, story, self.mode).await?;
        self.mock_server
            .apply_handlers(selection.mock_handlers)
            .await?;

        let RenderStoryRequest {
            component,
            args,
            slots,
            story: story_input,
        } = request;
        let payload = sanitize_payload(RenderPayload::new(args, slots), &self.sanitization);
        let module_mocks = Arc::new(selection.module_mocks);
        let component_request = ComponentRequest {
            component,
            args: payload.args,
            slots: payload.slots,
            story: story_input,
            module_mocks: Arc::clone(&module_mocks),
            mock_server_url: self.mock_server.base_url(),
        };

        with_module_mocks(module_mocks, self.renderer.render(&component_request)).await
    }
}

struct RenderJob {
    request: RenderStoryRequest,
    reply: oneshot::Sender<Result<String, RenderError>>,
}

/// Handle used to submit renders. Cheap to clone.
#[derive(Clone)]
pub struct RenderQueue {
    jobs: mpsc::UnboundedSender<RenderJob>,
    depth: Arc<AtomicUsize>,
}

impl RenderQueue {
    /// Start the worker. The queue stops once every handle is dropped.
    pub fn spawn(pipeline: RenderPipeline) -> (Self, JoinHandle<()>) {
        let (jobs, mut receiver) = mpsc::unbounded_channel::<RenderJob>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = Arc::clone(&depth);

        let worker = tokio::spawn(async move {
            info!(target = "storyrender::queue", "render queue started");
            while let Some(job) = receiver.recv().await {
                let waiting = worker_depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                gauge!(METRIC_QUEUE_DEPTH).set(waiting as f64);

                let result = pipeline.run(job.request).await;
                if job.reply.send(result).is_err() {
                    debug!(
                        target = "storyrender::queue",
                        "render caller went away before the result was ready"
                    );
                }
            }
            info!(target = "storyrender::queue", "render queue stopped");
        });

        (Self { jobs, depth }, worker)
    }

    /// Admit a render. Admission order is execution order.
    pub fn enqueue(
        &self,
        request: RenderStoryRequest,
    ) -> Result<oneshot::Receiver<Result<String, RenderError>>, RenderError> {
        let (reply, result) = oneshot::channel();
        let waiting = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.jobs.send(RenderJob { request, reply }).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(RenderError::QueueClosed);
        }
        gauge!(METRIC_QUEUE_DEPTH).set(waiting as f64);
        Ok(result)
    }

    pub async fn render(&self, request: RenderStoryRequest) -> Result<String, RenderError> {
        let result = self.enqueue(request)?;
        result.await.map_err(|_| RenderError::QueueClosed)?
    }

    /// Renders admitted but not yet started.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Answer `render:request` events from `requests` with `render:response`
/// events on `responses`, rendering through `queue`.
pub fn serve_channel(
    queue: RenderQueue,
    mut requests: mpsc::Receiver<Message>,
    responses: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = requests.recv().await {
            let request = match message {
                Message::Request(request) => request,
                other => {
                    debug!(
                        target = "storyrender::queue",
                        event = other.event_name(),
                        "ignoring non-request event"
                    );
                    continue;
                }
            };

            let id = request.id.clone();
            let story_request = RenderStoryRequest {
                component: request.component,
                args: request.args,
                slots: request.slots,
                story: request.story,
            };
            let admitted = queue.enqueue(story_request);
            let responses = responses.clone();
            tokio::spawn(async move {
                let outcome = match admitted {
                    Ok(result) => result.await.unwrap_or(Err(RenderError::QueueClosed)),
                    Err(err) => Err(err),
                };
                let response = match outcome {
                    Ok(html) => RenderResponseMessage::ok(id, html),
                    Err(err) => RenderResponseMessage::failed(id, err.to_string()),
                };
                if responses.send(Message::Response(response)).await.is_err() {
                    debug!(
                        target = "storyrender::queue",
                        "response channel closed before reply"
                    );
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use serde_json::json;
    use storyrender_wire::{PropMap, RenderComponentInput, RenderRequestMessage, StoryInput};

    use super::*;
    use crate::application::{
        mock_server::{MockHandler, MockServerSettings},
        module_mocks::resolve_module_mock,
        renderer::FnRenderer,
        rules::{MockHttp, MockModule, Rule, RuleSet},
    };

    /// Records what each render could observe of the shared state.
    struct ObservingRenderer {
        mock_server: Arc<MockServer>,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ComponentRenderer for ObservingRenderer {
        async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError> {
            let handlers = self.mock_server.active_handlers();
            let urls: Vec<_> = handlers
                .story_handlers()
                .iter()
                .map(|handler| handler.url().to_string())
                .collect();
            let module = resolve_module_mock("pkg/data").unwrap_or_else(|| "-".into());
            self.log
                .lock()
                .expect("log")
                .push(format!("start {} {urls:?} {module}", request.component));

            if request.component == "Slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if request.component == "Broken" {
                return Err(RenderFailure::new("component threw").into());
            }
            if request.component == "Panics" {
                panic!("component panicked");
            }

            self.log
                .lock()
                .expect("log")
                .push(format!("end {}", request.component));
            Ok(format!("<div>{}</div>", request.component))
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new(vec![
            Rule::new(["slow/*"])
                .with_effect(MockHttp(MockHandler::get("/slow")))
                .with_effect(MockModule {
                    specifier: "pkg/data".into(),
                    replacement: "/mocks/slow.ts".into(),
                }),
            Rule::new(["fast/*"]).with_effect(MockHttp(MockHandler::get("/fast"))),
        ])
    }

    fn request(component: &str, story: &str) -> RenderStoryRequest {
        RenderStoryRequest::new(component).with_story(StoryInput::new(story))
    }

    fn queue_with(
        renderer: Arc<dyn ComponentRenderer>,
        mock_server: Arc<MockServer>,
        sanitization: SanitizationPolicy,
    ) -> RenderQueue {
        let (queue, _worker) = RenderQueue::spawn(RenderPipeline {
            renderer,
            rules: Arc::new(RulesStore::fixed(rules())),
            mock_server,
            sanitization: Arc::new(sanitization),
            mode: StoryMode::Development,
        });
        queue
    }

    fn observing_queue() -> (RenderQueue, Arc<MockServer>, Arc<Mutex<Vec<String>>>) {
        let mock_server = Arc::new(MockServer::new(MockServerSettings::default(), Vec::new()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let renderer = Arc::new(ObservingRenderer {
            mock_server: Arc::clone(&mock_server),
            log: Arc::clone(&log),
        });
        let queue = queue_with(renderer, Arc::clone(&mock_server), SanitizationPolicy::disabled());
        (queue, mock_server, log)
    }

    #[tokio::test]
    async fn renders_run_one_at_a_time_in_admission_order() {
        let (queue, _mock_server, log) = observing_queue();

        let first = queue.enqueue(request("Slow", "slow--a")).expect("first");
        let second = queue.enqueue(request("Fast", "fast--b")).expect("second");
        let third = queue.enqueue(request("Plain", "other--c")).expect("third");

        assert_eq!(third.await.expect("third").expect("html"), "<div>Plain</div>");
        assert_eq!(first.await.expect("first").expect("html"), "<div>Slow</div>");
        assert_eq!(second.await.expect("second").expect("html"), "<div>Fast</div>");

        let log = log.lock().expect("log").clone();
        assert_eq!(
            log,
            vec![
                "start Slow [\"/slow\"] /mocks/slow.ts".to_string(),
                "end Slow".to_string(),
                "start Fast [\"/fast\"] -".to_string(),
                "end Fast".to_string(),
                "start Plain [] -".to_string(),
                "end Plain".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn failures_do_not_block_or_leak_state() {
        let (queue, mock_server, log) = observing_queue();

        let broken = queue.enqueue(request("Broken", "slow--x")).expect("broken");
        let panics = queue.enqueue(request("Panics", "slow--y")).expect("panics");
        let next = queue.enqueue(request("Next", "other--z")).expect("next");

        let broken = broken.await.expect("broken");
        assert!(matches!(broken, Err(RenderError::Failed(_))));
        let panics = panics.await.expect("panics");
        match panics {
            Err(RenderError::Failed(failure)) => {
                assert!(failure.message.contains("component panicked"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(next.await.expect("next").expect("html"), "<div>Next</div>");

        let log = log.lock().expect("log").clone();
        assert_eq!(log.last().map(String::as_str), Some("end Next"));
        assert!(log.contains(&"start Next [] -".to_string()));
        assert!(mock_server.active_handlers().story_handlers().is_empty());
    }

    #[tokio::test]
    async fn configuration_errors_reject_only_that_render() {
        let mock_server = Arc::new(MockServer::disabled());
        let renderer = Arc::new(FnRenderer::new(|_: &ComponentRequest| Ok("ok".to_string())));
        let (queue, _worker) = RenderQueue::spawn(RenderPipeline {
            renderer,
            rules: Arc::new(RulesStore::fixed(RuleSet::new(vec![
                Rule::new(["bad/*"]).with_fn(|ctx| ctx.mock("", "/x.ts")),
            ]))),
            mock_server,
            sanitization: Arc::new(SanitizationPolicy::disabled()),
            mode: StoryMode::Development,
        });

        let err = queue.render(request("A", "bad--one")).await.unwrap_err();
        assert!(matches!(err, RenderError::Configuration(_)));
        assert_eq!(queue.render(request("B", "good--one")).await.expect("ok"), "ok");
    }

    #[tokio::test]
    async fn renderer_receives_sanitized_input() {
        let mock_server = Arc::new(MockServer::disabled());
        let renderer = Arc::new(FnRenderer::new(|request: &ComponentRequest| {
            Ok(request.slots["default"].as_str().unwrap_or_default().to_string())
        }));
        let policy = SanitizationPolicy::resolve(Some(&json!({}))).expect("policy");
        let queue = queue_with(renderer, mock_server, policy);

        let mut slots = PropMap::new();
        slots.insert("default".into(), json!("<em>hi</em><script>x()</script>"));
        let html = queue
            .render(RenderStoryRequest::new("Card").with_slots(slots))
            .await
            .expect("html");

        assert_eq!(html, "<em>hi</em>");
    }

    #[tokio::test]
    async fn channel_server_answers_each_request() {
        let mock_server = Arc::new(MockServer::disabled());
        let renderer = Arc::new(FnRenderer::new(|request: &ComponentRequest| {
            if request.component == "Bad" {
                Err(RenderFailure::new("nope").into())
            } else {
                Ok(format!("<{0}></{0}>", request.component))
            }
        }));
        let queue = queue_with(renderer, mock_server, SanitizationPolicy::disabled());

        let (request_tx, request_rx) = mpsc::channel(4);
        let (response_tx, mut response_rx) = mpsc::channel(4);
        let _server = serve_channel(queue, request_rx, response_tx);

        for (id, component) in [("1", "x-card"), ("2", "Bad")] {
            let message = RenderRequestMessage::new(
                id,
                RenderComponentInput {
                    component: component.into(),
                    ..Default::default()
                },
            );
            request_tx
                .send(Message::Request(message))
                .await
                .expect("send");
        }

        let mut responses = Vec::new();
        for _ in 0..2 {
            match response_rx.recv().await {
                Some(Message::Response(response)) => responses.push(response),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        responses.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(responses[0], RenderResponseMessage::ok("1", "<x-card></x-card>"));
        assert_eq!(responses[1].error.as_deref(), Some("render failed: nope"));
    }

    #[tokio::test]
    async fn dropped_worker_closes_queue() {
        let mock_server = Arc::new(MockServer::disabled());
        let renderer = Arc::new(FnRenderer::new(|_: &ComponentRequest| Ok(String::new())));
        let (queue, worker) = RenderQueue::spawn(RenderPipeline {
            renderer,
            rules: Arc::new(RulesStore::fixed(RuleSet::empty())),
            mock_server,
            sanitization: Arc::new(SanitizationPolicy::disabled()),
            mode: StoryMode::Development,
        });
        worker.abort();
        let _ = worker.await;

        let err = queue.render(RenderStoryRequest::new("X")).await.unwrap_err();
        assert!(matches!(err, RenderError::QueueClosed));
        assert_eq!(queue.depth(), 0);
    }
}
