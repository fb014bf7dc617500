//! Renderer child process speaking newline-delimited JSON over stdio.
//!
//! Each line written to the child's stdin is a `render:request` [`Message`];
//! each line the child prints on stdout should be a `render:response`.
//! Anything else on stdout is logged and skipped. The child's stderr is
//! inherited.

use std::{path::Path, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use storyrender_wire::{Message, RenderRequestMessage};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    application::{
        correlation::{RenderCorrelator, RenderTransport},
        error::{RenderError, RenderServerUnavailable},
        renderer::{ComponentRenderer, ComponentRequest, CorrelatedRenderer},
    },
    infra::error::InfraError,
};

const RESPONSE_BUFFER: usize = 64;

pub struct ProcessTransport {
    label: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
}

impl ProcessTransport {
    /// Launch `command` and return the transport plus the child's stdout.
    pub fn spawn(command: &Path, args: &[String]) -> Result<(Self, ChildStdout), InfraError> {
        let label = command.display().to_string();
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| InfraError::process(&label, err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InfraError::process(&label, "stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::process(&label, "stdout was not captured"))?;

        info!(
            target = "storyrender::process",
            command = %label,
            pid = child.id().unwrap_or_default(),
            "renderer process started"
        );

        Ok((
            Self {
                label,
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
            },
            stdout,
        ))
    }

    /// Kill the child if it is still running.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            debug!(
                target = "storyrender::process",
                command = %self.label,
                error = %err,
                "renderer process already stopped"
            );
        }
    }
}

#[async_trait]
impl RenderTransport for ProcessTransport {
    async fn send(&self, request: RenderRequestMessage) -> Result<(), RenderServerUnavailable> {
        let mut line = serde_json::to_vec(&Message::Request(request)).map_err(|err| {
            RenderServerUnavailable::unreachable(self.endpoint(), err.to_string())
        })?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let written = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        written.await.map_err(|err| {
            RenderServerUnavailable::unreachable(
                self.endpoint(),
                format!("Writing to the renderer process failed: {err}."),
            )
        })
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("process `{}`", self.label))
    }
}

/// Decode stdout lines into messages until the stream ends.
pub fn spawn_stdout_reader(
    stdout: ChildStdout,
    responses: mpsc::Sender<Message>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(line) {
                        Ok(message) => {
                            if responses.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(
                            target = "storyrender::process",
                            command = %label,
                            error = %err,
                            "ignoring malformed renderer output"
                        ),
                    }
                }
                Ok(None) => {
                    info!(
                        target = "storyrender::process",
                        command = %label,
                        "renderer process closed its output"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        target = "storyrender::process",
                        command = %label,
                        error = %err,
                        "reading renderer output failed"
                    );
                    break;
                }
            }
        }
    })
}

/// A [`ComponentRenderer`] backed by a renderer child process.
pub struct ProcessRenderer {
    renderer: CorrelatedRenderer,
    transport: Arc<ProcessTransport>,
    reader: JoinHandle<()>,
    pump: JoinHandle<()>,
}

impl ProcessRenderer {
    pub fn spawn(command: &Path, args: &[String], timeout: Duration) -> Result<Self, InfraError> {
        let (transport, stdout) = ProcessTransport::spawn(command, args)?;
        let transport = Arc::new(transport);
        let (responses_tx, responses_rx) = mpsc::channel(RESPONSE_BUFFER);
        let reader = spawn_stdout_reader(stdout, responses_tx, transport.label.clone());

        let correlator = RenderCorrelator::new(Arc::clone(&transport) as Arc<dyn RenderTransport>);
        let pump = correlator.spawn_response_pump(responses_rx);

        Ok(Self {
            renderer: CorrelatedRenderer::new(correlator, timeout),
            transport,
            reader,
            pump,
        })
    }

    pub fn pending_count(&self) -> usize {
        self.renderer.correlator().pending_count()
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
        self.reader.abort();
        self.pump.abort();
    }
}

#[async_trait]
impl ComponentRenderer for ProcessRenderer {
    async fn render(&self, request: &ComponentRequest) -> Result<String, RenderError> {
        self.renderer.render(request).await
    }
}
