//! Wire messages for the storyrender render protocol.
//!
//! A story catalog sends a [`RenderStoryRequest`] to the coordinator. When the
//! coordinator (or the catalog itself) talks to a renderer living in another
//! process, every request is tagged with a single-use id and the matching
//! [`RenderResponseMessage`] carries the same id back. On event channels both
//! directions travel inside the [`Message`] envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name used for render requests on a bidirectional channel.
pub const REQUEST_EVENT: &str = "render:request";
/// Event name used for render responses on a bidirectional channel.
pub const RESPONSE_EVENT: &str = "render:response";

/// Free-form argument or slot tree keyed by name.
pub type PropMap = Map<String, Value>;

/// Story metadata supplied by the catalog alongside a render call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryInput {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl StoryInput {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            name: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Inbound render call accepted by the coordinator (`POST /render`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderStoryRequest {
    pub component: String,
    #[serde(default)]
    pub args: PropMap,
    #[serde(default)]
    pub slots: PropMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<StoryInput>,
}

impl RenderStoryRequest {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: PropMap) -> Self {
        self.args = args;
        self
    }

    pub fn with_slots(mut self, slots: PropMap) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_story(mut self, story: StoryInput) -> Self {
        self.story = Some(story);
        self
    }
}

/// Component payload shipped to an out-of-process renderer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderComponentInput {
    pub component: String,
    #[serde(default)]
    pub args: PropMap,
    #[serde(default)]
    pub slots: PropMap,
}

/// Correlated render request. Optional fields carry per-render context the
/// remote renderer must honour for this request only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequestMessage {
    pub id: String,
    pub component: String,
    #[serde(default)]
    pub args: PropMap,
    #[serde(default)]
    pub slots: PropMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<StoryInput>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub module_mocks: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_server_url: Option<String>,
}

impl RenderRequestMessage {
    pub fn new(id: impl Into<String>, input: RenderComponentInput) -> Self {
        let RenderComponentInput {
            component,
            args,
            slots,
        } = input;
        Self {
            id: id.into(),
            component,
            args,
            slots,
            story: None,
            module_mocks: BTreeMap::new(),
            mock_server_url: None,
        }
    }

    /// The component payload without correlation or context fields.
    pub fn input(&self) -> RenderComponentInput {
        RenderComponentInput {
            component: self.component.clone(),
            args: self.args.clone(),
            slots: self.slots.clone(),
        }
    }
}

/// Correlated render response. `error` is set when the remote renderer failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResponseMessage {
    pub id: String,
    #[serde(default)]
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RenderResponseMessage {
    pub fn ok(id: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            html: html.into(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            html: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Envelope used on bidirectional event channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    #[serde(rename = "render:request")]
    Request(RenderRequestMessage),
    #[serde(rename = "render:response")]
    Response(RenderResponseMessage),
}

impl Message {
    pub fn event_name(&self) -> &'static str {
        match self {
            Message::Request(_) => REQUEST_EVENT,
            Message::Response(_) => RESPONSE_EVENT,
        }
    }
}
