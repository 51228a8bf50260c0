//! Agent protocol message types.
//!
//! Requests carry a cookie, a snapshot of the editor context (`Props`) and an
//! ordered list of actions. Responses echo the cookie and carry an error
//! string, opaque `Data` and a `State` blob. The agent is written in Go, so
//! absent slices and maps frequently arrive as `null`; every optional field
//! here decodes `null` to its empty default.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::request::RequestContext;

/// Prefix marking a string value that holds base64-encoded bytes.
pub const BASE64_SENTINEL: &str = "base64:";

/// Largest document text sent along with a request.
pub const MAX_VIEW_SIZE: usize = 512 << 10;

fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn nullable_object<'de, D: Deserializer<'de>>(d: D) -> Result<Value, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        None | Some(Value::Null) => empty_object(),
        Some(v) => v,
    })
}

/// A named operation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Action {
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// `A ~> B ~> C`
pub fn actions_summary(actions: &[Action]) -> String {
    actions
        .iter()
        .map(|a| a.name.as_str())
        .collect::<Vec<_>>()
        .join(" ~> ")
}

/// Identifies the client to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EditorProps {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "nullable")]
    pub settings: Map<String, Value>,
}

impl Default for EditorProps {
    fn default() -> Self {
        Self {
            name: "margo-client".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            settings: Map::new(),
        }
    }
}

/// The originating document at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ViewProps {
    /// Debounce target; not sent on the wire.
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ext: String,
    #[serde(default)]
    pub lang: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub wd: String,
    #[serde(default)]
    pub pos: usize,
    #[serde(default)]
    pub row: usize,
    #[serde(default)]
    pub col: usize,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub hash: String,
}

impl ViewProps {
    /// Attach document text. Clean documents are read from disk by the agent,
    /// and oversized ones are not sent at all.
    #[must_use]
    pub fn with_source(mut self, src: &str, dirty: bool) -> Self {
        self.dirty = dirty;
        self.src = if dirty && src.len() <= MAX_VIEW_SIZE {
            src.to_string()
        } else {
            String::new()
        };
        self
    }
}

/// Request envelope as written to the agent.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestEnvelope<'a> {
    pub cookie: &'a str,
    pub props: &'a RequestContext,
    pub actions: &'a [Action],
    pub sent: String,
}

impl<'a> RequestEnvelope<'a> {
    pub fn new(cookie: &'a str, props: &'a RequestContext, actions: &'a [Action]) -> Self {
        Self {
            cookie,
            props,
            actions,
            sent: chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.6f")
                .to_string(),
        }
    }
}

/// Request envelope as seen by the agent side.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReceivedRequest {
    pub cookie: String,
    #[serde(default)]
    pub props: RequestContext,
    #[serde(default, deserialize_with = "nullable")]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub sent: String,
}

/// Response envelope as read from the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    #[serde(default, deserialize_with = "nullable")]
    pub cookie: String,
    #[serde(default, deserialize_with = "nullable")]
    pub tag: String,
    #[serde(default, deserialize_with = "nullable")]
    pub error: String,
    #[serde(default = "empty_object", deserialize_with = "nullable_object")]
    pub data: Value,
    #[serde(default, deserialize_with = "nullable")]
    pub state: State,
}

impl ResponseEnvelope {
    pub fn reply(cookie: impl Into<String>, data: Value) -> Self {
        Self {
            cookie: cookie.into(),
            data,
            ..Self::default()
        }
    }

    /// Expand `base64:` sentinels in `Data` and the raw state fields.
    pub fn expand_sentinels(&mut self) {
        expand_sentinels(&mut self.data);
        self.state.view.src = expand_str(&self.state.view.src);
        for v in self.state.extra.values_mut() {
            expand_sentinels(v);
        }
    }
}

/// Client-side settings pushed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    #[serde(default, deserialize_with = "nullable")]
    pub override_settings: Map<String, Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub enabled_for_langs: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub inhibit_explicit_completions: bool,
    #[serde(default, deserialize_with = "nullable")]
    pub inhibit_word_completions: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            override_settings: Map::new(),
            enabled_for_langs: vec!["*".into()],
            inhibit_explicit_completions: false,
            inhibit_word_completions: false,
        }
    }
}

impl ClientConfig {
    pub fn enabled_for(&self, lang: &str) -> bool {
        self.enabled_for_langs
            .iter()
            .any(|l| l == "*" || l == lang)
    }
}

/// An instruction for the client, e.g. `Restart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientAction {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResView {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub src: String,
}

/// Rendering state attached to a response.
///
/// Only the fields the client acts on are typed; completions, issues and the
/// rest are kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    #[serde(default)]
    pub config: Option<ClientConfig>,
    #[serde(default, deserialize_with = "nullable")]
    pub status: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub errors: Vec<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub view: ResView,
    #[serde(default, deserialize_with = "nullable")]
    pub client_actions: Vec<ClientAction>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn expand_str(s: &str) -> String {
    match s.strip_prefix(BASE64_SENTINEL) {
        Some(encoded) => BASE64_STANDARD
            .decode(encoded)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default(),
        None => s.to_string(),
    }
}

/// Recursively replace `base64:` strings with their decoded text.
/// Undecodable payloads become empty strings.
pub fn expand_sentinels(v: &mut Value) {
    match v {
        Value::String(s) if s.starts_with(BASE64_SENTINEL) => {
            *s = expand_str(s);
        }
        Value::Array(items) => items.iter_mut().for_each(expand_sentinels),
        Value::Object(m) => m.values_mut().for_each(expand_sentinels),
        _ => {}
    }
}
