//! Functions and the messages exchanged with workers.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::grid::{Interest, SelectionCriteria};

/// Input property naming the handler a worker must run.
pub const HANDLER_KEY: &str = "$handler";

/// Property prefix of the artifact a handler is loaded from.
pub const HANDLER_PACKAGE_KEY: &str = "$handler.package";

/// Runtime bindings of a call, by name.
pub type Bindings = HashMap<String, serde_json::Value>;

/// A named unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    /// Name of the registered function type.
    pub function_type: String,
    /// Selection criteria declared by the function itself.
    #[serde(default)]
    pub criteria: SelectionCriteria,
    /// Run in-process instead of on a pooled worker.
    #[serde(default)]
    pub execute_locally: bool,
    #[serde(default)]
    pub call_timeout: Option<Duration>,
    /// Type-specific settings.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Function {
    pub fn new(name: impl Into<String>, function_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            function_type: function_type.into(),
            criteria: SelectionCriteria::new(),
            execute_locally: false,
            call_timeout: None,
            properties: HashMap::new(),
        }
    }

    pub fn with_criterion(mut self, key: impl Into<String>, interest: Interest) -> Self {
        self.criteria.insert(key.into(), interest);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn local(mut self) -> Self {
        self.execute_locally = true;
        self
    }
}

/// Criteria written at the call site. Patterns may reference bindings as
/// `${name}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    #[serde(default)]
    pub criteria: BTreeMap<String, String>,
}

impl CallSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_criterion(mut self, key: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.criteria.insert(key.into(), pattern.into());
        self
    }
}

/// Request sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub function: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub call_timeout: Option<Duration>,
}

impl InputMessage {
    pub fn new(function: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            function: function.into(),
            payload,
            properties: HashMap::new(),
            call_timeout: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Routing, transport or infrastructure failure.
    Technical,
    /// Failure reported by the function itself.
    Business,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputError {
    pub kind: ErrorKind,
    pub message: String,
}

/// A named text document attached to an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: String,
}

impl Attachment {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub begin: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Measurement {
    pub fn new(name: impl Into<String>, begin: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            name: name.into(),
            begin,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    pub payload: serde_json::Value,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub error: Option<OutputError>,
}

impl OutputMessage {
    pub fn ok(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(OutputError {
                kind,
                message: message.into(),
            }),
            ..Self::default()
        }
    }

    /// Technical error output carrying `error` and its source chain.
    pub fn technical(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push_str("\ncaused by: ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::error(ErrorKind::Technical, error.to_string())
            .with_attachment(Attachment::text("exception.log", chain))
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
