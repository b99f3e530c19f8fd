use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::OnceLock;
use tokio::time::Duration;
use uuid::Uuid;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Level {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// How long an enqueue may wait for queue capacity before the record
    /// is dropped. Higher severities wait longer, so under sustained
    /// overload the queue sheds low-severity records first.
    pub fn enqueue_wait(self) -> Duration {
        match self {
            Level::Trace | Level::Debug | Level::Information => Duration::from_millis(2),
            Level::Warning => Duration::from_millis(4),
            Level::Error | Level::Critical => Duration::from_millis(16),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Information => "Information",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Critical => "Critical",
        }
    }
}

/// Structured error payload attached to a record: the rendered message of
/// the top-level error plus the messages of its `source()` chain.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ErrorInfo {
    pub fn from_error(error: &(dyn Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        ErrorInfo { message: error.to_string(), chain }
    }
}

/// Request context captured by the caller when an ambient HTTP request
/// exists. The pipeline never reads ambient state itself; enrichment
/// happens at the call site and the resolved values are passed in here.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

/// One structured log event, immutable once enqueued.
///
/// The `id` is a v7 UUID: assigned exactly once at construction and
/// roughly ordered by creation time, so document keys derived from it
/// cluster well in the store.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub category: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<BTreeMap<String, serde_json::Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    pub host: String,
}

impl LogRecord {
    pub fn new(level: Level, category: impl Into<String>, text: impl Into<String>) -> Self {
        LogRecord {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            level,
            category: category.into(),
            text: text.into(),
            error: None,
            fields: BTreeMap::new(),
            scopes: None,
            context: None,
            host: host_name().to_string(),
        }
    }

    /// Attach a structured field. Values that fail structured conversion
    /// fall back to their debug representation; see [`field_value`].
    pub fn with_field<T: Serialize + std::fmt::Debug>(
        mut self,
        key: impl Into<String>,
        value: T,
    ) -> Self {
        self.fields.insert(key.into(), field_value(&value));
        self
    }

    pub fn with_error(mut self, error: &(dyn Error + 'static)) -> Self {
        self.error = Some(ErrorInfo::from_error(error));
        self
    }

    pub fn with_scope(mut self, scope: BTreeMap<String, serde_json::Value>) -> Self {
        self.scopes.get_or_insert_with(Vec::new).push(scope);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<BTreeMap<String, serde_json::Value>>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }
}

/// Convert an arbitrary value into a loosely-typed field value.
///
/// Structured conversion is attempted first; values serde cannot represent
/// (maps with non-string keys, serializers that error, ...) fall back to
/// their `Debug` string instead of failing the whole record.
pub fn field_value<T: Serialize + std::fmt::Debug>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or_else(|_| serde_json::Value::String(format!("{value:?}")))
}

fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    })
}
