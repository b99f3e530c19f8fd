use crate::queue::IngestionQueue;
use crate::record::{Level as RecordLevel, LogRecord};
use crate::shipper::LogShipper;
use std::collections::BTreeMap;
use tracing::span::{Attributes, Id};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// hands them to a [`LogShipper`]'s queue.
///
/// `on_event` runs on the application thread, so the non-blocking enqueue
/// path is used: when the queue is full the record is dropped and counted
/// rather than stalling the caller. The event target becomes the record
/// category; span fields become the record's scope list.
pub struct ShipperLayer {
    queue: IngestionQueue,
    include_scopes: bool,
    max_level: Level,
}

impl ShipperLayer {
    pub fn new(shipper: &LogShipper) -> Self {
        ShipperLayer {
            queue: shipper.queue(),
            include_scopes: shipper.options().include_scopes,
            max_level: Level::TRACE,
        }
    }

    /// Ignore events more verbose than `level`.
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }
}

fn map_level(level: Level) -> RecordLevel {
    if level == Level::ERROR {
        RecordLevel::Error
    } else if level == Level::WARN {
        RecordLevel::Warning
    } else if level == Level::INFO {
        RecordLevel::Information
    } else if level == Level::DEBUG {
        RecordLevel::Debug
    } else {
        RecordLevel::Trace
    }
}

/// Span fields captured at creation time, kept in the span's extensions so
/// events inside it can reconstruct the scope chain.
struct ScopeFields(BTreeMap<String, serde_json::Value>);

impl<S> Layer<S> for ShipperLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if !self.include_scopes {
            return;
        }
        let span = match ctx.span(id) {
            Some(span) => span,
            None => return,
        };
        let mut fields = BTreeMap::new();
        let mut message = None;
        attrs.record(&mut FieldVisitor { fields: &mut fields, message: &mut message });
        fields.insert(
            "span".to_string(),
            serde_json::Value::String(attrs.metadata().name().to_string()),
        );
        span.extensions_mut().insert(ScopeFields(fields));
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > self.max_level {
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;
        event.record(&mut FieldVisitor { fields: &mut fields, message: &mut message });

        let mut record = LogRecord::new(
            map_level(*meta.level()),
            meta.target(),
            message.unwrap_or_default(),
        );
        record.fields = fields;

        if self.include_scopes {
            if let Some(scope) = ctx.event_scope(event) {
                let scopes: Vec<_> = scope
                    .from_root()
                    .map(|span| match span.extensions().get::<ScopeFields>() {
                        Some(captured) => captured.0.clone(),
                        None => BTreeMap::from([(
                            "span".to_string(),
                            serde_json::Value::String(span.name().to_string()),
                        )]),
                    })
                    .collect();
                if !scopes.is_empty() {
                    record.scopes = Some(scopes);
                }
            }
        }

        self.queue.try_enqueue(record);
    }
}

use tracing::field::{Field, Visit};

struct FieldVisitor<'a> {
    fields: &'a mut BTreeMap<String, serde_json::Value>,
    message: &'a mut Option<String>,
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), crate::record::field_value(&value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{value:?}"));
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(format!("{value:?}")),
            );
        }
    }
}
