//! Renders reconstructed span trees through OpenTelemetry.
//!
//! Spans are opened and closed with the timestamps recorded by the source,
//! so a run that finished an hour ago shows up with its real timing. The
//! Datadog-style names (`resource.name`, `span.type`, `service.name`) ride
//! along as span attributes.

use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt as _, Tracer as _};
use opentelemetry::{Context, KeyValue, Value};
use std::time::SystemTime;

use super::metrics;
use crate::model::{SourceType, TagValue};
use crate::trace::{SpanNode, SpanTree, TraceSink};

fn otel_value(value: &TagValue) -> Value {
    match value {
        TagValue::Bool(b) => Value::Bool(*b),
        TagValue::Int(n) => Value::I64(*n),
        TagValue::Float(f) => Value::F64(*f),
        TagValue::Str(s) => Value::String(s.clone().into()),
    }
}

fn attributes(node: &SpanNode) -> Vec<KeyValue> {
    let mut attrs: Vec<KeyValue> = node
        .tags
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), otel_value(value)))
        .collect();
    if let Some(resource) = &node.resource {
        attrs.push(KeyValue::new("resource.name", resource.clone()));
    }
    if let Some(service) = &node.service {
        attrs.push(KeyValue::new("service.name", service.clone()));
    }
    if let Some(span_type) = &node.span_type {
        attrs.push(KeyValue::new("span.type", span_type.clone()));
    }
    attrs
}

/// Exports span trees via the globally registered tracer provider.
///
/// Construct it after [`super::init_telemetry`]; the tracer is bound to
/// whichever provider is global at that moment.
pub struct OtelTraceSink {
    tracer: BoxedTracer,
}

impl OtelTraceSink {
    pub fn new() -> Self {
        Self {
            tracer: opentelemetry::global::tracer("farm"),
        }
    }

    fn render(&self, node: &SpanNode, parent: &Context) {
        let mut builder = self
            .tracer
            .span_builder(node.name.clone())
            .with_kind(SpanKind::Internal)
            .with_start_time(SystemTime::from(node.start))
            .with_attributes(attributes(node));
        if node.error {
            builder = builder.with_status(Status::error(format!("{} failed", node.name)));
        }
        let span = builder.start_with_context(&self.tracer, parent);
        let cx = parent.with_span(span);

        for child in &node.children {
            self.render(child, &cx);
        }
        cx.span().end_with_timestamp(SystemTime::from(node.end));
    }
}

impl Default for OtelTraceSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for OtelTraceSink {
    fn export(&self, source: SourceType, tree: &SpanTree) {
        // A fresh context makes the root span start its own trace.
        self.render(&tree.root, &Context::new());
        metrics::traces_exported().add(1, &[KeyValue::new("source", source.as_str())]);
    }
}
