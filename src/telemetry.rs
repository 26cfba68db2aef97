//! Telemetry attachment points.
//!
//! The core never implements export logic. A host may inject a
//! [`TelemetrySink`]; the orchestrator and agents open spans around
//! crew construction and model invocations and attach attributes. With no
//! sink injected, span handles are inert.

use std::collections::HashMap;
use std::sync::Arc;

/// Injected tracer boundary. Export wiring (console, OTLP, Jaeger) lives
/// with the host.
pub trait TelemetrySink: Send + Sync {
    /// Open a span with the given name and initial attributes.
    fn span(&self, name: &str, attributes: HashMap<String, String>) -> SpanHandle;
}

/// Handle to an open telemetry span.
#[derive(Debug)]
pub struct SpanHandle {
    /// Span name.
    pub name: String,
    /// Span attributes.
    pub attributes: HashMap<String, String>,
    /// Whether the span has been ended.
    pub ended: bool,
}

impl SpanHandle {
    /// Create a span handle.
    pub fn new(name: &str, attributes: HashMap<String, String>) -> Self {
        Self {
            name: name.to_string(),
            attributes,
            ended: false,
        }
    }

    /// Add an attribute to the span.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        if !self.ended {
            self.attributes.insert(key.into(), value.into());
        }
    }

    /// End (close) the span.
    pub fn end(&mut self) {
        self.ended = true;
    }
}

/// Sink that records nothing.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn span(&self, name: &str, attributes: HashMap<String, String>) -> SpanHandle {
        SpanHandle::new(name, attributes)
    }
}

/// Shared sink handle used across a crew.
pub type SharedTelemetry = Arc<dyn TelemetrySink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_attributes() {
        let sink = NoopTelemetry;
        let mut span = sink.span("crew_creation", HashMap::new());
        span.set_attribute("crew_id", "crew-1");
        assert_eq!(span.attributes.get("crew_id").unwrap(), "crew-1");

        span.end();
        span.set_attribute("late", "ignored");
        assert!(!span.attributes.contains_key("late"));
    }
}
