//! Best-effort delivery of evaluation events.
mod emitter;
mod event;
mod sink;

pub use emitter::{TelemetryConfig, TelemetryEmitter};
pub use event::EvaluationEvent;
pub use sink::{LogSink, NoopSink, TelemetrySink};
