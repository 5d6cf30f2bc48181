use super::EvaluationEvent;

/// Destination of evaluation events.
///
/// Sinks are called from the telemetry worker thread, never from the evaluation path, so a slow
/// sink only delays other events. Returning an error drops the event; it is not retried.
///
/// Any `Fn(EvaluationEvent) -> Result<(), String>` closure is a sink.
pub trait TelemetrySink: Send + Sync {
    fn publish(&self, event: EvaluationEvent) -> Result<(), String>;
}

impl<F> TelemetrySink for F
where
    F: Fn(EvaluationEvent) -> Result<(), String> + Send + Sync,
{
    fn publish(&self, event: EvaluationEvent) -> Result<(), String> {
        self(event)
    }
}

/// Sink that writes every event to the `log` facade at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn publish(&self, event: EvaluationEvent) -> Result<(), String> {
        log::info!(target: "toggle::telemetry",
                   flag_key = event.flag_key,
                   subject_id = event.subject_id,
                   event:serde;
                   "flag evaluated");
        Ok(())
    }
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn publish(&self, _event: EvaluationEvent) -> Result<(), String> {
        Ok(())
    }
}
