use std::{
    panic::AssertUnwindSafe,
    sync::{
        mpsc::{Receiver, SyncSender, TrySendError},
        Arc, Condvar, Mutex, RwLock,
    },
    time::Duration,
};

use crate::{metrics::Metrics, Error, Result};

use super::{EvaluationEvent, TelemetrySink};

/// Settings for [`TelemetryEmitter`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Maximum number of queued events.
    pub capacity: usize,
    /// Maximum number of events published per worker wake-up.
    pub batch_size: usize,
    /// Upper bound on the drain wait in [`TelemetryEmitter::shutdown`].
    pub shutdown_timeout: Duration,
}

/// Worker completion. `None` while running, `Some(Err(()))` if a sink panicked.
type Completion = Arc<(Mutex<Option<std::result::Result<(), ()>>>, Condvar)>;

/// Fire-and-forget dispatch of evaluation events to a [`TelemetrySink`].
///
/// Events are queued on a bounded buffer drained by a background thread (`toggle-telemetry`).
/// [`emit`](TelemetryEmitter::emit) never blocks: when the buffer is full, when the worker has
/// stopped, or when the sink fails, the event is dropped and counted in
/// [`MetricsSnapshot::dropped_telemetry`](crate::MetricsSnapshot::dropped_telemetry). The loss
/// is intentional: evaluation latency must not depend on the sink.
pub struct TelemetryEmitter {
    /// `None` after shutdown.
    sender: RwLock<Option<SyncSender<EvaluationEvent>>>,
    completion: Completion,
    metrics: Arc<Metrics>,
    shutdown_timeout: Duration,
}

impl TelemetryEmitter {
    /// Start the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the thread cannot be spawned.
    pub fn start(
        sink: Arc<dyn TelemetrySink>,
        config: TelemetryConfig,
        metrics: Arc<Metrics>,
    ) -> Result<TelemetryEmitter> {
        let (sender, receiver) = std::sync::mpsc::sync_channel(config.capacity.max(1));
        let completion: Completion = Arc::new((Mutex::new(None), Condvar::new()));

        {
            // Cloning Arcs for move into thread
            let completion = Arc::clone(&completion);
            let metrics = Arc::clone(&metrics);
            let batch_size = config.batch_size.max(1);

            std::thread::Builder::new()
                .name("toggle-telemetry".to_owned())
                .spawn(move || {
                    log::debug!(target: "toggle", "telemetry worker started");
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        drain(&receiver, &*sink, &metrics, batch_size)
                    }));
                    if outcome.is_err() {
                        log::error!(target: "toggle", "telemetry sink panicked, telemetry worker stopped");
                    } else {
                        log::debug!(target: "toggle", "telemetry worker stopped");
                    }

                    let (lock, condvar) = &*completion;
                    *lock
                        .lock()
                        .expect("thread holding telemetry completion lock should not panic") =
                        Some(outcome.map_err(|_| ()));
                    condvar.notify_all();
                })?;
        }

        Ok(TelemetryEmitter {
            sender: RwLock::new(Some(sender)),
            completion,
            metrics,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Queue `event` for the sink. Never blocks and never fails; see the type docs for the drop
    /// policy.
    pub fn emit(&self, event: EvaluationEvent) {
        let sender = self
            .sender
            .read()
            .expect("thread holding telemetry sender lock should not panic");
        let Some(sender) = sender.as_ref() else {
            self.metrics.record_dropped_telemetry();
            return;
        };

        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.metrics.record_dropped_telemetry();
                log::debug!(target: "toggle", flag_key = event.flag_key; "telemetry buffer is full, dropping event");
            }
            Err(TrySendError::Disconnected(event)) => {
                self.metrics.record_dropped_telemetry();
                log::debug!(target: "toggle", flag_key = event.flag_key; "telemetry worker is gone, dropping event");
            }
        }
    }

    /// Stop accepting events and wait for queued ones to be published.
    ///
    /// The wait is bounded by the configured shutdown timeout; on timeout the remaining events are
    /// published in the background (if the process lives long enough). Calling `shutdown` more
    /// than once is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TelemetryWorkerPanicked`] if the sink panicked.
    pub fn shutdown(&self) -> Result<()> {
        // Dropping the sender disconnects the channel; the worker exits once it is drained.
        drop(
            self.sender
                .write()
                .expect("thread holding telemetry sender lock should not panic")
                .take(),
        );

        let (lock, condvar) = &*self.completion;
        let guard = lock
            .lock()
            .map_err(|_| Error::TelemetryWorkerPanicked)?;
        let (guard, wait) = condvar
            .wait_timeout_while(guard, self.shutdown_timeout, |outcome| outcome.is_none())
            .map_err(|_| Error::TelemetryWorkerPanicked)?;

        match *guard {
            Some(Ok(())) => Ok(()),
            Some(Err(())) => Err(Error::TelemetryWorkerPanicked),
            None => {
                debug_assert!(wait.timed_out());
                log::warn!(target: "toggle", timeout_ms = self.shutdown_timeout.as_millis() as u64; "telemetry did not drain before the shutdown timeout");
                Ok(())
            }
        }
    }
}

impl Drop for TelemetryEmitter {
    fn drop(&mut self) {
        // Let the worker drain and exit on its own; do not block the dropping thread.
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }
}

/// Worker loop. Returns when every sender is gone and the buffer is empty.
fn drain(
    receiver: &Receiver<EvaluationEvent>,
    sink: &dyn TelemetrySink,
    metrics: &Metrics,
    batch_size: usize,
) {
    while let Ok(first) = receiver.recv() {
        for event in std::iter::once(first).chain(receiver.try_iter().take(batch_size - 1)) {
            if let Err(err) = sink.publish(event) {
                metrics.record_dropped_telemetry();
                log::debug!(target: "toggle", "telemetry sink rejected event: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        time::Duration,
    };

    use chrono::Utc;

    use crate::{
        metrics::Metrics,
        telemetry::{EvaluationEvent, NoopSink, TelemetrySink},
        Error, EvaluationContext, EvaluationResult, Reason,
    };

    use super::{TelemetryConfig, TelemetryEmitter};

    fn config(capacity: usize) -> TelemetryConfig {
        TelemetryConfig {
            capacity,
            batch_size: 10,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn event(flag_key: &str) -> EvaluationEvent {
        let result = EvaluationResult {
            enabled: true,
            variant: None,
            reason: Reason::RolloutIncluded,
            flag_version: Some(1),
        };
        EvaluationEvent::new(
            flag_key.into(),
            &EvaluationContext::new("user-1"),
            &result,
            Utc::now(),
            false,
        )
    }

    #[test]
    fn delivers_events_and_drains_on_shutdown() {
        let _ = env_logger::builder().is_test(true).try_init();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let received = Arc::clone(&received);
            move |event: EvaluationEvent| -> Result<(), String> {
                received.lock().unwrap().push(event.flag_key);
                Ok(())
            }
        };
        let metrics = Arc::new(Metrics::new());
        let emitter =
            TelemetryEmitter::start(Arc::new(sink), config(100), metrics.clone()).unwrap();

        for i in 0..50 {
            emitter.emit(event(&format!("flag-{i}")));
        }
        emitter.shutdown().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 50);
        assert_eq!(received[0], *"flag-0");
        assert_eq!(metrics.snapshot().dropped_telemetry, 0);
    }

    #[test]
    fn drops_events_when_buffer_is_full() {
        // The sink reports that it has taken an event, then blocks until the test releases it.
        let gate = Arc::new(Mutex::new(()));
        let (taken_sender, taken) = mpsc::channel();
        let sink = {
            let gate = Arc::clone(&gate);
            move |_event: EvaluationEvent| -> Result<(), String> {
                let _ = taken_sender.send(());
                drop(gate.lock().unwrap());
                Ok(())
            }
        };
        let metrics = Arc::new(Metrics::new());
        let emitter = TelemetryEmitter::start(Arc::new(sink), config(2), metrics.clone()).unwrap();

        let held = gate.lock().unwrap();
        emitter.emit(event("in-sink"));
        taken.recv().unwrap();

        for _ in 0..5 {
            emitter.emit(event("overflow"));
        }
        assert_eq!(metrics.snapshot().dropped_telemetry, 3);

        drop(held);
        emitter.shutdown().unwrap();
        assert_eq!(metrics.snapshot().dropped_telemetry, 3);
    }

    #[test]
    fn sink_errors_count_as_dropped() {
        let sink =
            |_event: EvaluationEvent| -> Result<(), String> { Err("sink unavailable".to_owned()) };
        let metrics = Arc::new(Metrics::new());
        let emitter = TelemetryEmitter::start(Arc::new(sink), config(10), metrics.clone()).unwrap();

        emitter.emit(event("a"));
        emitter.emit(event("b"));
        emitter.shutdown().unwrap();

        assert_eq!(metrics.snapshot().dropped_telemetry, 2);
    }

    #[test]
    fn emit_after_shutdown_is_dropped() {
        let metrics = Arc::new(Metrics::new());
        let emitter =
            TelemetryEmitter::start(Arc::new(NoopSink), config(10), metrics.clone()).unwrap();

        emitter.shutdown().unwrap();
        emitter.emit(event("late"));

        assert_eq!(metrics.snapshot().dropped_telemetry, 1);
        // Shutting down twice is fine.
        emitter.shutdown().unwrap();
    }

    #[test]
    fn sink_panic_is_reported_on_shutdown() {
        struct PanickingSink;
        impl TelemetrySink for PanickingSink {
            fn publish(&self, _event: EvaluationEvent) -> Result<(), String> {
                panic!("sink bug");
            }
        }

        let emitter =
            TelemetryEmitter::start(Arc::new(PanickingSink), config(10), Arc::new(Metrics::new()))
                .unwrap();
        emitter.emit(event("a"));

        assert!(matches!(
            emitter.shutdown(),
            Err(Error::TelemetryWorkerPanicked)
        ));
    }

    #[test]
    fn shutdown_wait_is_bounded() {
        let sink = |_event: EvaluationEvent| -> Result<(), String> {
            std::thread::sleep(Duration::from_secs(2));
            Ok(())
        };
        let emitter = TelemetryEmitter::start(
            Arc::new(sink),
            TelemetryConfig {
                capacity: 10,
                batch_size: 10,
                shutdown_timeout: Duration::from_millis(50),
            },
            Arc::new(Metrics::new()),
        )
        .unwrap();
        emitter.emit(event("slow"));

        let started = std::time::Instant::now();
        emitter.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
