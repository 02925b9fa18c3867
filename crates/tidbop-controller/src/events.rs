//! Durable operation events.
//!
//! Every lifecycle operation opens a [`Trace`] on entry and closes it with
//! its result. Both ends land in the store's event table (de-duplicated per
//! cell) and in the log.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use tidbop_state::{ClusterStore, Event, EventKind};

use crate::error::ControllerResult;

#[derive(Clone)]
pub struct EventRecorder {
    store: ClusterStore,
}

impl EventRecorder {
    pub fn new(store: ClusterStore) -> Self {
        Self { store }
    }

    /// Record one event; a failing write is logged and otherwise ignored.
    pub fn record(&self, cell: &str, component: &str, key: &str, kind: EventKind, message: String) {
        let event = Event::new(cell, component, key, kind, message);
        if let Err(e) = self.store.record_event(event) {
            warn!(%cell, %key, error = %e, "failed to record event");
        }
    }

    /// Start tracing an operation: records a start event and returns the
    /// handle that records its outcome.
    pub fn trace(&self, cell: &str, component: &str, key: &str, message: impl Into<String>) -> Trace {
        let message = message.into();
        info!(%cell, %component, op = %key, "{message}");
        self.record(cell, component, key, EventKind::Ok, format!("{message}: started"));
        Trace {
            recorder: self.clone(),
            cell: cell.to_string(),
            component: component.to_string(),
            key: key.to_string(),
            message,
            started: Instant::now(),
        }
    }
}

#[must_use = "a trace records nothing until finished"]
pub struct Trace {
    recorder: EventRecorder,
    cell: String,
    component: String,
    key: String,
    message: String,
    started: Instant,
}

impl Trace {
    pub fn finish<T>(self, result: &ControllerResult<T>) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        let (cell, component, key) = (&self.cell, &self.component, &self.key);
        match result {
            Ok(_) => {
                info!(%cell, %component, op = %key, elapsed_ms, "{}: done", self.message);
                self.recorder.record(
                    cell,
                    component,
                    key,
                    EventKind::Ok,
                    format!("{}: done", self.message),
                );
            }
            Err(e) => {
                let kind = if e.is_severe() {
                    error!(%cell, %component, op = %key, elapsed_ms, error = %e, "{}: failed", self.message);
                    EventKind::Error
                } else {
                    warn!(%cell, %component, op = %key, elapsed_ms, error = %e, "{}: failed", self.message);
                    EventKind::Warning
                };
                self.recorder
                    .record(cell, component, key, kind, format!("{}: {e}", self.message));
            }
        }
        debug!(%cell, op = %key, "trace closed");
    }
}
