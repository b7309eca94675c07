//! Recorders translate host events into samples.
//!
//! A [`Recorder`] is registered on a [`Collector`] and receives every
//! dispatched [`Event`] it [`listens_to`](Recorder::listens_to). Recorders are
//! independent of one another; a failing recorder is reported to the
//! collector's fault handler and the remaining recorders still run.

use serde::{Deserialize, Serialize};

use crate::collector::Collector;
use crate::error::BoxError;

/// Something that happened in the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// An error the host chose to report.
    ExceptionReported {
        /// Rendered error message.
        message: String,
        /// Where it was raised, e.g. `src/jobs.rs:42`.
        location: Option<String>,
    },
    /// Any other host event.
    Custom {
        /// Event name used for routing.
        name: String,
        /// Arbitrary event data.
        payload: serde_json::Value,
    },
}

impl Event {
    /// A custom event.
    pub fn custom(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::Custom {
            name: name.into(),
            payload,
        }
    }

    /// The custom event name, if this is one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Custom { name, .. } => Some(name),
            Self::ExceptionReported { .. } => None,
        }
    }
}

/// Turns events into `record`/`set` calls on a collector.
pub trait Recorder: Send + Sync + std::fmt::Debug {
    /// Called once when the recorder is registered.
    ///
    /// # Errors
    ///
    /// Errors are routed to the collector's fault handler; the recorder stays
    /// registered.
    fn boot(&self, collector: &mut Collector) -> Result<(), BoxError> {
        let _ = collector;
        Ok(())
    }

    /// Returns true if [`record`](Self::record) should see this event.
    fn listens_to(&self, event: &Event) -> bool {
        let _ = event;
        true
    }

    /// Records samples for one event.
    ///
    /// # Errors
    ///
    /// Errors are routed to the collector's fault handler.
    fn record(&self, collector: &mut Collector, event: &Event) -> Result<(), BoxError>;
}

/// Counts reported errors per message and location, tracking when each was
/// last seen.
///
/// Records an `exception` entry whose value is the report timestamp, feeding
/// `count` and `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionRecorder;

impl ExceptionRecorder {
    /// Entry type written by this recorder.
    pub const TYPE: &'static str = "exception";
}

impl Recorder for ExceptionRecorder {
    fn listens_to(&self, event: &Event) -> bool {
        matches!(event, Event::ExceptionReported { .. })
    }

    fn record(&self, collector: &mut Collector, event: &Event) -> Result<(), BoxError> {
        let Event::ExceptionReported { message, location } = event else {
            return Ok(());
        };

        let key = match location {
            Some(location) => format!("{message} @ {location}"),
            None => message.clone(),
        };
        let now = collector.now();
        collector.record(Self::TYPE, key, Some(now)).count().max();
        Ok(())
    }
}
