//! The per-unit-of-work sample buffer.
//!
//! A [`Collector`] is created for one request, job or worker tick, receives
//! `record`/`set`/`lazy` calls from the host and its recorders, and hands the
//! filtered batch to the [`Ingest`] gateway when the unit of work ends or the
//! buffer grows past its limit.
//!
//! # Buffer pressure
//!
//! After every queued sample or lazy producer the collector checks
//! `samples + lazy > buffer`. If so, lazy producers are resolved first; if the
//! resolved samples alone still exceed the limit, an ingest runs immediately.
//! A producer that records while this happens does not start another pass:
//! the `evaluating_buffer` flag is held for the duration and cleared
//! afterwards on every path.
//!
//! # Faults
//!
//! Lazy producers, filters and recorders return `Result<_, BoxError>`. An
//! `Err` is passed to the fault handler (see
//! [`handle_faults_using`](Collector::handle_faults_using)) and the rest of
//! the pass continues. Storage failures during ingest are handled the same
//! way and the batch is dropped.

use std::error::Error;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::clock::SharedClock;
use crate::config::TallyConfig;
use crate::error::{BoxError, Result};
use crate::ingest::Ingest;
use crate::recorder::{Event, Recorder};
use crate::sample::{Aggregate, Entry, Sample, Value};
use crate::storage::Storage;

type Producer = Box<dyn FnOnce(&mut Collector) -> std::result::Result<(), BoxError> + Send>;
type Filter = Box<dyn Fn(&Sample) -> std::result::Result<bool, BoxError> + Send + Sync>;
type FaultHandler = Box<dyn Fn(&BoxError) + Send + Sync>;

/// Buffers samples for one unit of work.
pub struct Collector {
    ingest: Arc<Ingest>,
    clock: SharedClock,
    buffer: usize,
    samples: Vec<Sample>,
    lazy: Vec<Producer>,
    filters: Vec<Filter>,
    recorders: Vec<Arc<dyn Recorder>>,
    fault_handler: Option<FaultHandler>,
    recording: bool,
    evaluating_buffer: bool,
    remembered_user: Option<String>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("ingest", &self.ingest)
            .field("buffer", &self.buffer)
            .field("samples", &self.samples.len())
            .field("lazy", &self.lazy.len())
            .field("filters", &self.filters.len())
            .field("recorders", &self.recorders)
            .field("recording", &self.recording)
            .field("evaluating_buffer", &self.evaluating_buffer)
            .field("remembered_user", &self.remembered_user)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Creates a recording collector with the default buffer limit.
    pub fn new(ingest: Arc<Ingest>, clock: SharedClock) -> Self {
        Self {
            ingest,
            clock,
            buffer: TallyConfig::default().ingest.buffer,
            samples: Vec::new(),
            lazy: Vec::new(),
            filters: Vec::new(),
            recorders: Vec::new(),
            fault_handler: None,
            recording: true,
            evaluating_buffer: false,
            remembered_user: None,
        }
    }

    /// Creates a collector using `config.ingest.buffer`.
    ///
    /// A disabled configuration yields a collector that does not record.
    pub fn from_config(config: &TallyConfig, ingest: Arc<Ingest>, clock: SharedClock) -> Self {
        let mut collector = Self::new(ingest, clock).with_buffer(config.ingest.buffer);
        collector.recording = config.enabled;
        collector
    }

    /// Sets the buffer limit.
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer;
        self
    }

    /// Current time according to the collector's clock.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Records an entry timestamped now.
    ///
    /// The returned handle selects aggregations; the entry is queued when the
    /// handle is dropped.
    ///
    /// ```rust
    /// # use std::sync::Arc;
    /// # use tally::{Collector, Ingest, clock};
    /// let clock = clock::system();
    /// let mut collector = Collector::new(Arc::new(Ingest::null(clock.clone())), clock);
    /// collector.record("slow_request", "GET /users", Some(1_250)).count().max();
    /// assert!(collector.wants_ingesting());
    /// ```
    pub fn record(
        &mut self,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: Option<i64>,
    ) -> RecordedEntry<'_> {
        let now = self.now();
        self.record_at(now, kind, key, value)
    }

    /// Records an entry with an explicit timestamp.
    pub fn record_at(
        &mut self,
        timestamp: i64,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: Option<i64>,
    ) -> RecordedEntry<'_> {
        let queued = self.recording;
        RecordedEntry {
            collector: self,
            entry: Entry::new(timestamp, kind, key, value),
            queued,
        }
    }

    /// Sets a value timestamped now.
    pub fn set(
        &mut self,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Value {
        let now = self.now();
        self.set_at(now, kind, key, value)
    }

    /// Sets a value with an explicit timestamp.
    pub fn set_at(
        &mut self,
        timestamp: i64,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Value {
        let value = Value::new(timestamp, kind, key, value);
        if self.recording {
            self.samples.push(value.clone().into());
            self.ingest_when_over_buffer_size();
        }
        value
    }

    /// Defers a producer until the batch is about to be ingested.
    pub fn lazy<F>(&mut self, producer: F) -> &mut Self
    where
        F: FnOnce(&mut Collector) -> std::result::Result<(), BoxError> + Send + 'static,
    {
        if self.recording {
            self.lazy.push(Box::new(producer));
            self.ingest_when_over_buffer_size();
        }
        self
    }

    /// Adds a predicate every sample must pass to be ingested.
    ///
    /// Predicates run in registration order. A predicate error rejects that
    /// sample and is reported as a fault.
    pub fn filter<F>(&mut self, filter: F) -> &mut Self
    where
        F: Fn(&Sample) -> std::result::Result<bool, BoxError> + Send + Sync + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    /// Routes producer, filter, recorder and ingest faults to `handler`.
    ///
    /// Without a handler faults are logged at debug level and discarded.
    pub fn handle_faults_using<F>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(&BoxError) + Send + Sync + 'static,
    {
        self.fault_handler = Some(Box::new(handler));
        self
    }

    fn fault(&self, error: &BoxError) {
        match &self.fault_handler {
            Some(handler) => handler(error),
            None => debug!(error = %error, "discarded collector fault"),
        }
    }

    /// Registers a recorder and boots it.
    pub fn register(&mut self, recorder: Arc<dyn Recorder>) -> &mut Self {
        if let Err(e) = recorder.boot(self) {
            self.fault(&e);
        }
        self.recorders.push(recorder);
        self
    }

    /// Passes an event to every recorder listening for it.
    pub fn dispatch(&mut self, event: &Event) -> &mut Self {
        let recorders = self.recorders.clone();
        for recorder in recorders.iter().filter(|r| r.listens_to(event)) {
            if let Err(e) = recorder.record(self, event) {
                self.fault(&e);
            }
        }
        self
    }

    /// Dispatches an [`Event::ExceptionReported`] for `error`.
    pub fn report(&mut self, error: &(dyn Error + 'static), location: Option<&str>) -> &mut Self {
        self.dispatch(&Event::ExceptionReported {
            message: error.to_string(),
            location: location.map(str::to_string),
        })
    }

    fn ingest_when_over_buffer_size(&mut self) {
        if self.evaluating_buffer {
            return;
        }

        if self.samples.len() + self.lazy.len() > self.buffer {
            trace!(
                samples = self.samples.len(),
                lazy = self.lazy.len(),
                buffer = self.buffer,
                "buffer over limit, resolving lazy producers"
            );
            self.evaluating_buffer = true;
            self.resolve_lazy();
        }

        if self.samples.len() > self.buffer {
            self.evaluating_buffer = true;
            self.ingest();
        }

        self.evaluating_buffer = false;
    }

    fn resolve_lazy(&mut self) {
        let producers = std::mem::take(&mut self.lazy);
        for producer in producers {
            if let Err(e) = producer(self) {
                self.fault(&e);
            }
        }
    }

    fn keeps(&self, sample: &Sample) -> bool {
        for filter in &self.filters {
            match filter(sample) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    self.fault(&e);
                    return false;
                }
            }
        }
        true
    }

    /// Resolves lazy producers, filters the buffer and hands it to the
    /// gateway. Returns how many samples were ingested.
    ///
    /// The buffer is cleared whatever happens; a failed store loses the
    /// batch and returns 0.
    pub fn ingest(&mut self) -> usize {
        let evaluating = std::mem::replace(&mut self.evaluating_buffer, true);
        self.resolve_lazy();

        let count = self.ignore(|collector| {
            let samples = std::mem::take(&mut collector.samples);
            let batch: Vec<Sample> = samples.into_iter().filter(|s| collector.keeps(s)).collect();
            if batch.is_empty() {
                return 0;
            }

            match collector.ingest.ingest(batch) {
                Ok(count) => count,
                Err(e) => {
                    warn!(error = %e, "ingest failed, batch dropped");
                    collector.fault(&BoxError::from(e));
                    0
                }
            }
        });

        self.flush();
        self.evaluating_buffer = evaluating;
        count
    }

    /// Drops everything buffered without ingesting.
    pub fn flush(&mut self) -> &mut Self {
        self.samples.clear();
        self.lazy.clear();
        self.remembered_user = None;
        self
    }

    /// Runs `f` with recording suspended, then restores the previous state.
    pub fn ignore<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        let recording = std::mem::replace(&mut self.recording, false);
        let out = f(self);
        self.recording = recording;
        out
    }

    /// Resumes recording.
    pub fn start_recording(&mut self) -> &mut Self {
        self.recording = true;
        self
    }

    /// Suspends recording; calls still return samples but queue nothing.
    pub fn stop_recording(&mut self) -> &mut Self {
        self.recording = false;
        self
    }

    /// Returns true if samples are being queued.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Returns true if anything is buffered.
    pub fn wants_ingesting(&self) -> bool {
        !self.samples.is_empty() || !self.lazy.is_empty()
    }

    /// Buffered samples, oldest first.
    pub fn queued(&self) -> &[Sample] {
        &self.samples
    }

    /// Remembers the user the current unit of work acts for.
    ///
    /// Cleared by [`flush`](Self::flush).
    pub fn remember_user(&mut self, id: impl Into<String>) -> &mut Self {
        self.remembered_user = Some(id.into());
        self
    }

    /// The remembered user, if any.
    pub fn remembered_user(&self) -> Option<&str> {
        self.remembered_user.as_deref()
    }

    /// Drains the gateway's queue into `storage` without recording.
    ///
    /// # Errors
    ///
    /// Returns an error if storing a drained batch fails.
    pub fn digest(&mut self, storage: &dyn Storage) -> Result<usize> {
        self.ignore(|collector| collector.ingest.digest(storage))
    }
}

/// Handle returned by [`Collector::record`].
///
/// Selector calls tag the entry; dropping the handle queues it and runs the
/// buffer-pressure check.
#[derive(Debug)]
pub struct RecordedEntry<'a> {
    collector: &'a mut Collector,
    entry: Entry,
    queued: bool,
}

impl RecordedEntry<'_> {
    /// Feeds the `count` rollup.
    pub fn count(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Count)
    }

    /// Feeds the `min` rollup.
    pub fn min(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Min)
    }

    /// Feeds the `max` rollup.
    pub fn max(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Max)
    }

    /// Feeds the `sum` rollup.
    pub fn sum(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Sum)
    }

    /// Feeds the `avg` rollup.
    pub fn avg(&mut self) -> &mut Self {
        self.aggregate(Aggregate::Avg)
    }

    /// Feeds the given rollup.
    pub fn aggregate(&mut self, aggregate: Aggregate) -> &mut Self {
        self.entry.aggregate(aggregate);
        self
    }

    /// Skips the raw entries table for this entry.
    pub fn only_buckets(&mut self) -> &mut Self {
        self.entry.only_buckets();
        self
    }

    /// Returns true if the entry will be buffered.
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    /// Queues the entry (if recording) and returns a copy of it.
    pub fn into_entry(self) -> Entry {
        self.entry.clone()
    }
}

impl Deref for RecordedEntry<'_> {
    type Target = Entry;

    fn deref(&self) -> &Entry {
        &self.entry
    }
}

impl Drop for RecordedEntry<'_> {
    fn drop(&mut self) {
        if !self.queued {
            return;
        }
        let entry = std::mem::replace(
            &mut self.entry,
            Entry::new(0, String::new(), String::new(), None),
        );
        self.collector.samples.push(entry.into());
        self.collector.ingest_when_over_buffer_size();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ingest::{Lottery, MemoryQueue};
    use std::sync::Mutex;

    const NOW: i64 = 1_710_431_249;

    /// Collector over an offloaded queue so tests can inspect what was
    /// ingested without a database.
    fn collector(buffer: usize) -> (Collector, MemoryQueue) {
        let clock: SharedClock = Arc::new(FixedClock::new(NOW));
        let queue = MemoryQueue::new();
        let ingest = Ingest::offloaded(queue.clone(), clock.clone()).with_lottery(Lottery::never());
        (Collector::new(Arc::new(ingest), clock).with_buffer(buffer), queue)
    }

    fn faults(collector: &mut Collector) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        collector.handle_faults_using(move |e| sink.lock().unwrap().push(e.to_string()));
        seen
    }

    #[test]
    fn test_record_defaults_to_now() {
        let (mut collector, _) = collector(10);
        let entry = collector.record("type", "key", None).into_entry();
        assert_eq!(entry.timestamp, NOW);
        assert_eq!(collector.queued().len(), 1);
    }

    #[test]
    fn test_selectors_apply_before_queueing() {
        let (mut collector, _) = collector(10);
        collector.record("type", "key", Some(3)).count().max().count();

        let Sample::Entry(entry) = &collector.queued()[0] else {
            panic!("expected an entry");
        };
        assert_eq!(entry.aggregations().len(), 2);
    }

    #[test]
    fn test_buffer_threshold() {
        let (mut collector, queue) = collector(4);

        for i in 0..4 {
            collector.record("type", format!("k{i}"), None).count();
            assert!(collector.wants_ingesting());
        }
        assert!(queue.is_empty());

        collector.set("type", "k4", "v");
        assert!(!collector.wants_ingesting());
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_lazy_counts_toward_pressure_and_resolves_first() {
        let (mut collector, queue) = collector(2);

        collector.lazy(|c| {
            c.record("type", "lazy1", None).count();
            Ok(())
        });
        collector.lazy(|c| {
            c.record("type", "lazy2", None).count();
            Ok(())
        });
        assert!(queue.is_empty());

        // 1 sample + 2 lazy > 2: producers resolve, leaving 3 samples > 2.
        collector.record("type", "eager", None).count();

        let keys: Vec<String> = queue
            .pop(10)
            .unwrap()
            .iter()
            .map(|s| s.key().to_string())
            .collect();
        assert_eq!(keys, vec!["eager", "lazy1", "lazy2"]);
        assert!(!collector.wants_ingesting());
    }

    #[test]
    fn test_lazy_resolution_below_limit_does_not_ingest() {
        let (mut collector, queue) = collector(2);

        collector.lazy(|_| Ok(()));
        collector.lazy(|_| Ok(()));
        collector.record("type", "key", None).count();

        assert!(queue.is_empty());
        assert_eq!(collector.queued().len(), 1);
    }

    #[test]
    fn test_nested_lazy_waits_for_next_pass_under_pressure() {
        let (mut collector, queue) = collector(1);

        collector.lazy(|c| {
            c.lazy(|c| {
                c.record("type", "nested", None).count();
                Ok(())
            });
            Ok(())
        });
        collector.record("type", "eager", None).count();

        assert!(queue.is_empty());
        assert_eq!(collector.lazy.len(), 1);

        assert_eq!(collector.ingest(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_nested_lazy_registered_while_ingesting_is_dropped() {
        let (mut collector, queue) = collector(10);

        collector.lazy(|c| {
            c.lazy(|c| {
                c.record("type", "late", None).count();
                Ok(())
            });
            Ok(())
        });

        assert_eq!(collector.ingest(), 0);
        assert!(!collector.wants_ingesting());
        assert_eq!(collector.ingest(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failing_producer_does_not_block_others() {
        let (mut collector, queue) = collector(100);
        let seen = faults(&mut collector);

        collector.lazy(|_| Err("boom".into()));
        collector.lazy(|c| {
            c.record("type", "survivor", None).count();
            Ok(())
        });

        assert_eq!(collector.ingest(), 1);
        assert_eq!(queue.pop(10).unwrap()[0].key(), "survivor");
        assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string()]);
    }

    #[test]
    fn test_filters_are_anded() {
        let (mut collector, queue) = collector(100);
        collector
            .filter(|s| Ok(s.kind() == "type"))
            .filter(|s| Ok(s.key() == "keep"));

        collector.record("type", "keep", None).count();
        collector.record("type", "drop", None).count();
        collector.record("other", "keep", None).count();
        collector.set("type", "keep", "1");

        assert_eq!(collector.ingest(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_failing_filter_rejects_only_its_sample() {
        let (mut collector, queue) = collector(100);
        let seen = faults(&mut collector);
        collector.filter(|s| {
            if s.key() == "bad" {
                Err("filter exploded".into())
            } else {
                Ok(true)
            }
        });

        collector.record("type", "bad", None).count();
        collector.record("type", "good", None).count();

        assert_eq!(collector.ingest(), 1);
        assert_eq!(queue.pop(10).unwrap()[0].key(), "good");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_stop_recording_returns_but_does_not_queue() {
        let (mut collector, _) = collector(100);
        collector.stop_recording();

        let handle = collector.record("type", "key", Some(1));
        assert!(!handle.is_queued());
        drop(handle);
        let value = collector.set("type", "key", "v");
        assert_eq!(value.value, "v");
        collector.lazy(|_| Ok(()));
        assert!(!collector.wants_ingesting());

        collector.start_recording();
        collector.record("type", "key", None);
        assert!(collector.wants_ingesting());
    }

    #[test]
    fn test_ignore_restores_state() {
        let (mut collector, _) = collector(100);
        collector.ignore(|c| {
            c.record("type", "key", None).count();
            assert!(!c.is_recording());
        });
        assert!(collector.is_recording());
        assert!(!collector.wants_ingesting());
    }

    #[test]
    fn test_ingest_suspends_recording() {
        let (mut collector, _) = collector(100);
        collector.record("type", "key", None).count();
        collector.ingest();
        assert!(collector.is_recording());
    }

    #[test]
    fn test_flush_clears_everything() {
        let (mut collector, queue) = collector(100);
        collector.record("type", "key", None).count();
        collector.lazy(|_| Ok(()));
        collector.remember_user("42");
        assert_eq!(collector.remembered_user(), Some("42"));

        collector.flush();
        assert!(!collector.wants_ingesting());
        assert_eq!(collector.remembered_user(), None);
        assert_eq!(collector.ingest(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_digest_moves_queue_into_storage() {
        let (mut collector, queue) = collector(100);
        collector.set("queue", "default", "3");
        collector.ingest();
        assert_eq!(queue.len(), 1);

        let storage = crate::storage::SqliteStorage::open_in_memory(
            &TallyConfig::default(),
            Arc::new(FixedClock::new(NOW)),
        )
        .unwrap();
        assert_eq!(collector.digest(&storage).unwrap(), 1);
        assert!(queue.is_empty());
        assert!(collector.is_recording());
    }

    #[test]
    fn test_disabled_config_does_not_record() {
        let clock: SharedClock = Arc::new(FixedClock::new(NOW));
        let config = TallyConfig {
            enabled: false,
            ..TallyConfig::default()
        };
        let mut collector =
            Collector::from_config(&config, Arc::new(Ingest::null(clock.clone())), clock);
        collector.record("type", "key", None).count();
        assert!(!collector.wants_ingesting());
    }
}
