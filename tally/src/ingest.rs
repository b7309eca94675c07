//! Ingest gateway: where a collector hands its filtered batch.
//!
//! # Strategies
//!
//! | Driver      | `ingest`                | `trim`                 | `digest`                 |
//! |-------------|-------------------------|------------------------|--------------------------|
//! | `storage`   | `Storage::store` inline | `Storage::trim`        | no-op, returns 0         |
//! | `offloaded` | push onto [`MemoryQueue`] | drop expired samples | drain queue into storage |
//! | `null`      | discard                 | no-op                  | no-op, returns 0         |
//!
//! After every successful ingest the gateway draws a [`Lottery`]; a win runs
//! [`Ingest::trim`]. Trim failures are logged and swallowed so they never fail
//! the ingest that triggered them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::{Driver, TallyConfig, TrimConfig};
use crate::error::{Result, StorageError};
use crate::sample::Sample;
use crate::storage::Storage;

/// Odds of running a trim after an ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lottery {
    wins: u32,
    out_of: u32,
}

impl Lottery {
    /// `wins` chances in `out_of`.
    ///
    /// `out_of` of zero never wins.
    pub fn odds(wins: u32, out_of: u32) -> Self {
        Self { wins, out_of }
    }

    /// Always wins.
    pub fn always() -> Self {
        Self::odds(1, 1)
    }

    /// Never wins.
    pub fn never() -> Self {
        Self::odds(0, 1)
    }

    /// Draws once.
    pub fn draw(self) -> bool {
        if self.out_of == 0 || self.wins == 0 {
            return false;
        }
        if self.wins >= self.out_of {
            return true;
        }
        rand::rng().random_range(1..=self.out_of) <= self.wins
    }
}

impl Default for Lottery {
    fn default() -> Self {
        Self::odds(1, 1000)
    }
}

/// Shared in-process queue for the offloaded strategy.
///
/// Clones share the same queue, so producers and the digesting worker can
/// each hold one.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<VecDeque<Sample>>>,
}

impl MemoryQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, VecDeque<Sample>>> {
        self.inner.lock().map_err(|_| StorageError::Poisoned.into())
    }

    /// Appends a batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn push(&self, batch: Vec<Sample>) -> Result<()> {
        self.lock()?.extend(batch);
        Ok(())
    }

    /// Removes up to `max` samples from the front.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn pop(&self, max: usize) -> Result<Vec<Sample>> {
        let mut queue = self.lock()?;
        let n = max.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    /// Puts a batch back at the front, keeping its order.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn requeue(&self, batch: Vec<Sample>) -> Result<()> {
        let mut queue = self.lock()?;
        for sample in batch.into_iter().rev() {
            queue.push_front(sample);
        }
        Ok(())
    }

    /// Drops queued samples at or before `horizon`; returns how many.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue lock is poisoned.
    pub fn trim(&self, horizon: i64) -> Result<usize> {
        let mut queue = self.lock()?;
        let before = queue.len();
        queue.retain(|s| s.timestamp() > horizon);
        Ok(before - queue.len())
    }

    /// Number of queued samples.
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |q| q.len())
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum Gateway {
    Storage(Arc<dyn Storage>),
    Offloaded(MemoryQueue),
    Null,
}

/// The ingest gateway.
#[derive(Debug)]
pub struct Ingest {
    gateway: Gateway,
    lottery: Lottery,
    clock: SharedClock,
    /// Raw retention, used to trim the offloaded queue.
    retention: TrimConfig,
    /// Samples per `store` call when digesting.
    chunk: usize,
}

impl Ingest {
    /// Writes straight to `storage`.
    pub fn storage(storage: Arc<dyn Storage>, clock: SharedClock) -> Self {
        Self::with_gateway(Gateway::Storage(storage), clock)
    }

    /// Queues batches on `queue` until [`digest`](Self::digest) runs.
    pub fn offloaded(queue: MemoryQueue, clock: SharedClock) -> Self {
        Self::with_gateway(Gateway::Offloaded(queue), clock)
    }

    /// Discards everything.
    pub fn null(clock: SharedClock) -> Self {
        Self::with_gateway(Gateway::Null, clock)
    }

    fn with_gateway(gateway: Gateway, clock: SharedClock) -> Self {
        let defaults = TallyConfig::default();
        Self {
            gateway,
            lottery: Lottery::default(),
            clock,
            retention: defaults.ingest.trim,
            chunk: defaults.storage.chunk,
        }
    }

    /// Builds the gateway the configuration selects.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](crate::error::ConfigError) if the driver is
    /// unknown.
    pub fn from_config(
        config: &TallyConfig,
        storage: Arc<dyn Storage>,
        queue: MemoryQueue,
        clock: SharedClock,
    ) -> Result<Self> {
        let gateway = match config.driver()? {
            Driver::Storage => Gateway::Storage(storage),
            Driver::Offloaded => Gateway::Offloaded(queue),
            Driver::Null => Gateway::Null,
        };
        let [wins, out_of] = config.ingest.trim.lottery;

        Ok(Self {
            gateway,
            lottery: Lottery::odds(wins, out_of),
            clock,
            retention: config.ingest.trim.clone(),
            chunk: config.storage.chunk.max(1),
        })
    }

    /// Replaces the trim lottery.
    #[must_use]
    pub fn with_lottery(mut self, lottery: Lottery) -> Self {
        self.lottery = lottery;
        self
    }

    /// Hands a batch to the configured strategy, then maybe trims.
    ///
    /// # Errors
    ///
    /// Returns an error if storing or queueing fails. The lottery is not
    /// drawn in that case.
    pub fn ingest(&self, batch: Vec<Sample>) -> Result<usize> {
        let count = batch.len();
        match &self.gateway {
            Gateway::Storage(storage) => {
                storage.store(&batch)?;
            }
            Gateway::Offloaded(queue) => queue.push(batch)?,
            Gateway::Null => {}
        }

        if self.lottery.draw() {
            if let Err(e) = self.trim() {
                warn!(error = %e, "lottery trim failed");
            }
        }

        Ok(count)
    }

    /// Deletes data past its retention.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage trim fails.
    pub fn trim(&self) -> Result<()> {
        match &self.gateway {
            Gateway::Storage(storage) => {
                storage.trim()?;
            }
            Gateway::Offloaded(queue) => {
                let dropped = queue.trim(self.retention.horizon(self.clock.now()))?;
                debug!(dropped, "trimmed ingest queue");
            }
            Gateway::Null => {}
        }
        Ok(())
    }

    /// Moves queued samples into `storage`; returns how many moved.
    ///
    /// Only the offloaded strategy queues anything. A failed batch is put
    /// back at the front of the queue before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a `store` call fails.
    pub fn digest(&self, storage: &dyn Storage) -> Result<usize> {
        let Gateway::Offloaded(queue) = &self.gateway else {
            return Ok(0);
        };

        let mut digested = 0;
        loop {
            let batch = queue.pop(self.chunk)?;
            if batch.is_empty() {
                break;
            }
            if let Err(e) = storage.store(&batch) {
                queue.requeue(batch)?;
                return Err(e);
            }
            digested += batch.len();
        }

        debug!(digested, "digested ingest queue");
        Ok(digested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::period::Period;
    use crate::sample::{Entry, Value};
    use crate::storage::SqliteStorage;

    const NOW: i64 = 1_710_431_249;

    fn clock() -> SharedClock {
        Arc::new(FixedClock::new(NOW))
    }

    fn sqlite() -> Arc<SqliteStorage> {
        Arc::new(SqliteStorage::open_in_memory(&TallyConfig::default(), clock()).unwrap())
    }

    fn batch(n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| Value::new(NOW, "queue", format!("q{i}"), "1").into())
            .collect()
    }

    #[test]
    fn test_lottery_extremes() {
        assert!(Lottery::always().draw());
        assert!(!Lottery::never().draw());
        assert!(!Lottery::odds(1, 0).draw());
        assert!(Lottery::odds(5, 3).draw());
    }

    #[test]
    fn test_storage_driver_writes_through() {
        let storage = sqlite();
        let ingest = Ingest::storage(storage.clone(), clock()).with_lottery(Lottery::never());

        assert_eq!(ingest.ingest(batch(3)).unwrap(), 3);
        assert_eq!(storage.values("queue", None).unwrap().len(), 3);
        assert_eq!(ingest.digest(storage.as_ref()).unwrap(), 0);
    }

    #[test]
    fn test_winning_lottery_trims_storage() {
        let clock = FixedClock::new(NOW);
        let storage = Arc::new(
            SqliteStorage::open_in_memory(&TallyConfig::default(), Arc::new(clock.clone()))
                .unwrap(),
        );
        let ingest = Ingest::storage(storage.clone(), Arc::new(clock.clone()))
            .with_lottery(Lottery::always());

        let mut entry = Entry::new(NOW, "t", "k", None);
        entry.count();
        ingest.ingest(vec![entry.into()]).unwrap();

        let hour_rows = || -> i64 {
            storage
                .with_connection(|conn| {
                    Ok(conn.query_row(
                        "SELECT count(*) FROM tally_aggregates WHERE period = ?1",
                        [Period::Hour.as_str()],
                        |row| row.get(0),
                    )?)
                })
                .unwrap()
        };
        assert_eq!(hour_rows(), 1);

        // Past the hour window the next ingest's draw removes the row.
        clock.advance(2 * 3600);
        assert_eq!(ingest.ingest(batch(1)).unwrap(), 1);
        assert_eq!(hour_rows(), 0);
    }

    #[test]
    fn test_failed_lottery_trim_keeps_ingest_count() {
        let storage = sqlite();
        storage
            .with_connection(|conn| Ok(conn.execute_batch("DROP TABLE tally_aggregates")?))
            .unwrap();
        let ingest = Ingest::storage(storage.clone(), clock()).with_lottery(Lottery::always());

        assert!(ingest.trim().is_err());
        assert_eq!(ingest.ingest(batch(2)).unwrap(), 2);
        assert_eq!(storage.values("queue", None).unwrap().len(), 2);
    }

    #[test]
    fn test_null_driver_discards() {
        let ingest = Ingest::null(clock()).with_lottery(Lottery::always());
        assert_eq!(ingest.ingest(batch(2)).unwrap(), 2);
        assert!(ingest.trim().is_ok());
        assert_eq!(ingest.digest(sqlite().as_ref()).unwrap(), 0);
    }

    #[test]
    fn test_offloaded_digest_in_chunks() {
        let queue = MemoryQueue::new();
        let mut config = TallyConfig::default();
        config.ingest.driver = "offloaded".to_string();
        config.storage.chunk = 2;

        let storage = sqlite();
        let ingest = Ingest::from_config(&config, storage.clone(), queue.clone(), clock())
            .unwrap()
            .with_lottery(Lottery::never());

        ingest.ingest(batch(5)).unwrap();
        assert_eq!(queue.len(), 5);
        assert!(storage.values("queue", None).unwrap().is_empty());

        assert_eq!(ingest.digest(storage.as_ref()).unwrap(), 5);
        assert!(queue.is_empty());
        assert_eq!(storage.values("queue", None).unwrap().len(), 5);
    }

    #[test]
    fn test_offloaded_trim_drops_expired() {
        let queue = MemoryQueue::new();
        let ingest = Ingest::offloaded(queue.clone(), clock());
        let horizon = TallyConfig::default().ingest.trim.horizon(NOW);

        let mut old = Entry::new(horizon, "t", "k", None);
        old.count();
        let fresh = Entry::new(horizon + 1, "t", "k", None);
        queue.push(vec![old.into(), fresh.into()]).unwrap();

        ingest.trim().unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_requeue_preserves_order() {
        let queue = MemoryQueue::new();
        queue.push(batch(4)).unwrap();

        let first = queue.pop(2).unwrap();
        queue.requeue(first).unwrap();

        let keys: Vec<String> = queue
            .pop(10)
            .unwrap()
            .iter()
            .map(|s| s.key().to_string())
            .collect();
        assert_eq!(keys, vec!["q0", "q1", "q2", "q3"]);
    }
}
