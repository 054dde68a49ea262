//! Memory store: what we knew about each item at the end of the last committed cycle.
//!
//! All records live in RAM while the process runs; a [`MemoryBackend`] loads them once at
//! startup and persists the changes on every [`Memory::flush`]. Writes made since the last
//! flush can be thrown away with [`Memory::discard`], which is how an aborted or
//! undelivered cycle leaves no trace.

mod json;
mod sqlite;

pub use json::JsonBackend;
pub use sqlite::SqliteBackend;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{BackendKind, MemoryConfig};
use crate::models::{HackerNewsItem, ItemId, ItemRecord, LifecycleState, RankSample};

/// Records handed to a backend on flush.
pub struct CommitBatch<'a> {
    /// Every live record after garbage collection.
    pub records: &'a HashMap<ItemId, ItemRecord>,
    /// Records written since the last successful commit.
    pub dirty: Vec<&'a ItemRecord>,
    /// Anything last written before this is expired and must be gone after the commit.
    pub cutoff: DateTime<Utc>,
}

/// Durable storage behind [`Memory`].
///
/// `commit` must be atomic: after a crash the backend holds either the previous commit or
/// this one, never a mix of garbage collection and writes.
pub trait MemoryBackend: Send {
    fn name(&self) -> &'static str;
    fn load(&mut self) -> anyhow::Result<HashMap<ItemId, ItemRecord>>;
    fn commit(&mut self, batch: &CommitBatch<'_>) -> anyhow::Result<()>;
}

/// Keeps nothing across restarts.
#[derive(Debug, Default)]
pub struct VolatileBackend;

impl MemoryBackend for VolatileBackend {
    fn name(&self) -> &'static str {
        "volatile"
    }

    fn load(&mut self) -> anyhow::Result<HashMap<ItemId, ItemRecord>> {
        Ok(HashMap::new())
    }

    fn commit(&mut self, _batch: &CommitBatch<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Open the configured backend under `data_dir`. Falls back to [`VolatileBackend`] when the
/// backend cannot be opened, so a broken disk degrades durability instead of stopping us.
pub fn open_backend(kind: BackendKind, data_dir: &Path) -> Box<dyn MemoryBackend> {
    let opened: anyhow::Result<Box<dyn MemoryBackend>> = match kind {
        BackendKind::Sqlite => {
            SqliteBackend::open(data_dir.join("memory.sqlite"))
                .map(|b| Box::new(b) as Box<dyn MemoryBackend>)
        }
        BackendKind::Json => Ok(Box::new(JsonBackend::new(data_dir.join("memory.json")))),
        BackendKind::Volatile => Ok(Box::new(VolatileBackend)),
    };

    opened.unwrap_or_else(|e| {
        tracing::warn!(
            error = %e,
            backend = ?kind,
            "could not open memory backend, state will not persist"
        );
        Box::new(VolatileBackend)
    })
}

/// A scalar field of an [`ItemRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    State(LifecycleState),
    Downranked(bool),
    Nulled(bool),
}

/// Outcome of one [`Memory::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub expired: usize,
    pub committed: bool,
}

pub struct Memory {
    backend: Box<dyn MemoryBackend>,
    clock: Arc<dyn Clock>,
    config: MemoryConfig,
    records: HashMap<ItemId, ItemRecord>,
    committed: HashMap<ItemId, ItemRecord>,
    dirty: HashSet<ItemId>,
}

impl Memory {
    pub fn open(
        mut backend: Box<dyn MemoryBackend>,
        clock: Arc<dyn Clock>,
        config: MemoryConfig,
    ) -> Self {
        let records = match backend.load() {
            Ok(records) => {
                tracing::info!(
                    backend = backend.name(),
                    records = records.len(),
                    "loaded memory"
                );
                records
            }
            Err(e) => {
                tracing::warn!(
                    backend = backend.name(),
                    error = %e,
                    "could not load memory, starting empty"
                );
                HashMap::new()
            }
        };

        Self {
            backend,
            clock,
            config,
            committed: records.clone(),
            records,
            dirty: HashSet::new(),
        }
    }

    pub fn volatile(clock: Arc<dyn Clock>, config: MemoryConfig) -> Self {
        Self::open(Box::new(VolatileBackend), clock, config)
    }

    fn cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - self.config.retention
    }

    pub fn get(&self, id: ItemId) -> Option<&ItemRecord> {
        tracing::trace!("retrieving from memory: {}", id);
        let cutoff = self.cutoff();
        self.records
            .get(&id)
            .filter(|record| record.last_write_time >= cutoff)
    }

    /// Record for a write: created when missing (or expired), stamped, marked dirty.
    fn touch(&mut self, id: ItemId) -> &mut ItemRecord {
        let now = self.clock.now();
        let cutoff = now - self.config.retention;
        self.dirty.insert(id);

        let record = self
            .records
            .entry(id)
            .or_insert_with(|| ItemRecord::new(id, now));
        if record.last_write_time < cutoff {
            *record = ItemRecord::new(id, now);
        }
        record.last_write_time = now;
        record
    }

    pub fn put(&mut self, id: ItemId, field: Field) {
        tracing::debug!("saving to memory: {}->{:?}", id, field);
        let record = self.touch(id);
        match field {
            Field::State(state) => record.state = Some(state),
            Field::Downranked(flag) => record.downranked = flag,
            Field::Nulled(flag) => record.nulled = flag,
        }
    }

    /// Merge a fetched payload into the cached one and return the result.
    pub fn merge_data(&mut self, id: ItemId, item: HackerNewsItem) -> HackerNewsItem {
        tracing::debug!("merging payload into memory: {}", id);
        let record = self.touch(id);
        match record.data.as_mut() {
            Some(cached) => cached.merge(item),
            None => record.data = Some(item),
        }
        record.data.clone().unwrap_or_default()
    }

    /// Append a rank sample, keeping only the newest `limit` samples.
    pub fn append_bounded(&mut self, id: ItemId, sample: RankSample, limit: usize) -> &ItemRecord {
        tracing::debug!("saving rank to memory: {}->{}", id, sample.rank);
        let record = self.touch(id);
        record.rank_history.push_back(sample);
        while record.rank_history.len() > limit {
            record.rank_history.pop_front();
        }
        record
    }

    /// Drop the newest rank sample.
    pub fn pop_rank_sample(&mut self, id: ItemId) {
        tracing::debug!("dropping latest rank sample: {}", id);
        self.touch(id).rank_history.pop_back();
    }

    pub fn clear_rank_history(&mut self, id: ItemId) {
        tracing::debug!("clearing rank history: {}", id);
        self.touch(id).rank_history.clear();
    }

    /// Ids of every non-expired record, ascending.
    pub fn all_ids(&self) -> Vec<ItemId> {
        let cutoff = self.cutoff();
        let mut ids: Vec<ItemId> = self
            .records
            .values()
            .filter(|record| record.last_write_time >= cutoff)
            .map(|record| record.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every write since the last successful flush.
    pub fn discard(&mut self) {
        if !self.dirty.is_empty() {
            tracing::info!(records = self.dirty.len(), "discarding uncommitted writes");
        }
        self.records = self.committed.clone();
        self.dirty.clear();
    }

    /// Garbage-collect expired records and commit pending writes.
    ///
    /// Never fails: a backend error is logged and the writes stay pending for the next flush.
    pub fn flush(&mut self) -> FlushReport {
        let cutoff = self.cutoff();

        let before = self.records.len();
        self.records.retain(|_, record| record.last_write_time >= cutoff);
        let expired = before - self.records.len();

        let records = &self.records;
        self.dirty.retain(|id| records.contains_key(id));

        let mut dirty: Vec<&ItemRecord> = self
            .dirty
            .iter()
            .filter_map(|id| self.records.get(id))
            .collect();
        dirty.sort_unstable_by_key(|record| record.id);
        let written = dirty.len();

        let batch = CommitBatch {
            records: &self.records,
            dirty,
            cutoff,
        };
        let committed = match self.backend.commit(&batch) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    error = %e,
                    "flushing memory failed, keeping writes for the next flush"
                );
                false
            }
        };

        if committed {
            self.committed = self.records.clone();
            self.dirty.clear();
        }

        tracing::debug!(written, expired, committed, "flushed memory");
        FlushReport {
            written,
            expired,
            committed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn sample(rank: usize, clock: &ManualClock) -> RankSample {
        RankSample {
            rank,
            at: clock.now(),
        }
    }

    struct FailingBackend;

    impl MemoryBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn load(&mut self) -> anyhow::Result<HashMap<ItemId, ItemRecord>> {
            anyhow::bail!("disk on fire")
        }

        fn commit(&mut self, _batch: &CommitBatch<'_>) -> anyhow::Result<()> {
            anyhow::bail!("disk still on fire")
        }
    }

    #[test]
    fn put_creates_and_stamps_record() {
        let clock = clock();
        let mut memory = Memory::volatile(clock.clone(), MemoryConfig::default());
        assert!(memory.get(1).is_none());

        memory.put(1, Field::State(LifecycleState::New));
        let first = memory.get(1).unwrap().last_write_time;
        assert_eq!(memory.get(1).unwrap().state, Some(LifecycleState::New));

        clock.advance(Duration::seconds(5));
        memory.put(1, Field::Downranked(true));
        let record = memory.get(1).unwrap();
        assert!(record.downranked);
        assert_eq!(record.last_write_time, first + Duration::seconds(5));
    }

    #[test]
    fn rank_history_is_bounded() {
        let clock = clock();
        let mut memory = Memory::volatile(clock.clone(), MemoryConfig::default());
        for rank in 1..=10 {
            memory.append_bounded(9, sample(rank, &clock), 2);
            clock.advance(Duration::seconds(3));
            assert!(memory.get(9).unwrap().rank_history.len() <= 2);
        }
        let ranks: Vec<usize> = memory
            .get(9)
            .unwrap()
            .rank_history
            .iter()
            .map(|s| s.rank)
            .collect();
        assert_eq!(ranks, vec![9, 10]);

        memory.pop_rank_sample(9);
        assert_eq!(memory.get(9).unwrap().rank_history.back().map(|s| s.rank), Some(9));
    }

    #[test]
    fn merge_data_keeps_earlier_fields() {
        let clock = clock();
        let mut memory = Memory::volatile(clock, MemoryConfig::default());
        memory.merge_data(
            3,
            HackerNewsItem {
                title: Some("hello".into()),
                ..Default::default()
            },
        );
        let merged = memory.merge_data(
            3,
            HackerNewsItem {
                deleted: Some(true),
                ..Default::default()
            },
        );
        assert_eq!(merged.title.as_deref(), Some("hello"));
        assert!(merged.is_deleted());
    }

    #[test]
    fn flush_garbage_collects_expired_records() {
        let clock = clock();
        let mut memory = Memory::volatile(clock.clone(), MemoryConfig::default());
        memory.put(1, Field::State(LifecycleState::Old));
        clock.advance(Duration::hours(20));
        memory.put(2, Field::State(LifecycleState::New));
        memory.flush();

        clock.advance(Duration::hours(5));
        assert_eq!(memory.all_ids(), vec![2]);
        let report = memory.flush();
        assert_eq!(report.expired, 1);
        assert_eq!(memory.len(), 1);
        assert_eq!(memory.all_ids(), vec![2]);
    }

    #[test]
    fn writing_to_expired_record_starts_over() {
        let clock = clock();
        let mut memory = Memory::volatile(clock.clone(), MemoryConfig::default());
        memory.put(1, Field::Downranked(true));
        clock.advance(Duration::days(2));
        memory.put(1, Field::State(LifecycleState::New));
        let record = memory.get(1).unwrap();
        assert!(!record.downranked);
        assert_eq!(record.state, Some(LifecycleState::New));
    }

    #[test]
    fn discard_restores_last_flush() {
        let clock = clock();
        let mut memory = Memory::volatile(clock, MemoryConfig::default());
        memory.put(1, Field::State(LifecycleState::New));
        memory.flush();

        memory.put(1, Field::State(LifecycleState::Dead));
        memory.put(2, Field::State(LifecycleState::New));
        memory.discard();

        assert_eq!(memory.get(1).unwrap().state, Some(LifecycleState::New));
        assert!(memory.get(2).is_none());
        assert_eq!(memory.all_ids(), vec![1]);
    }

    #[test]
    fn backend_failures_are_not_fatal() {
        let clock = clock();
        let mut memory = Memory::open(Box::new(FailingBackend), clock, MemoryConfig::default());
        assert!(memory.is_empty());

        memory.put(5, Field::State(LifecycleState::New));
        let report = memory.flush();
        assert!(!report.committed);
        assert_eq!(report.written, 1);
        // Still readable, and still pending for the next attempt.
        assert_eq!(memory.get(5).unwrap().state, Some(LifecycleState::New));
        assert_eq!(memory.flush().written, 1);
    }

    #[test]
    fn open_backend_falls_back_to_volatile() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("file");
        std::fs::write(&not_a_dir, b"x").unwrap();
        let backend = open_backend(BackendKind::Sqlite, &not_a_dir);
        assert_eq!(backend.name(), "volatile");
    }
}
