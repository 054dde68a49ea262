use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use super::{CommitBatch, MemoryBackend};
use crate::models::{HackerNewsItem, ItemId, ItemRecord, LifecycleState, RankSample};

/// One row per item. Timestamps are unix milliseconds so the GC can compare them in SQL.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        // In-memory databases answer "memory" here; that is fine.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory (
                id INTEGER PRIMARY KEY,
                state TEXT,
                downranked INTEGER NOT NULL DEFAULT 0,
                nulled INTEGER NOT NULL DEFAULT 0,
                data TEXT,
                rank_history TEXT NOT NULL DEFAULT '[]',
                last_write_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_memory_last_write ON memory(last_write_ms);",
        )?;

        Ok(Self { conn })
    }
}

struct Row {
    id: i64,
    state: Option<String>,
    downranked: bool,
    nulled: bool,
    data: Option<String>,
    rank_history: String,
    last_write_ms: i64,
}

impl Row {
    fn into_record(self) -> Result<ItemRecord> {
        let id = ItemId::try_from(self.id)?;
        let state = match self.state.as_deref() {
            Some(s) => Some(
                LifecycleState::parse(s).ok_or_else(|| anyhow!("unknown state {s:?} for {id}"))?,
            ),
            None => None,
        };
        let data = self
            .data
            .as_deref()
            .map(serde_json::from_str::<HackerNewsItem>)
            .transpose()?;
        let rank_history: VecDeque<RankSample> = serde_json::from_str(&self.rank_history)?;
        let last_write_time = DateTime::<Utc>::from_timestamp_millis(self.last_write_ms)
            .ok_or_else(|| anyhow!("bad timestamp {} for {id}", self.last_write_ms))?;

        Ok(ItemRecord {
            id,
            state,
            rank_history,
            downranked: self.downranked,
            data,
            nulled: self.nulled,
            last_write_time,
        })
    }
}

impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn load(&mut self) -> Result<HashMap<ItemId, ItemRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, state, downranked, nulled, data, rank_history, last_write_ms
             FROM memory",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(Row {
                id: row.get(0)?,
                state: row.get(1)?,
                downranked: row.get::<_, i64>(2)? != 0,
                nulled: row.get::<_, i64>(3)? != 0,
                data: row.get(4)?,
                rank_history: row.get(5)?,
                last_write_ms: row.get(6)?,
            })
        })?;

        let mut records = HashMap::new();
        for row in rows {
            match row?.into_record() {
                Ok(record) => {
                    records.insert(record.id, record);
                }
                Err(e) => tracing::warn!(error = %e, "skipping unreadable memory row"),
            }
        }

        Ok(records)
    }

    fn commit(&mut self, batch: &CommitBatch<'_>) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "DELETE FROM memory WHERE last_write_ms < ?1",
            params![batch.cutoff.timestamp_millis()],
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO memory
                 (id, state, downranked, nulled, data, rank_history, last_write_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for record in &batch.dirty {
                let data = record.data.as_ref().map(serde_json::to_string).transpose()?;
                stmt.execute(params![
                    i64::try_from(record.id)?,
                    record.state.map(|s| s.as_str()),
                    record.downranked,
                    record.nulled,
                    data,
                    serde_json::to_string(&record.rank_history)?,
                    record.last_write_time.timestamp_millis(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::MemoryConfig;
    use crate::memory::{Field, Memory};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.sqlite");
        let clock = clock();

        {
            let backend = SqliteBackend::open(&path).unwrap();
            let mut memory = Memory::open(Box::new(backend), clock.clone(), MemoryConfig::default());
            memory.put(10, Field::State(LifecycleState::Dead));
            memory.put(10, Field::Downranked(true));
            memory.merge_data(
                10,
                HackerNewsItem {
                    title: Some("A story".into()),
                    time: Some(1_700_000_000),
                    ..Default::default()
                },
            );
            memory.append_bounded(
                10,
                RankSample {
                    rank: 4,
                    at: clock.now(),
                },
                2,
            );
            memory.put(11, Field::Nulled(true));
            assert!(memory.flush().committed);
        }

        let backend = SqliteBackend::open(&path).unwrap();
        let memory = Memory::open(Box::new(backend), clock.clone(), MemoryConfig::default());
        assert_eq!(memory.all_ids(), vec![10, 11]);

        let record = memory.get(10).unwrap();
        assert_eq!(record.state, Some(LifecycleState::Dead));
        assert!(record.downranked);
        assert_eq!(record.data.as_ref().unwrap().title.as_deref(), Some("A story"));
        assert_eq!(record.rank_history.len(), 1);
        assert_eq!(record.rank_history[0].rank, 4);
        assert_eq!(record.last_write_time, clock.now());

        let tomb = memory.get(11).unwrap();
        assert!(tomb.nulled);
        assert_eq!(tomb.state, None);
    }

    #[test]
    fn commit_deletes_expired_rows() {
        let clock = clock();
        let mut backend = SqliteBackend::open_in_memory().unwrap();

        let old = ItemRecord::new(1, clock.now());
        let fresh = ItemRecord::new(2, clock.now() + Duration::hours(30));
        let mut records = HashMap::new();
        records.insert(1, old.clone());
        records.insert(2, fresh.clone());
        backend
            .commit(&CommitBatch {
                records: &records,
                dirty: vec![&old, &fresh],
                cutoff: clock.now() - Duration::days(1),
            })
            .unwrap();
        assert_eq!(backend.load().unwrap().len(), 2);

        records.remove(&1);
        backend
            .commit(&CommitBatch {
                records: &records,
                dirty: vec![],
                cutoff: clock.now() + Duration::hours(6),
            })
            .unwrap();
        let loaded = backend.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&2));
    }
}
