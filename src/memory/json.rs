use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use super::{CommitBatch, MemoryBackend};
use crate::models::{ItemId, ItemRecord};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<ItemRecord>,
}

/// The whole memory as one JSON document, rewritten on every commit.
pub struct JsonBackend {
    path: PathBuf,
}

impl JsonBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MemoryBackend for JsonBackend {
    fn name(&self) -> &'static str {
        "json"
    }

    fn load(&mut self) -> Result<HashMap<ItemId, ItemRecord>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&data)?;
        if snapshot.version != FORMAT_VERSION {
            bail!(
                "unsupported memory format version {} in {}",
                snapshot.version,
                self.path.display()
            );
        }

        Ok(snapshot
            .records
            .into_iter()
            .map(|record| (record.id, record))
            .collect())
    }

    fn commit(&mut self, batch: &CommitBatch<'_>) -> Result<()> {
        let mut records: Vec<ItemRecord> = batch
            .records
            .values()
            .filter(|record| record.last_write_time >= batch.cutoff)
            .cloned()
            .collect();
        records.sort_unstable_by_key(|record| record.id);

        let snapshot = Snapshot {
            version: FORMAT_VERSION,
            records,
        };

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Write aside and rename so a crash leaves either the old file or the new one.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::MemoryConfig;
    use crate::memory::{Field, Memory};
    use crate::models::{HackerNewsItem, LifecycleState, RankSample};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = JsonBackend::new(dir.path().join("memory.json"));
        assert!(backend.load().unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopen_and_gc_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let clock = clock();

        {
            let mut memory = Memory::open(
                Box::new(JsonBackend::new(&path)),
                clock.clone(),
                MemoryConfig::default(),
            );
            memory.put(1, Field::State(LifecycleState::Old));
            clock.advance(Duration::hours(23));
            memory.put(2, Field::State(LifecycleState::New));
            memory.merge_data(
                2,
                HackerNewsItem {
                    url: Some("https://example.com".into()),
                    ..Default::default()
                },
            );
            memory.append_bounded(
                2,
                RankSample {
                    rank: 31,
                    at: clock.now(),
                },
                2,
            );
            assert!(memory.flush().committed);

            clock.advance(Duration::hours(2));
            let report = memory.flush();
            assert!(report.committed);
            assert_eq!(report.expired, 1);
        }

        assert!(!path.with_extension("json.tmp").exists());

        let memory = Memory::open(
            Box::new(JsonBackend::new(&path)),
            clock.clone(),
            MemoryConfig::default(),
        );
        assert_eq!(memory.all_ids(), vec![2]);
        let record = memory.get(2).unwrap();
        assert_eq!(record.state, Some(LifecycleState::New));
        assert_eq!(
            record.data.as_ref().unwrap().url.as_deref(),
            Some("https://example.com")
        );
        assert_eq!(record.rank_history[0].rank, 31);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut backend = JsonBackend::new(&path);
        assert!(backend.load().is_err());

        let memory = Memory::open(Box::new(backend), clock(), MemoryConfig::default());
        assert!(memory.is_empty());
    }
}
