//! Diffs the current new/top lists against memory and decides what is worth reporting.
//!
//! Per item the lifecycle is `new -> {old, dead, deleted}`, with `dead -> new` when a killed
//! story comes back. Rank changes are judged from the last two top-list samples only.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::hn_client::{FetchError, ItemSource};
use crate::memory::{Field, FlushReport, Memory};
use crate::models::{
    EventKind, HackerNewsItem, ItemId, ItemRecord, LifecycleState, RankSample, StoryList, Update,
};

pub struct UpdateEngine<S: ItemSource> {
    source: S,
    memory: Memory,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl<S: ItemSource> UpdateEngine<S> {
    pub fn new(source: S, memory: Memory, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            source,
            memory,
            clock,
            config,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Poll both lists and work out this cycle's updates.
    ///
    /// Store writes made while detecting stay pending until [`Cycle::commit`]. If either list
    /// cannot be fetched the partial writes are discarded and the error is returned; the
    /// next cycle starts from the last committed state.
    pub fn run_cycle(&mut self) -> Result<Cycle<'_, S>, FetchError> {
        match self.detect() {
            Ok(updates) => {
                tracing::info!(updates = updates.len(), "cycle finished");
                Ok(Cycle {
                    engine: self,
                    updates: updates.into_iter(),
                    committed: false,
                })
            }
            Err(e) => {
                self.memory.discard();
                Err(e)
            }
        }
    }

    fn detect(&mut self) -> Result<Vec<Update>, FetchError> {
        let new_ids = self.source.fetch_list(StoryList::New)?;
        let top_ids = self.source.fetch_list(StoryList::Top)?;
        let now = self.clock.now();

        let mut updates = Vec::new();
        let new_set: HashSet<ItemId> = new_ids.iter().copied().collect();
        let known = self.memory.all_ids();

        for &id in &known {
            self.reconcile_known(id, new_set.contains(&id), &mut updates);
        }

        // Whatever is left on the new list has never been seen before.
        let mut seen: HashSet<ItemId> = known.into_iter().collect();
        for id in new_ids {
            if !seen.insert(id) {
                continue;
            }
            tracing::info!("{}: adding new story", id);
            if let Err(e) = self.hydrate(id, true) {
                tracing::warn!(error = %e, "{}: could not seed item data", id);
            }
            self.memory.put(id, Field::State(LifecycleState::New));
        }

        let mut ranked = HashSet::new();
        for (index, id) in top_ids.into_iter().enumerate() {
            if !ranked.insert(id) {
                continue;
            }
            if let Some(kind) = self.rank_change(id, index + 1, now) {
                updates.push(self.snapshot(id, kind, now));
            }
        }

        Ok(updates)
    }

    fn reconcile_known(&mut self, id: ItemId, on_new_list: bool, updates: &mut Vec<Update>) {
        let now = self.clock.now();
        let Some(state) = self.memory.get(id).map(|record| record.state) else {
            return;
        };

        if on_new_list {
            if state == Some(LifecycleState::Dead) {
                if let Err(e) = self.hydrate(id, true) {
                    tracing::warn!(error = %e, "{}: resurrection check failed, retrying next cycle", id);
                    return;
                }
                tracing::info!("{}: story resurrected", id);
                self.memory.put(id, Field::State(LifecycleState::New));
                updates.push(self.snapshot(id, EventKind::Resurrected, now));
                return;
            }
            self.memory.put(id, Field::State(LifecycleState::New));
            return;
        }

        let Some(state) = state else {
            // Only ever seen on the top list.
            self.memory.put(id, Field::State(LifecycleState::Old));
            return;
        };

        if state != LifecycleState::New {
            // Kept around until garbage collected.
            return;
        }

        tracing::info!("{}: story disappeared...", id);
        let item = match self.hydrate(id, true) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "{}: could not find out why, retrying next cycle", id);
                return;
            }
        };

        match item {
            None => {
                // Listed as new but never published: the API only ever says null.
                tracing::info!("{}: ...nulled", id);
                self.memory.put(id, Field::State(LifecycleState::Old));
            }
            Some(item) if item.is_dead() => {
                tracing::info!("{}: ...because it was killed", id);
                self.memory.put(id, Field::State(LifecycleState::Dead));
                updates.push(self.snapshot(id, EventKind::Killed, now));
            }
            Some(item) if item.is_deleted() => {
                tracing::info!("{}: ...because it was deleted", id);
                self.memory.put(id, Field::State(LifecycleState::Deleted));
                updates.push(self.snapshot(id, EventKind::Deleted, now));
            }
            Some(_) => {
                tracing::info!("{}: ...because it is too old", id);
                self.memory.put(id, Field::State(LifecycleState::Old));
            }
        }
    }

    /// Record the item's new position and say whether it crossed a page boundary.
    fn rank_change(&mut self, id: ItemId, rank: usize, now: DateTime<Utc>) -> Option<EventKind> {
        let record = self.memory.append_bounded(
            id,
            RankSample { rank, at: now },
            self.config.rank_history_len,
        );
        let (prev, cur) = record.last_two_ranks()?;
        let downranked = record.downranked;

        if prev.at < now - self.config.stale_rank_after {
            tracing::debug!("{}: rank history is stale, starting over", id);
            self.memory.clear_rank_history(id);
            return None;
        }

        let page = self.config.page_size;
        if prev.rank <= page && cur.rank > 2 * page {
            tracing::info!("{}: downranked {} -> {}", id, prev.rank, cur.rank);
            self.memory.put(id, Field::Downranked(true));
            self.refresh_for_event(id);
            return Some(EventKind::Downranked);
        }
        if cur.rank <= page && downranked {
            tracing::info!("{}: back on the front page {} -> {}", id, prev.rank, cur.rank);
            self.memory.put(id, Field::Downranked(false));
            self.refresh_for_event(id);
            return Some(EventKind::Dedownranked);
        }
        if cur.rank <= page && prev.rank > 2 * page {
            match self.is_long_stale(id, now) {
                Ok(true) => {
                    tracing::info!("{}: old story upranked {} -> {}", id, prev.rank, cur.rank);
                    self.refresh_for_event(id);
                    return Some(EventKind::Upranked);
                }
                Ok(false) => {}
                Err(e) => {
                    // Keep the deep rank as the latest sample so the jump is judged again.
                    tracing::warn!(error = %e, "{}: could not check story age, retrying next cycle", id);
                    self.memory.pop_rank_sample(id);
                }
            }
        }
        None
    }

    fn is_long_stale(&mut self, id: ItemId, now: DateTime<Utc>) -> Result<bool, FetchError> {
        Ok(self.hydrate(id, false)?.is_some_and(|item| {
            item.created_at()
                .is_some_and(|created| created < now - self.config.long_stale_after)
        }))
    }

    /// Rank events report current score and comments; fall back to cached data if the
    /// refresh fails since the rank change itself is already certain.
    fn refresh_for_event(&mut self, id: ItemId) {
        if let Err(e) = self.hydrate(id, true) {
            tracing::warn!(error = %e, "{}: reporting with cached data", id);
        }
    }

    /// Fetch the item and merge it into memory. Tombstoned items are never fetched again;
    /// without `force`, cached data is returned when there is any.
    fn hydrate(&mut self, id: ItemId, force: bool) -> Result<Option<HackerNewsItem>, FetchError> {
        if let Some(record) = self.memory.get(id) {
            if record.nulled {
                return Ok(None);
            }
            if !force {
                if let Some(data) = &record.data {
                    return Ok(Some(data.clone()));
                }
            }
        }

        match self.source.fetch_item(id)? {
            Some(item) => Ok(Some(self.memory.merge_data(id, item))),
            None => {
                tracing::info!("{}: upstream has no data, tombstoning", id);
                self.memory.put(id, Field::Nulled(true));
                Ok(None)
            }
        }
    }

    fn snapshot(&self, id: ItemId, kind: EventKind, now: DateTime<Utc>) -> Update {
        let record = self
            .memory
            .get(id)
            .cloned()
            .unwrap_or_else(|| ItemRecord::new(id, now));
        Update { record, kind }
    }
}

/// The updates of one poll, holding the engine until they are dealt with.
///
/// Deliver every update, then call [`Cycle::commit`] to persist the cycle. Dropping the
/// cycle without committing throws its store writes away, so the same updates are detected
/// again next time.
pub struct Cycle<'a, S: ItemSource> {
    engine: &'a mut UpdateEngine<S>,
    updates: std::vec::IntoIter<Update>,
    committed: bool,
}

impl<S: ItemSource> Cycle<'_, S> {
    pub fn remaining(&self) -> usize {
        self.updates.len()
    }

    pub fn commit(mut self) -> FlushReport {
        self.committed = true;
        self.engine.memory.flush()
    }
}

impl<S: ItemSource> Iterator for Cycle<'_, S> {
    type Item = Update;

    fn next(&mut self) -> Option<Update> {
        self.updates.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.updates.size_hint()
    }
}

impl<S: ItemSource> Drop for Cycle<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            self.engine.memory.discard();
        }
    }
}
