use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Hacker News item ids are plain unsigned integers.
pub type ItemId = u64;

/// Raw item payload as returned by `/v0/item/<id>.json`.
///
/// Every field is optional: the API omits whatever does not apply (no `url` on Ask HN,
/// no `title` once an item is deleted, ...). Anything we do not model explicitly is kept
/// in `extra` so it survives merges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HackerNewsItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descendants: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kids: Option<Vec<ItemId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    /// Creation time, unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HackerNewsItem {
    pub fn is_dead(&self) -> bool {
        self.dead.unwrap_or(false)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.unwrap_or(false)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.time.and_then(|t| Utc.timestamp_opt(t, 0).single())
    }

    /// Merge a newer fetch into this one. Fields the newer payload carries win; fields it
    /// lacks are kept from earlier fetches (a deleted story loses its title upstream, but we
    /// still want to say which story it was).
    pub fn merge(&mut self, newer: HackerNewsItem) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.id, newer.id);
        take(&mut self.kind, newer.kind);
        take(&mut self.title, newer.title);
        take(&mut self.url, newer.url);
        take(&mut self.by, newer.by);
        take(&mut self.score, newer.score);
        take(&mut self.descendants, newer.descendants);
        take(&mut self.kids, newer.kids);
        take(&mut self.text, newer.text);
        take(&mut self.dead, newer.dead);
        take(&mut self.deleted, newer.deleted);
        take(&mut self.time, newer.time);
        self.extra.extend(newer.extra);
    }
}

/// Which upstream id list to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryList {
    New,
    Top,
}

impl StoryList {
    pub fn endpoint(&self) -> &'static str {
        match self {
            StoryList::New => "newstories.json",
            StoryList::Top => "topstories.json",
        }
    }
}

/// Last known lifecycle classification of a tracked item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    New,
    Old,
    Dead,
    Deleted,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Old => "old",
            Self::Dead => "dead",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "old" => Some(Self::Old),
            "dead" => Some(Self::Dead),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of an item's position in the top list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSample {
    /// 1-based position.
    pub rank: usize,
    pub at: DateTime<Utc>,
}

/// Everything we remember about one item between polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: ItemId,
    #[serde(default)]
    pub state: Option<LifecycleState>,
    #[serde(default)]
    pub rank_history: VecDeque<RankSample>,
    #[serde(default)]
    pub downranked: bool,
    #[serde(default)]
    pub data: Option<HackerNewsItem>,
    #[serde(default)]
    pub nulled: bool,
    pub last_write_time: DateTime<Utc>,
}

impl ItemRecord {
    pub fn new(id: ItemId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: None,
            rank_history: VecDeque::new(),
            downranked: false,
            data: None,
            nulled: false,
            last_write_time: now,
        }
    }

    /// Cached payload, or nothing for tombstoned records.
    pub fn payload(&self) -> Option<&HackerNewsItem> {
        if self.nulled {
            None
        } else {
            self.data.as_ref()
        }
    }

    /// The two most recent rank samples, oldest first.
    pub fn last_two_ranks(&self) -> Option<(RankSample, RankSample)> {
        let len = self.rank_history.len();
        if len < 2 {
            return None;
        }
        Some((self.rank_history[len - 2], self.rank_history[len - 1]))
    }
}

/// Why an item is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Resurrected,
    Killed,
    Deleted,
    Downranked,
    Dedownranked,
    Upranked,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resurrected => "resurrected",
            Self::Killed => "killed",
            Self::Deleted => "deleted",
            Self::Downranked => "downranked",
            Self::Dedownranked => "dedownranked",
            Self::Upranked => "upranked",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A noteworthy transition: a snapshot of the record at the time it was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub record: ItemRecord,
    pub kind: EventKind,
}
