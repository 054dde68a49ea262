//! Watch the Hacker News new and top lists and report the stories whose fate changed:
//! killed, deleted, resurrected, or moved sharply in rank.
//!
//! [`engine::UpdateEngine`] does the diffing against a persistent [`memory::Memory`];
//! everything it needs from upstream goes through [`hn_client::ItemSource`].

pub mod clock;
pub mod config;
pub mod engine;
pub mod hn_client;
pub mod memory;
pub mod models;
pub mod sink;

pub use engine::{Cycle, UpdateEngine};
pub use hn_client::{FetchError, HackerNewsClient, ItemSource};
pub use memory::Memory;
pub use models::{EventKind, HackerNewsItem, ItemId, ItemRecord, LifecycleState, Update};
