//! Persistence Adapter for Storyline
//!
//! Two stores back the engine across restarts:
//!
//! - the **story database** ([`StoryDatabase`], SQLite behind a trait):
//!   story rows keyed by `(owner, story)`, per-owner active-list rows keyed
//!   by the packed list order, and the opaque pagination state of the two
//!   global lists. Blobs are opaque to this crate; the engine encodes them
//!   with the `storyline-core` codec.
//! - the **binlog** ([`Binlog`]): a transactional append-only log of pending
//!   user-initiated operations (send, edit, delete, read, expiring-reload)
//!   replayed on startup so they survive process restarts.

pub mod binlog;
pub mod db;
pub mod error;

pub use binlog::{Binlog, BinlogEvent};
pub use db::{ActiveStoriesRow, SqliteStoryDatabase, StoryDatabase, StoryRow};
pub use error::{Result, StorageError};
