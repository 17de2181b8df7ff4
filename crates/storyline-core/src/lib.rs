//! Core types for Storyline
//!
//! This crate holds the data model shared by the engine and the storage
//! layer:
//!
//! - identifier newtypes (`UserId`, `StoryId`, `StoryFullId`, …)
//! - the authoritative [`Story`] record and its content/caption/privacy types
//! - the list order key packing and the [`ListCursor`] total order
//! - the versioned binary blob codec used for database rows and binlog
//!   payloads
//! - the protocol error type with the stable `(code, message)` pairs
//!
//! Everything here is plain data: no I/O, no async, no global state.

pub mod codec;
pub mod error;
pub mod id;
pub mod order;
pub mod story;

pub use error::{ApiError, ApiResult, CodecError, CodecResult};
pub use id::{FileId, FileSourceId, GlobalStoryId, MessageId, StoryFullId, StoryId, StoryListId, UserId};
pub use order::{private_order, ListCursor};
pub use story::{
    ActiveStories, FormattedText, InteractionInfo, PrivacyRule, PrivacyRules, SavedActiveStories,
    SavedStoryList, Story, StoryContent, StoryInfo, StoryPhoto, StoryVideo, TextEntity,
    TextEntityKind,
};
