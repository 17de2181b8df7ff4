//! Storyline Engine
//!
//! The stateful core of the story subsystem: it reconciles authoritative
//! server responses, the local persistent store and user actions into a
//! single in-memory model, and drives outbound operations (send, edit,
//! delete, mark-as-viewed, report) through a retry-capable, restart-safe
//! binlog.
//!
//! ## Architecture
//!
//! ```text
//!              client calls                server pushes
//!                   │                           │
//!                   ▼                           ▼
//!            ┌──────────────────────────────────────────┐
//!            │  StoryEngine (entry points, validation)  │
//!            └──────┬───────────────────────────┬───────┘
//!                   │ Mutex<State>              │ effects
//!        ┌──────────┴───────────┐      ┌────────┴─────────┐
//!        │ registry · store     │      │ StoryDatabase    │
//!        │ lists · timers       │      │ Binlog           │
//!        │ viewers · batcher    │      │ ServerApi        │
//!        │ pipeline             │      │ FileService      │
//!        └──────────┬───────────┘      └──────────────────┘
//!                   │
//!                   ▼
//!            outbound Update stream
//! ```
//!
//! All mutations happen under one lock whose scope never spans a suspension
//! point; side effects against the collaborators are collected while the
//! lock is held and applied after it is released. Every continuation that
//! runs after an await re-validates the state it observed before.

pub mod api;
pub mod deps;
pub mod engine;
pub mod options;
pub mod rpc;
pub mod update;

mod batcher;
mod lists;
mod logevent;
mod pipeline;
mod registry;
mod state;
mod store;
mod timer;
mod viewers;

pub use api::NewStory;
pub use deps::{
    Clock, Deps, DialogDirectory, FileService, InputFile, Persistence, SystemClock, UploadOutcome,
    UserDirectory, UserInfo,
};
pub use engine::StoryEngine;
pub use options::{Options, OptionValues};
pub use rpc::{
    AllStoriesPage, AllStoriesResponse, EditStoryRequest, OwnerStories, ReportReason,
    SendStoryRequest, ServerApi, StoriesPage, StoryItem, StoryItemFull, StoryViewer,
    StoryViewsResponse, UserStoriesResponse, ViewerPage,
};
pub use update::{ActiveStoriesView, Update};

pub use storyline_core::{ApiError, ApiResult};
