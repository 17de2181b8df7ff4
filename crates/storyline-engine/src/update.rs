//! Outbound Updates
//!
//! The engine reports observable changes through a stream of [`Update`]
//! values. Emission is diff-based: each logical change produces at most one
//! update per entity, and `updateStory` is only re-sent for stories whose
//! first update already went out (`is_update_sent`).

use storyline_core::{Story, StoryId, StoryListId, UserId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

/// Externally visible shape of one owner's active stories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveStoriesView {
    pub owner_id: UserId,
    pub list_id: Option<StoryListId>,
    /// The owner's public order: zero while materialised but not yet
    /// surfaced by pagination.
    pub order: i64,
    pub story_ids: Vec<StoryId>,
    pub max_read_story_id: StoryId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A story was created or changed.
    Story {
        owner_id: UserId,
        story_id: StoryId,
        story: Story,
    },
    /// A previously published story was deleted.
    StoryDeleted { owner_id: UserId, story_id: StoryId },
    /// The owner's active story set changed; `None` clears it.
    ChatActiveStories {
        owner_id: UserId,
        active: Option<ActiveStoriesView>,
    },
    /// The externally visible total owner count of a list changed.
    StoryListChatCount { list_id: StoryListId, count: i32 },
}

/// Fan-out handle. Dropping the receiver silently discards updates; the
/// engine does not depend on anyone listening.
#[derive(Clone)]
pub struct Publisher {
    tx: UnboundedSender<Update>,
}

impl Publisher {
    pub fn new(tx: UnboundedSender<Update>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, update: Update) {
        trace!(?update, "emit update");
        let _ = self.tx.send(update);
    }
}
