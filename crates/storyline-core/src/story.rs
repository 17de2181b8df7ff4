//! The Story Data Model
//!
//! [`Story`] is the authoritative in-memory record for one post. It is
//! created on the first server observation or a successful database load,
//! mutated in place by server updates, local edits and timer-driven state
//! changes, and destroyed on a confirmed deletion or when an expired foreign
//! non-pinned record is loaded from the database.
//!
//! Content is a tagged variant that stays opaque to the engine except for
//! two things it genuinely needs: the set of file identifiers and the
//! field-wise merge outcome when the server re-sends the same media.

use crate::id::{FileId, GlobalStoryId, StoryId, StoryListId, UserId};
use serde::{Deserialize, Serialize};

/// Text with markup entities, produced by the external formatted-text
/// parser. The engine treats it as an opaque value with equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedText {
    pub text: String,
    pub entities: Vec<TextEntity>,
}

impl FormattedText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntity {
    pub offset: i32,
    pub length: i32,
    pub kind: TextEntityKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEntityKind {
    Mention,
    Hashtag,
    Url,
    Bold,
    Italic,
    Underline,
    Strikethrough,
    Code,
}

/// Privacy rules attached to an owned story: evaluated top to bottom by the
/// server, mirrored locally for display only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyRules {
    pub rules: Vec<PrivacyRule>,
}

impl PrivacyRules {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyRule {
    AllowAll,
    AllowContacts,
    AllowCloseFriends,
    AllowUsers(Vec<UserId>),
    DisallowUsers(Vec<UserId>),
}

/// View counter plus up to three most recent viewers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionInfo {
    pub view_count: i32,
    pub recent_viewer_user_ids: Vec<UserId>,
}

impl InteractionInfo {
    pub const MAX_RECENT_VIEWERS: usize = 3;

    pub fn is_empty(&self) -> bool {
        self.view_count == 0 && self.recent_viewer_user_ids.is_empty()
    }

    /// Sets the view count, refusing decreases. Returns whether the stored
    /// count changed.
    pub fn set_view_count(&mut self, view_count: i32) -> bool {
        if view_count > self.view_count {
            self.view_count = view_count;
            true
        } else {
            false
        }
    }

    pub fn set_recent_viewers(&mut self, mut user_ids: Vec<UserId>) {
        user_ids.truncate(Self::MAX_RECENT_VIEWERS);
        self.recent_viewer_user_ids = user_ids;
    }

    /// True when the local information cannot already account for `user_id`
    /// being a viewer, so a refresh is worthwhile.
    pub fn definitely_has_no_viewer(&self, user_id: UserId) -> bool {
        self.view_count == 0 || !self.recent_viewer_user_ids.contains(&user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPhoto {
    pub file_id: FileId,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryVideo {
    pub file_id: FileId,
    pub duration: i32,
    pub width: i32,
    pub height: i32,
    pub is_animation: bool,
}

/// Media payload of a story. `Unsupported` is a forward-compatibility stub
/// for variants this client version cannot render; it still occupies the
/// slot so the record is not treated as a stub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoryContent {
    Photo(StoryPhoto),
    Video(StoryVideo),
    Unsupported,
}

/// Outcome of merging a re-received content into the stored one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentMerge {
    /// Externally visible change: re-publish and persist.
    pub is_changed: bool,
    /// Only stored metadata moved: persist without publishing.
    pub need_save: bool,
}

impl StoryContent {
    pub fn type_name(&self) -> &'static str {
        match self {
            StoryContent::Photo(_) => "photo",
            StoryContent::Video(_) => "video",
            StoryContent::Unsupported => "unsupported",
        }
    }

    pub fn is_same_type(&self, other: &StoryContent) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        match self {
            StoryContent::Photo(photo) => vec![photo.file_id],
            StoryContent::Video(video) => vec![video.file_id],
            StoryContent::Unsupported => Vec::new(),
        }
    }

    /// The file the send pipeline uploads for this content.
    pub fn primary_file_id(&self) -> Option<FileId> {
        self.file_ids().first().copied()
    }

    /// Field-wise merge of `new` over `old`, assuming both are the same
    /// variant. A changed file means a real change; refreshed dimensions or
    /// duration only need a save.
    pub fn merge(old: &StoryContent, new: &StoryContent) -> ContentMerge {
        debug_assert!(old.is_same_type(new));
        let mut outcome = ContentMerge::default();
        match (old, new) {
            (StoryContent::Photo(a), StoryContent::Photo(b)) => {
                if a.file_id != b.file_id {
                    outcome.is_changed = true;
                } else if a != b {
                    outcome.need_save = true;
                }
            }
            (StoryContent::Video(a), StoryContent::Video(b)) => {
                if a.file_id != b.file_id || a.is_animation != b.is_animation {
                    outcome.is_changed = true;
                } else if a != b {
                    outcome.need_save = true;
                }
            }
            _ => {}
        }
        outcome
    }
}

/// The authoritative record for one story.
///
/// `global_id` and `is_update_sent` are session-local bookkeeping and are
/// not persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub date: i32,
    pub expire_date: i32,
    pub receive_date: i32,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub is_public: bool,
    pub is_for_close_friends: bool,
    pub is_for_contacts: bool,
    pub is_for_selected_contacts: bool,
    pub noforwards: bool,
    pub content: Option<StoryContent>,
    pub caption: FormattedText,
    pub privacy_rules: PrivacyRules,
    pub interaction_info: InteractionInfo,
    #[serde(skip)]
    pub global_id: GlobalStoryId,
    #[serde(skip)]
    pub is_update_sent: bool,
}

impl Story {
    pub fn is_active(&self, now: i64) -> bool {
        now < i64::from(self.expire_date)
    }

    /// A stub is known to exist but its content has not been loaded.
    pub fn is_stub(&self) -> bool {
        self.content.is_none()
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        self.content.as_ref().map(StoryContent::file_ids).unwrap_or_default()
    }

    pub fn info(&self, story_id: StoryId) -> StoryInfo {
        StoryInfo {
            story_id,
            date: self.date,
            expire_date: self.expire_date,
            is_for_close_friends: self.is_for_close_friends,
        }
    }
}

/// The partial record carried by a skipped server item and by the active
/// list blob: enough to keep ordering and expiry working without content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryInfo {
    pub story_id: StoryId,
    pub date: i32,
    pub expire_date: i32,
    pub is_for_close_friends: bool,
}

/// The currently-active stories of one owner, plus the owner's position in
/// its global list. `story_ids` is non-empty and strictly ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveStories {
    pub story_ids: Vec<StoryId>,
    pub max_read_story_id: StoryId,
    pub list_id: Option<StoryListId>,
    pub private_order: i64,
    pub public_order: i64,
}

impl ActiveStories {
    pub fn last_story_id(&self) -> StoryId {
        *self.story_ids.last().expect("active stories are never empty")
    }

    pub fn has_unread(&self) -> bool {
        self.max_read_story_id < self.last_story_id()
    }
}

/// Persisted form of [`ActiveStories`]: the per-story infos instead of bare
/// ids, so ordering and expiry survive a restart without loading every
/// story row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedActiveStories {
    pub max_read_story_id: StoryId,
    pub story_infos: Vec<StoryInfo>,
}

/// Persisted pagination state of one global list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedStoryList {
    pub state: String,
    pub server_total_count: i32,
    pub server_has_more: bool,
}
