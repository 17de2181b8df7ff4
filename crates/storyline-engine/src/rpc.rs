//! Server RPC Contract
//!
//! [`ServerApi`] is the engine's view of the story RPC vocabulary. The
//! transport and serialization live outside; this module only fixes the
//! request/response shapes the engine relies on.
//!
//! The push/pull vocabulary is a tagged variant: three story item kinds
//! ([`StoryItem`]) and three bundle kinds (all-stories pages, plain story
//! pages, per-owner bundles). Every bundle carries a users-list prefix that
//! the engine ingests into the user directory before the stories, so
//! privacy and viewer references always resolve.

use crate::deps::{InputFile, UserInfo};
use async_trait::async_trait;
use storyline_core::{
    ApiResult, FormattedText, InteractionInfo, PrivacyRules, StoryContent, StoryId, StoryListId,
    UserId,
};

/// A story item as pushed or pulled from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum StoryItem {
    Deleted {
        story_id: StoryId,
    },
    /// Partial record: enough for ordering and expiry, no content.
    Skipped {
        story_id: StoryId,
        date: i32,
        expire_date: i32,
        is_for_close_friends: bool,
    },
    Full(Box<StoryItemFull>),
}

/// The complete wire record of one story.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryItemFull {
    pub story_id: StoryId,
    pub date: i32,
    pub expire_date: i32,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub is_public: bool,
    pub is_for_close_friends: bool,
    pub is_for_contacts: bool,
    pub is_for_selected_contacts: bool,
    pub noforwards: bool,
    /// A "min" record omits privacy and interaction info; it never applies
    /// to owned stories.
    pub is_min: bool,
    pub content: StoryContent,
    pub caption: FormattedText,
    pub privacy_rules: Option<PrivacyRules>,
    pub interaction_info: Option<InteractionInfo>,
}

/// One owner's bundle inside an all-stories page or a per-owner response.
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerStories {
    pub owner_id: UserId,
    pub max_read_story_id: StoryId,
    pub stories: Vec<StoryItem>,
}

/// A full page of `get_all_stories`.
#[derive(Debug, Clone, PartialEq)]
pub struct AllStoriesPage {
    pub state: String,
    pub total_count: i32,
    pub has_more: bool,
    pub users: Vec<UserInfo>,
    /// Owner bundles in descending `private_order`.
    pub owner_stories: Vec<OwnerStories>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllStoriesResponse {
    NotModified { state: String },
    Page(AllStoriesPage),
}

/// A plain page of stories of one owner (pinned, archive, by-id).
#[derive(Debug, Clone, PartialEq)]
pub struct StoriesPage {
    pub total_count: i32,
    pub users: Vec<UserInfo>,
    pub stories: Vec<StoryItem>,
}

/// Response to a per-owner active stories request.
#[derive(Debug, Clone, PartialEq)]
pub struct UserStoriesResponse {
    pub users: Vec<UserInfo>,
    pub bundle: OwnerStories,
}

/// One viewer of an owned story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoryViewer {
    pub user_id: UserId,
    pub view_date: i32,
}

/// One page of the viewer list.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewerPage {
    pub total_count: i32,
    pub users: Vec<UserInfo>,
    pub viewers: Vec<StoryViewer>,
}

/// Batched view counters for owned stories, index-aligned with the request.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryViewsResponse {
    pub users: Vec<UserInfo>,
    pub views: Vec<InteractionInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendStoryRequest {
    pub content: StoryContent,
    pub input_file: Option<InputFile>,
    pub caption: FormattedText,
    pub privacy_rules: PrivacyRules,
    pub random_id: i64,
    pub active_period: i32,
    pub is_pinned: bool,
    pub noforwards: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditStoryRequest {
    pub story_id: StoryId,
    pub content: Option<StoryContent>,
    pub input_file: Option<InputFile>,
    pub caption: Option<FormattedText>,
    pub privacy_rules: Option<PrivacyRules>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportReason {
    Spam,
    Violence,
    Pornography,
    ChildAbuse,
    Copyright,
    Other,
}

/// The story RPCs the engine consumes. Implementations run on their own
/// executors; every method is a suspension point for the engine.
#[async_trait]
pub trait ServerApi: Send + Sync {
    async fn get_all_stories(
        &self,
        list_id: StoryListId,
        is_next: bool,
        state: &str,
    ) -> ApiResult<AllStoriesResponse>;

    /// Re-requests read positions for every owner; results arrive through
    /// the regular update stream.
    async fn get_all_read_user_stories(&self) -> ApiResult<()>;

    async fn toggle_all_stories_hidden(&self, hidden: bool) -> ApiResult<()>;

    async fn toggle_stories_hidden(&self, user_id: UserId, hidden: bool) -> ApiResult<()>;

    async fn increment_story_views(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
    ) -> ApiResult<()>;

    async fn read_stories(&self, owner_id: UserId, max_story_id: StoryId) -> ApiResult<()>;

    async fn get_story_views_list(
        &self,
        story_id: StoryId,
        offset_date: i32,
        offset_user_id: UserId,
        limit: i32,
    ) -> ApiResult<ViewerPage>;

    async fn get_stories_by_id(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
    ) -> ApiResult<StoriesPage>;

    async fn get_pinned_stories(
        &self,
        owner_id: UserId,
        from_story_id: StoryId,
        limit: i32,
    ) -> ApiResult<StoriesPage>;

    async fn get_stories_archive(
        &self,
        from_story_id: StoryId,
        limit: i32,
    ) -> ApiResult<StoriesPage>;

    async fn get_user_stories(&self, owner_id: UserId) -> ApiResult<UserStoriesResponse>;

    /// Returns the server's authoritative item for the accepted story,
    /// carrying the minted server id.
    async fn send_story(&self, request: SendStoryRequest) -> ApiResult<StoryItemFull>;

    /// `Ok(None)` means the edit was accepted without an immediate item;
    /// the refreshed record arrives through the update stream.
    async fn edit_story(&self, request: EditStoryRequest) -> ApiResult<Option<StoryItemFull>>;

    async fn toggle_pinned(&self, story_ids: Vec<StoryId>, is_pinned: bool) -> ApiResult<()>;

    async fn delete_stories(&self, story_ids: Vec<StoryId>) -> ApiResult<()>;

    async fn get_stories_views(&self, story_ids: Vec<StoryId>) -> ApiResult<StoryViewsResponse>;

    async fn report_story(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
        reason: ReportReason,
        message: String,
    ) -> ApiResult<()>;
}
