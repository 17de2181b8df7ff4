//! Engine Configuration
//!
//! [`Options`] mirrors the tunables the host reads from its option store.
//! The handle is cheap to clone and interior-mutable, so the host can flip
//! options mid-session (premium purchase, changelog sender change) without
//! restarting the engine.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use storyline_core::UserId;

/// How long an opened story waits between server refreshes.
pub const OPENED_STORY_POLL_PERIOD: i64 = 60;

/// Staleness bound before a story referenced by a message is refetched.
pub const VIEWED_STORY_POLL_PERIOD: i64 = 60;

/// Initial page size of the expired-row sweep; doubles while pages come back
/// full.
pub const DEFAULT_LOADED_EXPIRED_STORIES: u32 = 100;

/// Period of the view-count poll that runs while owned stories are open.
pub const INTERACTION_INFO_UPDATE_PERIOD: Duration = Duration::from_secs(10);

/// Server-side limit on one `increment_story_views` batch.
pub const MAX_VIEWED_STORIES_PER_REQUEST: usize = 200;

/// At most this many opened owned stories are polled per tick.
pub const MAX_POLLED_OWNED_STORIES: usize = 100;

/// Page size of database-backed list loading.
pub const DATABASE_LIST_PAGE_SIZE: u32 = 10;

/// Fallback changelog sender: the service notifications user.
pub const SERVICE_NOTIFICATIONS_USER_ID: UserId = UserId(777000);

/// Snapshot of all option values.
#[derive(Debug, Clone)]
pub struct OptionValues {
    /// Seconds after expiry during which viewers of an owned story remain
    /// fetchable.
    pub story_viewers_expiration_delay: i64,
    /// Transient: the archive-all flag still needs to be pushed to the
    /// server.
    pub need_synchronize_archive_all_stories: bool,
    pub archive_all_stories: bool,
    pub stories_changelog_user_id: UserId,
    pub is_premium: bool,
    /// Test environments additionally allow 60 s and 300 s active periods.
    pub is_test_env: bool,
}

impl Default for OptionValues {
    fn default() -> Self {
        Self {
            story_viewers_expiration_delay: 86_400,
            need_synchronize_archive_all_stories: false,
            archive_all_stories: false,
            stories_changelog_user_id: SERVICE_NOTIFICATIONS_USER_ID,
            is_premium: false,
            is_test_env: false,
        }
    }
}

/// Shared handle over [`OptionValues`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    inner: Arc<RwLock<OptionValues>>,
}

impl Options {
    pub fn new(values: OptionValues) -> Self {
        Self {
            inner: Arc::new(RwLock::new(values)),
        }
    }

    pub fn snapshot(&self) -> OptionValues {
        self.inner.read().expect("options lock poisoned").clone()
    }

    pub fn story_viewers_expiration_delay(&self) -> i64 {
        self.inner.read().expect("options lock poisoned").story_viewers_expiration_delay
    }

    pub fn need_synchronize_archive_all_stories(&self) -> bool {
        self.inner
            .read()
            .expect("options lock poisoned")
            .need_synchronize_archive_all_stories
    }

    pub fn archive_all_stories(&self) -> bool {
        self.inner.read().expect("options lock poisoned").archive_all_stories
    }

    pub fn stories_changelog_user_id(&self) -> UserId {
        self.inner.read().expect("options lock poisoned").stories_changelog_user_id
    }

    pub fn is_premium(&self) -> bool {
        self.inner.read().expect("options lock poisoned").is_premium
    }

    pub fn is_test_env(&self) -> bool {
        self.inner.read().expect("options lock poisoned").is_test_env
    }

    pub fn set_need_synchronize_archive_all_stories(&self, value: bool) {
        self.inner
            .write()
            .expect("options lock poisoned")
            .need_synchronize_archive_all_stories = value;
    }

    pub fn set_archive_all_stories(&self, value: bool) {
        self.inner.write().expect("options lock poisoned").archive_all_stories = value;
    }

    pub fn set_is_premium(&self, value: bool) {
        self.inner.write().expect("options lock poisoned").is_premium = value;
    }
}
