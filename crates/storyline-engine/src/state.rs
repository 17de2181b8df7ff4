//! Engine State
//!
//! All mutable state of the story subsystem lives in one [`State`] value
//! guarded by a single lock: the engine behaves like a single-threaded
//! actor whose continuations re-validate everything after each suspension
//! point.
//!
//! Mutators never perform I/O. Anything that must happen against a
//! collaborator (database writes, binlog erases, file-layer notifications,
//! follow-up loads) is pushed as an [`Effect`] and applied by the engine
//! after the lock is released. The [`Ctx`] bundle carries the per-operation
//! environment: the wall clock, the identity snapshot and the effect sink.

use crate::batcher::{PendingRead, PendingViews};
use crate::lists::StoryList;
use crate::pipeline::PipelineState;
use crate::registry::Registry;
use crate::timer::TimerWheel;
use crate::update::{ActiveStoriesView, Publisher};
use crate::viewers::CachedViewers;
use crate::deps::UserDirectory;
use crate::options::DEFAULT_LOADED_EXPIRED_STORIES;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet};
use storyline_core::{
    ActiveStories, ApiResult, FileId, FileSourceId, MessageId, Story, StoryFullId, StoryId,
    StoryListId, UserId,
};
use tokio::sync::oneshot;

/// Deferred side effect, applied by the engine once the state lock is
/// released.
pub(crate) enum Effect {
    SaveStory {
        story_full_id: StoryFullId,
        expires_at: i64,
        blob: Bytes,
    },
    DeleteStoryFromDb {
        story_full_id: StoryFullId,
    },
    SaveActiveStories {
        owner_id: UserId,
        list_id: Option<StoryListId>,
        order: i64,
        blob: Bytes,
    },
    DeleteActiveStories {
        owner_id: UserId,
    },
    SaveListState {
        list_id: StoryListId,
        blob: Bytes,
    },
    EraseLogEvent {
        log_event_id: u64,
    },
    RefreshStoryMessages {
        story_full_id: StoryFullId,
        message_ids: Vec<MessageId>,
    },
    ChangeStoryFiles {
        story_full_id: StoryFullId,
        old_file_ids: Vec<FileId>,
        new_file_ids: Vec<FileId>,
    },
    DeleteFiles {
        file_ids: Vec<FileId>,
    },
    CheckLocalFiles {
        file_ids: Vec<FileId>,
    },
    ReloadStory {
        story_full_id: StoryFullId,
    },
    /// Re-fetch one owner's active set from the server (deduplicated and
    /// binlog-backed by the engine).
    LoadExpiringStories {
        owner_id: UserId,
    },
    /// Poke the per-owner mark-read sender.
    SendReadStories {
        owner_id: UserId,
    },
    /// Poke the per-owner view-increment batcher.
    SendStoryViews {
        owner_id: UserId,
    },
    /// Immediate view-count fetch for owned stories.
    FetchOwnedViews {
        story_ids: Vec<StoryId>,
    },
}

/// Per-operation environment handed to state mutators.
pub(crate) struct Ctx<'a> {
    pub now: i64,
    pub my_id: UserId,
    pub changelog_user_id: UserId,
    pub viewers_expiration_delay: i64,
    pub use_db: bool,
    pub users: &'a dyn UserDirectory,
    pub publisher: &'a Publisher,
    pub effects: &'a mut Vec<Effect>,
}

impl Ctx<'_> {
    pub fn is_owned(&self, owner_id: UserId) -> bool {
        owner_id == self.my_id
    }
}

pub(crate) struct State {
    pub registry: Registry,
    pub stories: HashMap<StoryFullId, Story>,
    pub active: HashMap<UserId, ActiveStories>,
    /// Read positions observed before the owner had any active stories.
    pub stashed_max_read: HashMap<UserId, StoryId>,
    /// Owners whose active list resolved to empty.
    pub failed_to_load_active: HashSet<UserId>,
    pub lists: [StoryList; 2],
    pub timers: TimerWheel,
    pub viewers: HashMap<StoryFullId, CachedViewers>,
    pub opened: HashMap<StoryFullId, u32>,
    pub opened_owned: HashMap<StoryFullId, u32>,
    pub pending_views: HashMap<UserId, PendingViews>,
    pub pending_reads: HashMap<UserId, PendingRead>,
    /// Messages embedding a story, re-rendered when it changes.
    pub story_messages: HashMap<StoryFullId, BTreeSet<MessageId>>,
    pub file_sources: HashMap<StoryFullId, FileSourceId>,
    pub reload_waiters: HashMap<StoryFullId, Vec<oneshot::Sender<ApiResult<()>>>>,
    /// Per-owner dedup of scheduled expiring-stories reloads, with the
    /// binlog event backing each.
    pub load_expiring_log_ids: HashMap<UserId, u64>,
    pub pipeline: PipelineState,
    pub synchronizing_archive: bool,
    pub sweep_limit: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            registry: Registry::default(),
            stories: HashMap::new(),
            active: HashMap::new(),
            stashed_max_read: HashMap::new(),
            failed_to_load_active: HashSet::new(),
            lists: [StoryList::default(), StoryList::default()],
            timers: TimerWheel::default(),
            viewers: HashMap::new(),
            opened: HashMap::new(),
            opened_owned: HashMap::new(),
            pending_views: HashMap::new(),
            pending_reads: HashMap::new(),
            story_messages: HashMap::new(),
            file_sources: HashMap::new(),
            reload_waiters: HashMap::new(),
            load_expiring_log_ids: HashMap::new(),
            pipeline: PipelineState::default(),
            synchronizing_archive: false,
            sweep_limit: DEFAULT_LOADED_EXPIRED_STORIES,
        }
    }
}

impl State {
    pub fn list(&self, list_id: StoryListId) -> &StoryList {
        &self.lists[list_id.index()]
    }

    pub fn list_mut(&mut self, list_id: StoryListId) -> &mut StoryList {
        &mut self.lists[list_id.index()]
    }

    pub fn get_story(&self, story_full_id: StoryFullId) -> Option<&Story> {
        self.stories.get(&story_full_id)
    }

    pub fn have_story_with_content(&self, story_full_id: StoryFullId) -> bool {
        self.get_story(story_full_id).map_or(false, |s| !s.is_stub())
    }

    pub fn active_view(&self, owner_id: UserId) -> Option<ActiveStoriesView> {
        self.active.get(&owner_id).map(|active| ActiveStoriesView {
            owner_id,
            list_id: active.list_id,
            order: active.public_order,
            story_ids: active.story_ids.clone(),
            max_read_story_id: active.max_read_story_id,
        })
    }
}
