//! Identifier Registry
//!
//! Owns the monotone `global_id` allocation and the three disjoint
//! classifications of story identity that are not "live in the store":
//! deleted (permanent tombstones for the session), inaccessible (the server
//! said we cannot see it; remembered with the last reload time so reloads
//! are throttled) and failed-to-load (negative cache for database loads).

use std::collections::{HashMap, HashSet};
use storyline_core::{GlobalStoryId, StoryFullId};

#[derive(Default)]
pub(crate) struct Registry {
    max_global_id: i64,
    by_global_id: HashMap<GlobalStoryId, StoryFullId>,
    deleted: HashSet<StoryFullId>,
    inaccessible: HashMap<StoryFullId, i64>,
    failed_to_load: HashSet<StoryFullId>,
}

impl Registry {
    /// Allocates the next global id for a newly registered story.
    pub fn register(&mut self, story_full_id: StoryFullId) -> GlobalStoryId {
        self.max_global_id += 1;
        let global_id = GlobalStoryId(self.max_global_id);
        self.by_global_id.insert(global_id, story_full_id);
        global_id
    }

    pub fn unregister(&mut self, global_id: GlobalStoryId) {
        self.by_global_id.remove(&global_id);
    }

    pub fn resolve(&self, global_id: GlobalStoryId) -> Option<StoryFullId> {
        self.by_global_id.get(&global_id).copied()
    }

    pub fn mark_deleted(&mut self, story_full_id: StoryFullId) {
        self.deleted.insert(story_full_id);
    }

    pub fn is_deleted(&self, story_full_id: StoryFullId) -> bool {
        self.deleted.contains(&story_full_id)
    }

    pub fn mark_inaccessible(&mut self, story_full_id: StoryFullId, now: i64) {
        self.inaccessible.insert(story_full_id, now);
    }

    pub fn clear_inaccessible(&mut self, story_full_id: StoryFullId) {
        self.inaccessible.remove(&story_full_id);
    }

    pub fn is_inaccessible(&self, story_full_id: StoryFullId) -> bool {
        self.inaccessible.contains_key(&story_full_id)
    }

    /// Unix time of the last reload attempt for an inaccessible story.
    pub fn inaccessible_since(&self, story_full_id: StoryFullId) -> Option<i64> {
        self.inaccessible.get(&story_full_id).copied()
    }

    pub fn mark_failed_to_load(&mut self, story_full_id: StoryFullId) {
        self.failed_to_load.insert(story_full_id);
    }

    pub fn clear_failed_to_load(&mut self, story_full_id: StoryFullId) {
        self.failed_to_load.remove(&story_full_id);
    }

    pub fn has_failed_to_load(&self, story_full_id: StoryFullId) -> bool {
        self.failed_to_load.contains(&story_full_id)
    }
}
