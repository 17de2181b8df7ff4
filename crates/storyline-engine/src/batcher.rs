//! Read & View Batcher
//!
//! Two per-owner buckets, each with at-most-one RPC in flight per owner:
//!
//! - **mark-read**: opening an active foreign story advances the local
//!   `max_read` immediately; the server write is logged to the binlog and
//!   deduplicated so only the latest position per owner is pending.
//! - **view-increment**: opening a non-active pinned story enqueues its id;
//!   batches of up to 200 ids go out whenever no request is in flight.

use crate::state::{Ctx, Effect, State};
use std::collections::BTreeSet;
use storyline_core::{StoryId, UserId};
use tracing::info;

/// Queued view increments for one owner.
#[derive(Debug, Default)]
pub(crate) struct PendingViews {
    pub story_ids: BTreeSet<StoryId>,
    pub has_query: bool,
}

/// Mark-read progress for one owner.
#[derive(Debug, Default)]
pub(crate) struct PendingRead {
    pub in_flight: bool,
    /// The single binlog event backing this owner's pending position.
    pub log_event_id: u64,
    /// A position that advanced while a request was in flight.
    pub queued_max: Option<StoryId>,
}

impl State {
    /// Queues a view increment; pokes the sender when idle.
    pub(crate) fn enqueue_story_view(&mut self, ctx: &mut Ctx<'_>, owner_id: UserId, story_id: StoryId) {
        let views = self.pending_views.entry(owner_id).or_default();
        views.story_ids.insert(story_id);
        if !views.has_query {
            ctx.effects.push(Effect::SendStoryViews { owner_id });
        }
    }

    /// Advances the local read position. Returns whether it moved (and the
    /// server should be told).
    pub(crate) fn on_update_read_stories(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        max_read_story_id: StoryId,
    ) -> bool {
        match self.active.get(&owner_id) {
            None => {
                let stashed = self
                    .stashed_max_read
                    .get(&owner_id)
                    .copied()
                    .unwrap_or(StoryId::NONE);
                if max_read_story_id > stashed {
                    info!(
                        owner = owner_id.0,
                        max_read = max_read_story_id.0,
                        "stashing read position for an owner without active stories"
                    );
                    self.stashed_max_read.insert(owner_id, max_read_story_id);
                    return true;
                }
                false
            }
            Some(active) if max_read_story_id > active.max_read_story_id => {
                let story_ids = active.story_ids.clone();
                self.on_update_active_stories(ctx, owner_id, max_read_story_id, story_ids, false);
                true
            }
            Some(_) => false,
        }
    }

    /// The read position the server should currently be told about.
    pub(crate) fn current_max_read(&self, owner_id: UserId) -> StoryId {
        self.active
            .get(&owner_id)
            .map(|active| active.max_read_story_id)
            .or_else(|| self.stashed_max_read.get(&owner_id).copied())
            .unwrap_or(StoryId::NONE)
    }

    /// Up to `limit` opened owned story ids, for the interaction poll.
    pub(crate) fn opened_owned_story_ids(&self, limit: usize) -> Vec<StoryId> {
        let mut story_ids: Vec<StoryId> = self
            .opened_owned
            .keys()
            .map(|story_full_id| story_full_id.story_id)
            .collect();
        story_ids.sort();
        story_ids.truncate(limit);
        story_ids
    }
}
