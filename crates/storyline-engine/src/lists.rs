//! Active-Story Lists
//!
//! Per-owner active sets plus the two global ordered lists (Main and
//! Archive). An owner's position is the packed `private_order`; the
//! externally visible `public_order` equals it only once pagination has
//! materialised past the owner's cursor, so consumers never observe an
//! owner "above" a hole in the list.
//!
//! Pagination is two-staged: database pages first (while `database_has_more`),
//! then server pages keyed by the opaque `state` string, then finalization
//! (watermark to +∞). `sent_total_count` is derived: the materialised size,
//! and once the list is fully materialised at least the server's total.

use crate::state::{Ctx, Effect, State};
use storyline_core::codec;
use storyline_core::{
    private_order, ApiResult, ListCursor, SavedActiveStories, SavedStoryList, StoryFullId,
    StoryId, StoryListId, UserId,
};
use std::collections::BTreeSet;
use std::ops::Bound;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// One global story list.
pub(crate) struct StoryList {
    /// Opaque server pagination state.
    pub state: String,
    /// Total owner count the server last reported; -1 until known.
    pub server_total_count: i32,
    /// Whether `server_total_count` was reloaded this session, which gates
    /// local decrements.
    pub is_reloaded_server_total_count: bool,
    pub server_has_more: bool,
    pub database_has_more: bool,
    /// All materialised owners, in display order.
    pub ordered_stories: BTreeSet<ListCursor>,
    /// Positions at or before this cursor are surfaced (`public_order`
    /// non-zero). `ListCursor::MAX` once fully materialised.
    pub list_last_story_date: ListCursor,
    pub last_loaded_database_cursor: ListCursor,
    /// Externally visible owner count; -1 until first published.
    pub sent_total_count: i32,
    pub is_loading: bool,
    pub load_waiters: Vec<oneshot::Sender<ApiResult<()>>>,
}

impl Default for StoryList {
    fn default() -> Self {
        Self {
            state: String::new(),
            server_total_count: -1,
            is_reloaded_server_total_count: false,
            server_has_more: true,
            database_has_more: false,
            ordered_stories: BTreeSet::new(),
            list_last_story_date: ListCursor::MIN,
            last_loaded_database_cursor: ListCursor::MIN,
            sent_total_count: -1,
            is_loading: false,
            load_waiters: Vec::new(),
        }
    }
}

impl State {
    /// The list an owner's stories belong to, or `None` when the client
    /// does not follow the owner at all.
    pub(crate) fn subscribed_list_id(&self, ctx: &Ctx<'_>, owner_id: UserId) -> Option<StoryListId> {
        let subscribed = owner_id == ctx.my_id
            || owner_id == ctx.changelog_user_id
            || ctx.users.is_contact(owner_id);
        if !subscribed {
            return None;
        }
        if owner_id != ctx.my_id && ctx.users.are_stories_hidden(owner_id) {
            Some(StoryListId::Archive)
        } else {
            Some(StoryListId::Main)
        }
    }

    pub(crate) fn publish_chat_active_stories(&self, ctx: &mut Ctx<'_>, owner_id: UserId) {
        ctx.publisher.emit(crate::update::Update::ChatActiveStories {
            owner_id,
            active: self.active_view(owner_id),
        });
    }

    /// Recomputes `(list_id, private_order, public_order)` for an owner
    /// with a non-empty active set. Returns whether the owner's visible
    /// placement changed; `need_save` is set when the persisted row must be
    /// rewritten.
    pub(crate) fn update_active_stories_order(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        need_save: &mut bool,
    ) -> bool {
        let (last_story_id, max_read_story_id, old_list, old_private, old_public) = {
            let active = self
                .active
                .get(&owner_id)
                .expect("order update requires an active entry");
            (
                active.last_story_id(),
                active.max_read_story_id,
                active.list_id,
                active.private_order,
                active.public_order,
            )
        };
        let last_story_date = self
            .stories
            .get(&StoryFullId::new(owner_id, last_story_id))
            .map(|story| story.date)
            .unwrap_or(1);

        let new_private = private_order(
            last_story_date.max(1),
            max_read_story_id < last_story_id,
            ctx.users.is_premium_user(owner_id),
            owner_id == ctx.changelog_user_id,
            owner_id == ctx.my_id,
        );

        let list_id = self.subscribed_list_id(ctx, owner_id);

        let mut new_public = 0i64;
        if let Some(list_id) = list_id {
            if ListCursor::new(new_private, owner_id) <= self.list(list_id).list_last_story_date {
                new_public = new_private;
            }
            if old_private != new_private || old_list != Some(list_id) {
                if let Some(old_list) = old_list {
                    self.list_mut(old_list)
                        .ordered_stories
                        .remove(&ListCursor::new(old_private, owner_id));
                }
                self.list_mut(list_id)
                    .ordered_stories
                    .insert(ListCursor::new(new_private, owner_id));
                if old_list != Some(list_id) {
                    if let Some(old_list) = old_list {
                        self.update_sent_total_count(ctx, old_list);
                    }
                }
                self.update_sent_total_count(ctx, list_id);
            }
        } else if let Some(old_list) = old_list {
            self.list_mut(old_list)
                .ordered_stories
                .remove(&ListCursor::new(old_private, owner_id));
            self.update_sent_total_count(ctx, old_list);
        }

        if old_private == new_private && old_public == new_public && old_list == list_id {
            return false;
        }

        if old_private != new_private || old_list != list_id {
            *need_save = true;
        }

        let mut sent = false;
        if old_public != new_public || old_list != list_id {
            // Leaving a list is announced separately, with public order
            // zeroed, before the new placement goes out.
            if old_list != list_id && old_list.is_some() && old_public != 0 {
                if let Some(active) = self.active.get_mut(&owner_id) {
                    active.public_order = 0;
                }
                self.publish_chat_active_stories(ctx, owner_id);
            }
            sent = true;
        }
        if let Some(active) = self.active.get_mut(&owner_id) {
            active.private_order = new_private;
            active.list_id = list_id;
            active.public_order = new_public;
        }
        sent
    }

    /// Applies a fresh per-owner active set (from the server, the database
    /// or a local mutation).
    pub(crate) fn on_update_active_stories(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        mut max_read_story_id: StoryId,
        mut story_ids: Vec<StoryId>,
        mut from_database: bool,
    ) {
        let before = story_ids.len();
        story_ids.retain(|story_id| {
            if !story_id.is_server() {
                return false;
            }
            let alive = self
                .stories
                .get(&StoryFullId::new(owner_id, *story_id))
                .map_or(false, |story| story.is_active(ctx.now));
            if !alive {
                info!(owner = owner_id.0, story = story_id.0, "dropping expired or missing active story");
            }
            alive
        });
        if story_ids.len() != before {
            // The caller's snapshot no longer matches what will be stored.
            from_database = false;
        }
        story_ids.sort();
        story_ids.dedup();
        if story_ids.first().map_or(true, |first| max_read_story_id < *first) {
            max_read_story_id = StoryId::NONE;
        }

        if story_ids.is_empty() {
            if let Some(active) = self.active.remove(&owner_id) {
                info!(owner = owner_id.0, "removing active stories");
                if let Some(list_id) = active.list_id {
                    self.list_mut(list_id)
                        .ordered_stories
                        .remove(&ListCursor::new(active.private_order, owner_id));
                    let list = self.list_mut(list_id);
                    if !from_database
                        && list.is_reloaded_server_total_count
                        && list.server_total_count > list.ordered_stories.len() as i32
                    {
                        list.server_total_count -= 1;
                        self.save_story_list(ctx, list_id);
                    }
                    self.update_sent_total_count(ctx, list_id);
                }
                ctx.publisher.emit(crate::update::Update::ChatActiveStories {
                    owner_id,
                    active: None,
                });
            } else {
                self.stashed_max_read.remove(&owner_id);
            }
            if !from_database && ctx.use_db {
                ctx.effects.push(Effect::DeleteActiveStories { owner_id });
            }
            self.failed_to_load_active.insert(owner_id);
            return;
        }
        self.failed_to_load_active.remove(&owner_id);

        if !self.active.contains_key(&owner_id) {
            if let Some(stashed) = self.stashed_max_read.remove(&owner_id) {
                if stashed > max_read_story_id && stashed >= story_ids[0] {
                    max_read_story_id = stashed;
                }
            }
            self.active.insert(owner_id, Default::default());
        }

        let is_changed = {
            let active = self.active.get_mut(&owner_id).expect("just inserted");
            let is_changed =
                active.max_read_story_id != max_read_story_id || active.story_ids != story_ids;
            active.max_read_story_id = max_read_story_id;
            active.story_ids = story_ids;
            is_changed
        };

        let mut need_save = is_changed;
        let order_changed = self.update_active_stories_order(ctx, owner_id, &mut need_save);
        if is_changed || order_changed {
            self.publish_chat_active_stories(ctx, owner_id);
        }
        if need_save && !from_database && ctx.use_db {
            self.save_active_stories(ctx, owner_id);
        }
    }

    /// Re-evaluates one owner's placement after an external signal (list
    /// watermark advance, contact or premium change).
    pub(crate) fn on_active_stories_order_updated(&mut self, ctx: &mut Ctx<'_>, owner_id: UserId) {
        if !self.active.contains_key(&owner_id) {
            return;
        }
        let mut need_save = false;
        if self.update_active_stories_order(ctx, owner_id, &mut need_save) {
            self.publish_chat_active_stories(ctx, owner_id);
        }
        if need_save && ctx.use_db {
            self.save_active_stories(ctx, owner_id);
        }
    }

    pub(crate) fn save_active_stories(&mut self, ctx: &mut Ctx<'_>, owner_id: UserId) {
        let Some(active) = self.active.get(&owner_id) else {
            return;
        };
        let saved = SavedActiveStories {
            max_read_story_id: active.max_read_story_id,
            story_infos: active
                .story_ids
                .iter()
                .filter_map(|story_id| {
                    self.stories
                        .get(&StoryFullId::new(owner_id, *story_id))
                        .map(|story| story.info(*story_id))
                })
                .collect(),
        };
        let order = if active.list_id.is_some() {
            active.private_order
        } else {
            0
        };
        ctx.effects.push(Effect::SaveActiveStories {
            owner_id,
            list_id: active.list_id,
            order,
            blob: codec::encode_active_stories(&saved),
        });
    }

    pub(crate) fn save_story_list(&mut self, ctx: &mut Ctx<'_>, list_id: StoryListId) {
        if !ctx.use_db {
            return;
        }
        let list = self.list(list_id);
        let saved = SavedStoryList {
            state: list.state.clone(),
            server_total_count: list.server_total_count,
            server_has_more: list.server_has_more,
        };
        ctx.effects.push(Effect::SaveListState {
            list_id,
            blob: codec::encode_story_list(&saved),
        });
    }

    /// Recomputes the externally visible owner count and publishes it when
    /// it moved.
    pub(crate) fn update_sent_total_count(&mut self, ctx: &mut Ctx<'_>, list_id: StoryListId) {
        let list = self.list_mut(list_id);
        if list.server_total_count == -1 {
            return;
        }
        let mut total = list.ordered_stories.len() as i32;
        if list.list_last_story_date == ListCursor::MAX {
            total = total.max(list.server_total_count);
        }
        if list.sent_total_count != total {
            list.sent_total_count = total;
            ctx.publisher.emit(crate::update::Update::StoryListChatCount {
                list_id,
                count: total,
            });
        }
    }

    /// Ingests one owner bundle: its story items, then the owner's active
    /// set.
    pub(crate) fn on_get_owner_stories(
        &mut self,
        ctx: &mut Ctx<'_>,
        bundle: crate::rpc::OwnerStories,
    ) -> UserId {
        let owner_id = bundle.owner_id;
        let mut story_ids = Vec::new();
        for item in bundle.stories {
            let story_id = self.on_get_story_item(ctx, owner_id, item);
            if story_id.is_server() {
                story_ids.push(story_id);
            }
        }
        self.on_update_active_stories(ctx, owner_id, bundle.max_read_story_id, story_ids, false);
        owner_id
    }

    /// Applies a full server page of a global list.
    pub(crate) fn on_get_all_stories_page(
        &mut self,
        ctx: &mut Ctx<'_>,
        list_id: StoryListId,
        is_next: bool,
        page: crate::rpc::AllStoriesPage,
    ) {
        let mut has_more = page.has_more;
        {
            let list = self.list_mut(list_id);
            if page.state.is_empty() {
                error!(%list_id, "received an empty pagination state");
            } else {
                list.state = page.state.clone();
            }
            list.server_total_count = page.total_count.max(0);
            list.is_reloaded_server_total_count = true;
            if !page.has_more || page.owner_stories.is_empty() {
                list.server_has_more = false;
            }
        }
        if page.owner_stories.is_empty() && has_more {
            error!(%list_id, "received no stories, but expected more");
            has_more = false;
        }

        let mut max_cursor = ListCursor::MIN;
        let mut received_owners = Vec::new();
        for bundle in page.owner_stories {
            let owner_id = self.on_get_owner_stories(ctx, bundle);
            match self.active.get(&owner_id) {
                Some(active) => {
                    let cursor = ListCursor::new(active.private_order, owner_id);
                    if max_cursor < cursor {
                        max_cursor = cursor;
                    } else {
                        error!(
                            owner = owner_id.0,
                            %list_id,
                            "list page delivered owners out of order"
                        );
                    }
                    received_owners.push(owner_id);
                }
                None => error!(owner = owner_id.0, "received an invalid owner bundle"),
            }
        }
        if !has_more {
            max_cursor = ListCursor::MAX;
        }

        // Owners previously materialised inside the covered range that the
        // server no longer reports have lost their active stories.
        let min_cursor = if is_next {
            self.list(list_id).list_last_story_date
        } else {
            ListCursor::MIN
        };
        let deleted_owners: Vec<UserId> = if min_cursor <= max_cursor {
            self.list(list_id)
                .ordered_stories
                .range((Bound::Excluded(min_cursor), Bound::Included(max_cursor)))
                .map(|cursor| cursor.owner_id)
                .filter(|owner_id| !received_owners.contains(owner_id))
                .collect()
        } else {
            Vec::new()
        };

        if self.list(list_id).list_last_story_date < max_cursor {
            let previous = self.list(list_id).list_last_story_date;
            self.list_mut(list_id).list_last_story_date = max_cursor;
            let entered: Vec<UserId> = self
                .list(list_id)
                .ordered_stories
                .range((Bound::Excluded(previous), Bound::Included(max_cursor)))
                .map(|cursor| cursor.owner_id)
                .collect();
            for owner_id in entered {
                self.on_active_stories_order_updated(ctx, owner_id);
            }
        } else if is_next {
            error!(%list_id, "list watermark did not advance");
        }

        if !deleted_owners.is_empty() {
            info!(%list_id, owners = deleted_owners.len(), "removing absent owners");
        }
        for owner_id in deleted_owners {
            self.on_update_active_stories(ctx, owner_id, StoryId::NONE, Vec::new(), false);
            ctx.effects.push(Effect::LoadExpiringStories { owner_id });
        }

        self.update_sent_total_count(ctx, list_id);
        self.save_story_list(ctx, list_id);
    }

    /// Applies one database row of a global list page.
    pub(crate) fn on_get_active_stories_from_database(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        saved: SavedActiveStories,
    ) {
        let mut story_ids = Vec::new();
        for info in saved.story_infos {
            let story_id = self.on_get_story_info(ctx, owner_id, info, true);
            if story_id.is_server() {
                story_ids.push(story_id);
            }
        }
        self.on_update_active_stories(ctx, owner_id, saved.max_read_story_id, story_ids, true);
    }

    /// Advances the materialisation watermark and republishes owners that
    /// entered the window. Used by both database pagination and
    /// finalization.
    pub(crate) fn advance_list_watermark(
        &mut self,
        ctx: &mut Ctx<'_>,
        list_id: StoryListId,
        new_watermark: ListCursor,
    ) {
        let previous = self.list(list_id).list_last_story_date;
        if !(previous < new_watermark) {
            return;
        }
        self.list_mut(list_id).list_last_story_date = new_watermark;
        let entered: Vec<UserId> = self
            .list(list_id)
            .ordered_stories
            .range((Bound::Excluded(previous), Bound::Included(new_watermark)))
            .map(|cursor| cursor.owner_id)
            .collect();
        for owner_id in entered {
            self.on_active_stories_order_updated(ctx, owner_id);
        }
        self.update_sent_total_count(ctx, list_id);
    }

    /// Restores list pagination state saved by a previous session.
    pub(crate) fn restore_story_list(&mut self, list_id: StoryListId, saved: SavedStoryList) {
        let list = self.list_mut(list_id);
        list.state = saved.state;
        list.server_total_count = saved.server_total_count.max(0);
        list.server_has_more = saved.server_has_more;
        list.database_has_more = true;
        warn_if_unreasonable(saved.server_total_count, list_id);
    }
}

fn warn_if_unreasonable(total_count: i32, list_id: StoryListId) {
    if total_count < 0 {
        warn!(%list_id, total_count, "restored a negative total count, clamping");
    }
}
