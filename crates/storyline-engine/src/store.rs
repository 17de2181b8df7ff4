//! Story Store
//!
//! Owns ingestion of server story records into the authoritative in-memory
//! map, the deletion path, the change fan-out (timers, persistence,
//! publishing, message cross-references) and the database row policy.
//!
//! Ingestion never trusts the server blindly: non-server ids are refused,
//! non-positive dates are coerced with a log, and a deleted tombstone wins
//! over any later record of the same story.

use crate::state::{Ctx, Effect, State};
use crate::rpc::{StoriesPage, StoryItem, StoryItemFull};
use storyline_core::codec;
use storyline_core::{
    ApiError, ApiResult, Story, StoryContent, StoryFullId, StoryId, StoryInfo, UserId,
};
use tracing::{error, info, warn};

impl State {
    pub(crate) fn viewers_expire_date(&self, ctx: &Ctx<'_>, story: &Story) -> i64 {
        i64::from(story.expire_date) + ctx.viewers_expiration_delay
    }

    /// Whether the viewer list of this story can still be fetched.
    pub(crate) fn can_get_story_viewers(
        &self,
        ctx: &Ctx<'_>,
        story_full_id: StoryFullId,
        story: &Story,
    ) -> ApiResult<()> {
        if !ctx.is_owned(story_full_id.owner_id) {
            return Err(ApiError::story_not_outgoing());
        }
        if !story_full_id.story_id.is_server() {
            return Err(ApiError::story_not_sent_yet());
        }
        if ctx.now >= self.viewers_expire_date(ctx, story) {
            return Err(ApiError::story_too_old());
        }
        Ok(())
    }

    /// Emits `updateStory` for the current record and marks it published.
    pub(crate) fn publish_story(&mut self, ctx: &mut Ctx<'_>, story_full_id: StoryFullId) {
        if let Some(story) = self.stories.get_mut(&story_full_id) {
            story.is_update_sent = true;
            let snapshot = story.clone();
            ctx.publisher.emit(crate::update::Update::Story {
                owner_id: story_full_id.owner_id,
                story_id: story_full_id.story_id,
                story: snapshot,
            });
        }
    }

    /// Fan-out after any mutation of a story record: re-arm timers,
    /// persist, publish, refresh embedding messages.
    pub(crate) fn on_story_changed(
        &mut self,
        ctx: &mut Ctx<'_>,
        story_full_id: StoryFullId,
        is_changed: bool,
        need_save: bool,
        from_database: bool,
    ) {
        let Some(story) = self.stories.get(&story_full_id) else {
            return;
        };
        let global_id = story.global_id;
        if global_id.is_valid() {
            if story.is_active(ctx.now) {
                self.timers
                    .expire
                    .set(global_id, i64::from(story.expire_date));
            }
            if self.can_get_story_viewers(ctx, story_full_id, story).is_ok() {
                let deadline = self.viewers_expire_date(ctx, story);
                self.timers.viewers_expire.set(global_id, deadline);
            }
        }
        let story = self.stories.get(&story_full_id).expect("checked above");
        if story.is_stub() || !story_full_id.story_id.is_server() {
            return;
        }
        if !(is_changed || need_save) {
            return;
        }
        if ctx.use_db && !from_database {
            // Foreign non-pinned rows carry their expiry as a TTL for the
            // background sweep.
            let expires_at = if story.is_active(ctx.now)
                && !ctx.is_owned(story_full_id.owner_id)
                && !story.is_pinned
            {
                i64::from(story.expire_date)
            } else {
                0
            };
            ctx.effects.push(Effect::SaveStory {
                story_full_id,
                expires_at,
                blob: codec::encode_story(story),
            });
        }
        if is_changed && story.is_update_sent {
            self.publish_story(ctx, story_full_id);
        }
        if let Some(message_ids) = self.story_messages.get(&story_full_id) {
            ctx.effects.push(Effect::RefreshStoryMessages {
                story_full_id,
                message_ids: message_ids.iter().copied().collect(),
            });
        }
    }

    /// Dispatches one wire story item.
    pub(crate) fn on_get_story_item(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        item: StoryItem,
    ) -> StoryId {
        match item {
            StoryItem::Deleted { story_id } => {
                self.on_delete_story(ctx, StoryFullId::new(owner_id, story_id));
                StoryId::NONE
            }
            StoryItem::Skipped {
                story_id,
                date,
                expire_date,
                is_for_close_friends,
            } => self.on_get_story_info(
                ctx,
                owner_id,
                StoryInfo {
                    story_id,
                    date,
                    expire_date,
                    is_for_close_friends,
                },
                false,
            ),
            StoryItem::Full(item) => self.on_get_new_story(ctx, owner_id, *item),
        }
    }

    /// Ingests a full story record.
    pub(crate) fn on_get_new_story(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        mut item: StoryItemFull,
    ) -> StoryId {
        let story_id = item.story_id;
        if !story_id.is_server() {
            error!(owner = owner_id.0, story = story_id.0, "received a story with a non-server id");
            return StoryId::NONE;
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        if self.registry.is_deleted(story_full_id) {
            return StoryId::NONE;
        }

        let mut is_changed = false;
        let mut need_save = false;
        if !self.stories.contains_key(&story_full_id) {
            let mut story = Story::default();
            story.global_id = self.registry.register(story_full_id);
            self.stories.insert(story_full_id, story);
            self.registry.clear_inaccessible(story_full_id);
            self.registry.clear_failed_to_load(story_full_id);
            is_changed = true;
            item.is_min = false;
            info!(%story_full_id, "adding a new story");
        }
        // Only owned stories can legitimately arrive as partial records.
        if !ctx.is_owned(owner_id) {
            item.is_min = false;
        }

        let edited_content = self
            .pipeline
            .being_edited
            .get(&story_full_id)
            .map_or(false, |edited| edited.content.is_some());
        let edited_caption = self
            .pipeline
            .being_edited
            .get(&story_full_id)
            .map_or(false, |edited| edited.edit_caption);

        let mut date = item.date;
        let mut expire_date = item.expire_date;
        if date <= 0 {
            error!(%story_full_id, date, "received a story with a non-positive date");
            date = 1;
        }
        if expire_date <= date {
            error!(%story_full_id, date, expire_date, "received a story expiring before its date");
            expire_date = date + 1;
        }

        let old_file_ids;
        {
            let story = self.stories.get_mut(&story_full_id).expect("just ensured");
            story.receive_date = ctx.now as i32;
            old_file_ids = story.file_ids();

            // Content merge: an in-flight content edit keeps the local
            // preview visible, so the server copy only needs saving.
            if edited_content {
                story.content = Some(item.content);
                need_save = true;
            } else {
                match &story.content {
                    Some(old) if old.is_same_type(&item.content) => {
                        let outcome = StoryContent::merge(old, &item.content);
                        is_changed |= outcome.is_changed;
                        need_save |= outcome.need_save;
                        story.content = Some(item.content);
                    }
                    _ => {
                        story.content = Some(item.content);
                        is_changed = true;
                    }
                }
            }

            if story.is_edited != item.is_edited
                || story.is_pinned != item.is_pinned
                || story.is_public != item.is_public
                || story.is_for_close_friends != item.is_for_close_friends
                || story.is_for_contacts != item.is_for_contacts
                || story.is_for_selected_contacts != item.is_for_selected_contacts
                || story.noforwards != item.noforwards
                || story.date != date
                || story.expire_date != expire_date
            {
                story.is_edited = item.is_edited;
                story.is_pinned = item.is_pinned;
                story.is_public = item.is_public;
                story.is_for_close_friends = item.is_for_close_friends;
                story.is_for_contacts = item.is_for_contacts;
                story.is_for_selected_contacts = item.is_for_selected_contacts;
                story.noforwards = item.noforwards;
                story.date = date;
                story.expire_date = expire_date;
                is_changed = true;
            }

            if !item.is_min {
                let privacy_rules = item.privacy_rules.unwrap_or_default();
                let interaction_info = item.interaction_info.unwrap_or_default();
                if story.privacy_rules != privacy_rules
                    || story.interaction_info != interaction_info
                {
                    story.privacy_rules = privacy_rules;
                    story.interaction_info = interaction_info;
                    is_changed = true;
                }
            }

            if story.caption != item.caption {
                story.caption = item.caption;
                if edited_caption {
                    need_save = true;
                } else {
                    is_changed = true;
                }
            }

            if is_changed || need_save {
                let new_file_ids = story.file_ids();
                if old_file_ids != new_file_ids {
                    ctx.effects.push(Effect::ChangeStoryFiles {
                        story_full_id,
                        old_file_ids,
                        new_file_ids,
                    });
                }
            }
        }

        self.on_story_changed(ctx, story_full_id, is_changed, need_save, false);

        let is_active = self
            .stories
            .get(&story_full_id)
            .map_or(false, |story| story.is_active(ctx.now));
        if is_active {
            match self.active.get(&owner_id) {
                None => {
                    if self.subscribed_list_id(ctx, owner_id).is_some() {
                        ctx.effects.push(Effect::LoadExpiringStories { owner_id });
                    }
                }
                Some(active) if !active.story_ids.contains(&story_id) => {
                    let mut story_ids = active.story_ids.clone();
                    let max_read_story_id = active.max_read_story_id;
                    story_ids.push(story_id);
                    self.on_update_active_stories(ctx, owner_id, max_read_story_id, story_ids, false);
                }
                Some(_) => {}
            }
        }

        story_id
    }

    /// Ingests a partial (skipped) record.
    pub(crate) fn on_get_story_info(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        mut info: StoryInfo,
        from_database: bool,
    ) -> StoryId {
        let story_id = info.story_id;
        if !story_id.is_server() {
            error!(owner = owner_id.0, story = story_id.0, "received a partial story with a non-server id");
            return StoryId::NONE;
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        if self.registry.is_deleted(story_full_id) {
            return StoryId::NONE;
        }

        if !self.stories.contains_key(&story_full_id) {
            let mut story = Story::default();
            story.global_id = self.registry.register(story_full_id);
            self.stories.insert(story_full_id, story);
            self.registry.clear_inaccessible(story_full_id);
        }

        if info.date <= 0 {
            error!(%story_full_id, date = info.date, "received a partial story with a non-positive date");
            info.date = 1;
        }
        if info.expire_date <= info.date {
            error!(%story_full_id, "received a partial story expiring before its date");
            info.expire_date = info.date + 1;
        }

        let changed = {
            let story = self.stories.get_mut(&story_full_id).expect("just ensured");
            let changed = story.date != info.date
                || story.expire_date != info.expire_date
                || story.is_for_close_friends != info.is_for_close_friends;
            story.date = info.date;
            story.expire_date = info.expire_date;
            story.is_for_close_friends = info.is_for_close_friends;
            changed
        };
        if changed {
            self.on_story_changed(ctx, story_full_id, true, true, from_database);
        }
        story_id
    }

    /// Server-confirmed (or locally initiated optimistic) deletion.
    pub(crate) fn on_delete_story(&mut self, ctx: &mut Ctx<'_>, story_full_id: StoryFullId) {
        let story_id = story_full_id.story_id;
        if !story_id.is_server() {
            error!(%story_full_id, "received a deletion for a non-server story");
            return;
        }

        self.registry.mark_deleted(story_full_id);
        self.registry.mark_inaccessible(story_full_id, ctx.now);

        let Some(story) = self.stories.remove(&story_full_id) else {
            if ctx.use_db {
                ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
            }
            return;
        };
        info!(%story_full_id, "deleting story");

        if story.is_update_sent {
            ctx.publisher.emit(crate::update::Update::StoryDeleted {
                owner_id: story_full_id.owner_id,
                story_id,
            });
        }
        let file_ids = story.file_ids();
        if !file_ids.is_empty() {
            ctx.effects.push(Effect::DeleteFiles { file_ids });
        }
        if story.global_id.is_valid() {
            self.registry.unregister(story.global_id);
            self.timers.cancel_all(story.global_id);
        }

        if let Some(edited) = self.pipeline.being_edited.remove(&story_full_id) {
            if edited.log_event_id != 0 {
                ctx.effects.push(Effect::EraseLogEvent {
                    log_event_id: edited.log_event_id,
                });
            }
        }
        self.pipeline.edit_generations.remove(&story_full_id);
        self.viewers.remove(&story_full_id);

        let owner_id = story_full_id.owner_id;
        if let Some(active) = self.active.get(&owner_id) {
            if active.story_ids.contains(&story_id) {
                let mut story_ids = active.story_ids.clone();
                let max_read_story_id = active.max_read_story_id;
                story_ids.retain(|id| *id != story_id);
                self.on_update_active_stories(ctx, owner_id, max_read_story_id, story_ids, false);
            }
        }

        if ctx.use_db {
            ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
        }
    }

    /// Ingests a plain page of one owner's stories (pinned, archive,
    /// by-id). Expected ids the server did not return become inaccessible.
    pub(crate) fn on_get_story_page(
        &mut self,
        ctx: &mut Ctx<'_>,
        owner_id: UserId,
        expected_story_ids: &[StoryId],
        page: StoriesPage,
    ) -> (i32, Vec<StoryFullId>) {
        let mut story_ids = Vec::new();
        for item in page.stories {
            let story_id = self.on_get_story_item(ctx, owner_id, item);
            if story_id.is_server() {
                story_ids.push(StoryFullId::new(owner_id, story_id));
            }
        }
        let mut total_count = page.total_count;
        if total_count < story_ids.len() as i32 {
            error!(
                owner = owner_id.0,
                total_count,
                received = story_ids.len(),
                "server total count is below the returned page size"
            );
            total_count = story_ids.len() as i32;
        }
        for story_id in expected_story_ids {
            let story_full_id = StoryFullId::new(owner_id, *story_id);
            if !self.stories.contains_key(&story_full_id) {
                warn!(%story_full_id, "expected story missing from the response, marking inaccessible");
                self.registry.mark_inaccessible(story_full_id, ctx.now);
            }
        }
        (total_count, story_ids)
    }

    /// Applies batched view counters for owned stories.
    pub(crate) fn on_get_story_views(
        &mut self,
        ctx: &mut Ctx<'_>,
        story_ids: &[StoryId],
        views: Vec<storyline_core::InteractionInfo>,
    ) {
        if story_ids.len() != views.len() {
            error!(
                requested = story_ids.len(),
                received = views.len(),
                "mismatched story views response"
            );
            return;
        }
        let owner_id = ctx.my_id;
        for (story_id, interaction_info) in story_ids.iter().zip(views) {
            let story_full_id = StoryFullId::new(owner_id, *story_id);
            let Some(story) = self.stories.get_mut(&story_full_id) else {
                continue;
            };
            if story.is_stub() || interaction_info.is_empty() {
                continue;
            }
            if story.interaction_info != interaction_info {
                story.interaction_info = interaction_info;
                self.on_story_changed(ctx, story_full_id, true, true, false);
            }
        }
    }

    /// Applies a story row read from the database. Returns whether a usable
    /// record is now in memory.
    pub(crate) fn apply_db_story_row(
        &mut self,
        ctx: &mut Ctx<'_>,
        story_full_id: StoryFullId,
        data: &[u8],
    ) -> bool {
        if self.have_story_with_content(story_full_id) {
            return true;
        }
        let parsed = match codec::decode_story(data) {
            Ok(story) => story,
            Err(e) => {
                error!(%story_full_id, error = %e, "invalid story row, deleting and scheduling a reload");
                ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
                ctx.effects.push(Effect::ReloadStory { story_full_id });
                return false;
            }
        };
        if parsed.content.is_none() {
            error!(%story_full_id, "story row without content, deleting");
            ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
            return false;
        }
        let owner_id = story_full_id.owner_id;
        if parsed.is_active(ctx.now) {
            if let Some(active) = self.active.get(&owner_id) {
                if !active.story_ids.contains(&story_full_id.story_id) {
                    info!(%story_full_id, "ignoring an unavailable active story from the database");
                    ctx.effects.push(Effect::DeleteFiles {
                        file_ids: parsed.file_ids(),
                    });
                    ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
                    return false;
                }
            }
        } else if !ctx.is_owned(owner_id) && !parsed.is_pinned {
            // Expired foreign non-pinned stories are not retained.
            info!(%story_full_id, "deleting an expired story from the database");
            ctx.effects.push(Effect::DeleteFiles {
                file_ids: parsed.file_ids(),
            });
            ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
            return false;
        }

        match self.stories.get_mut(&story_full_id) {
            Some(stub) => {
                // A stub may carry fresher ordering fields than the row.
                let date = stub.date.max(parsed.date);
                let expire_date = stub.expire_date.max(parsed.expire_date);
                let global_id = stub.global_id;
                let is_update_sent = stub.is_update_sent;
                let mut story = parsed;
                story.date = date;
                story.expire_date = expire_date;
                story.global_id = global_id;
                story.is_update_sent = is_update_sent;
                *stub = story;
            }
            None => {
                let mut story = parsed;
                story.global_id = self.registry.register(story_full_id);
                self.stories.insert(story_full_id, story);
            }
        }
        self.registry.clear_failed_to_load(story_full_id);
        self.on_story_changed(ctx, story_full_id, false, false, true);
        true
    }

    /// Applies one row of the expired sweep. The row's TTL already lapsed,
    /// so a record that parses as retainable is only logged.
    pub(crate) fn sweep_db_story_row(
        &mut self,
        ctx: &mut Ctx<'_>,
        story_full_id: StoryFullId,
        data: &[u8],
    ) {
        let parsed = match codec::decode_story(data) {
            Ok(story) => story,
            Err(e) => {
                error!(%story_full_id, error = %e, "invalid expiring story row, deleting and scheduling a reload");
                ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
                ctx.effects.push(Effect::ReloadStory { story_full_id });
                return;
            }
        };
        if !parsed.is_active(ctx.now) && !ctx.is_owned(story_full_id.owner_id) && !parsed.is_pinned
        {
            ctx.effects.push(Effect::DeleteFiles {
                file_ids: parsed.file_ids(),
            });
            ctx.effects.push(Effect::DeleteStoryFromDb { story_full_id });
        } else {
            // The TTL query returned a row that is not actually disposable.
            error!(%story_full_id, "received a non-expired story from the expiry sweep");
        }
    }
}
