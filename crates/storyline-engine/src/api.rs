//! Client API Entry Points
//!
//! Every inbound operation validates its arguments against the directories
//! before touching the model, and reports failures with the stable
//! `(code, message)` pairs other clients depend on.
//!
//! Inbound server pushes enter through the `on_server_*` methods; they take
//! the same ingestion paths as pulled responses.

use crate::engine::StoryEngine;
use crate::logevent::{self, EditStoryEvent, SendStoryEvent};
use crate::options::{DATABASE_LIST_PAGE_SIZE, VIEWED_STORY_POLL_PERIOD};
use crate::pipeline::PendingStory;
use crate::rpc::{
    AllStoriesResponse, OwnerStories, ReportReason, StoryItem, StoryViewer, UserStoriesResponse,
};
use crate::state::Effect;
use crate::update::ActiveStoriesView;
use rand::Rng;
use storyline_core::codec;
use storyline_core::{
    ApiError, ApiResult, FormattedText, ListCursor, PrivacyRules, Story, StoryContent,
    StoryFullId, StoryId, StoryListId, MessageId, UserId,
};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

/// Parameters of a new story.
#[derive(Debug, Clone)]
pub struct NewStory {
    pub content: StoryContent,
    pub caption: FormattedText,
    pub privacy_rules: PrivacyRules,
    /// Seconds until expiry; see the premium duration set.
    pub active_period: i32,
    pub is_pinned: bool,
    pub protect_content: bool,
}

const FREE_ACTIVE_PERIOD: i32 = 86_400;
const PREMIUM_ACTIVE_PERIODS: [i32; 5] =
    [6 * 3600, 12 * 3600, 2 * 86_400, 3 * 86_400, 7 * 86_400];
const TEST_ACTIVE_PERIODS: [i32; 2] = [60, 300];

impl StoryEngine {
    fn check_story_sender(&self, owner_id: UserId) -> ApiResult<()> {
        if !self.inner.deps.dialogs.have_dialog(owner_id) {
            return Err(ApiError::sender_not_found());
        }
        if !self.inner.deps.dialogs.can_read_dialog(owner_id) {
            return Err(ApiError::sender_inaccessible());
        }
        Ok(())
    }

    fn my_id(&self) -> UserId {
        self.inner.deps.users.my_id()
    }

    // ---------------------------------------------------------------
    // Global lists
    // ---------------------------------------------------------------

    /// Loads the next page of a global list: database first, then server,
    /// then finalization ("Not found" once everything is materialised).
    pub async fn load_active_stories(&self, list_id: Option<StoryListId>) -> ApiResult<()> {
        let Some(list_id) = list_id else {
            return Err(ApiError::story_list_required());
        };

        enum Plan {
            Done(ApiResult<()>),
            Wait(oneshot::Receiver<ApiResult<()>>),
            RunDatabase,
            RunServer { is_next: bool, state: String },
        }

        let plan = self
            .with_state(|state, ctx| {
                if state.list(list_id).list_last_story_date == ListCursor::MAX {
                    return Plan::Done(Err(ApiError::not_found()));
                }
                if state.list(list_id).is_loading {
                    let (tx, rx) = oneshot::channel();
                    state.list_mut(list_id).load_waiters.push(tx);
                    return Plan::Wait(rx);
                }
                if state.list(list_id).database_has_more {
                    state.list_mut(list_id).is_loading = true;
                    return Plan::RunDatabase;
                }
                if state.list(list_id).server_has_more {
                    let list = state.list_mut(list_id);
                    list.is_loading = true;
                    return Plan::RunServer {
                        is_next: !list.state.is_empty(),
                        state: list.state.clone(),
                    };
                }
                // Nothing left anywhere: finalize the list.
                state.advance_list_watermark(ctx, list_id, ListCursor::MAX);
                Plan::Done(Err(ApiError::not_found()))
            })
            .await;

        match plan {
            Plan::Done(result) => result,
            Plan::Wait(rx) => rx.await.unwrap_or_else(|_| Err(ApiError::request_aborted())),
            Plan::RunDatabase => {
                let result = self.load_list_page_from_database(list_id).await;
                self.finish_list_load(list_id, result.clone()).await;
                result
            }
            Plan::RunServer { is_next, state } => {
                let result = self.load_list_page_from_server(list_id, is_next, state).await;
                self.finish_list_load(list_id, result.clone()).await;
                result
            }
        }
    }

    async fn finish_list_load(&self, list_id: StoryListId, result: ApiResult<()>) {
        let waiters = self
            .with_state(|state, _ctx| {
                let list = state.list_mut(list_id);
                list.is_loading = false;
                std::mem::take(&mut list.load_waiters)
            })
            .await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn load_list_page_from_database(&self, list_id: StoryListId) -> ApiResult<()> {
        let Some(persistence) = self.inner.deps.persistence.clone() else {
            // Stale flag from a lost database; fall through to the server.
            self.with_state(|state, _ctx| state.list_mut(list_id).database_has_more = false)
                .await;
            return Ok(());
        };
        let cursor = {
            let state = self.inner.state.lock().await;
            state.list(list_id).last_loaded_database_cursor
        };
        let rows = match persistence
            .db
            .get_active_story_list(list_id, cursor.order, cursor.owner_id, DATABASE_LIST_PAGE_SIZE)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!(%list_id, error = %e, "database list page failed");
                return Err(ApiError::new(500, "Database error"));
            }
        };
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        info!(%list_id, rows = rows.len(), "loaded a list page from the database");

        self.with_state(|state, ctx| {
            if rows.is_empty() {
                let list = state.list_mut(list_id);
                list.last_loaded_database_cursor = ListCursor::MAX;
                list.database_has_more = false;
                return;
            }
            let mut max_cursor = state.list(list_id).last_loaded_database_cursor;
            for row in &rows {
                match codec::decode_active_stories(&row.data) {
                    Ok(saved) => {
                        state.on_get_active_stories_from_database(ctx, row.owner_id, saved)
                    }
                    Err(e) => {
                        warn!(owner = row.owner_id.0, error = %e, "invalid active stories row, deleting");
                        ctx.effects.push(Effect::DeleteActiveStories {
                            owner_id: row.owner_id,
                        });
                    }
                }
                let row_cursor = ListCursor::new(row.order, row.owner_id);
                if max_cursor < row_cursor {
                    max_cursor = row_cursor;
                }
            }
            if state.list(list_id).last_loaded_database_cursor < max_cursor {
                state.list_mut(list_id).last_loaded_database_cursor = max_cursor;
                state.advance_list_watermark(ctx, list_id, max_cursor);
            } else {
                error!(%list_id, "database list cursor did not advance");
            }
            state.update_sent_total_count(ctx, list_id);
        })
        .await;
        Ok(())
    }

    async fn load_list_page_from_server(
        &self,
        list_id: StoryListId,
        is_next: bool,
        state_token: String,
    ) -> ApiResult<()> {
        let response = self
            .inner
            .deps
            .server
            .get_all_stories(list_id, is_next, &state_token)
            .await?;
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        match response {
            AllStoriesResponse::NotModified { state: new_state } => {
                self.with_state(|state, ctx| {
                    if new_state.is_empty() {
                        error!(%list_id, "received an empty state in a not-modified response");
                    } else {
                        state.list_mut(list_id).state = new_state;
                        state.save_story_list(ctx, list_id);
                    }
                })
                .await;
                Ok(())
            }
            AllStoriesResponse::Page(page) => {
                self.inner.deps.users.on_get_users(page.users.clone());
                self.with_state(|state, ctx| {
                    state.on_get_all_stories_page(ctx, list_id, is_next, page);
                })
                .await;
                Ok(())
            }
        }
    }

    /// Re-fetches both lists from scratch (same pagination state, first
    /// page) to reconcile with the server.
    pub async fn reload_active_stories(&self) {
        for list_id in StoryListId::ALL {
            let run = self
                .with_state(|state, _ctx| {
                    let list = state.list_mut(list_id);
                    if list.is_loading {
                        return None;
                    }
                    list.is_loading = true;
                    Some(list.state.clone())
                })
                .await;
            if let Some(state_token) = run {
                let result = self.load_list_page_from_server(list_id, false, state_token).await;
                if let Err(e) = &result {
                    warn!(%list_id, error = %e, "list reload failed");
                }
                self.finish_list_load(list_id, result).await;
            }
        }
    }

    /// Re-requests every owner's read position from the server.
    pub async fn reload_all_read_stories(&self) -> ApiResult<()> {
        self.inner.deps.server.get_all_read_user_stories().await
    }

    // ---------------------------------------------------------------
    // Per-owner reads
    // ---------------------------------------------------------------

    pub async fn get_dialog_pinned_stories(
        &self,
        owner_id: UserId,
        from_story_id: StoryId,
        limit: i32,
    ) -> ApiResult<(i32, Vec<StoryFullId>)> {
        if limit <= 0 {
            return Err(ApiError::limit_must_be_positive());
        }
        self.check_story_sender(owner_id)?;
        if from_story_id != StoryId::NONE && !from_story_id.is_server() {
            return Err(ApiError::invalid_from_story_id());
        }
        let page = self
            .inner
            .deps
            .server
            .get_pinned_stories(owner_id, from_story_id, limit)
            .await?;
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        self.inner.deps.users.on_get_users(page.users.clone());
        Ok(self
            .with_state(|state, ctx| state.on_get_story_page(ctx, owner_id, &[], page))
            .await)
    }

    pub async fn get_story_archive(
        &self,
        from_story_id: StoryId,
        limit: i32,
    ) -> ApiResult<(i32, Vec<StoryFullId>)> {
        if limit <= 0 {
            return Err(ApiError::limit_must_be_positive());
        }
        if from_story_id != StoryId::NONE && !from_story_id.is_server() {
            return Err(ApiError::invalid_from_story_id());
        }
        let owner_id = self.my_id();
        let page = self
            .inner
            .deps
            .server
            .get_stories_archive(from_story_id, limit)
            .await?;
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        self.inner.deps.users.on_get_users(page.users.clone());
        Ok(self
            .with_state(|state, ctx| state.on_get_story_page(ctx, owner_id, &[], page))
            .await)
    }

    pub async fn get_dialog_expiring_stories(
        &self,
        owner_id: UserId,
    ) -> ApiResult<Option<ActiveStoriesView>> {
        self.check_story_sender(owner_id)?;
        self.fetch_dialog_expiring_stories(owner_id).await
    }

    pub async fn get_story(
        &self,
        owner_id: UserId,
        story_id: StoryId,
        only_local: bool,
    ) -> ApiResult<Option<Story>> {
        self.check_story_sender(owner_id)?;
        if !story_id.is_server() {
            return Err(ApiError::invalid_story_id());
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.ensure_story_loaded(story_full_id).await;

        let snapshot = self.snapshot_story_for_caller(story_full_id).await;
        if snapshot.is_some() || only_local {
            return Ok(snapshot);
        }
        self.reload_story(story_full_id, true).await?;
        Ok(self.snapshot_story_for_caller(story_full_id).await)
    }

    /// Returns the record, publishing its first `updateStory` if needed so
    /// callers and update consumers agree on what exists.
    async fn snapshot_story_for_caller(&self, story_full_id: StoryFullId) -> Option<Story> {
        self.with_state(|state, ctx| {
            if !state.have_story_with_content(story_full_id) {
                return None;
            }
            if !state
                .get_story(story_full_id)
                .map_or(false, |story| story.is_update_sent)
            {
                state.publish_story(ctx, story_full_id);
            }
            state.get_story(story_full_id).cloned()
        })
        .await
    }

    // ---------------------------------------------------------------
    // Opening and viewing
    // ---------------------------------------------------------------

    pub async fn open_story(&self, owner_id: UserId, story_id: StoryId) -> ApiResult<()> {
        self.check_story_sender(owner_id)?;
        if !story_id.is_server() {
            return Err(ApiError::invalid_story_id());
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.with_state(|state, ctx| {
            if !state.stories.contains_key(&story_full_id) {
                return Ok(());
            }
            if ctx.is_owned(owner_id) {
                let count = state.opened_owned.entry(story_full_id).or_insert(0);
                *count += 1;
                if *count == 1 {
                    ctx.effects.push(Effect::FetchOwnedViews {
                        story_ids: vec![story_id],
                    });
                }
            }
            let story = state.get_story(story_full_id).expect("checked above");
            if story.is_stub() {
                return Ok(());
            }
            let global_id = story.global_id;
            let receive_date = i64::from(story.receive_date);
            let file_ids = story.file_ids();
            let is_active = story.is_active(ctx.now);
            let is_pinned = story.is_pinned;

            let count = state.opened.entry(story_full_id).or_insert(0);
            *count += 1;
            if *count == 1 {
                state
                    .timers
                    .reload
                    .set(global_id, receive_date + crate::options::OPENED_STORY_POLL_PERIOD);
            }
            if !file_ids.is_empty() {
                ctx.effects.push(Effect::CheckLocalFiles { file_ids });
            }

            if !is_active && is_pinned {
                state.enqueue_story_view(ctx, owner_id, story_id);
            }
            if is_active && !ctx.is_owned(owner_id)
                && state.on_update_read_stories(ctx, owner_id, story_id)
            {
                ctx.effects.push(Effect::SendReadStories { owner_id });
            }
            Ok(())
        })
        .await
    }

    pub async fn close_story(&self, owner_id: UserId, story_id: StoryId) -> ApiResult<()> {
        self.check_story_sender(owner_id)?;
        if !story_id.is_server() {
            return Err(ApiError::invalid_story_id());
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.with_state(|state, ctx| {
            if ctx.is_owned(owner_id) {
                match state.opened_owned.get_mut(&story_full_id) {
                    None => return Err(ApiError::story_not_opened()),
                    Some(count) => {
                        *count -= 1;
                        if *count == 0 {
                            state.opened_owned.remove(&story_full_id);
                        }
                    }
                }
            }
            let Some(story) = state.get_story(story_full_id) else {
                return Ok(());
            };
            let global_id = story.global_id;
            if let Some(count) = state.opened.get_mut(&story_full_id) {
                if *count > 0 {
                    *count -= 1;
                    if *count == 0 {
                        state.opened.remove(&story_full_id);
                        state.timers.reload.cancel(global_id);
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// A message embedding this story was displayed; refresh the record if
    /// it is missing or stale.
    pub async fn view_story_message(&self, owner_id: UserId, story_id: StoryId) {
        if !story_id.is_server() {
            return;
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.ensure_story_loaded(story_full_id).await;
        let stale = self
            .with_state(|state, ctx| match state.get_story(story_full_id) {
                None => true,
                Some(story) => i64::from(story.receive_date) < ctx.now - VIEWED_STORY_POLL_PERIOD,
            })
            .await;
        if stale {
            let _ = self.reload_story(story_full_id, false).await;
        }
    }

    /// Someone replied to an owned story; refresh its view counters when
    /// the replier is not yet known to be a viewer.
    pub async fn on_story_replied(
        &self,
        owner_id: UserId,
        story_id: StoryId,
        replier_user_id: UserId,
    ) {
        if !replier_user_id.is_valid()
            || replier_user_id == self.my_id()
            || !story_id.is_server()
        {
            return;
        }
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.ensure_story_loaded(story_full_id).await;
        self.with_state(|state, ctx| {
            if !ctx.is_owned(owner_id) {
                return;
            }
            let Some(story) = state.get_story(story_full_id) else {
                return;
            };
            if !story.is_stub()
                && ctx.now < state.viewers_expire_date(ctx, story)
                && story.interaction_info.definitely_has_no_viewer(replier_user_id)
            {
                ctx.effects.push(Effect::FetchOwnedViews {
                    story_ids: vec![story_id],
                });
            }
        })
        .await;
    }

    /// Tracks a message that embeds a story, so changes re-render it.
    pub async fn register_story_message(
        &self,
        story_full_id: StoryFullId,
        message_id: MessageId,
    ) {
        self.with_state(|state, _ctx| {
            state
                .story_messages
                .entry(story_full_id)
                .or_default()
                .insert(message_id);
        })
        .await;
    }

    pub async fn unregister_story_message(
        &self,
        story_full_id: StoryFullId,
        message_id: MessageId,
    ) {
        self.with_state(|state, _ctx| {
            if let Some(message_ids) = state.story_messages.get_mut(&story_full_id) {
                message_ids.remove(&message_id);
                if message_ids.is_empty() {
                    state.story_messages.remove(&story_full_id);
                }
            }
        })
        .await;
    }

    // ---------------------------------------------------------------
    // Viewers
    // ---------------------------------------------------------------

    /// Viewer list of an owned story. Fully cached ranges bypass the
    /// server.
    pub async fn get_story_viewers(
        &self,
        story_id: StoryId,
        offset: Option<StoryViewer>,
        limit: i32,
    ) -> ApiResult<(i32, Vec<StoryViewer>)> {
        let story_full_id = StoryFullId::new(self.my_id(), story_id);

        enum Plan {
            Done(ApiResult<(i32, Vec<StoryViewer>)>),
            Fetch,
        }
        let plan = self
            .with_state(|state, ctx| {
                let Some(story) = state.get_story(story_full_id) else {
                    return Plan::Done(Err(ApiError::story_not_found()));
                };
                if limit <= 0 {
                    return Plan::Done(Err(ApiError::limit_must_be_positive()));
                }
                if state.can_get_story_viewers(ctx, story_full_id, story).is_err()
                    || story.interaction_info.view_count == 0
                {
                    return Plan::Done(Ok((0, Vec::new())));
                }
                if let Some(cached) = state.viewers.get(&story_full_id) {
                    // The view counter refreshes every poll tick, so a
                    // cache that agrees with it (or any non-head range) is
                    // authoritative.
                    if !story.is_stub()
                        && (cached.total_count == story.interaction_info.view_count
                            || offset.is_some())
                    {
                        if let Some(viewers) = cached.get_sublist(offset.as_ref(), limit as usize)
                        {
                            return Plan::Done(Ok((cached.total_count, viewers)));
                        }
                    }
                }
                Plan::Fetch
            })
            .await;
        if let Plan::Done(result) = plan {
            return result;
        }

        let (offset_date, offset_user_id) = match &offset {
            Some(viewer) => (viewer.view_date, viewer.user_id),
            None => (0, UserId(0)),
        };
        let page = self
            .inner
            .deps
            .server
            .get_story_views_list(story_id, offset_date, offset_user_id, limit)
            .await?;
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        self.inner.deps.users.on_get_users(page.users.clone());

        self.with_state(|state, ctx| {
            if !state.have_story_with_content(story_full_id) {
                return Ok((0, Vec::new()));
            }
            let mut total_count = page.total_count;
            if total_count < page.viewers.len() as i32 {
                error!(
                    total_count,
                    received = page.viewers.len(),
                    "viewer total below the returned page size"
                );
                total_count = page.viewers.len() as i32;
            }
            let counter_moved = {
                let story = state
                    .stories
                    .get_mut(&story_full_id)
                    .expect("checked above");
                let moved = story.interaction_info.set_view_count(page.total_count);
                if moved && offset.is_none() {
                    story.interaction_info.set_recent_viewers(
                        page.viewers.iter().map(|viewer| viewer.user_id).collect(),
                    );
                }
                moved
            };
            if counter_moved {
                state.on_story_changed(ctx, story_full_id, true, true, false);
            }
            let cached = state.viewers.entry(story_full_id).or_default();
            cached.update_total_count(total_count);
            cached.add_sublist(offset, page.viewers.clone());
            Ok((total_count, page.viewers))
        })
        .await
    }

    // ---------------------------------------------------------------
    // Send, edit, delete
    // ---------------------------------------------------------------

    /// Posts a new story. Resolves as soon as the provisional record is
    /// queued; the server id arrives later through the update stream.
    pub async fn send_story(&self, new_story: NewStory) -> ApiResult<(StoryFullId, Story)> {
        let NewStory {
            content,
            caption,
            privacy_rules,
            active_period,
            is_pinned,
            protect_content,
        } = new_story;

        let allowed_for_tests = self.inner.deps.options.is_test_env()
            && TEST_ACTIVE_PERIODS.contains(&active_period);
        if active_period != FREE_ACTIVE_PERIOD && !allowed_for_tests {
            if !self.inner.deps.options.is_premium()
                || !PREMIUM_ACTIVE_PERIODS.contains(&active_period)
            {
                return Err(ApiError::invalid_active_period());
            }
        }

        let owner_id = self.my_id();
        let now = self.now();
        let story = Story {
            date: now as i32,
            expire_date: now as i32 + active_period,
            receive_date: now as i32,
            is_pinned,
            noforwards: protect_content,
            content: Some(content),
            caption,
            privacy_rules,
            ..Story::default()
        };

        let mut random_id: i64 = 0;
        while random_id == 0 {
            random_id = rand::thread_rng().gen();
        }

        let mut pending = self
            .with_state(|state, _ctx| {
                state.pipeline.send_count += 1;
                let send_num = state.pipeline.send_count;
                state.pipeline.yet_unsent.insert(send_num);
                PendingStory {
                    owner_id,
                    story_id: StoryId::NONE,
                    send_num,
                    random_id,
                    story: story.clone(),
                    log_event_id: 0,
                    was_reuploaded: false,
                }
            })
            .await;

        if let Some(persistence) = &self.inner.deps.persistence {
            let payload = SendStoryEvent {
                owner_id,
                random_id,
                story: story.clone(),
            }
            .encode();
            match persistence.binlog.add(logevent::SEND_STORY, &payload).await {
                Ok(log_event_id) => pending.log_event_id = log_event_id,
                Err(e) => warn!(error = %e, "failed to log story send"),
            }
        }

        info!(send_num = pending.send_num, "queued story send");
        self.do_send_story(pending, Vec::new()).await;
        Ok((StoryFullId::new(owner_id, StoryId::NONE), story))
    }

    /// Replaces the content and/or caption of a server-known owned story.
    /// Resolves when the server confirms; a superseding edit also resolves
    /// the earlier callers.
    pub async fn edit_story(
        &self,
        story_id: StoryId,
        content: Option<StoryContent>,
        caption: Option<FormattedText>,
    ) -> ApiResult<()> {
        let owner_id = self.my_id();
        let story_full_id = StoryFullId::new(owner_id, story_id);

        enum Plan {
            Done(ApiResult<()>),
            Run {
                pending: PendingStory,
                rx: oneshot::Receiver<ApiResult<()>>,
                log_event_id: u64,
                event: EditStoryEvent,
            },
        }
        let plan = self
            .with_state(|state, ctx| {
                if !state.have_story_with_content(story_full_id) {
                    return Plan::Done(Err(ApiError::story_not_found()));
                }
                if !story_id.is_server() {
                    return Plan::Done(Err(ApiError::story_not_editable()));
                }

                // An edit that would restore what is already visible is a
                // no-op for that part.
                let mut is_caption_edited = caption.is_some();
                if let Some(new_caption) = &caption {
                    let story_caption =
                        &state.get_story(story_full_id).expect("checked above").caption;
                    let visible_caption = match state.pipeline.being_edited.get(&story_full_id) {
                        Some(edited) if edited.edit_caption => &edited.caption,
                        _ => story_caption,
                    };
                    if visible_caption == new_caption {
                        is_caption_edited = false;
                    }
                }
                if content.is_none() && !is_caption_edited {
                    return Plan::Done(Ok(()));
                }

                let generation = {
                    let generation = state
                        .pipeline
                        .edit_generations
                        .entry(story_full_id)
                        .or_insert(0);
                    if content.is_some() {
                        *generation += 1;
                    }
                    if is_caption_edited {
                        *generation += 1;
                    }
                    *generation
                };

                let (tx, rx) = oneshot::channel();
                let (edit_content, edit_caption, caption_value, log_event_id) = {
                    let edited = state.pipeline.being_edited.entry(story_full_id).or_default();
                    if let Some(content) = content.clone() {
                        edited.content = Some(content);
                    }
                    if is_caption_edited {
                        edited.caption = caption.clone().unwrap_or_default();
                        edited.edit_caption = true;
                    }
                    edited.waiters.push(tx);
                    (
                        edited.content.clone(),
                        edited.edit_caption,
                        edited.caption.clone(),
                        edited.log_event_id,
                    )
                };

                state.pipeline.send_count += 1;
                let send_num = u32::MAX - state.pipeline.send_count;
                let mut provisional = Story::default();
                provisional.content = edit_content.clone();
                let pending = PendingStory {
                    owner_id,
                    story_id,
                    send_num,
                    random_id: generation,
                    story: provisional,
                    log_event_id: 0,
                    was_reuploaded: false,
                };

                // The edited preview becomes visible immediately.
                state.on_story_changed(ctx, story_full_id, true, true, false);

                Plan::Run {
                    pending,
                    rx,
                    log_event_id,
                    event: EditStoryEvent {
                        story_full_id,
                        content: edit_content,
                        edit_caption,
                        caption: caption_value,
                    },
                }
            })
            .await;

        let (pending, rx, log_event_id, event) = match plan {
            Plan::Done(result) => return result,
            Plan::Run {
                pending,
                rx,
                log_event_id,
                event,
            } => (pending, rx, log_event_id, event),
        };

        if let Some(persistence) = &self.inner.deps.persistence {
            let payload = event.encode();
            if log_event_id == 0 {
                match persistence.binlog.add(logevent::EDIT_STORY, &payload).await {
                    Ok(new_id) => {
                        self.with_state(|state, _ctx| {
                            if let Some(edited) =
                                state.pipeline.being_edited.get_mut(&story_full_id)
                            {
                                edited.log_event_id = new_id;
                            }
                        })
                        .await;
                    }
                    Err(e) => warn!(error = %e, "failed to log story edit"),
                }
            } else if let Err(e) = persistence
                .binlog
                .rewrite(log_event_id, logevent::EDIT_STORY, &payload)
                .await
            {
                warn!(error = %e, "failed to rewrite story edit log event");
            }
        }

        if pending.story.content.is_some() {
            self.do_send_story(pending, Vec::new()).await;
        } else {
            self.do_edit_story(None, pending, None).await;
        }

        rx.await.unwrap_or_else(|_| Err(ApiError::request_aborted()))
    }

    /// Deletes an owned story: optimistically locally, durably on the
    /// server.
    pub async fn delete_story(&self, story_id: StoryId) -> ApiResult<()> {
        let story_full_id = StoryFullId::new(self.my_id(), story_id);
        self.ensure_story_loaded(story_full_id).await;
        let exists = {
            let state = self.inner.state.lock().await;
            state.stories.contains_key(&story_full_id)
        };
        if !exists {
            return Err(ApiError::story_not_found());
        }
        if !story_id.is_server() {
            return Err(ApiError::new(400, "Invalid story identifier"));
        }
        self.delete_story_on_server(story_full_id, 0).await;
        Ok(())
    }

    pub async fn set_story_privacy_settings(
        &self,
        story_id: StoryId,
        privacy_rules: PrivacyRules,
    ) -> ApiResult<()> {
        let story_full_id = StoryFullId::new(self.my_id(), story_id);
        let exists = {
            let state = self.inner.state.lock().await;
            state.have_story_with_content(story_full_id)
        };
        if !exists {
            return Err(ApiError::story_not_found());
        }
        self.inner
            .deps
            .server
            .edit_story(crate::rpc::EditStoryRequest {
                story_id,
                content: None,
                input_file: None,
                caption: None,
                privacy_rules: Some(privacy_rules.clone()),
            })
            .await
            .or_else(|e| if e.is_story_not_modified() { Ok(None) } else { Err(e) })?;
        if self.is_closing() {
            return Ok(());
        }
        self.with_state(|state, ctx| {
            if let Some(story) = state.stories.get_mut(&story_full_id) {
                if story.privacy_rules != privacy_rules {
                    story.privacy_rules = privacy_rules;
                    state.on_story_changed(ctx, story_full_id, true, true, false);
                }
            }
        })
        .await;
        Ok(())
    }

    pub async fn toggle_story_is_pinned(
        &self,
        story_id: StoryId,
        is_pinned: bool,
    ) -> ApiResult<()> {
        let story_full_id = StoryFullId::new(self.my_id(), story_id);
        let exists = {
            let state = self.inner.state.lock().await;
            state.have_story_with_content(story_full_id)
        };
        if !exists {
            return Err(ApiError::story_not_found());
        }
        self.inner
            .deps
            .server
            .toggle_pinned(vec![story_id], is_pinned)
            .await?;
        if self.is_closing() {
            return Ok(());
        }
        self.with_state(|state, ctx| {
            if let Some(story) = state.stories.get_mut(&story_full_id) {
                story.is_pinned = is_pinned;
                state.on_story_changed(ctx, story_full_id, true, true, false);
            }
        })
        .await;
        Ok(())
    }

    /// Moves one owner's stories between Main and Archive.
    pub async fn toggle_dialog_stories_hidden(
        &self,
        owner_id: UserId,
        list_id: Option<StoryListId>,
    ) -> ApiResult<()> {
        self.check_story_sender(owner_id)?;
        let current = self
            .with_state(|state, ctx| state.subscribed_list_id(ctx, owner_id))
            .await;
        if list_id.is_some() && list_id == current {
            return Ok(());
        }
        let Some(list_id) = list_id else {
            return Err(ApiError::story_list_required());
        };
        self.inner
            .deps
            .server
            .toggle_stories_hidden(owner_id, list_id == StoryListId::Archive)
            .await
    }

    pub async fn report_story(
        &self,
        owner_id: UserId,
        story_id: StoryId,
        reason: ReportReason,
        message: String,
    ) -> ApiResult<()> {
        let story_full_id = StoryFullId::new(owner_id, story_id);
        self.ensure_story_loaded(story_full_id).await;
        let exists = {
            let state = self.inner.state.lock().await;
            state.stories.contains_key(&story_full_id)
        };
        if !exists {
            return Err(ApiError::story_not_found());
        }
        self.inner
            .deps
            .server
            .report_story(owner_id, vec![story_id], reason, message)
            .await
    }

    // ---------------------------------------------------------------
    // Server pushes
    // ---------------------------------------------------------------

    /// Ingests a pushed story item (created, changed or deleted).
    pub async fn on_server_story(&self, owner_id: UserId, item: StoryItem) {
        self.with_state(|state, ctx| {
            state.on_get_story_item(ctx, owner_id, item);
        })
        .await;
    }

    /// Ingests a pushed per-owner bundle with its users-list prefix.
    pub async fn on_server_owner_stories(&self, response: UserStoriesResponse) {
        self.inner.deps.users.on_get_users(response.users.clone());
        self.with_state(|state, ctx| {
            state.on_get_owner_stories(ctx, response.bundle);
        })
        .await;
    }

    /// Ingests a bare bundle without a users prefix (already resolved).
    pub async fn on_server_stories(&self, bundle: OwnerStories) {
        self.with_state(|state, ctx| {
            state.on_get_owner_stories(ctx, bundle);
        })
        .await;
    }

    /// The server reported a new read position for an owner.
    pub async fn on_server_read_stories(&self, owner_id: UserId, max_read_story_id: StoryId) {
        self.with_state(|state, ctx| {
            state.on_update_read_stories(ctx, owner_id, max_read_story_id);
        })
        .await;
    }

    /// An owner's directory record changed (contact status, premium,
    /// hidden flag); their list placement may move.
    pub async fn on_owner_updated(&self, owner_id: UserId) {
        self.with_state(|state, ctx| {
            state.on_active_stories_order_updated(ctx, owner_id);
        })
        .await;
    }
}
