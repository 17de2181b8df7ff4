//! Engine Lifecycle and Orchestration
//!
//! [`StoryEngine`] is a cloneable handle over the shared state. The
//! concurrency discipline is:
//!
//! - every mutation happens inside [`StoryEngine::with_state`], which holds
//!   the single state lock, hands mutators a [`Ctx`] and applies the
//!   collected [`Effect`]s once the lock is released;
//! - every continuation after a suspension point re-validates what it saw
//!   (story existence, edit generation, shutdown flag);
//! - background loops (timer wheel, expired sweep, interaction poll) are
//!   spawned by [`StoryEngine::start`] and stop when the close flag rises.

use crate::deps::Deps;
use crate::logevent::{
    self, DeleteStoryEvent, EditStoryEvent, LoadExpiringStoriesEvent, ReadStoriesEvent,
    SendStoryEvent,
};
use crate::options::{
    DEFAULT_LOADED_EXPIRED_STORIES, INTERACTION_INFO_UPDATE_PERIOD, MAX_POLLED_OWNED_STORIES,
    MAX_VIEWED_STORIES_PER_REQUEST, OPENED_STORY_POLL_PERIOD,
};
use crate::pipeline::{BeingEditedStory, PendingStory};
use crate::state::{Ctx, Effect, State};
use crate::timer::TimerKind;
use crate::update::{Publisher, Update};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storyline_core::codec;
use storyline_core::{ApiError, ApiResult, StoryFullId, StoryId, StoryListId, UserId};
use storyline_storage::Result as StorageResult;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, error, info, warn};

pub(crate) struct EngineInner {
    pub state: Mutex<State>,
    pub deps: Deps,
    pub publisher: Publisher,
    pub closing: AtomicBool,
    pub timer_wake: Notify,
}

/// Cloneable handle to the story engine.
#[derive(Clone)]
pub struct StoryEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl StoryEngine {
    /// Creates the engine and the outbound update stream.
    pub fn new(deps: Deps) -> (Self, UnboundedReceiver<Update>) {
        let (tx, rx) = unbounded_channel();
        let engine = Self {
            inner: Arc::new(EngineInner {
                state: Mutex::new(State::default()),
                deps,
                publisher: Publisher::new(tx),
                closing: AtomicBool::new(false),
                timer_wake: Notify::new(),
            }),
        };
        (engine, rx)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub(crate) fn now(&self) -> i64 {
        self.inner.deps.clock.now_unix()
    }

    /// Runs a mutation under the state lock and applies the collected
    /// effects afterwards. The lock never spans a suspension point.
    pub(crate) async fn with_state<R>(
        &self,
        f: impl FnOnce(&mut State, &mut Ctx<'_>) -> R,
    ) -> R {
        let mut effects = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            let options = &self.inner.deps.options;
            let mut ctx = Ctx {
                now: self.now(),
                my_id: self.inner.deps.users.my_id(),
                changelog_user_id: options.stories_changelog_user_id(),
                viewers_expiration_delay: options.story_viewers_expiration_delay(),
                use_db: self.inner.deps.use_db(),
                users: self.inner.deps.users.as_ref(),
                publisher: &self.inner.publisher,
                effects: &mut effects,
            };
            f(&mut state, &mut ctx)
        };
        self.apply_effects(effects).await;
        self.inner.timer_wake.notify_one();
        result
    }

    async fn apply_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::SaveStory {
                    story_full_id,
                    expires_at,
                    blob,
                } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence.db.add_story(story_full_id, expires_at, 0, &blob).await
                        {
                            warn!(%story_full_id, error = %e, "failed to save story");
                        }
                    }
                }
                Effect::DeleteStoryFromDb { story_full_id } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence.db.delete_story(story_full_id).await {
                            warn!(%story_full_id, error = %e, "failed to delete story row");
                        }
                    }
                }
                Effect::SaveActiveStories {
                    owner_id,
                    list_id,
                    order,
                    blob,
                } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence
                            .db
                            .add_active_stories(owner_id, list_id, order, &blob)
                            .await
                        {
                            warn!(owner = owner_id.0, error = %e, "failed to save active stories");
                        }
                    }
                }
                Effect::DeleteActiveStories { owner_id } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence.db.delete_active_stories(owner_id).await {
                            warn!(owner = owner_id.0, error = %e, "failed to delete active stories row");
                        }
                    }
                }
                Effect::SaveListState { list_id, blob } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence
                            .db
                            .add_active_story_list_state(list_id, &blob)
                            .await
                        {
                            warn!(%list_id, error = %e, "failed to save list state");
                        }
                    }
                }
                Effect::EraseLogEvent { log_event_id } => {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        if let Err(e) = persistence.binlog.erase(log_event_id).await {
                            warn!(log_event_id, error = %e, "failed to erase binlog event");
                        }
                    }
                }
                Effect::RefreshStoryMessages {
                    story_full_id,
                    message_ids,
                } => {
                    self.inner
                        .deps
                        .dialogs
                        .refresh_story_messages(story_full_id, &message_ids);
                }
                Effect::ChangeStoryFiles {
                    story_full_id,
                    old_file_ids,
                    new_file_ids,
                } => {
                    // Unique old files are gone for good; the file layer is
                    // told so external refresh paths keep working.
                    let removed: Vec<_> = old_file_ids
                        .iter()
                        .copied()
                        .filter(|file_id| !new_file_ids.contains(file_id))
                        .collect();
                    if !removed.is_empty() {
                        self.inner.deps.files.delete_files(&removed);
                    }
                    let source = {
                        let mut state = self.inner.state.lock().await;
                        match state.file_sources.get(&story_full_id) {
                            Some(source) => *source,
                            None => {
                                let source = self
                                    .inner
                                    .deps
                                    .files
                                    .create_story_file_source(story_full_id);
                                state.file_sources.insert(story_full_id, source);
                                source
                            }
                        }
                    };
                    self.inner
                        .deps
                        .files
                        .change_story_files(source, &old_file_ids, &new_file_ids);
                }
                Effect::DeleteFiles { file_ids } => {
                    self.inner.deps.files.delete_files(&file_ids);
                }
                Effect::CheckLocalFiles { file_ids } => {
                    for file_id in file_ids {
                        self.inner.deps.files.check_local_location(file_id);
                    }
                }
                Effect::ReloadStory { story_full_id } => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        let _ = engine.reload_story(story_full_id, false).await;
                    });
                }
                Effect::LoadExpiringStories { owner_id } => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.load_dialog_expiring_stories(owner_id, 0).await;
                    });
                }
                Effect::SendReadStories { owner_id } => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.run_read_stories(owner_id).await;
                    });
                }
                Effect::SendStoryViews { owner_id } => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.run_story_views(owner_id).await;
                    });
                }
                Effect::FetchOwnedViews { story_ids } => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.fetch_owned_views(story_ids).await;
                    });
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Restores persisted list state, replays the binlog and spawns the
    /// background loops. Call once after construction.
    pub async fn start(&self) -> StorageResult<()> {
        if let Some(persistence) = self.inner.deps.persistence.clone() {
            for list_id in StoryListId::ALL {
                match persistence.db.get_active_story_list_state(list_id).await? {
                    Some(blob) => match codec::decode_story_list(&blob) {
                        Ok(saved) => {
                            info!(%list_id, state = %saved.state, "restored list state");
                            self.with_state(|state, _ctx| state.restore_story_list(list_id, saved))
                                .await;
                        }
                        Err(e) => error!(%list_id, error = %e, "invalid persisted list state"),
                    },
                    None => {}
                }
            }
            self.replay_binlog().await?;
        }

        self.try_synchronize_archive_all_stories();

        let engine = self.clone();
        tokio::spawn(async move { engine.run_timer_loop().await });
        let engine = self.clone();
        tokio::spawn(async move { engine.run_expired_sweep_loop().await });
        let engine = self.clone();
        tokio::spawn(async move { engine.run_interaction_poll_loop().await });

        Ok(())
    }

    /// Raises the close flag. Callbacks observing it return without
    /// completing external promises; binlog events of unfinished operations
    /// stay behind for the next run.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::Release);
        self.inner.timer_wake.notify_waiters();
    }

    /// Fails all outstanding reload and list-load waiters with a
    /// transport-aborted error, then closes.
    pub async fn hangup(&self) {
        let waiters = {
            let mut state = self.inner.state.lock().await;
            let mut waiters: Vec<oneshot::Sender<ApiResult<()>>> = Vec::new();
            for (_, mut queue) in state.reload_waiters.drain() {
                waiters.append(&mut queue);
            }
            for list in &mut state.lists {
                waiters.append(&mut list.load_waiters);
                list.is_loading = false;
            }
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(Err(ApiError::request_aborted()));
        }
        self.close();
    }

    // ---------------------------------------------------------------
    // Timer wheel
    // ---------------------------------------------------------------

    async fn run_timer_loop(&self) {
        loop {
            if self.is_closing() {
                return;
            }
            let next_deadline = {
                let state = self.inner.state.lock().await;
                state.timers.next_deadline()
            };
            let sleep = match next_deadline {
                // Cap the sleep so wall-clock jumps are noticed.
                Some(deadline) => Duration::from_secs((deadline - self.now()).clamp(0, 3600) as u64),
                None => Duration::from_secs(3600),
            };
            tokio::select! {
                _ = self.inner.timer_wake.notified() => {}
                _ = tokio::time::sleep(sleep) => {
                    self.tick_timers().await;
                }
            }
        }
    }

    /// Fires every timer whose wall-clock deadline has passed. The loop
    /// calls this automatically; hosts with a paused runtime may drive it
    /// manually.
    pub async fn tick_timers(&self) {
        if self.is_closing() {
            return;
        }
        let due = self
            .with_state(|state, ctx| state.timers.pop_due(ctx.now))
            .await;
        for (kind, global_id) in due {
            match kind {
                TimerKind::Reload => self.on_story_reload_timeout(global_id).await,
                TimerKind::Expire => self.on_story_expire_timeout(global_id).await,
                TimerKind::ViewersExpire => self.on_story_viewers_expire_timeout(global_id).await,
            }
            if self.is_closing() {
                return;
            }
        }
    }

    async fn on_story_reload_timeout(&self, global_id: storyline_core::GlobalStoryId) {
        let story_full_id = self
            .with_state(|state, ctx| {
                let story_full_id = state.registry.resolve(global_id)?;
                if state.stories.contains_key(&story_full_id)
                    && state.opened.contains_key(&story_full_id)
                {
                    // Re-arm before the reload so a slow server cannot stop
                    // the poll.
                    state
                        .timers
                        .reload
                        .set(global_id, ctx.now + OPENED_STORY_POLL_PERIOD);
                    Some(story_full_id)
                } else {
                    debug!(global_id = global_id.0, "no need to reload");
                    None
                }
            })
            .await;
        if let Some(story_full_id) = story_full_id {
            let _ = self.reload_story(story_full_id, false).await;
        }
    }

    async fn on_story_expire_timeout(&self, global_id: storyline_core::GlobalStoryId) {
        self.with_state(|state, ctx| {
            let Some(story_full_id) = state.registry.resolve(global_id) else {
                return;
            };
            let Some(story) = state.stories.get(&story_full_id) else {
                return;
            };
            if story.is_active(ctx.now) {
                // The deadline was computed against a different wall clock.
                debug!(%story_full_id, "expiry timer fired early, re-arming");
                state.on_story_changed(ctx, story_full_id, false, false, false);
                return;
            }
            info!(%story_full_id, "story expired");
            let owner_id = story_full_id.owner_id;
            if !ctx.is_owned(owner_id) && !story.is_stub() && !story.is_pinned {
                // Expired foreign non-pinned stories disappear entirely.
                state.on_delete_story(ctx, story_full_id);
            } else if state.have_story_with_content(story_full_id) {
                // Retained: publish the activity flip if anyone saw it.
                if state
                    .get_story(story_full_id)
                    .map_or(false, |s| s.is_update_sent)
                {
                    state.publish_story(ctx, story_full_id);
                }
            }
            if let Some(active) = state.active.get(&owner_id) {
                if active.story_ids.contains(&story_full_id.story_id) {
                    let story_ids = active.story_ids.clone();
                    let max_read_story_id = active.max_read_story_id;
                    state.on_update_active_stories(ctx, owner_id, max_read_story_id, story_ids, false);
                }
            }
        })
        .await;
    }

    async fn on_story_viewers_expire_timeout(&self, global_id: storyline_core::GlobalStoryId) {
        self.with_state(|state, ctx| {
            let Some(story_full_id) = state.registry.resolve(global_id) else {
                return;
            };
            let Some(story) = state.stories.get(&story_full_id) else {
                return;
            };
            if state.can_get_story_viewers(ctx, story_full_id, story).is_ok() {
                debug!(%story_full_id, "viewers timer fired early, re-arming");
                state.on_story_changed(ctx, story_full_id, false, false, false);
                return;
            }
            info!(%story_full_id, "viewers window closed");
            if !story.is_stub() && story.is_update_sent {
                state.publish_story(ctx, story_full_id);
            }
            state.viewers.remove(&story_full_id);
        })
        .await;
    }

    // ---------------------------------------------------------------
    // Database loading
    // ---------------------------------------------------------------

    /// Loads a story row into memory unless it is already there or known
    /// unusable.
    pub(crate) async fn ensure_story_loaded(&self, story_full_id: StoryFullId) {
        let needed = {
            let state = self.inner.state.lock().await;
            self.inner.deps.use_db()
                && !state.have_story_with_content(story_full_id)
                && !state.registry.has_failed_to_load(story_full_id)
                && !state.registry.is_deleted(story_full_id)
                && !state.registry.is_inaccessible(story_full_id)
        };
        if !needed {
            return;
        }
        let persistence = match &self.inner.deps.persistence {
            Some(persistence) => persistence.clone(),
            None => return,
        };
        match persistence.db.get_story(story_full_id).await {
            Ok(Some(blob)) => {
                self.with_state(|state, ctx| {
                    state.apply_db_story_row(ctx, story_full_id, &blob);
                })
                .await;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%story_full_id, error = %e, "story row read failed");
                self.with_state(|state, _ctx| {
                    state.registry.mark_failed_to_load(story_full_id);
                })
                .await;
            }
        }
    }

    /// Loads one owner's active-stories row into memory if absent.
    pub(crate) async fn ensure_active_loaded(&self, owner_id: UserId) {
        let needed = {
            let state = self.inner.state.lock().await;
            self.inner.deps.use_db()
                && !state.active.contains_key(&owner_id)
                && !state.failed_to_load_active.contains(&owner_id)
        };
        if !needed {
            return;
        }
        let persistence = match &self.inner.deps.persistence {
            Some(persistence) => persistence.clone(),
            None => return,
        };
        match persistence.db.get_active_stories(owner_id).await {
            Ok(Some(blob)) => match codec::decode_active_stories(&blob) {
                Ok(saved) => {
                    self.with_state(|state, ctx| {
                        if !state.active.contains_key(&owner_id) {
                            state.on_get_active_stories_from_database(ctx, owner_id, saved);
                        }
                    })
                    .await;
                }
                Err(e) => {
                    warn!(owner = owner_id.0, error = %e, "invalid active stories row");
                    if let Err(e) = persistence.db.delete_active_stories(owner_id).await {
                        warn!(owner = owner_id.0, error = %e, "failed to delete bad row");
                    }
                }
            },
            Ok(None) => {
                self.with_state(|state, _ctx| {
                    state.failed_to_load_active.insert(owner_id);
                })
                .await;
            }
            Err(e) => warn!(owner = owner_id.0, error = %e, "active stories read failed"),
        }
    }

    // ---------------------------------------------------------------
    // Reloading
    // ---------------------------------------------------------------

    /// Reloads one story from the server. Concurrent reloads of the same
    /// story share a single RPC; inaccessible stories are rate-limited.
    pub(crate) fn reload_story(
        &self,
        story_full_id: StoryFullId,
        want_result: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ApiResult<()>> + Send + '_>> {
        Box::pin(self.reload_story_inner(story_full_id, want_result))
    }

    async fn reload_story_inner(
        &self,
        story_full_id: StoryFullId,
        want_result: bool,
    ) -> ApiResult<()> {
        enum Plan {
            Done(ApiResult<()>),
            Wait(oneshot::Receiver<ApiResult<()>>),
            Run,
        }
        let plan = self
            .with_state(|state, ctx| {
                if state.registry.is_deleted(story_full_id) {
                    return Plan::Done(Ok(()));
                }
                if let Some(last) = state.registry.inaccessible_since(story_full_id) {
                    if last > 0 && last >= ctx.now - OPENED_STORY_POLL_PERIOD / 2 {
                        return Plan::Done(Ok(()));
                    }
                }
                if !story_full_id.story_id.is_server() {
                    return Plan::Done(Err(ApiError::new(400, "Invalid story identifier")));
                }
                // A present (possibly empty) waiter list marks an in-flight
                // reload; followers join it instead of issuing another RPC.
                match state.reload_waiters.get_mut(&story_full_id) {
                    None => {
                        state.reload_waiters.insert(story_full_id, Vec::new());
                        Plan::Run
                    }
                    Some(waiters) if want_result => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Plan::Wait(rx)
                    }
                    Some(_) => Plan::Done(Ok(())),
                }
            })
            .await;

        match plan {
            Plan::Done(result) => result,
            Plan::Wait(rx) => rx.await.unwrap_or_else(|_| Err(ApiError::request_aborted())),
            Plan::Run => {
                debug!(%story_full_id, "reloading story");
                let result = self
                    .inner
                    .deps
                    .server
                    .get_stories_by_id(story_full_id.owner_id, vec![story_full_id.story_id])
                    .await;
                let outcome = match result {
                    Ok(page) => {
                        self.inner.deps.users.on_get_users(page.users.clone());
                        self.with_state(|state, ctx| {
                            state.on_get_story_page(
                                ctx,
                                story_full_id.owner_id,
                                &[story_full_id.story_id],
                                page,
                            );
                        })
                        .await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                if self.is_closing() {
                    return outcome;
                }
                let waiters = self
                    .with_state(|state, _ctx| {
                        state
                            .reload_waiters
                            .remove(&story_full_id)
                            .unwrap_or_default()
                    })
                    .await;
                for waiter in waiters {
                    let _ = waiter.send(outcome.clone());
                }
                outcome
            }
        }
    }

    /// Schedules a per-owner active-set reload, deduplicated per owner and
    /// backed by a binlog event so it survives restarts.
    pub(crate) fn load_dialog_expiring_stories(
        &self,
        owner_id: UserId,
        log_event_id: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.load_dialog_expiring_stories_inner(owner_id, log_event_id))
    }

    async fn load_dialog_expiring_stories_inner(&self, owner_id: UserId, log_event_id: u64) {
        let run = self
            .with_state(|state, ctx| {
                if state.load_expiring_log_ids.contains_key(&owner_id) {
                    if log_event_id != 0 {
                        ctx.effects.push(Effect::EraseLogEvent { log_event_id });
                    }
                    return false;
                }
                state.load_expiring_log_ids.insert(owner_id, log_event_id);
                true
            })
            .await;
        if !run {
            return;
        }

        let mut log_event_id = log_event_id;
        if log_event_id == 0 {
            if let Some(persistence) = &self.inner.deps.persistence {
                let payload = LoadExpiringStoriesEvent { owner_id }.encode();
                match persistence
                    .binlog
                    .add(logevent::LOAD_DIALOG_EXPIRING_STORIES, &payload)
                    .await
                {
                    Ok(id) => {
                        log_event_id = id;
                        self.with_state(|state, _ctx| {
                            state.load_expiring_log_ids.insert(owner_id, id);
                        })
                        .await;
                    }
                    Err(e) => warn!(owner = owner_id.0, error = %e, "failed to log expiring reload"),
                }
            }
        }

        let _ = self.fetch_dialog_expiring_stories(owner_id).await;

        if self.is_closing() {
            return;
        }
        self.with_state(|state, ctx| {
            state.load_expiring_log_ids.remove(&owner_id);
            if log_event_id != 0 {
                ctx.effects.push(Effect::EraseLogEvent { log_event_id });
            }
        })
        .await;
    }

    /// Fetches one owner's active set unless it is already known.
    pub(crate) async fn fetch_dialog_expiring_stories(
        &self,
        owner_id: UserId,
    ) -> ApiResult<Option<crate::update::ActiveStoriesView>> {
        self.ensure_active_loaded(owner_id).await;
        let known = {
            let state = self.inner.state.lock().await;
            state.active.contains_key(&owner_id)
        };
        if known {
            let state = self.inner.state.lock().await;
            return Ok(state.active_view(owner_id));
        }
        let response = self.inner.deps.server.get_user_stories(owner_id).await?;
        self.inner.deps.users.on_get_users(response.users.clone());
        if self.is_closing() {
            return Err(ApiError::request_aborted());
        }
        self.with_state(|state, ctx| {
            state.on_get_owner_stories(ctx, response.bundle);
        })
        .await;
        let state = self.inner.state.lock().await;
        Ok(state.active_view(owner_id))
    }

    // ---------------------------------------------------------------
    // Read & view batching
    // ---------------------------------------------------------------

    pub(crate) fn run_read_stories(
        &self,
        owner_id: UserId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.run_read_stories_inner(owner_id))
    }

    async fn run_read_stories_inner(&self, owner_id: UserId) {
        loop {
            if self.is_closing() {
                return;
            }
            let job = {
                let mut state = self.inner.state.lock().await;
                let max_story_id = state.current_max_read(owner_id);
                if !max_story_id.is_server() {
                    state.pending_reads.remove(&owner_id);
                    return;
                }
                let pending = state.pending_reads.entry(owner_id).or_default();
                if pending.in_flight {
                    pending.queued_max = Some(pending.queued_max.unwrap_or(StoryId::NONE).max(max_story_id));
                    return;
                }
                pending.in_flight = true;
                Some((max_story_id, pending.log_event_id))
            };
            let Some((max_story_id, mut log_event_id)) = job else {
                return;
            };

            if let Some(persistence) = &self.inner.deps.persistence {
                let payload = ReadStoriesEvent {
                    owner_id,
                    max_story_id,
                }
                .encode();
                // One pending log event per owner: rewrite instead of
                // stacking duplicates.
                let written = if log_event_id == 0 {
                    persistence.binlog.add(logevent::READ_STORIES_ON_SERVER, &payload).await
                } else {
                    persistence
                        .binlog
                        .rewrite(log_event_id, logevent::READ_STORIES_ON_SERVER, &payload)
                        .await
                        .map(|_| log_event_id)
                };
                match written {
                    Ok(id) => {
                        log_event_id = id;
                        let mut state = self.inner.state.lock().await;
                        if let Some(pending) = state.pending_reads.get_mut(&owner_id) {
                            pending.log_event_id = id;
                        }
                    }
                    Err(e) => warn!(owner = owner_id.0, error = %e, "failed to log read stories"),
                }
            }

            if let Err(e) = self
                .inner
                .deps
                .server
                .read_stories(owner_id, max_story_id)
                .await
            {
                warn!(owner = owner_id.0, error = %e, "read stories failed");
            }
            if self.is_closing() {
                return;
            }

            let again = {
                let mut state = self.inner.state.lock().await;
                let Some(pending) = state.pending_reads.get_mut(&owner_id) else {
                    return;
                };
                pending.in_flight = false;
                match pending.queued_max.take() {
                    Some(queued) if queued > max_story_id => true,
                    _ => {
                        pending.log_event_id = 0;
                        state.pending_reads.remove(&owner_id);
                        false
                    }
                }
            };
            if !again {
                if log_event_id != 0 {
                    if let Some(persistence) = &self.inner.deps.persistence {
                        let _ = persistence.binlog.erase(log_event_id).await;
                    }
                }
                return;
            }
        }
    }

    pub(crate) fn run_story_views(
        &self,
        owner_id: UserId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.run_story_views_inner(owner_id))
    }

    async fn run_story_views_inner(&self, owner_id: UserId) {
        loop {
            if self.is_closing() {
                return;
            }
            let batch = {
                let mut state = self.inner.state.lock().await;
                let Some(views) = state.pending_views.get_mut(&owner_id) else {
                    return;
                };
                if views.has_query {
                    return;
                }
                let mut batch = Vec::new();
                while batch.len() < MAX_VIEWED_STORIES_PER_REQUEST {
                    match views.story_ids.pop_first() {
                        Some(story_id) => batch.push(story_id),
                        None => break,
                    }
                }
                if batch.is_empty() {
                    state.pending_views.remove(&owner_id);
                    return;
                }
                views.has_query = true;
                batch
            };

            if let Err(e) = self
                .inner
                .deps
                .server
                .increment_story_views(owner_id, batch)
                .await
            {
                // Opportunistic counters: log and move on.
                debug!(owner = owner_id.0, error = %e, "increment story views failed");
            }
            if self.is_closing() {
                return;
            }
            let done = {
                let mut state = self.inner.state.lock().await;
                let Some(views) = state.pending_views.get_mut(&owner_id) else {
                    return;
                };
                views.has_query = false;
                if views.story_ids.is_empty() {
                    state.pending_views.remove(&owner_id);
                    true
                } else {
                    false
                }
            };
            if done {
                return;
            }
        }
    }

    pub(crate) fn fetch_owned_views(
        &self,
        story_ids: Vec<StoryId>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.fetch_owned_views_inner(story_ids))
    }

    async fn fetch_owned_views_inner(&self, story_ids: Vec<StoryId>) {
        if story_ids.is_empty() {
            return;
        }
        match self.inner.deps.server.get_stories_views(story_ids.clone()).await {
            Ok(response) => {
                self.inner.deps.users.on_get_users(response.users.clone());
                if self.is_closing() {
                    return;
                }
                self.with_state(|state, ctx| {
                    state.on_get_story_views(ctx, &story_ids, response.views);
                })
                .await;
            }
            Err(e) => debug!(error = %e, "story views fetch failed"),
        }
    }

    async fn run_interaction_poll_loop(&self) {
        loop {
            tokio::time::sleep(INTERACTION_INFO_UPDATE_PERIOD).await;
            if self.is_closing() {
                return;
            }
            let story_ids = {
                let state = self.inner.state.lock().await;
                state.opened_owned_story_ids(MAX_POLLED_OWNED_STORIES)
            };
            if !story_ids.is_empty() {
                self.fetch_owned_views(story_ids).await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Expired-row sweep
    // ---------------------------------------------------------------

    async fn run_expired_sweep_loop(&self) {
        let Some(persistence) = self.inner.deps.persistence.clone() else {
            return;
        };
        loop {
            if self.is_closing() {
                return;
            }
            let limit = {
                let state = self.inner.state.lock().await;
                state.sweep_limit
            };
            debug!(limit, "loading expired story rows");
            let rows = match persistence.db.get_expiring_stories(self.now() - 1, limit).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "expiry sweep query failed");
                    Vec::new()
                }
            };
            if self.is_closing() {
                return;
            }
            let full_page = rows.len() as u32 == limit && limit > 0;
            self.with_state(|state, ctx| {
                for row in &rows {
                    state.sweep_db_story_row(ctx, row.story_full_id, &row.data);
                }
                if full_page {
                    state.sweep_limit = state.sweep_limit.saturating_mul(2);
                } else {
                    state.sweep_limit = DEFAULT_LOADED_EXPIRED_STORIES;
                }
            })
            .await;

            // A full page means there is likely more behind it; otherwise
            // back off with jitter so clients do not sweep in lockstep.
            let delay = if full_page {
                Duration::from_secs(1)
            } else {
                Duration::from_secs(rand::thread_rng().gen_range(300..=420))
            };
            debug!(received = rows.len(), ?delay, "expiry sweep pass finished");
            tokio::time::sleep(delay).await;
        }
    }

    // ---------------------------------------------------------------
    // Archive-all synchronization
    // ---------------------------------------------------------------

    /// Pushes the archive-all flag to the server while the transient
    /// synchronization option is set.
    pub(crate) fn try_synchronize_archive_all_stories(&self) {
        if self.is_closing() {
            return;
        }
        if !self.inner.deps.options.need_synchronize_archive_all_stories() {
            return;
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let run = engine
                .with_state(|state, _ctx| {
                    if state.synchronizing_archive {
                        return false;
                    }
                    state.synchronizing_archive = true;
                    true
                })
                .await;
            if !run {
                return;
            }
            let archive_all = engine.inner.deps.options.archive_all_stories();
            let result = engine
                .inner
                .deps
                .server
                .toggle_all_stories_hidden(archive_all)
                .await;
            if engine.is_closing() {
                return;
            }
            engine
                .with_state(|state, _ctx| state.synchronizing_archive = false)
                .await;
            let current = engine.inner.deps.options.archive_all_stories();
            if current != archive_all {
                // The option flipped mid-flight; push again.
                engine.try_synchronize_archive_all_stories();
                return;
            }
            match result {
                Ok(()) => engine
                    .inner
                    .deps
                    .options
                    .set_need_synchronize_archive_all_stories(false),
                Err(e) => warn!(error = %e, "archive-all synchronization failed"),
            }
        });
    }

    // ---------------------------------------------------------------
    // Binlog replay
    // ---------------------------------------------------------------

    async fn replay_binlog(&self) -> StorageResult<()> {
        let persistence = match self.inner.deps.persistence.clone() {
            Some(persistence) => persistence,
            None => return Ok(()),
        };
        let events = persistence.binlog.events().await;
        info!(events = events.len(), "replaying binlog");
        for event in events {
            match event.kind {
                logevent::DELETE_STORY_ON_SERVER => {
                    let Ok(parsed) = DeleteStoryEvent::decode(&event.data) else {
                        warn!(event_id = event.id, "bad delete event, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    if parsed.story_full_id.owner_id != self.inner.deps.users.my_id() {
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    }
                    self.delete_story_on_server(parsed.story_full_id, event.id).await;
                }
                logevent::READ_STORIES_ON_SERVER => {
                    let Ok(parsed) = ReadStoriesEvent::decode(&event.data) else {
                        warn!(event_id = event.id, "bad read event, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    if !self.inner.deps.dialogs.have_dialog(parsed.owner_id) {
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    }
                    self.ensure_active_loaded(parsed.owner_id).await;
                    self.with_state(|state, ctx| {
                        state.on_update_read_stories(ctx, parsed.owner_id, parsed.max_story_id);
                        if let Some(pending) = state.pending_reads.get_mut(&parsed.owner_id) {
                            pending.log_event_id = event.id;
                        } else {
                            let mut pending = crate::batcher::PendingRead::default();
                            pending.log_event_id = event.id;
                            state.pending_reads.insert(parsed.owner_id, pending);
                        }
                        ctx.effects.push(Effect::SendReadStories {
                            owner_id: parsed.owner_id,
                        });
                    })
                    .await;
                }
                logevent::LOAD_DIALOG_EXPIRING_STORIES => {
                    let Ok(parsed) = LoadExpiringStoriesEvent::decode(&event.data) else {
                        warn!(event_id = event.id, "bad expiring-reload event, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    if !self.inner.deps.dialogs.have_dialog(parsed.owner_id) {
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    }
                    let engine = self.clone();
                    let owner_id = parsed.owner_id;
                    let event_id = event.id;
                    tokio::spawn(async move {
                        engine.load_dialog_expiring_stories(owner_id, event_id).await;
                    });
                }
                logevent::SEND_STORY => {
                    let Ok(parsed) = SendStoryEvent::decode(&event.data) else {
                        error!(event_id = event.id, "bad send event, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    if matches!(parsed.story.content, Some(storyline_core::StoryContent::Unsupported) | None) {
                        error!(event_id = event.id, "unsupported pending story content, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    }
                    let pending = self
                        .with_state(|state, _ctx| {
                            state.pipeline.send_count += 1;
                            let send_num = state.pipeline.send_count;
                            state.pipeline.yet_unsent.insert(send_num);
                            PendingStory {
                                owner_id: parsed.owner_id,
                                story_id: StoryId::NONE,
                                send_num,
                                random_id: parsed.random_id,
                                story: parsed.story.clone(),
                                log_event_id: event.id,
                                was_reuploaded: false,
                            }
                        })
                        .await;
                    self.do_send_story(pending, Vec::new()).await;
                }
                logevent::EDIT_STORY => {
                    let Ok(parsed) = EditStoryEvent::decode(&event.data) else {
                        error!(event_id = event.id, "bad edit event, erasing");
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    self.ensure_story_loaded(parsed.story_full_id).await;
                    let pending = self
                        .with_state(|state, _ctx| {
                            if !state.have_story_with_content(parsed.story_full_id) {
                                info!(story = %parsed.story_full_id, "edited story is gone, dropping event");
                                return None;
                            }
                            if state.pipeline.being_edited.contains_key(&parsed.story_full_id) {
                                info!(story = %parsed.story_full_id, "outdated edit event, dropping");
                                return None;
                            }
                            state.pipeline.send_count += 1;
                            let send_num = u32::MAX - state.pipeline.send_count;
                            let generation = state
                                .pipeline
                                .edit_generations
                                .entry(parsed.story_full_id)
                                .or_insert(0);
                            *generation += 1;
                            let generation = *generation;
                            let mut story = storyline_core::Story::default();
                            story.content = parsed.content.clone();
                            state.pipeline.being_edited.insert(
                                parsed.story_full_id,
                                BeingEditedStory {
                                    content: parsed.content.clone(),
                                    caption: parsed.caption.clone(),
                                    edit_caption: parsed.edit_caption,
                                    log_event_id: event.id,
                                    waiters: Vec::new(),
                                },
                            );
                            Some(PendingStory {
                                owner_id: parsed.story_full_id.owner_id,
                                story_id: parsed.story_full_id.story_id,
                                send_num,
                                random_id: generation,
                                story,
                                log_event_id: 0,
                                was_reuploaded: false,
                            })
                        })
                        .await;
                    let Some(pending) = pending else {
                        persistence.binlog.erase(event.id).await?;
                        continue;
                    };
                    if pending.story.content.is_some() {
                        self.do_send_story(pending, Vec::new()).await;
                    } else {
                        self.do_edit_story(None, pending, None).await;
                    }
                }
                kind => {
                    warn!(event_id = event.id, kind, "unknown binlog event, erasing");
                    persistence.binlog.erase(event.id).await?;
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Deletion
    // ---------------------------------------------------------------

    /// Optimistic local delete plus the durable server delete.
    pub(crate) async fn delete_story_on_server(&self, story_full_id: StoryFullId, log_event_id: u64) {
        info!(%story_full_id, "deleting story on server");
        let mut log_event_id = log_event_id;
        if log_event_id == 0 {
            if let Some(persistence) = &self.inner.deps.persistence {
                let payload = DeleteStoryEvent { story_full_id }.encode();
                match persistence.binlog.add(logevent::DELETE_STORY_ON_SERVER, &payload).await {
                    Ok(id) => log_event_id = id,
                    Err(e) => warn!(error = %e, "failed to log story deletion"),
                }
            }
        }

        self.with_state(|state, ctx| {
            state.registry.mark_deleted(story_full_id);
            state.on_delete_story(ctx, story_full_id);
        })
        .await;

        let result = self
            .inner
            .deps
            .server
            .delete_stories(vec![story_full_id.story_id])
            .await;
        if let Err(e) = &result {
            warn!(%story_full_id, error = %e, "server delete failed");
        }
        if self.is_closing() && result.is_err() {
            // Keep the log event; replay retries after restart.
            return;
        }
        if log_event_id != 0 {
            if let Some(persistence) = &self.inner.deps.persistence {
                let _ = persistence.binlog.erase(log_event_id).await;
            }
        }
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    /// The updates that reconstruct the externally visible list state for a
    /// late subscriber.
    pub async fn current_state_updates(&self) -> Vec<Update> {
        let state = self.inner.state.lock().await;
        let mut updates = Vec::new();
        for owner_id in state.active.keys() {
            updates.push(Update::ChatActiveStories {
                owner_id: *owner_id,
                active: state.active_view(*owner_id),
            });
        }
        for list_id in StoryListId::ALL {
            let list = state.list(list_id);
            if list.sent_total_count != -1 {
                updates.push(Update::StoryListChatCount {
                    list_id,
                    count: list.sent_total_count,
                });
            }
        }
        updates
    }
}
