//! Send/Edit Pipeline
//!
//! Drives the external upload service and the send/edit RPCs. The design
//! constraints:
//!
//! - **FIFO sends**: new stories dispatch in strictly ascending `send_num`
//!   with at most one send RPC in flight, so the server observes the exact
//!   composition order.
//! - **Edit preemption**: edits key their uploads with `u32::MAX − n`, so
//!   the upload layer prioritises them, and they bypass the send queue
//!   entirely once uploaded.
//! - **Generations**: each accepted edit bumps the story's edit generation;
//!   a completion whose `random_id` no longer matches the current
//!   generation is discarded without touching the store.
//! - **Restart safety**: a send or edit lives in the binlog from before its
//!   upload starts until its server response lands.
//!
//! Upload failure ladder: missing parts are re-uploaded selectively; a
//! "server already has the bytes" answer invalidates the local file
//! reference and forces exactly one full re-upload; a second such answer,
//! or a web remote, is fatal for that operation.

use crate::engine::StoryEngine;
use crate::rpc::{EditStoryRequest, SendStoryRequest};
use crate::state::Effect;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use storyline_core::{
    ApiError, ApiResult, FileId, FormattedText, Story, StoryContent, StoryFullId, StoryId, UserId,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// One queued send or edit.
#[derive(Debug, Clone)]
pub(crate) struct PendingStory {
    pub owner_id: UserId,
    /// `NONE` for a new story; the server id for an edit.
    pub story_id: StoryId,
    /// Dispatch key: ascending for sends, `u32::MAX − n` for edits.
    pub send_num: u32,
    /// Sends: the non-zero wire dedup id. Edits: the generation this
    /// attempt belongs to.
    pub random_id: i64,
    /// The provisional record (for edits: only the replacement content).
    pub story: Story,
    pub log_event_id: u64,
    pub was_reuploaded: bool,
}

impl PendingStory {
    fn story_full_id(&self) -> StoryFullId {
        StoryFullId::new(self.owner_id, self.story_id)
    }
}

/// An upload that finished and waits for its dispatch slot.
pub(crate) struct ReadyToSendStory {
    pub file_id: FileId,
    pub pending: PendingStory,
    pub input_file: Option<crate::deps::InputFile>,
}

/// In-flight edit of a server-known story.
#[derive(Debug, Default)]
pub(crate) struct BeingEditedStory {
    pub content: Option<StoryContent>,
    pub caption: FormattedText,
    pub edit_caption: bool,
    pub log_event_id: u64,
    pub waiters: Vec<oneshot::Sender<ApiResult<()>>>,
}

#[derive(Default)]
pub(crate) struct PipelineState {
    pub send_count: u32,
    /// Send ops not yet confirmed, keyed by `send_num`; the smallest is the
    /// only dispatch candidate.
    pub yet_unsent: BTreeSet<u32>,
    pub ready: BTreeMap<u32, ReadyToSendStory>,
    pub send_in_flight: bool,
    pub being_uploaded: HashMap<FileId, PendingStory>,
    pub being_edited: HashMap<StoryFullId, BeingEditedStory>,
    pub edit_generations: HashMap<StoryFullId, i64>,
}

impl StoryEngine {
    /// Starts (or restarts) the upload for one pending send or edit.
    pub(crate) fn do_send_story(
        &self,
        pending: PendingStory,
        bad_parts: Vec<i32>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.do_send_story_inner(pending, bad_parts))
    }

    async fn do_send_story_inner(&self, pending: PendingStory, bad_parts: Vec<i32>) {
        let Some(file_id) = pending
            .story
            .content
            .as_ref()
            .and_then(StoryContent::primary_file_id)
        else {
            warn!(owner = pending.owner_id.0, "pending story has no uploadable file");
            return;
        };
        let priority = pending.send_num;
        debug!(file = file_id.0, ?bad_parts, "requesting story file upload");
        {
            let mut state = self.inner.state.lock().await;
            state.pipeline.being_uploaded.insert(file_id, pending);
        }
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine
                .inner
                .deps
                .files
                .upload(file_id, bad_parts, priority)
                .await;
            if engine.is_closing() {
                // Keep the binlog event; replay restarts the upload.
                return;
            }
            match outcome {
                Ok(outcome) => engine.on_upload_story(file_id, outcome).await,
                Err(e) => engine.on_upload_story_error(file_id, e).await,
            }
        });
    }

    pub(crate) async fn on_upload_story(&self, file_id: FileId, outcome: crate::deps::UploadOutcome) {
        let pending = {
            let mut state = self.inner.state.lock().await;
            state.pipeline.being_uploaded.remove(&file_id)
        };
        let Some(mut pending) = pending else {
            // The upload was cancelled just before completion.
            return;
        };
        debug!(file = file_id.0, "story file upload finished");

        match outcome {
            crate::deps::UploadOutcome::Remote { is_web: true } => {
                self.delete_pending_story(
                    Some(file_id),
                    pending,
                    Err(ApiError::new(400, "Can't use web photo as a story")),
                )
                .await;
            }
            crate::deps::UploadOutcome::Remote { is_web: false } => {
                if pending.was_reuploaded {
                    self.delete_pending_story(
                        Some(file_id),
                        pending,
                        Err(ApiError::new(500, "Failed to reupload story")),
                    )
                    .await;
                    return;
                }
                // The server's copy is stale; drop the reference and force
                // one full re-upload.
                pending.was_reuploaded = true;
                self.inner.deps.files.delete_file_reference(file_id);
                self.do_send_story(pending, vec![-1]).await;
            }
            crate::deps::UploadOutcome::Uploaded { input_file } => {
                if pending.story_id.is_server() {
                    self.do_edit_story(Some(file_id), pending, Some(input_file)).await;
                } else {
                    {
                        let mut state = self.inner.state.lock().await;
                        let send_num = pending.send_num;
                        state.pipeline.ready.insert(
                            send_num,
                            ReadyToSendStory {
                                file_id,
                                pending,
                                input_file: Some(input_file),
                            },
                        );
                    }
                    self.try_send_story().await;
                }
            }
        }
    }

    pub(crate) async fn on_upload_story_error(&self, file_id: FileId, error: ApiError) {
        let pending = {
            let mut state = self.inner.state.lock().await;
            state.pipeline.being_uploaded.remove(&file_id)
        };
        let Some(pending) = pending else {
            return;
        };
        info!(file = file_id.0, %error, "story file upload failed");
        self.delete_pending_story(Some(file_id), pending, Err(error)).await;
    }

    /// Dispatches the next ready send, if the queue head is ready and no
    /// send is in flight.
    pub(crate) async fn try_send_story(&self) {
        let job = {
            let mut state = self.inner.state.lock().await;
            let pipeline = &mut state.pipeline;
            if pipeline.send_in_flight {
                None
            } else {
                match pipeline.yet_unsent.first().copied() {
                    None => None,
                    Some(front) => match pipeline.ready.remove(&front) {
                        None => {
                            debug!(send_num = front, "head of the send queue is not ready yet");
                            None
                        }
                        Some(ready) => {
                            pipeline.send_in_flight = true;
                            Some(ready)
                        }
                    },
                }
            }
        };
        let Some(ready) = job else {
            return;
        };
        let engine = self.clone();
        tokio::spawn(async move { engine.perform_send(ready).await });
    }

    fn perform_send(
        &self,
        ready: ReadyToSendStory,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(self.perform_send_inner(ready))
    }

    async fn perform_send_inner(&self, ready: ReadyToSendStory) {
        let mut pending = ready.pending;
        let story = &pending.story;
        let request = SendStoryRequest {
            content: story.content.clone().expect("sends always carry content"),
            input_file: ready.input_file,
            caption: story.caption.clone(),
            privacy_rules: story.privacy_rules.clone(),
            random_id: pending.random_id,
            active_period: story.expire_date.saturating_sub(story.date),
            is_pinned: story.is_pinned,
            noforwards: story.noforwards,
        };
        info!(send_num = pending.send_num, "sending story");
        let result = self.inner.deps.server.send_story(request).await;

        match result {
            Ok(item) => {
                let log_event_id = pending.log_event_id;
                self.with_state(|state, ctx| {
                    state.pipeline.send_in_flight = false;
                    state.pipeline.yet_unsent.remove(&pending.send_num);
                    // The server's item mints the real id; ingesting it
                    // reconciles the provisional record in one step.
                    let story_id = state.on_get_new_story(ctx, pending.owner_id, item);
                    if story_id.is_server() {
                        let story_full_id = StoryFullId::new(pending.owner_id, story_id);
                        if !state
                            .get_story(story_full_id)
                            .map_or(false, |s| s.is_update_sent)
                        {
                            state.publish_story(ctx, story_full_id);
                        }
                    }
                    if log_event_id != 0 {
                        ctx.effects.push(Effect::EraseLogEvent { log_event_id });
                    }
                })
                .await;
                self.try_send_story().await;
            }
            Err(e) => {
                if self.is_closing() && self.inner.deps.use_db() {
                    // Stranded on purpose; replay retries after restart.
                    return;
                }
                {
                    let mut state = self.inner.state.lock().await;
                    state.pipeline.send_in_flight = false;
                }
                if let Some(part) = e.missing_file_part() {
                    info!(part, "server asked to re-upload file parts");
                    self.do_send_story(pending, vec![part]).await;
                } else if e.is_file_reference_error() && !pending.was_reuploaded {
                    info!("stale file reference, re-uploading once");
                    pending.was_reuploaded = true;
                    self.inner.deps.files.delete_file_reference(ready.file_id);
                    self.do_send_story(pending, vec![-1]).await;
                } else {
                    self.delete_pending_story(Some(ready.file_id), pending, Err(e)).await;
                }
            }
        }
    }

    /// Issues the edit RPC for an uploaded (or content-less) pending edit,
    /// unless a newer edit superseded it.
    pub(crate) async fn do_edit_story(
        &self,
        file_id: Option<FileId>,
        mut pending: PendingStory,
        input_file: Option<crate::deps::InputFile>,
    ) {
        let story_full_id = pending.story_full_id();
        let request = self
            .with_state(|state, _ctx| {
                let generation = state
                    .pipeline
                    .edit_generations
                    .get(&story_full_id)
                    .copied()
                    .unwrap_or(0);
                if !state.have_story_with_content(story_full_id)
                    || generation != pending.random_id
                {
                    return None;
                }
                let edited = state.pipeline.being_edited.get(&story_full_id)?;
                Some(EditStoryRequest {
                    story_id: story_full_id.story_id,
                    content: edited.content.clone(),
                    input_file: input_file.clone(),
                    caption: if edited.edit_caption {
                        Some(edited.caption.clone())
                    } else {
                        None
                    },
                    privacy_rules: None,
                })
            })
            .await;
        let Some(request) = request else {
            info!(%story_full_id, "skipping an outdated edit");
            if let Some(file_id) = file_id {
                self.inner.deps.files.cancel_upload(file_id);
            }
            return;
        };

        info!(%story_full_id, "editing story");
        let result = self.inner.deps.server.edit_story(request).await;
        if self.is_closing() && self.inner.deps.use_db() {
            return;
        }

        match result {
            Ok(item) => {
                if let Some(item) = item {
                    let owner_id = story_full_id.owner_id;
                    self.with_state(|state, ctx| {
                        state.on_get_new_story(ctx, owner_id, item);
                    })
                    .await;
                }
                self.delete_pending_story(file_id, pending, Ok(())).await;
            }
            Err(e) if e.is_story_not_modified() => {
                self.delete_pending_story(file_id, pending, Ok(())).await;
            }
            Err(e) => {
                if let Some(part) = e.missing_file_part() {
                    info!(part, "server asked to re-upload file parts of an edit");
                    self.do_send_story(pending, vec![part]).await;
                } else if e.is_file_reference_error()
                    && !pending.was_reuploaded
                    && file_id.is_some()
                {
                    pending.was_reuploaded = true;
                    if let Some(file_id) = file_id {
                        self.inner.deps.files.delete_file_reference(file_id);
                    }
                    self.do_send_story(pending, vec![-1]).await;
                } else {
                    self.delete_pending_story(file_id, pending, Err(e)).await;
                }
            }
        }
    }

    /// Finalises a pending send or edit: unhooks it from the pipeline,
    /// erases its binlog event and settles the user promises.
    pub(crate) async fn delete_pending_story(
        &self,
        file_id: Option<FileId>,
        pending: PendingStory,
        status: ApiResult<()>,
    ) {
        if let Some(file_id) = file_id {
            self.inner.deps.files.delete_partial_upload(file_id);
        }

        if pending.story_id.is_server() {
            let story_full_id = pending.story_full_id();
            let waiters = self
                .with_state(|state, ctx| {
                    let generation = state
                        .pipeline
                        .edit_generations
                        .get(&story_full_id)
                        .copied()
                        .unwrap_or(0);
                    if !state.have_story_with_content(story_full_id)
                        || generation != pending.random_id
                        || !state.pipeline.being_edited.contains_key(&story_full_id)
                    {
                        info!(%story_full_id, "ignoring an outdated edit completion");
                        return None;
                    }
                    let edited = state
                        .pipeline
                        .being_edited
                        .remove(&story_full_id)
                        .expect("checked above");
                    if edited.log_event_id != 0 {
                        ctx.effects.push(Effect::EraseLogEvent {
                            log_event_id: edited.log_event_id,
                        });
                    }
                    // Re-render without the edited preview (or with the
                    // server-confirmed record).
                    state.on_story_changed(ctx, story_full_id, true, true, false);
                    Some(edited.waiters)
                })
                .await;
            if let Some(waiters) = waiters {
                for waiter in waiters {
                    let _ = waiter.send(status.clone());
                }
            }
        } else {
            info!(send_num = pending.send_num, ok = status.is_ok(), "finishing story send");
            let keep_log = self.is_closing() && self.inner.deps.use_db();
            self.with_state(|state, ctx| {
                state.pipeline.yet_unsent.remove(&pending.send_num);
                if pending.log_event_id != 0 && !keep_log {
                    ctx.effects.push(Effect::EraseLogEvent {
                        log_event_id: pending.log_event_id,
                    });
                }
            })
            .await;
            if let Err(e) = status {
                warn!(send_num = pending.send_num, error = %e, "story send failed");
            }
            self.try_send_story().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edit_dispatch_keys_precede_send_keys_in_upload_priority() {
        // Uploads are prioritised by the dispatch key, so an edit started
        // after many sends still jumps the upload queue.
        let send_key = 5u32;
        let edit_key = u32::MAX - 6;
        assert!(edit_key > send_key);
    }

    #[test]
    fn yet_unsent_orders_sends_fifo() {
        let mut yet_unsent = BTreeSet::new();
        yet_unsent.insert(3u32);
        yet_unsent.insert(1u32);
        yet_unsent.insert(2u32);
        assert_eq!(yet_unsent.first().copied(), Some(1));
    }
}
