//! External Collaborators
//!
//! The engine never talks to the network, the file store or the directories
//! directly; everything goes through the traits in this module, handed in as
//! one [`Deps`] bundle. Production wires them to the real services, tests
//! wire them to mocks.

use crate::options::Options;
use crate::rpc::ServerApi;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use storyline_core::{ApiResult, FileId, FileSourceId, MessageId, StoryFullId, UserId};
use storyline_storage::{Binlog, StoryDatabase};

/// Wall-clock source. Deadlines are wall-clock seconds, so tests inject a
/// manual clock instead of sleeping.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

/// The system clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A user record carried as the users-list prefix of server bundles. The
/// engine forwards these to the directory before touching the stories that
/// reference them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub user_id: UserId,
    pub is_contact: bool,
    pub is_premium: bool,
    pub stories_hidden: bool,
}

/// The user/contacts directory.
pub trait UserDirectory: Send + Sync {
    fn my_id(&self) -> UserId;
    fn is_contact(&self, user_id: UserId) -> bool;
    fn is_premium_user(&self, user_id: UserId) -> bool;
    fn are_stories_hidden(&self, user_id: UserId) -> bool;
    /// Ingests the users-list prefix of a server bundle.
    fn on_get_users(&self, users: Vec<UserInfo>);
}

/// The dialog (chat) directory.
pub trait DialogDirectory: Send + Sync {
    fn have_dialog(&self, user_id: UserId) -> bool;
    fn can_read_dialog(&self, user_id: UserId) -> bool;
    /// Asks the message layer to re-render messages embedding a story whose
    /// record changed.
    fn refresh_story_messages(&self, story_full_id: StoryFullId, message_ids: &[MessageId]);
}

/// Opaque upload handle passed back to the server with a send or edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub file_id: FileId,
    pub remote_key: String,
}

/// Result of an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Bytes were transferred; `input_file` references them.
    Uploaded { input_file: InputFile },
    /// The server already holds the bytes; there is nothing to transfer.
    /// `is_web` marks remote web files, which cannot be used as stories.
    Remote { is_web: bool },
}

/// The external file upload/download service.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Uploads a file, optionally re-transferring `bad_parts` (`-1` forces a
    /// full re-upload). `priority` orders concurrent uploads: higher first.
    async fn upload(
        &self,
        file_id: FileId,
        bad_parts: Vec<i32>,
        priority: u32,
    ) -> ApiResult<UploadOutcome>;

    fn cancel_upload(&self, file_id: FileId);

    /// Drops a partially transferred upload after a failed send.
    fn delete_partial_upload(&self, file_id: FileId);

    /// Invalidates a stale file reference so the next upload re-registers
    /// the file with the server.
    fn delete_file_reference(&self, file_id: FileId);

    /// Deletes files that no story references any more.
    fn delete_files(&self, file_ids: &[FileId]);

    /// Registers the refresh handle for the files of one story.
    fn create_story_file_source(&self, story_full_id: StoryFullId) -> FileSourceId;

    /// Tells the file layer that the file set behind `source` changed.
    fn change_story_files(&self, source: FileSourceId, old_ids: &[FileId], new_ids: &[FileId]);

    /// Pre-warms the local copy of a file about to be displayed.
    fn check_local_location(&self, file_id: FileId);
}

/// The persistent pair: story database plus action binlog. Present only
/// when the session keeps a message database; without it, sends and edits
/// do not survive restarts.
#[derive(Clone)]
pub struct Persistence {
    pub db: Arc<dyn StoryDatabase>,
    pub binlog: Arc<Binlog>,
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Deps {
    pub server: Arc<dyn ServerApi>,
    pub users: Arc<dyn UserDirectory>,
    pub dialogs: Arc<dyn DialogDirectory>,
    pub files: Arc<dyn FileService>,
    pub persistence: Option<Persistence>,
    pub options: Options,
    pub clock: Arc<dyn Clock>,
}

impl Deps {
    pub fn use_db(&self) -> bool {
        self.persistence.is_some()
    }
}
