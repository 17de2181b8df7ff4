//! Test doubles for the engine's collaborators.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storyline_core::{
    ApiError, ApiResult, FileId, FileSourceId, FormattedText, InteractionInfo, MessageId,
    PrivacyRules, StoryContent, StoryFullId, StoryId, StoryListId, StoryPhoto, UserId,
};
use storyline_engine::{
    AllStoriesResponse, Clock, Deps, DialogDirectory, EditStoryRequest, FileService, InputFile,
    NewStory, Options, OptionValues, OwnerStories, Persistence, ReportReason, SendStoryRequest,
    ServerApi, StoriesPage, StoryEngine, StoryItem, StoryItemFull, StoryViewsResponse,
    Update, UploadOutcome, UserDirectory, UserInfo, UserStoriesResponse, ViewerPage,
};
use storyline_storage::{Binlog, SqliteStoryDatabase};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;

pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(now),
        })
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct UsersInner {
    contacts: HashSet<UserId>,
    premium: HashSet<UserId>,
    hidden: HashSet<UserId>,
}

pub struct TestUsers {
    me: UserId,
    inner: Mutex<UsersInner>,
}

impl TestUsers {
    pub fn new(me: UserId) -> Arc<Self> {
        Arc::new(Self {
            me,
            inner: Mutex::new(UsersInner::default()),
        })
    }

    pub fn add_contact(&self, user_id: UserId) {
        self.inner.lock().unwrap().contacts.insert(user_id);
    }

    pub fn set_premium(&self, user_id: UserId) {
        self.inner.lock().unwrap().premium.insert(user_id);
    }

    pub fn set_hidden(&self, user_id: UserId, hidden: bool) {
        let mut inner = self.inner.lock().unwrap();
        if hidden {
            inner.hidden.insert(user_id);
        } else {
            inner.hidden.remove(&user_id);
        }
    }
}

impl UserDirectory for TestUsers {
    fn my_id(&self) -> UserId {
        self.me
    }

    fn is_contact(&self, user_id: UserId) -> bool {
        self.inner.lock().unwrap().contacts.contains(&user_id)
    }

    fn is_premium_user(&self, user_id: UserId) -> bool {
        self.inner.lock().unwrap().premium.contains(&user_id)
    }

    fn are_stories_hidden(&self, user_id: UserId) -> bool {
        self.inner.lock().unwrap().hidden.contains(&user_id)
    }

    fn on_get_users(&self, users: Vec<UserInfo>) {
        let mut inner = self.inner.lock().unwrap();
        for user in users {
            if user.is_contact {
                inner.contacts.insert(user.user_id);
            }
            if user.is_premium {
                inner.premium.insert(user.user_id);
            }
            if user.stories_hidden {
                inner.hidden.insert(user.user_id);
            }
        }
    }
}

#[derive(Default)]
pub struct TestDialogs {
    pub unknown: Mutex<HashSet<UserId>>,
    pub unreadable: Mutex<HashSet<UserId>>,
    pub refreshed: Mutex<Vec<(StoryFullId, Vec<MessageId>)>>,
}

impl TestDialogs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl DialogDirectory for TestDialogs {
    fn have_dialog(&self, user_id: UserId) -> bool {
        !self.unknown.lock().unwrap().contains(&user_id)
    }

    fn can_read_dialog(&self, user_id: UserId) -> bool {
        !self.unreadable.lock().unwrap().contains(&user_id)
    }

    fn refresh_story_messages(&self, story_full_id: StoryFullId, message_ids: &[MessageId]) {
        self.refreshed
            .lock()
            .unwrap()
            .push((story_full_id, message_ids.to_vec()));
    }
}

#[derive(Default)]
pub struct TestFiles {
    pub uploads: Mutex<Vec<(FileId, Vec<i32>, u32)>>,
    pub outcomes: Mutex<VecDeque<ApiResult<UploadOutcome>>>,
    pub upload_delays_ms: Mutex<HashMap<FileId, u64>>,
    /// When set, uploads never complete (simulates a crash mid-upload).
    pub hold_uploads: Mutex<bool>,
    pub deleted_references: Mutex<Vec<FileId>>,
    pub deleted_files: Mutex<Vec<FileId>>,
}

impl TestFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold(&self) {
        *self.hold_uploads.lock().unwrap() = true;
    }

    pub fn script_outcome(&self, outcome: ApiResult<UploadOutcome>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn delay_upload(&self, file_id: FileId, millis: u64) {
        self.upload_delays_ms.lock().unwrap().insert(file_id, millis);
    }
}

#[async_trait]
impl FileService for TestFiles {
    async fn upload(
        &self,
        file_id: FileId,
        bad_parts: Vec<i32>,
        priority: u32,
    ) -> ApiResult<UploadOutcome> {
        self.uploads.lock().unwrap().push((file_id, bad_parts, priority));
        if *self.hold_uploads.lock().unwrap() {
            futures::future::pending::<()>().await;
        }
        let delay = self
            .upload_delays_ms
            .lock()
            .unwrap()
            .get(&file_id)
            .copied()
            .unwrap_or(0);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        match self.outcomes.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(UploadOutcome::Uploaded {
                input_file: InputFile {
                    file_id,
                    remote_key: format!("uploaded-{}", file_id.0),
                },
            }),
        }
    }

    fn cancel_upload(&self, _file_id: FileId) {}

    fn delete_partial_upload(&self, _file_id: FileId) {}

    fn delete_file_reference(&self, file_id: FileId) {
        self.deleted_references.lock().unwrap().push(file_id);
    }

    fn delete_files(&self, file_ids: &[FileId]) {
        self.deleted_files.lock().unwrap().extend_from_slice(file_ids);
    }

    fn create_story_file_source(&self, story_full_id: StoryFullId) -> FileSourceId {
        FileSourceId(story_full_id.owner_id.0 * 1_000_000 + i64::from(story_full_id.story_id.0))
    }

    fn change_story_files(&self, _source: FileSourceId, _old: &[FileId], _new: &[FileId]) {}

    fn check_local_location(&self, _file_id: FileId) {}
}

#[derive(Default)]
pub struct TestServer {
    pub all_stories: Mutex<VecDeque<ApiResult<AllStoriesResponse>>>,
    pub send_responses: Mutex<VecDeque<ApiResult<StoryItemFull>>>,
    pub edit_responses: Mutex<VecDeque<ApiResult<Option<StoryItemFull>>>>,
    pub viewer_pages: Mutex<VecDeque<ApiResult<ViewerPage>>>,
    pub stories_by_id: Mutex<VecDeque<ApiResult<StoriesPage>>>,
    pub user_stories: Mutex<VecDeque<ApiResult<UserStoriesResponse>>>,
    pub pinned_pages: Mutex<VecDeque<ApiResult<StoriesPage>>>,
    pub archive_pages: Mutex<VecDeque<ApiResult<StoriesPage>>>,

    pub read_calls: Mutex<Vec<(UserId, StoryId)>>,
    pub increment_calls: Mutex<Vec<(UserId, Vec<StoryId>)>>,
    pub send_calls: Mutex<Vec<SendStoryRequest>>,
    pub edit_calls: Mutex<Vec<EditStoryRequest>>,
    pub viewer_calls: Mutex<Vec<(StoryId, i32, UserId, i32)>>,
    pub delete_calls: Mutex<Vec<Vec<StoryId>>>,
    pub pinned_calls: Mutex<Vec<(Vec<StoryId>, bool)>>,
    pub by_id_calls: Mutex<Vec<(UserId, Vec<StoryId>)>>,
    pub views_calls: Mutex<Vec<Vec<StoryId>>>,
    pub hidden_calls: Mutex<Vec<(UserId, bool)>>,
    pub report_calls: Mutex<Vec<(UserId, Vec<StoryId>)>>,

    /// The first edit call waits here before responding.
    pub edit_gate: Mutex<Option<Arc<Notify>>>,
}

impl TestServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_all_stories(&self, response: ApiResult<AllStoriesResponse>) {
        self.all_stories.lock().unwrap().push_back(response);
    }

    pub fn script_send(&self, response: ApiResult<StoryItemFull>) {
        self.send_responses.lock().unwrap().push_back(response);
    }

    pub fn script_edit(&self, response: ApiResult<Option<StoryItemFull>>) {
        self.edit_responses.lock().unwrap().push_back(response);
    }

    pub fn script_viewers(&self, response: ApiResult<ViewerPage>) {
        self.viewer_pages.lock().unwrap().push_back(response);
    }

    pub fn script_user_stories(&self, response: ApiResult<UserStoriesResponse>) {
        self.user_stories.lock().unwrap().push_back(response);
    }

    pub fn script_pinned_page(&self, response: ApiResult<StoriesPage>) {
        self.pinned_pages.lock().unwrap().push_back(response);
    }

    pub fn script_archive_page(&self, response: ApiResult<StoriesPage>) {
        self.archive_pages.lock().unwrap().push_back(response);
    }

    pub fn gate_next_edit(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.edit_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl ServerApi for TestServer {
    async fn get_all_stories(
        &self,
        _list_id: StoryListId,
        _is_next: bool,
        _state: &str,
    ) -> ApiResult<AllStoriesResponse> {
        self.all_stories
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::new(500, "unexpected get_all_stories")))
    }

    async fn get_all_read_user_stories(&self) -> ApiResult<()> {
        Ok(())
    }

    async fn toggle_all_stories_hidden(&self, _hidden: bool) -> ApiResult<()> {
        Ok(())
    }

    async fn toggle_stories_hidden(&self, user_id: UserId, hidden: bool) -> ApiResult<()> {
        self.hidden_calls.lock().unwrap().push((user_id, hidden));
        Ok(())
    }

    async fn increment_story_views(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
    ) -> ApiResult<()> {
        self.increment_calls.lock().unwrap().push((owner_id, story_ids));
        Ok(())
    }

    async fn read_stories(&self, owner_id: UserId, max_story_id: StoryId) -> ApiResult<()> {
        self.read_calls.lock().unwrap().push((owner_id, max_story_id));
        Ok(())
    }

    async fn get_story_views_list(
        &self,
        story_id: StoryId,
        offset_date: i32,
        offset_user_id: UserId,
        limit: i32,
    ) -> ApiResult<ViewerPage> {
        self.viewer_calls
            .lock()
            .unwrap()
            .push((story_id, offset_date, offset_user_id, limit));
        self.viewer_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::new(500, "unexpected get_story_views_list")))
    }

    async fn get_stories_by_id(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
    ) -> ApiResult<StoriesPage> {
        self.by_id_calls.lock().unwrap().push((owner_id, story_ids));
        self.stories_by_id.lock().unwrap().pop_front().unwrap_or(Ok(StoriesPage {
            total_count: 0,
            users: Vec::new(),
            stories: Vec::new(),
        }))
    }

    async fn get_pinned_stories(
        &self,
        _owner_id: UserId,
        _from_story_id: StoryId,
        _limit: i32,
    ) -> ApiResult<StoriesPage> {
        self.pinned_pages.lock().unwrap().pop_front().unwrap_or(Ok(StoriesPage {
            total_count: 0,
            users: Vec::new(),
            stories: Vec::new(),
        }))
    }

    async fn get_stories_archive(
        &self,
        _from_story_id: StoryId,
        _limit: i32,
    ) -> ApiResult<StoriesPage> {
        self.archive_pages.lock().unwrap().pop_front().unwrap_or(Ok(StoriesPage {
            total_count: 0,
            users: Vec::new(),
            stories: Vec::new(),
        }))
    }

    async fn get_user_stories(&self, owner_id: UserId) -> ApiResult<UserStoriesResponse> {
        self.user_stories.lock().unwrap().pop_front().unwrap_or(Ok(UserStoriesResponse {
            users: Vec::new(),
            bundle: OwnerStories {
                owner_id,
                max_read_story_id: StoryId::NONE,
                stories: Vec::new(),
            },
        }))
    }

    async fn send_story(&self, request: SendStoryRequest) -> ApiResult<StoryItemFull> {
        self.send_calls.lock().unwrap().push(request);
        self.send_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::new(500, "unexpected send_story")))
    }

    async fn edit_story(&self, request: EditStoryRequest) -> ApiResult<Option<StoryItemFull>> {
        self.edit_calls.lock().unwrap().push(request);
        let gate = self.edit_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.edit_responses.lock().unwrap().pop_front().unwrap_or(Ok(None))
    }

    async fn toggle_pinned(&self, story_ids: Vec<StoryId>, is_pinned: bool) -> ApiResult<()> {
        self.pinned_calls.lock().unwrap().push((story_ids, is_pinned));
        Ok(())
    }

    async fn delete_stories(&self, story_ids: Vec<StoryId>) -> ApiResult<()> {
        self.delete_calls.lock().unwrap().push(story_ids);
        Ok(())
    }

    async fn get_stories_views(&self, story_ids: Vec<StoryId>) -> ApiResult<StoryViewsResponse> {
        self.views_calls.lock().unwrap().push(story_ids.clone());
        Ok(StoryViewsResponse {
            users: Vec::new(),
            views: story_ids
                .iter()
                .map(|_| InteractionInfo {
                    view_count: 1,
                    recent_viewer_user_ids: Vec::new(),
                })
                .collect(),
        })
    }

    async fn report_story(
        &self,
        owner_id: UserId,
        story_ids: Vec<StoryId>,
        _reason: ReportReason,
        _message: String,
    ) -> ApiResult<()> {
        self.report_calls.lock().unwrap().push((owner_id, story_ids));
        Ok(())
    }
}

pub struct Harness {
    pub engine: StoryEngine,
    pub updates: UnboundedReceiver<Update>,
    pub server: Arc<TestServer>,
    pub users: Arc<TestUsers>,
    pub dialogs: Arc<TestDialogs>,
    pub files: Arc<TestFiles>,
    pub clock: Arc<ManualClock>,
    pub options: Options,
    pub persistence: Option<Persistence>,
}

pub const ME: UserId = UserId(3);

pub async fn harness() -> Harness {
    build_harness(None, OptionValues::default(), |_, _| {}).await
}

pub async fn harness_with_options(values: OptionValues) -> Harness {
    build_harness(None, values, |_, _| {}).await
}

pub async fn persistent_harness(dir: &Path) -> Harness {
    build_harness(Some(dir), OptionValues::default(), |_, _| {}).await
}

/// Persistent harness whose mocks are scripted before the engine starts
/// (needed when binlog replay fires requests during startup).
pub async fn persistent_harness_with(
    dir: &Path,
    configure: impl FnOnce(&TestServer, &TestFiles),
) -> Harness {
    build_harness(Some(dir), OptionValues::default(), configure).await
}

async fn build_harness(
    dir: Option<&Path>,
    values: OptionValues,
    configure: impl FnOnce(&TestServer, &TestFiles),
) -> Harness {
    let server = TestServer::new();
    let users = TestUsers::new(ME);
    let dialogs = TestDialogs::new();
    let files = TestFiles::new();
    let clock = ManualClock::new(1_000_000);
    let options = Options::new(values);

    let persistence = match dir {
        Some(dir) => {
            let db = SqliteStoryDatabase::new(dir.join("stories.db")).await.unwrap();
            let binlog = Binlog::open(dir.join("actions.binlog")).await.unwrap();
            Some(Persistence {
                db: Arc::new(db),
                binlog: Arc::new(binlog),
            })
        }
        None => None,
    };

    configure(&server, &files);

    let deps = Deps {
        server: server.clone(),
        users: users.clone(),
        dialogs: dialogs.clone(),
        files: files.clone(),
        persistence: persistence.clone(),
        options: options.clone(),
        clock: clock.clone(),
    };
    let (engine, updates) = StoryEngine::new(deps);
    engine.start().await.unwrap();

    Harness {
        engine,
        updates,
        server,
        users,
        dialogs,
        files,
        clock,
        options,
        persistence,
    }
}

impl Harness {
    pub fn drain_updates(&mut self) -> Vec<Update> {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            updates.push(update);
        }
        updates
    }

    pub fn now(&self) -> i64 {
        use storyline_engine::Clock as _;
        self.clock.now_unix()
    }
}

/// Polls a condition until it holds or the timeout lapses.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the timeout");
}

pub fn photo_content(file_id: i64) -> StoryContent {
    StoryContent::Photo(StoryPhoto {
        file_id: FileId(file_id),
        width: 720,
        height: 1280,
    })
}

pub fn full_item(story_id: i32, date: i32, expire_date: i32, file_id: i64) -> StoryItem {
    StoryItem::Full(Box::new(StoryItemFull {
        story_id: StoryId(story_id),
        date,
        expire_date,
        is_edited: false,
        is_pinned: false,
        is_public: true,
        is_for_close_friends: false,
        is_for_contacts: false,
        is_for_selected_contacts: false,
        noforwards: false,
        is_min: false,
        content: photo_content(file_id),
        caption: FormattedText::default(),
        privacy_rules: Some(PrivacyRules::default()),
        interaction_info: None,
    }))
}

pub fn full_item_detailed(
    story_id: i32,
    date: i32,
    expire_date: i32,
    file_id: i64,
    is_pinned: bool,
    caption: &str,
) -> StoryItemFull {
    StoryItemFull {
        story_id: StoryId(story_id),
        date,
        expire_date,
        is_edited: false,
        is_pinned,
        is_public: true,
        is_for_close_friends: false,
        is_for_contacts: false,
        is_for_selected_contacts: false,
        noforwards: false,
        is_min: false,
        content: photo_content(file_id),
        caption: FormattedText::plain(caption),
        privacy_rules: Some(PrivacyRules::default()),
        interaction_info: None,
    }
}

pub fn bundle(owner_id: UserId, max_read: i32, stories: Vec<StoryItem>) -> OwnerStories {
    OwnerStories {
        owner_id,
        max_read_story_id: StoryId(max_read),
        stories,
    }
}

pub fn contact_user(user_id: UserId, is_premium: bool) -> UserInfo {
    UserInfo {
        user_id,
        is_contact: true,
        is_premium,
        stories_hidden: false,
    }
}

pub fn new_story(file_id: i64, caption: &str, active_period: i32, is_pinned: bool) -> NewStory {
    NewStory {
        content: photo_content(file_id),
        caption: FormattedText::plain(caption),
        privacy_rules: PrivacyRules {
            rules: vec![storyline_core::PrivacyRule::AllowAll],
        },
        active_period,
        is_pinned,
        protect_content: false,
    }
}
