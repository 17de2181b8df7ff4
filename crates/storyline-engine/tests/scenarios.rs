//! End-to-end scenarios against mocked collaborators.

mod support;

use std::collections::{HashMap, HashSet};
use support::*;
use storyline_core::{
    codec, FormattedText, InteractionInfo, MessageId, PrivacyRule, PrivacyRules, Story,
    StoryFullId, StoryId, StoryListId, UserId,
};
use storyline_storage::StoryDatabase as _;
use storyline_engine::options::VIEWED_STORY_POLL_PERIOD;
use storyline_engine::{
    ActiveStoriesView, AllStoriesPage, AllStoriesResponse, ReportReason, StoriesPage, StoryItem,
    StoryViewer, Update, UserStoriesResponse, ViewerPage,
};

const U1: UserId = UserId(1);
const U2: UserId = UserId(2);

fn main_page(now: i64) -> AllStoriesResponse {
    let expire = (now + 1_000_000) as i32;
    AllStoriesResponse::Page(AllStoriesPage {
        state: "state-1".to_string(),
        total_count: 3,
        has_more: false,
        users: vec![contact_user(U1, true), contact_user(U2, false)],
        owner_stories: vec![
            // Descending private order: self, premium+unread, plain contact.
            bundle(ME, 0, vec![full_item(10, 900_000, expire, 103)]),
            bundle(U1, 0, vec![full_item(11, 900_100, expire, 101)]),
            bundle(U2, 12, vec![full_item(12, 900_200, expire, 102)]),
        ],
    })
}

fn last_active_views(updates: &[Update]) -> HashMap<UserId, Option<ActiveStoriesView>> {
    let mut views = HashMap::new();
    for update in updates {
        if let Update::ChatActiveStories { owner_id, active } = update {
            views.insert(*owner_id, active.clone());
        }
    }
    views
}

fn story_updates_for(updates: &[Update], story_id: StoryId) -> Vec<Story> {
    updates
        .iter()
        .filter_map(|update| match update {
            Update::Story {
                story_id: id,
                story,
                ..
            } if *id == story_id => Some(story.clone()),
            _ => None,
        })
        .collect()
}

// S1: first Main list load orders owners deterministically and reports the
// total count.
#[tokio::test]
async fn first_main_list_load_orders_owners() {
    let mut h = harness().await;
    h.server.script_all_stories(Ok(main_page(h.now())));

    h.engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap();

    let updates = h.drain_updates();
    let views = last_active_views(&updates);
    let me = views[&ME].clone().unwrap();
    let u1 = views[&U1].clone().unwrap();
    let u2 = views[&U2].clone().unwrap();

    assert!(me.order > u1.order, "self precedes premium unread");
    assert!(u1.order > u2.order, "unread precedes read");
    assert!(u2.order > 0, "everything is surfaced once materialised");
    assert_eq!(me.list_id, Some(StoryListId::Main));
    assert_eq!(u1.story_ids, vec![StoryId(11)]);
    assert_eq!(u1.max_read_story_id, StoryId::NONE);
    assert_eq!(u2.max_read_story_id, StoryId(12));

    let counts: Vec<i32> = updates
        .iter()
        .filter_map(|update| match update {
            Update::StoryListChatCount {
                list_id: StoryListId::Main,
                count,
            } => Some(*count),
            _ => None,
        })
        .collect();
    assert_eq!(counts.last().copied(), Some(3));

    // Everything is materialised: the next page is "Not found".
    let err = h
        .engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    assert_eq!(err.message, "Not found");
}

// Property 10: redelivering the same server page is a no-op.
#[tokio::test]
async fn duplicate_list_page_is_idempotent() {
    let mut h = harness().await;
    h.server.script_all_stories(Ok(main_page(h.now())));
    h.engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap();
    h.drain_updates();

    // The reload fetches both lists; answer Main with the same page.
    h.server.script_all_stories(Ok(main_page(h.now())));
    h.server.script_all_stories(Ok(AllStoriesResponse::NotModified {
        state: "state-1".to_string(),
    }));
    h.engine.reload_active_stories().await;

    assert_eq!(h.drain_updates(), Vec::new());
}

// S2: opening an active foreign story advances the read position, clears
// the unread bit and issues one read_stories RPC.
#[tokio::test]
async fn open_story_marks_read_and_reorders() {
    let mut h = harness().await;
    h.server.script_all_stories(Ok(main_page(h.now())));
    h.engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap();
    let before = last_active_views(&h.drain_updates())[&U1].clone().unwrap();

    h.engine.open_story(U1, StoryId(11)).await.unwrap();

    wait_until(|| !h.server.read_calls.lock().unwrap().is_empty()).await;
    assert_eq!(
        h.server.read_calls.lock().unwrap().as_slice(),
        &[(U1, StoryId(11))]
    );

    let after = last_active_views(&h.drain_updates())[&U1].clone().unwrap();
    assert_eq!(after.max_read_story_id, StoryId(11));
    assert!(after.order < before.order, "the unread bit is gone");
}

// S3: a send interrupted mid-upload replays from the binlog and completes
// with exactly one published story.
#[tokio::test]
async fn send_story_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let h = persistent_harness(dir.path()).await;
        h.files.hold();
        h.engine.send_story(new_story(500, "hi", 86_400, false)).await.unwrap();
        wait_until(|| !h.files.uploads.lock().unwrap().is_empty()).await;
        assert_eq!(h.persistence.as_ref().unwrap().binlog.len().await, 1);
        h.engine.close();
    }

    let mut h = persistent_harness_with(dir.path(), |server, _files| {
        server.script_send(Ok(full_item_detailed(42, 1_000_000, 1_086_400, 500, false, "hi")));
    })
    .await;

    wait_until(|| !h.server.send_calls.lock().unwrap().is_empty()).await;

    // The minted id materialises, the log event is erased, and updateStory
    // goes out exactly once.
    let binlog = h.persistence.as_ref().unwrap().binlog.clone();
    for _ in 0..300 {
        if binlog.is_empty().await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(binlog.is_empty().await);
    let updates = h.drain_updates();
    let stories = story_updates_for(&updates, StoryId(42));
    assert_eq!(stories.len(), 1);
    assert_eq!(stories[0].caption, FormattedText::plain("hi"));

    let request = h.server.send_calls.lock().unwrap()[0].clone();
    assert_eq!(request.active_period, 86_400);
    assert_ne!(request.random_id, 0);
}

// S4: a second edit supersedes the first; the stale completion is
// discarded and both callers resolve successfully.
#[tokio::test]
async fn superseded_edit_is_discarded() {
    let h = harness().await;
    let expire = (h.now() + 1_000_000) as i32;
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                7, 900_000, expire, 700, false, "original",
            ))),
        )
        .await;

    let gate = h.server.gate_next_edit();
    h.server.script_edit(Ok(None));
    h.server.script_edit(Ok(None));

    let engine = h.engine.clone();
    let first = tokio::spawn(async move {
        engine
            .edit_story(StoryId(7), None, Some(FormattedText::plain("v1")))
            .await
    });
    wait_until(|| h.server.edit_calls.lock().unwrap().len() == 1).await;

    // The second edit completes while the first is still in flight.
    h.engine
        .edit_story(StoryId(7), None, Some(FormattedText::plain("v2")))
        .await
        .unwrap();
    assert_eq!(h.server.edit_calls.lock().unwrap().len(), 2);

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok(()));

    let calls = h.server.edit_calls.lock().unwrap();
    assert_eq!(calls[0].caption, Some(FormattedText::plain("v1")));
    assert_eq!(calls[1].caption, Some(FormattedText::plain("v2")));
}

// S5: an owned story survives expiry, and the viewers window closes one
// day later.
#[tokio::test]
async fn owned_story_expiry_and_viewers_window() {
    let mut h = harness().await;
    let now = h.now();
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                9,
                now as i32,
                (now + 1000) as i32,
                900,
                false,
                "mine",
            ))),
        )
        .await;
    // First read publishes the story, so later changes are re-published.
    let story = h.engine.get_story(ME, StoryId(9), true).await.unwrap();
    assert!(story.is_some());
    h.drain_updates();

    h.clock.set(now + 1000);
    h.engine.tick_timers().await;

    let story = h.engine.get_story(ME, StoryId(9), true).await.unwrap();
    assert!(story.is_some(), "owned stories are retained past expiry");
    let updates = h.drain_updates();
    assert_eq!(story_updates_for(&updates, StoryId(9)).len(), 1);

    h.clock.set(now + 1000 + 86_400);
    h.engine.tick_timers().await;

    let updates = h.drain_updates();
    let republished = story_updates_for(&updates, StoryId(9));
    assert_eq!(republished.len(), 1, "viewers-window close re-publishes once");
}

// S6: an expired foreign non-pinned row loaded from the database is
// discarded silently.
#[tokio::test]
async fn expired_foreign_row_is_discarded() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut h = persistent_harness(dir.path()).await;

    let owner = UserId(5);
    let story_full_id = StoryFullId::new(owner, StoryId(77));
    let story = Story {
        date: 500,
        expire_date: 600,
        content: Some(support::photo_content(555)),
        ..Story::default()
    };
    let db = h.persistence.as_ref().unwrap().db.clone();
    db.add_story(story_full_id, 0, 0, &codec::encode_story(&story))
        .await
        .unwrap();

    let loaded = h.engine.get_story(owner, StoryId(77), true).await.unwrap();
    assert_eq!(loaded, None);
    assert!(db.get_story(story_full_id).await.unwrap().is_none());
    assert_eq!(h.drain_updates(), Vec::new());
}

// Property 6: sends dispatch in submission order even when a later upload
// finishes first.
#[tokio::test]
async fn send_dispatch_is_fifo() {
    let h = harness().await;
    h.files.delay_upload(storyline_core::FileId(201), 150);
    h.server
        .script_send(Ok(full_item_detailed(101, 1_000_000, 1_086_400, 201, false, "a")));
    h.server
        .script_send(Ok(full_item_detailed(102, 1_000_000, 1_086_400, 202, false, "b")));

    h.engine.send_story(new_story(201, "a", 86_400, false)).await.unwrap();
    h.engine.send_story(new_story(202, "b", 86_400, false)).await.unwrap();

    wait_until(|| h.server.send_calls.lock().unwrap().len() == 2).await;
    let calls = h.server.send_calls.lock().unwrap();
    assert_eq!(calls[0].caption, FormattedText::plain("a"));
    assert_eq!(calls[1].caption, FormattedText::plain("b"));
}

// Property 8: a cached viewer range answers repeat queries without a
// second RPC.
#[tokio::test]
async fn viewer_cache_answers_repeat_queries() {
    let h = harness().await;
    let now = h.now();
    let mut item = full_item_detailed(15, now as i32, (now + 1000) as i32, 150, false, "view me");
    item.interaction_info = Some(storyline_core::InteractionInfo {
        view_count: 2,
        recent_viewer_user_ids: vec![],
    });
    h.engine.on_server_story(ME, StoryItem::Full(Box::new(item))).await;

    let viewers = vec![
        StoryViewer {
            user_id: UserId(21),
            view_date: 950,
        },
        StoryViewer {
            user_id: UserId(22),
            view_date: 940,
        },
    ];
    h.server.script_viewers(Ok(ViewerPage {
        total_count: 2,
        users: vec![],
        viewers: viewers.clone(),
    }));

    let (total, first) = h.engine.get_story_viewers(StoryId(15), None, 10).await.unwrap();
    assert_eq!(total, 2);
    assert_eq!(first, viewers);

    let (_, second) = h.engine.get_story_viewers(StoryId(15), None, 2).await.unwrap();
    assert_eq!(second, viewers);
    assert_eq!(h.server.viewer_calls.lock().unwrap().len(), 1, "cache hit");
}

// Deleting an owned story is optimistic locally and durable on the server.
#[tokio::test]
async fn delete_story_is_optimistic() {
    let mut h = harness().await;
    let now = h.now();
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                20,
                now as i32,
                (now + 1000) as i32,
                777,
                false,
                "bye",
            ))),
        )
        .await;
    // Publish it first so the deletion is observable.
    h.engine.get_story(ME, StoryId(20), true).await.unwrap();
    h.drain_updates();

    h.engine.delete_story(StoryId(20)).await.unwrap();

    let updates = h.drain_updates();
    assert!(updates.iter().any(|update| matches!(
        update,
        Update::StoryDeleted {
            story_id: StoryId(20),
            ..
        }
    )));
    assert_eq!(
        h.server.delete_calls.lock().unwrap().as_slice(),
        &[vec![StoryId(20)]]
    );

    // A late push for the deleted story is ignored this session.
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                20,
                now as i32,
                (now + 1000) as i32,
                777,
                false,
                "zombie",
            ))),
        )
        .await;
    assert_eq!(h.engine.get_story(ME, StoryId(20), true).await.unwrap(), None);
}

// Validation errors use the stable protocol strings.
#[tokio::test]
async fn validation_errors_are_verbatim() {
    let h = harness().await;

    let err = h.engine.load_active_stories(None).await.unwrap_err();
    assert_eq!(err.message, "Story list must be non-empty");

    let err = h
        .engine
        .get_dialog_pinned_stories(U1, StoryId::NONE, 0)
        .await
        .unwrap_err();
    assert_eq!(err.message, "Parameter limit must be positive");

    let err = h.engine.open_story(U1, StoryId(0)).await.unwrap_err();
    assert_eq!(err.message, "Invalid story identifier specified");

    let err = h.engine.close_story(ME, StoryId(5)).await.unwrap_err();
    assert_eq!(err.message, "The story wasn't opened");

    h.dialogs.unknown.lock().unwrap().insert(UserId(99));
    let err = h.engine.open_story(UserId(99), StoryId(1)).await.unwrap_err();
    assert_eq!(err.message, "Story sender not found");

    h.dialogs.unreadable.lock().unwrap().insert(UserId(98));
    let err = h.engine.open_story(UserId(98), StoryId(1)).await.unwrap_err();
    assert_eq!(err.message, "Can't access the story sender");

    let err = h
        .engine
        .send_story(new_story(1, "x", 123, false))
        .await
        .unwrap_err();
    assert_eq!(err.message, "Invalid story active period specified");
}

// A story referenced by a displayed message is refreshed when it is
// missing or stale, and left alone while the last record is fresh.
#[tokio::test]
async fn view_story_message_refreshes_stale_records() {
    let h = harness().await;
    let now = h.now();
    h.engine
        .on_server_story(U1, full_item(33, 900_000, (now + 1000) as i32, 330))
        .await;

    // Fresh record: nothing to do.
    h.engine.view_story_message(U1, StoryId(33)).await;
    assert!(h.server.by_id_calls.lock().unwrap().is_empty());

    // Stale record: one reload.
    h.clock.advance(VIEWED_STORY_POLL_PERIOD + 1);
    h.engine.view_story_message(U1, StoryId(33)).await;
    assert_eq!(
        h.server.by_id_calls.lock().unwrap().as_slice(),
        &[(U1, vec![StoryId(33)])]
    );

    // Unknown record: reload as well.
    h.engine.view_story_message(U2, StoryId(77)).await;
    assert_eq!(h.server.by_id_calls.lock().unwrap().len(), 2);

    // Drafts are never refreshed.
    h.engine.view_story_message(U1, StoryId(0)).await;
    assert_eq!(h.server.by_id_calls.lock().unwrap().len(), 2);
}

// A reply to an owned story fetches fresh view counters, but only when the
// replier is not already accounted for.
#[tokio::test]
async fn story_reply_refreshes_views_for_unknown_viewers() {
    let h = harness().await;
    let now = h.now();
    let mut item = full_item_detailed(40, now as i32, (now + 1000) as i32, 400, false, "owned");
    item.interaction_info = Some(InteractionInfo {
        view_count: 3,
        recent_viewer_user_ids: vec![UserId(21)],
    });
    h.engine.on_server_story(ME, StoryItem::Full(Box::new(item))).await;

    h.engine.on_story_replied(ME, StoryId(40), UserId(22)).await;
    wait_until(|| !h.server.views_calls.lock().unwrap().is_empty()).await;
    assert_eq!(h.server.views_calls.lock().unwrap()[0], vec![StoryId(40)]);

    // Own replies and replies to foreign stories change nothing.
    h.engine.on_story_replied(ME, StoryId(40), ME).await;
    h.engine
        .on_server_story(U1, full_item(41, now as i32, (now + 1000) as i32, 410))
        .await;
    h.engine.on_story_replied(U1, StoryId(41), UserId(22)).await;
    assert_eq!(h.server.views_calls.lock().unwrap().len(), 1);
}

// Toggling the pinned flag applies locally only after the server confirms,
// and re-publishes the record.
#[tokio::test]
async fn toggle_pinned_applies_after_server_confirmation() {
    let mut h = harness().await;
    let now = h.now();
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                44,
                now as i32,
                (now + 1000) as i32,
                440,
                false,
                "keep me",
            ))),
        )
        .await;
    h.engine.get_story(ME, StoryId(44), true).await.unwrap();
    h.drain_updates();

    h.engine.toggle_story_is_pinned(StoryId(44), true).await.unwrap();

    assert_eq!(
        h.server.pinned_calls.lock().unwrap().as_slice(),
        &[(vec![StoryId(44)], true)]
    );
    let story = h.engine.get_story(ME, StoryId(44), true).await.unwrap().unwrap();
    assert!(story.is_pinned);
    let published = story_updates_for(&h.drain_updates(), StoryId(44));
    assert_eq!(published.len(), 1);
    assert!(published[0].is_pinned);

    let err = h
        .engine
        .toggle_story_is_pinned(StoryId(99), true)
        .await
        .unwrap_err();
    assert_eq!(err.message, "Story not found");
}

// A late subscriber can reconstruct the visible list state from the
// snapshot updates.
#[tokio::test]
async fn current_state_updates_reconstruct_list_state() {
    let mut h = harness().await;
    h.server.script_all_stories(Ok(main_page(h.now())));
    h.engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap();
    h.drain_updates();

    let snapshot = h.engine.current_state_updates().await;

    let owners: HashSet<UserId> = snapshot
        .iter()
        .filter_map(|update| match update {
            Update::ChatActiveStories {
                owner_id,
                active: Some(_),
            } => Some(*owner_id),
            _ => None,
        })
        .collect();
    assert_eq!(owners, HashSet::from([ME, U1, U2]));

    let counts: Vec<(StoryListId, i32)> = snapshot
        .iter()
        .filter_map(|update| match update {
            Update::StoryListChatCount { list_id, count } => Some((*list_id, *count)),
            _ => None,
        })
        .collect();
    // The archive was never counted, so only Main appears.
    assert_eq!(counts, vec![(StoryListId::Main, 3)]);
}

// Messages embedding a story are re-rendered when it changes, until they
// are unregistered.
#[tokio::test]
async fn registered_messages_are_refreshed_on_story_change() {
    let h = harness().await;
    let now = h.now();
    let expire = (now + 1000) as i32;
    let story_full_id = StoryFullId::new(U1, StoryId(60));
    h.engine
        .on_server_story(
            U1,
            StoryItem::Full(Box::new(full_item_detailed(60, now as i32, expire, 600, false, "v1"))),
        )
        .await;
    h.engine.register_story_message(story_full_id, MessageId(9001)).await;

    h.engine
        .on_server_story(
            U1,
            StoryItem::Full(Box::new(full_item_detailed(60, now as i32, expire, 600, false, "v2"))),
        )
        .await;
    assert_eq!(
        h.dialogs.refreshed.lock().unwrap().as_slice(),
        &[(story_full_id, vec![MessageId(9001)])]
    );

    h.engine.unregister_story_message(story_full_id, MessageId(9001)).await;
    h.engine
        .on_server_story(
            U1,
            StoryItem::Full(Box::new(full_item_detailed(60, now as i32, expire, 600, false, "v3"))),
        )
        .await;
    assert_eq!(h.dialogs.refreshed.lock().unwrap().len(), 1);
}

// Privacy changes ride the edit RPC with only the privacy field set, and
// apply locally once accepted.
#[tokio::test]
async fn privacy_settings_follow_the_edit_rpc() {
    let h = harness().await;
    let now = h.now();
    h.engine
        .on_server_story(
            ME,
            StoryItem::Full(Box::new(full_item_detailed(
                46,
                now as i32,
                (now + 1000) as i32,
                460,
                false,
                "private",
            ))),
        )
        .await;

    let rules = PrivacyRules {
        rules: vec![PrivacyRule::AllowCloseFriends],
    };
    h.engine
        .set_story_privacy_settings(StoryId(46), rules.clone())
        .await
        .unwrap();

    {
        let calls = h.server.edit_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].story_id, StoryId(46));
        assert_eq!(calls[0].privacy_rules, Some(rules.clone()));
        assert!(calls[0].content.is_none());
        assert!(calls[0].caption.is_none());
    }
    let story = h.engine.get_story(ME, StoryId(46), true).await.unwrap().unwrap();
    assert_eq!(story.privacy_rules, rules);

    let err = h
        .engine
        .set_story_privacy_settings(StoryId(99), PrivacyRules::default())
        .await
        .unwrap_err();
    assert_eq!(err.message, "Story not found");
}

// Hiding an owner's stories goes to the server only when the placement
// actually moves.
#[tokio::test]
async fn toggling_hidden_stories_routes_to_the_server() {
    let h = harness().await;
    h.users.add_contact(U1);

    // Already in the requested list: accepted without an RPC.
    h.engine
        .toggle_dialog_stories_hidden(U1, Some(StoryListId::Main))
        .await
        .unwrap();
    assert!(h.server.hidden_calls.lock().unwrap().is_empty());

    h.engine
        .toggle_dialog_stories_hidden(U1, Some(StoryListId::Archive))
        .await
        .unwrap();
    assert_eq!(h.server.hidden_calls.lock().unwrap().as_slice(), &[(U1, true)]);

    let err = h
        .engine
        .toggle_dialog_stories_hidden(U1, None)
        .await
        .unwrap_err();
    assert_eq!(err.message, "Story list must be non-empty");
}

// A server-pushed read position moves the owner without echoing a write
// back to the server.
#[tokio::test]
async fn pushed_read_positions_reorder_without_a_server_write() {
    let mut h = harness().await;
    h.server.script_all_stories(Ok(main_page(h.now())));
    h.engine
        .load_active_stories(Some(StoryListId::Main))
        .await
        .unwrap();
    h.drain_updates();

    h.engine.on_server_read_stories(U1, StoryId(11)).await;

    let view = last_active_views(&h.drain_updates())[&U1].clone().unwrap();
    assert_eq!(view.max_read_story_id, StoryId(11));
    assert!(h.server.read_calls.lock().unwrap().is_empty());

    h.engine.reload_all_read_stories().await.unwrap();
}

// The per-owner expiring fetch asks the server once and answers locally
// afterwards.
#[tokio::test]
async fn expiring_stories_fetch_falls_back_to_the_server() {
    let h = harness().await;
    let now = h.now();
    h.server.script_user_stories(Ok(UserStoriesResponse {
        users: vec![contact_user(U1, false)],
        bundle: bundle(U1, 0, vec![full_item(21, 900_000, (now + 1000) as i32, 210)]),
    }));

    let view = h.engine.get_dialog_expiring_stories(U1).await.unwrap().unwrap();
    assert_eq!(view.story_ids, vec![StoryId(21)]);

    // A second fetch is served from memory; an RPC would hit the empty
    // default response and clear the entry.
    let again = h.engine.get_dialog_expiring_stories(U1).await.unwrap().unwrap();
    assert_eq!(again.story_ids, vec![StoryId(21)]);
}

// Pinned and archive pages ingest their items and report the server total.
#[tokio::test]
async fn pinned_and_archive_pages_ingest_and_count() {
    let h = harness().await;
    let now = h.now();
    let expire = (now + 1000) as i32;
    h.server.script_pinned_page(Ok(StoriesPage {
        total_count: 5,
        users: vec![contact_user(U1, false)],
        stories: vec![
            full_item(71, 900_000, expire, 710),
            full_item(72, 900_100, expire, 720),
        ],
    }));

    let (total, story_ids) = h
        .engine
        .get_dialog_pinned_stories(U1, StoryId::NONE, 10)
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(
        story_ids,
        vec![
            StoryFullId::new(U1, StoryId(71)),
            StoryFullId::new(U1, StoryId(72)),
        ]
    );

    let err = h
        .engine
        .get_dialog_pinned_stories(U1, StoryId(-3), 10)
        .await
        .unwrap_err();
    assert_eq!(err.message, "Invalid value of parameter from_story_id specified");

    h.server.script_archive_page(Ok(StoriesPage {
        total_count: 1,
        users: Vec::new(),
        stories: vec![full_item(81, 900_000, expire, 810)],
    }));
    let (total, story_ids) = h.engine.get_story_archive(StoryId::NONE, 10).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(story_ids, vec![StoryFullId::new(ME, StoryId(81))]);
}

// Reporting validates the story and forwards it with its owner.
#[tokio::test]
async fn report_story_requires_a_known_story() {
    let h = harness().await;
    let err = h
        .engine
        .report_story(U1, StoryId(5), ReportReason::Spam, String::new())
        .await
        .unwrap_err();
    assert_eq!(err.message, "Story not found");

    let now = h.now();
    h.engine
        .on_server_story(U1, full_item(5, 900_000, (now + 1000) as i32, 50))
        .await;
    h.engine
        .report_story(U1, StoryId(5), ReportReason::Spam, "spam".to_string())
        .await
        .unwrap();
    assert_eq!(
        h.server.report_calls.lock().unwrap().as_slice(),
        &[(U1, vec![StoryId(5)])]
    );
}

// Premium unlocks the longer active periods; test environments unlock the
// short ones.
#[tokio::test]
async fn active_period_validation_follows_options() {
    let h = harness().await;
    let err = h
        .engine
        .send_story(new_story(1, "x", 7 * 86_400, false))
        .await
        .unwrap_err();
    assert_eq!(err.message, "Invalid story active period specified");

    h.options.set_is_premium(true);
    h.server
        .script_send(Ok(full_item_detailed(50, 1_000_000, 1_604_800, 1, false, "x")));
    h.engine
        .send_story(new_story(1, "x", 7 * 86_400, false))
        .await
        .unwrap();
}
