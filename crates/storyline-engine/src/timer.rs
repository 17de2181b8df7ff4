//! Timer Wheel
//!
//! Three independent deadline sets keyed by story global id: reload while
//! open, expiry, and viewers-window expiry. A single engine task sleeps
//! until the earliest deadline across all three sets and fires the due
//! entries.
//!
//! Deadlines are wall-clock seconds while the sleeping task uses the
//! monotonic runtime clock, so a callback can fire early after a clock
//! jump. Handlers therefore re-check `now` against the story's actual state
//! and re-arm instead of acting when the deadline has not really elapsed.

use std::collections::{BTreeSet, HashMap};
use storyline_core::GlobalStoryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Reload,
    Expire,
    ViewersExpire,
}

/// One deadline set: `global_id -> deadline` with an ordered view.
#[derive(Default)]
pub(crate) struct TimerQueue {
    deadlines: HashMap<GlobalStoryId, i64>,
    ordered: BTreeSet<(i64, GlobalStoryId)>,
}

impl TimerQueue {
    /// Sets or moves the deadline for one story.
    pub fn set(&mut self, global_id: GlobalStoryId, deadline: i64) {
        if let Some(old) = self.deadlines.insert(global_id, deadline) {
            if old == deadline {
                return;
            }
            self.ordered.remove(&(old, global_id));
        }
        self.ordered.insert((deadline, global_id));
    }

    pub fn cancel(&mut self, global_id: GlobalStoryId) {
        if let Some(deadline) = self.deadlines.remove(&global_id) {
            self.ordered.remove(&(deadline, global_id));
        }
    }

    pub fn next_deadline(&self) -> Option<i64> {
        self.ordered.first().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every entry whose deadline has passed.
    pub fn pop_due(&mut self, now: i64) -> Vec<GlobalStoryId> {
        let mut due = Vec::new();
        while let Some(&(deadline, global_id)) = self.ordered.first() {
            if deadline > now {
                break;
            }
            self.ordered.remove(&(deadline, global_id));
            self.deadlines.remove(&global_id);
            due.push(global_id);
        }
        due
    }
}

/// The three timer sets of the engine.
#[derive(Default)]
pub(crate) struct TimerWheel {
    pub reload: TimerQueue,
    pub expire: TimerQueue,
    pub viewers_expire: TimerQueue,
}

impl TimerWheel {
    pub fn next_deadline(&self) -> Option<i64> {
        [
            self.reload.next_deadline(),
            self.expire.next_deadline(),
            self.viewers_expire.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn pop_due(&mut self, now: i64) -> Vec<(TimerKind, GlobalStoryId)> {
        let mut due = Vec::new();
        for global_id in self.reload.pop_due(now) {
            due.push((TimerKind::Reload, global_id));
        }
        for global_id in self.expire.pop_due(now) {
            due.push((TimerKind::Expire, global_id));
        }
        for global_id in self.viewers_expire.pop_due(now) {
            due.push((TimerKind::ViewersExpire, global_id));
        }
        due
    }

    /// Drops every deadline of a story that left the store.
    pub fn cancel_all(&mut self, global_id: GlobalStoryId) {
        self.reload.cancel(global_id);
        self.expire.cancel(global_id);
        self.viewers_expire.cancel(global_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_due_returns_elapsed_entries_in_order() {
        let mut queue = TimerQueue::default();
        queue.set(GlobalStoryId(1), 100);
        queue.set(GlobalStoryId(2), 50);
        queue.set(GlobalStoryId(3), 150);

        assert_eq!(queue.next_deadline(), Some(50));
        assert_eq!(queue.pop_due(100), vec![GlobalStoryId(2), GlobalStoryId(1)]);
        assert_eq!(queue.next_deadline(), Some(150));
        assert!(queue.pop_due(100).is_empty());
    }

    #[test]
    fn set_moves_an_existing_deadline() {
        let mut queue = TimerQueue::default();
        queue.set(GlobalStoryId(1), 100);
        queue.set(GlobalStoryId(1), 200);
        assert!(queue.pop_due(150).is_empty());
        assert_eq!(queue.pop_due(200), vec![GlobalStoryId(1)]);
    }

    #[test]
    fn cancel_removes_the_entry() {
        let mut queue = TimerQueue::default();
        queue.set(GlobalStoryId(1), 100);
        queue.cancel(GlobalStoryId(1));
        assert_eq!(queue.next_deadline(), None);
        assert!(queue.pop_due(1000).is_empty());
    }

    #[test]
    fn wheel_reports_earliest_deadline_across_sets() {
        let mut wheel = TimerWheel::default();
        wheel.reload.set(GlobalStoryId(1), 300);
        wheel.expire.set(GlobalStoryId(2), 100);
        wheel.viewers_expire.set(GlobalStoryId(3), 200);
        assert_eq!(wheel.next_deadline(), Some(100));

        let due = wheel.pop_due(250);
        assert_eq!(
            due,
            vec![
                (TimerKind::Expire, GlobalStoryId(2)),
                (TimerKind::ViewersExpire, GlobalStoryId(3)),
            ]
        );
    }
}
