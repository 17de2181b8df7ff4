//! Viewer Cache
//!
//! For each owned story the cache keeps the viewer `total_count` and a set
//! of contiguous sub-ranges of the server's viewer sequence, each keyed by
//! the `(view_date, user_id)` offset it starts after (`None` is the start
//! of the list).
//!
//! A lookup returns the longest prefix of the requested range that is fully
//! covered; any non-empty answer bypasses the server. A server slice is
//! merged into adjacent sub-ranges, so coverage only ever grows until the
//! whole entry is invalidated (story deleted, or the viewers window
//! closed).

use crate::rpc::StoryViewer;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SubRange {
    /// The viewer this range starts after; `None` anchors it to the list
    /// head.
    offset: Option<StoryViewer>,
    viewers: Vec<StoryViewer>,
}

#[derive(Debug, Default)]
pub(crate) struct CachedViewers {
    pub total_count: i32,
    ranges: Vec<SubRange>,
}

impl CachedViewers {
    /// Updates the total count, refusing decreases (the server occasionally
    /// under-reports; a shrinking count would lose coverage guarantees).
    pub fn update_total_count(&mut self, total_count: i32) {
        if total_count < self.total_count {
            warn!(
                old = self.total_count,
                new = total_count,
                "total viewer count decreased, keeping the old value"
            );
            return;
        }
        self.total_count = total_count;
    }

    /// The longest covered prefix of the range starting after `offset`, up
    /// to `limit` viewers. `None` when the position itself is unknown.
    pub fn get_sublist(&self, offset: Option<&StoryViewer>, limit: usize) -> Option<Vec<StoryViewer>> {
        if limit == 0 {
            return None;
        }
        for range in &self.ranges {
            let tail: &[StoryViewer] = match offset {
                None => {
                    if range.offset.is_none() {
                        &range.viewers
                    } else {
                        continue;
                    }
                }
                Some(offset) => {
                    if range.offset.as_ref() == Some(offset) {
                        &range.viewers
                    } else if let Some(pos) = range.viewers.iter().position(|v| v == offset) {
                        &range.viewers[pos + 1..]
                    } else {
                        continue;
                    }
                }
            };
            if tail.is_empty() {
                return None;
            }
            return Some(tail[..tail.len().min(limit)].to_vec());
        }
        None
    }

    /// Merges a freshly fetched slice that starts after `offset`.
    pub fn add_sublist(&mut self, offset: Option<StoryViewer>, viewers: Vec<StoryViewer>) {
        if viewers.is_empty() {
            return;
        }

        // Extend the range this slice continues, or replace the range that
        // starts at the same position with the longer coverage.
        let mut merged = false;
        for range in &mut self.ranges {
            if range.offset == offset {
                if viewers.len() > range.viewers.len() {
                    range.viewers = viewers.clone();
                }
                merged = true;
                break;
            }
            if let Some(pos) = offset
                .as_ref()
                .and_then(|o| range.viewers.iter().position(|v| v == o))
            {
                let covered = range.viewers.len() - (pos + 1);
                if viewers.len() > covered {
                    range.viewers.truncate(pos + 1);
                    range.viewers.extend(viewers.iter().copied());
                }
                merged = true;
                break;
            }
        }
        if !merged {
            self.ranges.push(SubRange { offset, viewers });
        }

        self.coalesce();
    }

    /// Joins ranges whose boundary viewers line up.
    fn coalesce(&mut self) {
        let mut changed = true;
        while changed {
            changed = false;
            'outer: for i in 0..self.ranges.len() {
                let last = match self.ranges[i].viewers.last() {
                    Some(last) => *last,
                    None => continue,
                };
                for j in 0..self.ranges.len() {
                    if i == j {
                        continue;
                    }
                    if self.ranges[j].offset == Some(last) {
                        let tail = self.ranges.remove(j);
                        let i = if j < i { i - 1 } else { i };
                        self.ranges[i].viewers.extend(tail.viewers);
                        changed = true;
                        break 'outer;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyline_core::UserId;

    fn viewer(user: i64, date: i32) -> StoryViewer {
        StoryViewer {
            user_id: UserId(user),
            view_date: date,
        }
    }

    #[test]
    fn head_range_serves_prefixes() {
        let mut cache = CachedViewers::default();
        cache.add_sublist(None, vec![viewer(1, 100), viewer(2, 90), viewer(3, 80)]);

        assert_eq!(
            cache.get_sublist(None, 2),
            Some(vec![viewer(1, 100), viewer(2, 90)])
        );
        assert_eq!(
            cache.get_sublist(None, 10),
            Some(vec![viewer(1, 100), viewer(2, 90), viewer(3, 80)])
        );
        assert_eq!(cache.get_sublist(Some(&viewer(9, 9)), 5), None);
    }

    #[test]
    fn lookup_inside_a_range() {
        let mut cache = CachedViewers::default();
        cache.add_sublist(None, vec![viewer(1, 100), viewer(2, 90), viewer(3, 80)]);

        assert_eq!(
            cache.get_sublist(Some(&viewer(1, 100)), 5),
            Some(vec![viewer(2, 90), viewer(3, 80)])
        );
        // The final viewer has no known successors.
        assert_eq!(cache.get_sublist(Some(&viewer(3, 80)), 5), None);
    }

    #[test]
    fn adjacent_slices_coalesce() {
        let mut cache = CachedViewers::default();
        cache.add_sublist(None, vec![viewer(1, 100), viewer(2, 90)]);
        cache.add_sublist(Some(viewer(2, 90)), vec![viewer(3, 80), viewer(4, 70)]);

        assert_eq!(
            cache.get_sublist(None, 10),
            Some(vec![viewer(1, 100), viewer(2, 90), viewer(3, 80), viewer(4, 70)])
        );
    }

    #[test]
    fn merge_never_loses_coverage() {
        let mut cache = CachedViewers::default();
        cache.add_sublist(None, vec![viewer(1, 100), viewer(2, 90), viewer(3, 80)]);
        // A shorter re-fetch of a covered position must not shrink coverage.
        cache.add_sublist(Some(viewer(1, 100)), vec![viewer(2, 90)]);

        assert_eq!(
            cache.get_sublist(None, 10),
            Some(vec![viewer(1, 100), viewer(2, 90), viewer(3, 80)])
        );
    }

    #[test]
    fn disjoint_ranges_stay_separate_until_linked() {
        let mut cache = CachedViewers::default();
        cache.add_sublist(None, vec![viewer(1, 100)]);
        cache.add_sublist(Some(viewer(5, 50)), vec![viewer(6, 40)]);

        assert_eq!(cache.get_sublist(None, 10), Some(vec![viewer(1, 100)]));
        assert_eq!(
            cache.get_sublist(Some(&viewer(5, 50)), 10),
            Some(vec![viewer(6, 40)])
        );
        // Linking slice arrives: 1 -> 5.
        cache.add_sublist(Some(viewer(1, 100)), vec![viewer(5, 50)]);
        assert_eq!(
            cache.get_sublist(None, 10),
            Some(vec![viewer(1, 100), viewer(5, 50), viewer(6, 40)])
        );
    }

    #[test]
    fn total_count_never_decreases() {
        let mut cache = CachedViewers::default();
        cache.update_total_count(10);
        cache.update_total_count(7);
        assert_eq!(cache.total_count, 10);
        cache.update_total_count(12);
        assert_eq!(cache.total_count, 12);
    }
}
