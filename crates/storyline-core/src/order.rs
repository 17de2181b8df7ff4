//! Story List Ordering
//!
//! Owners inside a story list are ordered by a packed 64-bit `private_order`
//! key. Higher keys sort earlier (newest and most important owners first);
//! ties are broken by owner id, also descending. The packing is:
//!
//! ```text
//! bit 36  owner is the current user
//! bit 35  the owner has unread stories (max_read < last active id)
//! bit 34  owner is the changelog sender
//! bit 33  owner is premium
//! bits 0–31  date of the owner's newest active story
//! ```
//!
//! The four signal bits are additive on top of a 32-bit date, so even with
//! all of them set the key stays below bit 37; there is no combination that
//! would collide with a higher signal. [`ListCursor`] wraps
//! `(private_order, owner)` into the total order used by the in-memory
//! sorted set, the database pagination and the materialisation watermark.

use crate::id::UserId;
use std::cmp::Ordering;

const PREMIUM_BIT: i64 = 1 << 33;
const CHANGELOG_BIT: i64 = 1 << 34;
const UNREAD_BIT: i64 = 1 << 35;
const SELF_BIT: i64 = 1 << 36;

/// Packs the list sort key for one owner.
///
/// `last_story_date` is the `date` of the owner's newest active story and
/// must be positive.
pub fn private_order(
    last_story_date: i32,
    is_unread: bool,
    is_premium: bool,
    is_changelog: bool,
    is_self: bool,
) -> i64 {
    debug_assert!(last_story_date > 0);
    let mut order = i64::from(last_story_date);
    if is_premium {
        order += PREMIUM_BIT;
    }
    if is_changelog {
        order += CHANGELOG_BIT;
    }
    if is_unread {
        order += UNREAD_BIT;
    }
    if is_self {
        order += SELF_BIT;
    }
    order
}

/// A position in a story list: `(private_order, owner)`.
///
/// The natural order iterates owners the way the list is displayed: larger
/// `private_order` first, larger owner id first on ties. `MIN` precedes
/// every reachable position and `MAX` follows every reachable position, so
/// they serve as the "nothing materialised" and "fully materialised"
/// watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListCursor {
    pub order: i64,
    pub owner_id: UserId,
}

impl ListCursor {
    pub const MIN: ListCursor = ListCursor {
        order: i64::MAX,
        owner_id: UserId(i64::MAX),
    };

    pub const MAX: ListCursor = ListCursor {
        order: 0,
        owner_id: UserId(0),
    };

    pub fn new(order: i64, owner_id: UserId) -> Self {
        Self { order, owner_id }
    }
}

impl Ord for ListCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .order
            .cmp(&self.order)
            .then_with(|| other.owner_id.cmp(&self.owner_id))
    }
}

impl PartialOrd for ListCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_bits_dominate_date() {
        let date = i32::MAX;
        let plain = private_order(date, false, false, false, false);
        let premium = private_order(1, false, true, false, false);
        let changelog = private_order(1, false, false, true, false);
        let unread = private_order(1, true, false, false, false);
        let own = private_order(1, false, false, false, true);

        assert!(premium > plain);
        assert!(changelog > premium);
        assert!(unread > changelog);
        assert!(own > unread);
    }

    #[test]
    fn all_signals_fit_below_bit_37() {
        let order = private_order(i32::MAX, true, true, true, true);
        assert!(order < 1 << 37);
        assert!(order > 0);
    }

    #[test]
    fn cursor_orders_higher_keys_first() {
        let a = ListCursor::new(500, UserId(1));
        let b = ListCursor::new(400, UserId(2));
        assert!(a < b);

        let c = ListCursor::new(400, UserId(9));
        assert!(c < b);
    }

    #[test]
    fn sentinels_bound_every_position() {
        let mid = ListCursor::new(private_order(1_690_000_000, true, true, true, true), UserId(5));
        assert!(ListCursor::MIN < mid);
        assert!(mid < ListCursor::MAX);
        assert!(ListCursor::MIN < ListCursor::MAX);
    }

    #[test]
    fn sorted_set_iterates_descending_order() {
        use std::collections::BTreeSet;

        let mut set = BTreeSet::new();
        set.insert(ListCursor::new(100, UserId(1)));
        set.insert(ListCursor::new(300, UserId(2)));
        set.insert(ListCursor::new(200, UserId(3)));

        let orders: Vec<i64> = set.iter().map(|c| c.order).collect();
        assert_eq!(orders, vec![300, 200, 100]);
    }
}
