//! Identifier newtypes
//!
//! Cross-references between stories, messages embedding them and file
//! sources are by identifier only; there is no pointer graph anywhere in the
//! engine. Each identifier is a thin transparent newtype so mixed-up
//! arguments fail to compile.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A user of the messenger. Story owners are always users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl UserId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user {}", self.0)
    }
}

/// Per-owner story identifier. Positive ids are server-assigned; zero is a
/// client-local draft that has not reached the server yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StoryId(pub i32);

impl StoryId {
    pub const NONE: StoryId = StoryId(0);

    pub fn is_server(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "story {}", self.0)
    }
}

/// Full story identity: `(owner, story)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct StoryFullId {
    pub owner_id: UserId,
    pub story_id: StoryId,
}

impl StoryFullId {
    pub fn new(owner_id: UserId, story_id: StoryId) -> Self {
        Self { owner_id, story_id }
    }
}

impl fmt::Display for StoryFullId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "story {} of user {}", self.story_id.0, self.owner_id.0)
    }
}

/// Process-wide monotone story key, assigned on first registration and used
/// as the key in every timer set. Zero means "not registered yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct GlobalStoryId(pub i64);

impl GlobalStoryId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

/// One of the two globally ordered story lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoryListId {
    Main,
    Archive,
}

impl StoryListId {
    pub const ALL: [StoryListId; 2] = [StoryListId::Main, StoryListId::Archive];

    pub fn index(self) -> usize {
        match self {
            StoryListId::Main => 0,
            StoryListId::Archive => 1,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(StoryListId::Main),
            1 => Some(StoryListId::Archive),
            _ => None,
        }
    }
}

impl fmt::Display for StoryListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoryListId::Main => write!(f, "main story list"),
            StoryListId::Archive => write!(f, "archive story list"),
        }
    }
}

/// Identifier of a file managed by the external file service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct FileId(pub i64);

impl FileId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

/// Handle the file service uses to refresh expired file references for the
/// files of one story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FileSourceId(pub i64);

impl FileSourceId {
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

/// Identifier of a message that embeds a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct MessageId(pub i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_story_ids_are_positive() {
        assert!(StoryId(1).is_server());
        assert!(StoryId(i32::MAX).is_server());
        assert!(!StoryId::NONE.is_server());
        assert!(!StoryId(-5).is_server());
    }

    #[test]
    fn list_index_round_trip() {
        for list in StoryListId::ALL {
            assert_eq!(StoryListId::from_index(list.index() as i64), Some(list));
        }
        assert_eq!(StoryListId::from_index(2), None);
    }

    #[test]
    fn full_id_display() {
        let id = StoryFullId::new(UserId(7), StoryId(42));
        assert_eq!(id.to_string(), "story 42 of user 7");
    }
}
