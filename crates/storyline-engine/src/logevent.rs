//! Binlog Event Kinds
//!
//! The durable payloads of the five replayable operations. Each payload is
//! a versioned blob whose leading flag bitmap gates optional fields, so new
//! fields can be added without breaking older logs.

use storyline_core::codec::{self, BlobReader, BlobWriter, BLOB_VERSION};
use storyline_core::{
    CodecResult, FormattedText, Story, StoryContent, StoryFullId, StoryId, UserId,
};
use bytes::Bytes;

pub(crate) const DELETE_STORY_ON_SERVER: u32 = 1;
pub(crate) const READ_STORIES_ON_SERVER: u32 = 2;
pub(crate) const LOAD_DIALOG_EXPIRING_STORIES: u32 = 3;
pub(crate) const SEND_STORY: u32 = 4;
pub(crate) const EDIT_STORY: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeleteStoryEvent {
    pub story_full_id: StoryFullId,
}

impl DeleteStoryEvent {
    pub fn encode(&self) -> Bytes {
        let mut w = BlobWriter::new(BLOB_VERSION);
        w.put_flags(0);
        w.put_varint(self.story_full_id.owner_id.0);
        w.put_varint(i64::from(self.story_full_id.story_id.0));
        w.finish()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = BlobReader::new(data, BLOB_VERSION)?;
        let _flags = r.get_flags()?;
        Ok(Self {
            story_full_id: StoryFullId::new(
                UserId(r.get_varint()?),
                StoryId(r.get_varint()? as i32),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReadStoriesEvent {
    pub owner_id: UserId,
    pub max_story_id: StoryId,
}

impl ReadStoriesEvent {
    pub fn encode(&self) -> Bytes {
        let mut w = BlobWriter::new(BLOB_VERSION);
        w.put_flags(0);
        w.put_varint(self.owner_id.0);
        w.put_varint(i64::from(self.max_story_id.0));
        w.finish()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = BlobReader::new(data, BLOB_VERSION)?;
        let _flags = r.get_flags()?;
        Ok(Self {
            owner_id: UserId(r.get_varint()?),
            max_story_id: StoryId(r.get_varint()? as i32),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadExpiringStoriesEvent {
    pub owner_id: UserId,
}

impl LoadExpiringStoriesEvent {
    pub fn encode(&self) -> Bytes {
        let mut w = BlobWriter::new(BLOB_VERSION);
        w.put_flags(0);
        w.put_varint(self.owner_id.0);
        w.finish()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = BlobReader::new(data, BLOB_VERSION)?;
        let _flags = r.get_flags()?;
        Ok(Self {
            owner_id: UserId(r.get_varint()?),
        })
    }
}

/// A pending send. `send_num` is session-local and reassigned on replay.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SendStoryEvent {
    pub owner_id: UserId,
    pub random_id: i64,
    pub story: Story,
}

impl SendStoryEvent {
    pub fn encode(&self) -> Bytes {
        let mut w = BlobWriter::new(BLOB_VERSION);
        w.put_flags(0);
        w.put_varint(self.owner_id.0);
        w.put_varint(self.random_id);
        codec::write_story(&mut w, &self.story);
        w.finish()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = BlobReader::new(data, BLOB_VERSION)?;
        let _flags = r.get_flags()?;
        Ok(Self {
            owner_id: UserId(r.get_varint()?),
            random_id: r.get_varint()?,
            story: codec::read_story(&mut r)?,
        })
    }
}

const EDIT_HAS_CONTENT: u32 = 1;
const EDIT_CAPTION: u32 = 1 << 1;
const EDIT_HAS_CAPTION: u32 = 1 << 2;

/// A pending edit of a server-known story.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EditStoryEvent {
    pub story_full_id: StoryFullId,
    pub content: Option<StoryContent>,
    pub edit_caption: bool,
    pub caption: FormattedText,
}

impl EditStoryEvent {
    pub fn encode(&self) -> Bytes {
        let mut w = BlobWriter::new(BLOB_VERSION);
        let has_caption = self.edit_caption && !self.caption.is_empty();
        let mut flags = 0u32;
        if self.content.is_some() {
            flags |= EDIT_HAS_CONTENT;
        }
        if self.edit_caption {
            flags |= EDIT_CAPTION;
        }
        if has_caption {
            flags |= EDIT_HAS_CAPTION;
        }
        w.put_flags(flags);
        w.put_varint(self.story_full_id.owner_id.0);
        w.put_varint(i64::from(self.story_full_id.story_id.0));
        if let Some(content) = &self.content {
            codec::write_content(&mut w, content);
        }
        if has_caption {
            codec::write_formatted_text(&mut w, &self.caption);
        }
        w.finish()
    }

    pub fn decode(data: &[u8]) -> CodecResult<Self> {
        let mut r = BlobReader::new(data, BLOB_VERSION)?;
        let flags = r.get_flags()?;
        let story_full_id = StoryFullId::new(
            UserId(r.get_varint()?),
            StoryId(r.get_varint()? as i32),
        );
        let content = if flags & EDIT_HAS_CONTENT != 0 {
            Some(codec::read_content(&mut r)?)
        } else {
            None
        };
        let caption = if flags & EDIT_HAS_CAPTION != 0 {
            codec::read_formatted_text(&mut r)?
        } else {
            FormattedText::default()
        };
        Ok(Self {
            story_full_id,
            content,
            edit_caption: flags & EDIT_CAPTION != 0,
            caption,
        })
    }
}
