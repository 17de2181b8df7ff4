//! Binary Blob Codec
//!
//! Database rows and binlog payloads are stored as compact binary blobs.
//! Every blob starts with a one-byte version, followed by a 32-bit flag
//! bitmap gating the optional sections, followed by the fields themselves.
//! Integers use LEB128 varints with ZigZag for signed values, so the common
//! small values (story ids, dates close to the epoch deltas, short lists)
//! stay short.
//!
//! The format is forward-compatible in one direction only: a newer reader
//! accepts older versions, an older reader rejects newer versions instead of
//! misparsing them.
//!
//! Round-trip is exact: `decode(encode(x)) == x` for every encoded type,
//! modulo the session-local fields (`global_id`, `is_update_sent`) that are
//! deliberately not persisted.

use crate::error::{CodecError, CodecResult};
use crate::id::{FileId, StoryId, UserId};
use crate::story::{
    FormattedText, InteractionInfo, PrivacyRule, PrivacyRules, SavedActiveStories, SavedStoryList,
    Story, StoryContent, StoryInfo, StoryPhoto, StoryVideo, TextEntity, TextEntityKind,
};
use bytes::{BufMut, Bytes, BytesMut};

pub const BLOB_VERSION: u8 = 1;

const MAX_VARINT_BYTES: usize = 10;

// Story blob flags.
const STORY_HAS_CONTENT: u32 = 1;
const STORY_HAS_CAPTION: u32 = 1 << 1;
const STORY_HAS_PRIVACY: u32 = 1 << 2;
const STORY_HAS_INTERACTION: u32 = 1 << 3;
const STORY_IS_EDITED: u32 = 1 << 4;
const STORY_IS_PINNED: u32 = 1 << 5;
const STORY_IS_PUBLIC: u32 = 1 << 6;
const STORY_IS_FOR_CLOSE_FRIENDS: u32 = 1 << 7;
const STORY_IS_FOR_CONTACTS: u32 = 1 << 8;
const STORY_IS_FOR_SELECTED_CONTACTS: u32 = 1 << 9;
const STORY_NOFORWARDS: u32 = 1 << 10;

// Active stories blob flags.
const ACTIVE_HAS_MAX_READ: u32 = 1;

// Story list blob flags.
const LIST_HAS_MORE: u32 = 1;

/// Append-only builder for one blob.
pub struct BlobWriter {
    buf: BytesMut,
}

impl BlobWriter {
    pub fn new(version: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(version);
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_flags(&mut self, flags: u32) {
        self.buf.put_u32_le(flags);
    }

    pub fn put_varint_u64(&mut self, mut value: u64) {
        loop {
            let mut byte = (value & 0x7F) as u8;
            value >>= 7;
            if value != 0 {
                byte |= 0x80;
            }
            self.buf.put_u8(byte);
            if value == 0 {
                break;
            }
        }
    }

    pub fn put_varint(&mut self, value: i64) {
        self.put_varint_u64(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_varint_u64(value.len() as u64);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn put_user_ids(&mut self, ids: &[UserId]) {
        self.put_varint_u64(ids.len() as u64);
        for id in ids {
            self.put_varint(id.0);
        }
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Checked reader over one blob. Construction validates the version byte.
pub struct BlobReader<'a> {
    data: &'a [u8],
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8], max_version: u8) -> CodecResult<Self> {
        let mut reader = Self { data };
        let version = reader.get_u8()?;
        if version == 0 || version > max_version {
            return Err(CodecError::UnsupportedVersion(version));
        }
        Ok(reader)
    }

    fn take(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> CodecResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_flags(&mut self) -> CodecResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn get_varint_u64(&mut self) -> CodecResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        for _ in 0..MAX_VARINT_BYTES {
            let byte = self.get_u8()?;
            value |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(CodecError::VarintTooLong)
    }

    pub fn get_varint(&mut self) -> CodecResult<i64> {
        let unsigned = self.get_varint_u64()?;
        let value = (unsigned >> 1) as i64;
        Ok(if unsigned & 1 != 0 { !value } else { value })
    }

    pub fn get_string(&mut self) -> CodecResult<String> {
        let len = self.get_varint_u64()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn get_user_ids(&mut self) -> CodecResult<Vec<UserId>> {
        let count = self.get_varint_u64()? as usize;
        let mut ids = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            ids.push(UserId(self.get_varint()?));
        }
        Ok(ids)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

pub fn write_content(w: &mut BlobWriter, content: &StoryContent) {
    match content {
        StoryContent::Photo(photo) => {
            w.put_u8(1);
            w.put_varint(photo.file_id.0);
            w.put_varint(i64::from(photo.width));
            w.put_varint(i64::from(photo.height));
        }
        StoryContent::Video(video) => {
            w.put_u8(2);
            w.put_varint(video.file_id.0);
            w.put_varint(i64::from(video.duration));
            w.put_varint(i64::from(video.width));
            w.put_varint(i64::from(video.height));
            w.put_u8(u8::from(video.is_animation));
        }
        StoryContent::Unsupported => w.put_u8(3),
    }
}

pub fn read_content(r: &mut BlobReader<'_>) -> CodecResult<StoryContent> {
    let tag = r.get_u8()?;
    Ok(match tag {
        1 => StoryContent::Photo(StoryPhoto {
            file_id: FileId(r.get_varint()?),
            width: r.get_varint()? as i32,
            height: r.get_varint()? as i32,
        }),
        2 => StoryContent::Video(StoryVideo {
            file_id: FileId(r.get_varint()?),
            duration: r.get_varint()? as i32,
            width: r.get_varint()? as i32,
            height: r.get_varint()? as i32,
            is_animation: r.get_u8()? != 0,
        }),
        3 => StoryContent::Unsupported,
        tag => return Err(CodecError::InvalidTag { what: "story content", tag }),
    })
}

fn entity_kind_tag(kind: TextEntityKind) -> u8 {
    match kind {
        TextEntityKind::Mention => 1,
        TextEntityKind::Hashtag => 2,
        TextEntityKind::Url => 3,
        TextEntityKind::Bold => 4,
        TextEntityKind::Italic => 5,
        TextEntityKind::Underline => 6,
        TextEntityKind::Strikethrough => 7,
        TextEntityKind::Code => 8,
    }
}

fn entity_kind_from_tag(tag: u8) -> CodecResult<TextEntityKind> {
    Ok(match tag {
        1 => TextEntityKind::Mention,
        2 => TextEntityKind::Hashtag,
        3 => TextEntityKind::Url,
        4 => TextEntityKind::Bold,
        5 => TextEntityKind::Italic,
        6 => TextEntityKind::Underline,
        7 => TextEntityKind::Strikethrough,
        8 => TextEntityKind::Code,
        tag => return Err(CodecError::InvalidTag { what: "text entity", tag }),
    })
}

pub fn write_formatted_text(w: &mut BlobWriter, text: &FormattedText) {
    w.put_string(&text.text);
    w.put_varint_u64(text.entities.len() as u64);
    for entity in &text.entities {
        w.put_varint(i64::from(entity.offset));
        w.put_varint(i64::from(entity.length));
        w.put_u8(entity_kind_tag(entity.kind));
    }
}

pub fn read_formatted_text(r: &mut BlobReader<'_>) -> CodecResult<FormattedText> {
    let text = r.get_string()?;
    let count = r.get_varint_u64()? as usize;
    let mut entities = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        entities.push(TextEntity {
            offset: r.get_varint()? as i32,
            length: r.get_varint()? as i32,
            kind: entity_kind_from_tag(r.get_u8()?)?,
        });
    }
    Ok(FormattedText { text, entities })
}

pub fn write_privacy_rules(w: &mut BlobWriter, rules: &PrivacyRules) {
    w.put_varint_u64(rules.rules.len() as u64);
    for rule in &rules.rules {
        match rule {
            PrivacyRule::AllowAll => w.put_u8(1),
            PrivacyRule::AllowContacts => w.put_u8(2),
            PrivacyRule::AllowCloseFriends => w.put_u8(3),
            PrivacyRule::AllowUsers(ids) => {
                w.put_u8(4);
                w.put_user_ids(ids);
            }
            PrivacyRule::DisallowUsers(ids) => {
                w.put_u8(5);
                w.put_user_ids(ids);
            }
        }
    }
}

pub fn read_privacy_rules(r: &mut BlobReader<'_>) -> CodecResult<PrivacyRules> {
    let count = r.get_varint_u64()? as usize;
    let mut rules = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let tag = r.get_u8()?;
        rules.push(match tag {
            1 => PrivacyRule::AllowAll,
            2 => PrivacyRule::AllowContacts,
            3 => PrivacyRule::AllowCloseFriends,
            4 => PrivacyRule::AllowUsers(r.get_user_ids()?),
            5 => PrivacyRule::DisallowUsers(r.get_user_ids()?),
            tag => return Err(CodecError::InvalidTag { what: "privacy rule", tag }),
        });
    }
    Ok(PrivacyRules { rules })
}

fn write_interaction_info(w: &mut BlobWriter, info: &InteractionInfo) {
    w.put_varint(i64::from(info.view_count));
    w.put_user_ids(&info.recent_viewer_user_ids);
}

fn read_interaction_info(r: &mut BlobReader<'_>) -> CodecResult<InteractionInfo> {
    Ok(InteractionInfo {
        view_count: r.get_varint()? as i32,
        recent_viewer_user_ids: r.get_user_ids()?,
    })
}

/// Writes the persisted fields of a story into an existing writer, so the
/// same layout is shared by story rows and binlog payloads embedding a
/// provisional story.
pub fn write_story(w: &mut BlobWriter, story: &Story) {
    let mut flags = 0u32;
    if story.content.is_some() {
        flags |= STORY_HAS_CONTENT;
    }
    if !story.caption.is_empty() {
        flags |= STORY_HAS_CAPTION;
    }
    if !story.privacy_rules.is_empty() {
        flags |= STORY_HAS_PRIVACY;
    }
    if !story.interaction_info.is_empty() {
        flags |= STORY_HAS_INTERACTION;
    }
    if story.is_edited {
        flags |= STORY_IS_EDITED;
    }
    if story.is_pinned {
        flags |= STORY_IS_PINNED;
    }
    if story.is_public {
        flags |= STORY_IS_PUBLIC;
    }
    if story.is_for_close_friends {
        flags |= STORY_IS_FOR_CLOSE_FRIENDS;
    }
    if story.is_for_contacts {
        flags |= STORY_IS_FOR_CONTACTS;
    }
    if story.is_for_selected_contacts {
        flags |= STORY_IS_FOR_SELECTED_CONTACTS;
    }
    if story.noforwards {
        flags |= STORY_NOFORWARDS;
    }
    w.put_flags(flags);
    w.put_varint(i64::from(story.date));
    w.put_varint(i64::from(story.expire_date));
    w.put_varint(i64::from(story.receive_date));
    if let Some(content) = &story.content {
        write_content(w, content);
    }
    if !story.caption.is_empty() {
        write_formatted_text(w, &story.caption);
    }
    if !story.privacy_rules.is_empty() {
        write_privacy_rules(w, &story.privacy_rules);
    }
    if !story.interaction_info.is_empty() {
        write_interaction_info(w, &story.interaction_info);
    }
}

pub fn read_story(r: &mut BlobReader<'_>) -> CodecResult<Story> {
    let flags = r.get_flags()?;
    let mut story = Story {
        date: r.get_varint()? as i32,
        expire_date: r.get_varint()? as i32,
        receive_date: r.get_varint()? as i32,
        is_edited: flags & STORY_IS_EDITED != 0,
        is_pinned: flags & STORY_IS_PINNED != 0,
        is_public: flags & STORY_IS_PUBLIC != 0,
        is_for_close_friends: flags & STORY_IS_FOR_CLOSE_FRIENDS != 0,
        is_for_contacts: flags & STORY_IS_FOR_CONTACTS != 0,
        is_for_selected_contacts: flags & STORY_IS_FOR_SELECTED_CONTACTS != 0,
        noforwards: flags & STORY_NOFORWARDS != 0,
        ..Story::default()
    };
    if flags & STORY_HAS_CONTENT != 0 {
        story.content = Some(read_content(r)?);
    }
    if flags & STORY_HAS_CAPTION != 0 {
        story.caption = read_formatted_text(r)?;
    }
    if flags & STORY_HAS_PRIVACY != 0 {
        story.privacy_rules = read_privacy_rules(r)?;
    }
    if flags & STORY_HAS_INTERACTION != 0 {
        story.interaction_info = read_interaction_info(r)?;
    }
    Ok(story)
}

pub fn encode_story(story: &Story) -> Bytes {
    let mut w = BlobWriter::new(BLOB_VERSION);
    write_story(&mut w, story);
    w.finish()
}

pub fn decode_story(data: &[u8]) -> CodecResult<Story> {
    let mut r = BlobReader::new(data, BLOB_VERSION)?;
    read_story(&mut r)
}

fn write_story_info(w: &mut BlobWriter, info: &StoryInfo) {
    w.put_varint(i64::from(info.story_id.0));
    w.put_varint(i64::from(info.date));
    w.put_varint(i64::from(info.expire_date));
    w.put_u8(u8::from(info.is_for_close_friends));
}

fn read_story_info(r: &mut BlobReader<'_>) -> CodecResult<StoryInfo> {
    Ok(StoryInfo {
        story_id: StoryId(r.get_varint()? as i32),
        date: r.get_varint()? as i32,
        expire_date: r.get_varint()? as i32,
        is_for_close_friends: r.get_u8()? != 0,
    })
}

pub fn encode_active_stories(saved: &SavedActiveStories) -> Bytes {
    let mut w = BlobWriter::new(BLOB_VERSION);
    let mut flags = 0u32;
    if saved.max_read_story_id != StoryId::NONE {
        flags |= ACTIVE_HAS_MAX_READ;
    }
    w.put_flags(flags);
    if saved.max_read_story_id != StoryId::NONE {
        w.put_varint(i64::from(saved.max_read_story_id.0));
    }
    w.put_varint_u64(saved.story_infos.len() as u64);
    for info in &saved.story_infos {
        write_story_info(&mut w, info);
    }
    w.finish()
}

pub fn decode_active_stories(data: &[u8]) -> CodecResult<SavedActiveStories> {
    let mut r = BlobReader::new(data, BLOB_VERSION)?;
    let flags = r.get_flags()?;
    let max_read_story_id = if flags & ACTIVE_HAS_MAX_READ != 0 {
        StoryId(r.get_varint()? as i32)
    } else {
        StoryId::NONE
    };
    let count = r.get_varint_u64()? as usize;
    let mut story_infos = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        story_infos.push(read_story_info(&mut r)?);
    }
    Ok(SavedActiveStories {
        max_read_story_id,
        story_infos,
    })
}

pub fn encode_story_list(saved: &SavedStoryList) -> Bytes {
    let mut w = BlobWriter::new(BLOB_VERSION);
    let mut flags = 0u32;
    if saved.server_has_more {
        flags |= LIST_HAS_MORE;
    }
    w.put_flags(flags);
    w.put_string(&saved.state);
    w.put_varint(i64::from(saved.server_total_count));
    w.finish()
}

pub fn decode_story_list(data: &[u8]) -> CodecResult<SavedStoryList> {
    let mut r = BlobReader::new(data, BLOB_VERSION)?;
    let flags = r.get_flags()?;
    Ok(SavedStoryList {
        server_has_more: flags & LIST_HAS_MORE != 0,
        state: r.get_string()?,
        server_total_count: r.get_varint()? as i32,
    })
}
