//! Error Types for Storyline
//!
//! Two error families live here:
//!
//! - [`CodecError`]: failures while parsing a binary blob (database row or
//!   binlog payload). A codec error on a stored row means the row is
//!   corrupted; the store reacts by deleting the row and scheduling a server
//!   reload.
//! - [`ApiError`]: the `(code, message)` pairs surfaced to API callers and
//!   received from the server. The message strings are a stable protocol
//!   contract shared with other clients; they must not be reworded, so each
//!   one has a named constructor.

use thiserror::Error;

/// Failure while decoding a stored blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of blob")]
    UnexpectedEof,

    #[error("unsupported blob version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid tag {tag} for {what}")]
    InvalidTag { what: &'static str, tag: u8 },

    #[error("varint is too long")]
    VarintTooLong,

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// A protocol-level error: numeric code plus a stable message string.
///
/// Server RPC failures and caller-visible validation failures share this
/// shape, exactly like the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn story_not_found() -> Self {
        Self::new(400, "Story not found")
    }

    pub fn sender_not_found() -> Self {
        Self::new(400, "Story sender not found")
    }

    pub fn sender_inaccessible() -> Self {
        Self::new(400, "Can't access the story sender")
    }

    pub fn cannot_archive_sender() -> Self {
        Self::new(400, "Can't archive sender stories")
    }

    pub fn invalid_story_id() -> Self {
        Self::new(400, "Invalid story identifier specified")
    }

    pub fn invalid_from_story_id() -> Self {
        Self::new(400, "Invalid value of parameter from_story_id specified")
    }

    pub fn limit_must_be_positive() -> Self {
        Self::new(400, "Parameter limit must be positive")
    }

    pub fn story_list_required() -> Self {
        Self::new(400, "Story list must be non-empty")
    }

    pub fn invalid_active_period() -> Self {
        Self::new(400, "Invalid story active period specified")
    }

    pub fn story_not_opened() -> Self {
        Self::new(400, "The story wasn't opened")
    }

    pub fn story_not_editable() -> Self {
        Self::new(400, "Story can't be edited")
    }

    pub fn story_not_outgoing() -> Self {
        Self::new(400, "Story is not outgoing")
    }

    pub fn story_not_sent_yet() -> Self {
        Self::new(400, "Story is not sent yet")
    }

    pub fn story_too_old() -> Self {
        Self::new(400, "Story is too old")
    }

    pub fn not_found() -> Self {
        Self::new(404, "Not found")
    }

    pub fn request_aborted() -> Self {
        Self::new(500, "Request aborted")
    }

    /// Whether this is the server's "nothing changed" response to an edit,
    /// which non-bot callers treat as success.
    pub fn is_story_not_modified(&self) -> bool {
        self.message == "STORY_NOT_MODIFIED"
    }

    /// Whether the server rejected a send because it no longer accepts the
    /// file reference we hold. The local reference must be dropped and the
    /// file re-registered once.
    pub fn is_file_reference_error(&self) -> bool {
        self.message.starts_with("FILE_REFERENCE_")
    }

    /// Extracts the part number from a `FILE_PART_<n>_MISSING` error, the
    /// server's way of asking for selected parts to be re-uploaded.
    pub fn missing_file_part(&self) -> Option<i32> {
        let rest = self.message.strip_prefix("FILE_PART_")?;
        let digits = rest.strip_suffix("_MISSING")?;
        digits.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_strings_are_verbatim() {
        assert_eq!(ApiError::story_not_found().message, "Story not found");
        assert_eq!(ApiError::sender_not_found().message, "Story sender not found");
        assert_eq!(
            ApiError::sender_inaccessible().message,
            "Can't access the story sender"
        );
        assert_eq!(
            ApiError::invalid_story_id().message,
            "Invalid story identifier specified"
        );
        assert_eq!(
            ApiError::limit_must_be_positive().message,
            "Parameter limit must be positive"
        );
        assert_eq!(
            ApiError::story_list_required().message,
            "Story list must be non-empty"
        );
        assert_eq!(
            ApiError::invalid_active_period().message,
            "Invalid story active period specified"
        );
        assert_eq!(ApiError::story_not_opened().message, "The story wasn't opened");
        assert_eq!(ApiError::story_not_found().code, 400);
        assert_eq!(ApiError::not_found().code, 404);
    }

    #[test]
    fn missing_file_part_parsing() {
        assert_eq!(
            ApiError::new(400, "FILE_PART_17_MISSING").missing_file_part(),
            Some(17)
        );
        assert_eq!(ApiError::new(400, "FILE_PART_X_MISSING").missing_file_part(), None);
        assert_eq!(ApiError::new(400, "FLOOD_WAIT_3").missing_file_part(), None);
    }

    #[test]
    fn file_reference_errors() {
        assert!(ApiError::new(400, "FILE_REFERENCE_EXPIRED").is_file_reference_error());
        assert!(ApiError::new(400, "FILE_REFERENCE_0_EXPIRED").is_file_reference_error());
        assert!(!ApiError::new(400, "FILE_PART_0_MISSING").is_file_reference_error());
    }
}
