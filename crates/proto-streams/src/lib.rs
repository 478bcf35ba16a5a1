//! Wire types of the durable streams HTTP protocol, shared by the
//! `stream-broker` service and the `stream-client` library.

mod name;
mod offset;

pub use name::{NameError, StreamName};
pub use offset::{Offset, OffsetError};

/// Header carrying the offset of the first byte of a read response body.
pub const STREAM_OFFSET: &str = "stream-offset";
/// Header carrying the offset from which a reader should resume.
/// Set on read responses, append responses, and HEAD responses.
pub const STREAM_NEXT_OFFSET: &str = "stream-next-offset";
/// Header which is "true" when a read response reaches the stream's tail.
pub const STREAM_UP_TO_DATE: &str = "stream-up-to-date";

/// Reserved final path segment which addresses the append endpoint of a stream.
pub const APPEND_SEGMENT: &str = "append";

/// ReadMode selects whether a read returns immediately, or blocks
/// until new content is available (or the broker's timeout elapses).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadMode {
    #[default]
    Immediate,
    LongPoll,
}

impl ReadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadMode::Immediate => "immediate",
            ReadMode::LongPoll => "long-poll",
        }
    }
}

/// Query parameters of a stream read.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadParams {
    /// Offset to read from. Defaults to the beginning of the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<Offset>,
    #[serde(default)]
    pub live: ReadMode,
    /// Soft upper bound on the bytes of a response body.
    /// At least one whole record is always returned, if one is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// Metadata of a stream, returned by its create endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    pub name: StreamName,
    pub content_type: String,
    /// Offset at which the next appended record will begin.
    pub write_head: Offset,
}

/// Response of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    /// Offset assigned to the last record of the appended batch.
    pub offset: Offset,
    /// Offset one beyond the appended batch, which is the stream's new write head.
    pub next_offset: Offset,
    /// Number of records which were appended.
    pub records: u64,
}

/// Machine-readable code of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    StreamNotFound,
    StreamUnavailable,
    ContentTypeMismatch,
    InvalidOffset,
    InvalidName,
    EmptyAppend,
    MissingContentType,
}

/// JSON body of a failed request.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}
