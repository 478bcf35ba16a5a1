//! Codec of newline-delimited JSON records.

use crate::{Error, Result};
use bytes::Bytes;
use proto_streams::Offset;

/// Line is a single newline-terminated record of a Chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub offset: Offset,
    /// Offset one beyond the Line's newline.
    pub next_offset: Offset,
    /// Content of the Line, without its newline.
    pub content: Bytes,
}

/// Split `content`, which begins at `offset`, into its newline-terminated Lines.
/// Empty lines are skipped.
///
/// Also returns the offset one beyond the final newline of `content`.
/// Trailing bytes without a newline are a partial record, and aren't returned.
pub fn split_lines(offset: Offset, content: &Bytes) -> (Vec<Line>, Offset) {
    let mut lines = Vec::new();
    let mut begin = 0;

    for end in memchr::memchr_iter(b'\n', content) {
        if end != begin {
            lines.push(Line {
                offset: offset.advance(begin as u64),
                next_offset: offset.advance(end as u64 + 1),
                content: content.slice(begin..end),
            });
        }
        begin = end + 1;
    }
    (lines, offset.advance(begin as u64))
}

/// Decode a Line as a JSON document.
pub fn decode<T: serde::de::DeserializeOwned>(line: &Line) -> Result<T> {
    serde_json::from_slice(&line.content).map_err(|source| Error::MalformedRecord {
        offset: line.offset,
        source,
    })
}

/// Encode `value` as a compact, newline-terminated JSON line onto `buf`.
/// Compact JSON never contains a raw newline, so it's always a single record.
pub fn encode<T: serde::Serialize + ?Sized>(value: &T, buf: &mut Vec<u8>) -> Result<()> {
    serde_json::to_writer(&mut *buf, value).map_err(Error::Encode)?;
    buf.push(b'\n');
    Ok(())
}
