use crate::{check, offset_header, Client, Error, Result};
use bytes::Bytes;
use proto_streams::{Offset, ReadMode, StreamName};

/// Chunk is the body of a single read response: zero or more whole,
/// newline-terminated records beginning at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: Offset,
    /// Offset from which the next read should resume.
    pub next_offset: Offset,
    /// Does this Chunk reach the write head of the stream?
    pub up_to_date: bool,
    pub content: Bytes,
}

/// ChunkSource reads Chunks of a stream. It's implemented by Client,
/// and is the seam through which a Consumer is driven.
#[async_trait::async_trait]
pub trait ChunkSource: Send + Sync {
    async fn read_chunk(&self, name: &StreamName, offset: Offset, mode: ReadMode)
        -> Result<Chunk>;
}

#[async_trait::async_trait]
impl ChunkSource for Client {
    async fn read_chunk(
        &self,
        name: &StreamName,
        offset: Offset,
        mode: ReadMode,
    ) -> Result<Chunk> {
        let mut url = self.stream_url(name)?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("live", mode.as_str());

        let resp = self
            .http
            .get(url)
            .timeout(self.read_timeout)
            .send()
            .await?;
        let resp = check(name, resp).await?;

        let chunk_offset = offset_header(&resp, proto_streams::STREAM_OFFSET)?;
        let next_offset = offset_header(&resp, proto_streams::STREAM_NEXT_OFFSET)?;
        let up_to_date = resp
            .headers()
            .get(proto_streams::STREAM_UP_TO_DATE)
            .map(|value| value.as_bytes() == b"true")
            .unwrap_or_default();

        let content = resp.bytes().await?;

        if chunk_offset != offset {
            return Err(Error::Protocol(format!(
                "read of {offset} returned a chunk at {chunk_offset}"
            )));
        } else if next_offset.get().checked_sub(chunk_offset.get()) != Some(content.len() as u64) {
            return Err(Error::Protocol(format!(
                "chunk [{chunk_offset}, {next_offset}) has {} bytes of content",
                content.len()
            )));
        }
        tracing::trace!(stream = %name, %offset, %next_offset, up_to_date, "read chunk");

        Ok(Chunk {
            offset,
            next_offset,
            up_to_date,
            content,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// ScriptedSource replays a script of read results, and records the
    /// requests made of it. Once the script is exhausted, reads never complete.
    #[derive(Clone, Default)]
    pub struct ScriptedSource {
        script: Arc<Mutex<VecDeque<Result<Chunk>>>>,
        pub requests: Arc<Mutex<Vec<(Offset, ReadMode)>>>,
    }

    impl ScriptedSource {
        pub fn new(script: impl IntoIterator<Item = Result<Chunk>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into_iter().collect())),
                requests: Default::default(),
            }
        }

        pub fn requests(&self) -> Vec<(Offset, ReadMode)> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Chunk of `content` beginning at `offset`.
    pub fn chunk(offset: u64, content: &'static str, up_to_date: bool) -> Result<Chunk> {
        Ok(Chunk {
            offset: Offset::new(offset),
            next_offset: Offset::new(offset + content.len() as u64),
            up_to_date,
            content: Bytes::from_static(content.as_bytes()),
        })
    }

    #[async_trait::async_trait]
    impl ChunkSource for ScriptedSource {
        async fn read_chunk(
            &self,
            _name: &StreamName,
            offset: Offset,
            mode: ReadMode,
        ) -> Result<Chunk> {
            self.requests.lock().unwrap().push((offset, mode));
            let next = self.script.lock().unwrap().pop_front();

            match next {
                Some(result) => result,
                None => std::future::pending().await,
            }
        }
    }
}
