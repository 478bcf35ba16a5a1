//! Worker glue which pairs a Consumer of an input stream with a Producer
//! of an output stream, for one conversation.

use crate::{Client, Consumer, Error, Producer, Result};
use proto_streams::{Offset, StreamName};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Content-type of conversation streams.
pub const JSON: &str = "application/json";

/// Handler processes each input record of a conversation into
/// zero or more output records.
#[async_trait::async_trait]
pub trait Handler: Send {
    type Input: serde::de::DeserializeOwned + Send;
    type Output: serde::Serialize + Send + Sync;

    async fn handle(&mut self, input: Self::Input) -> anyhow::Result<Vec<Self::Output>>;
}

/// CursorStore persists the offset from which a stream's consumer resumes.
#[async_trait::async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, stream: &StreamName) -> Result<Option<Offset>>;
    async fn save(&self, stream: &StreamName, offset: Offset) -> Result<()>;
}

/// MemoryCursors is a CursorStore which lives only as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryCursors {
    cursors: Arc<Mutex<BTreeMap<StreamName, Offset>>>,
}

impl MemoryCursors {
    pub fn get(&self, stream: &StreamName) -> Option<Offset> {
        self.cursors.lock().unwrap().get(stream).copied()
    }
}

#[async_trait::async_trait]
impl CursorStore for MemoryCursors {
    async fn load(&self, stream: &StreamName) -> Result<Option<Offset>> {
        Ok(self.get(stream))
    }

    async fn save(&self, stream: &StreamName, offset: Offset) -> Result<()> {
        self.cursors.lock().unwrap().insert(stream.clone(), offset);
        Ok(())
    }
}

/// FileCursors is a CursorStore holding a JSON file per stream within a directory.
/// Files are replaced atomically, so a crash leaves the prior cursor intact.
#[derive(Debug, Clone)]
pub struct FileCursors {
    dir: PathBuf,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct CursorFile {
    stream: StreamName,
    offset: Offset,
}

const ENCODE_SET: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS.add(b'/').add(b'%');

impl FileCursors {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, stream: &StreamName) -> PathBuf {
        let encoded = percent_encoding::utf8_percent_encode(stream, ENCODE_SET);
        self.dir.join(format!("{encoded}.json"))
    }
}

#[async_trait::async_trait]
impl CursorStore for FileCursors {
    async fn load(&self, stream: &StreamName) -> Result<Option<Offset>> {
        let path = self.path(stream);

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Cursor { path, source }),
        };
        let file: CursorFile = serde_json::from_slice(&content).map_err(|err| Error::Cursor {
            path: path.clone(),
            source: err.into(),
        })?;

        Ok(Some(file.offset))
    }

    async fn save(&self, stream: &StreamName, offset: Offset) -> Result<()> {
        let path = self.path(stream);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_vec(&CursorFile {
            stream: stream.clone(),
            offset,
        })
        .map_err(Error::Encode)?;

        let write = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&tmp, &content).await?;
            tokio::fs::rename(&tmp, &path).await
        };
        write.await.map_err(|source| Error::Cursor {
            path: path.clone(),
            source,
        })
    }
}

/// Conversation owns the Consumer of its input stream, the Producer of its
/// output stream, and the Handler which maps one onto the other.
/// Its cursor is saved after the outputs of each input are appended,
/// so an input is processed again only if the worker fails in between.
pub struct Conversation<H: Handler, C> {
    consumer: Consumer<H::Input>,
    producer: Producer,
    handler: H,
    cursors: C,
}

impl<H: Handler, C: CursorStore> Conversation<H, C> {
    /// Open a Conversation which reads `input` from its saved cursor and
    /// appends to `output`. Either stream is created if it doesn't exist.
    pub async fn open(
        client: &Client,
        input: StreamName,
        output: StreamName,
        handler: H,
        cursors: C,
        cancel: CancellationToken,
    ) -> Result<Self> {
        client.create_or_connect(&input, JSON).await?;
        let producer = client.create_or_connect(&output, JSON).await?.into_producer();

        let offset = cursors.load(&input).await?.unwrap_or_default();
        tracing::info!(%input, %output, %offset, "opened conversation");

        Ok(Self {
            consumer: client.consumer(input, offset, cancel),
            producer,
            handler,
            cursors,
        })
    }

    /// Use `consumer` in place of the Conversation's own, such as to tune its reconnection.
    pub fn with_consumer(mut self, consumer: Consumer<H::Input>) -> Self {
        self.consumer = consumer;
        self
    }

    /// Process input records until the Conversation is cancelled,
    /// or fails with an error.
    pub async fn run(mut self) -> Result<()> {
        while let Some(record) = self.consumer.next().await {
            let record = record?;

            let outputs = self.handler.handle(record.value).await?;
            if !outputs.is_empty() {
                let appended = self.producer.append_batch(&outputs).await?;
                tracing::debug!(
                    stream = %self.producer.name(),
                    offset = %appended.offset,
                    records = appended.records,
                    "appended outputs"
                );
            }
            self.cursors
                .save(self.consumer.name(), record.next_offset)
                .await?;
        }
        tracing::info!(input = %self.consumer.name(), cursor = %self.consumer.cursor(), "conversation closed");

        Ok(())
    }
}
