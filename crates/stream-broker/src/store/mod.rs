use crate::{Error, Result};
use bytes::Bytes;
use proto_streams::{Offset, StreamMetadata, StreamName};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

mod log;
pub use log::{frame, Appended, Framed, Head, Log};

/// Record is a single record of a stream, as read from its Log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: Offset,
    /// Offset of the record which follows this one.
    pub next_offset: Offset,
    /// Record content, without its trailing newline.
    pub payload: Bytes,
}

/// Batch is the result of a read: zero or more whole records
/// beginning at `offset` and ending at `next_offset`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub offset: Offset,
    pub next_offset: Offset,
    /// Write head of the stream as of the read.
    pub write_head: Offset,
    /// Newline-terminated content of all `records`.
    pub content: Bytes,
    pub records: Vec<Record>,
}

impl Batch {
    fn empty(offset: Offset, write_head: Offset) -> Self {
        Self {
            offset,
            next_offset: offset,
            write_head,
            content: Bytes::new(),
            records: Vec::new(),
        }
    }

    /// Are further records available beyond this Batch?
    pub fn has_more(&self) -> bool {
        self.next_offset < self.write_head
    }
}

/// Outcome of a Store::create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creation {
    Created,
    AlreadyExists,
}

/// Store is the set of streams held under a data directory.
/// It's cheaply cloned, and clones share the same streams.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    streams: std::sync::Mutex<BTreeMap<StreamName, Arc<Log>>>,
    // Identifier of the next stream directory. Directories are never re-used,
    // and a stream's name is held by its `meta.json` rather than its path.
    next_dir: AtomicU64,
}

// Prefix of a stream directory which is being removed.
const TOMBSTONE_PREFIX: &str = ".deleted-";

fn dir_name(id: u64) -> String {
    format!("{id:016x}")
}

impl Store {
    /// Open the Store rooted at `root`, creating it if required
    /// and recovering all streams it contains.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let map_err = |source| Error::Open {
            path: root.clone(),
            source,
        };
        std::fs::create_dir_all(&root).map_err(map_err)?;

        let mut streams = BTreeMap::new();
        let mut next_dir = 0;

        for entry in std::fs::read_dir(&root).map_err(map_err)? {
            let entry = entry.map_err(map_err)?;

            if !entry.file_type().map_err(map_err)?.is_dir() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (id, tombstone) = match file_name.strip_prefix(TOMBSTONE_PREFIX) {
                Some(id) => (id, true),
                None => (file_name.as_str(), false),
            };
            let Ok(id) = u64::from_str_radix(id, 16) else {
                tracing::warn!(dir = ?entry.path(), "ignoring unrecognized directory");
                continue;
            };
            next_dir = next_dir.max(id.saturating_add(1));

            // Finish removals which were interrupted.
            if tombstone {
                if let Err(err) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!(dir = ?entry.path(), %err, "failed to remove deleted stream");
                }
                continue;
            }
            let log = Log::recover(entry.path()).map_err(|source| Error::Open {
                path: entry.path(),
                source,
            })?;

            tracing::debug!(stream = %log.name(), write_head = log.head().write_head, "recovered stream");
            streams.insert(log.name().clone(), Arc::new(log));
        }
        tracing::info!(root = ?root, streams = streams.len(), "opened store");

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                streams: std::sync::Mutex::new(streams),
                next_dir: AtomicU64::new(next_dir),
            }),
        })
    }

    /// Create the named stream if it doesn't exist. Creating an existing
    /// stream with the same content-type is not an error, and leaves it as-is.
    pub async fn create(
        &self,
        name: &StreamName,
        content_type: &str,
    ) -> Result<(StreamMetadata, Creation)> {
        let (this, name, content_type) = (self.clone(), name.clone(), content_type.to_string());

        let (log, creation) =
            tokio::task::spawn_blocking(move || this.create_blocking(name, content_type)).await??;

        Ok((metadata(&log), creation))
    }

    fn create_blocking(&self, name: StreamName, content_type: String) -> Result<(Arc<Log>, Creation)> {
        // Hold the lock throughout, so that racing creations resolve to one Log.
        let mut streams = self.inner.streams.lock().unwrap();

        if let Some(log) = streams.get(&name) {
            return if log.content_type() == content_type {
                Ok((log.clone(), Creation::AlreadyExists))
            } else {
                Err(Error::ContentTypeMismatch {
                    name,
                    expected: log.content_type().to_string(),
                    actual: content_type,
                })
            };
        }

        let id = self.inner.next_dir.fetch_add(1, Ordering::Relaxed);
        let dir = self.inner.root.join(dir_name(id));

        let log = Log::create(dir, name.clone(), content_type).map_err(|source| {
            Error::StreamUnavailable {
                name: name.clone(),
                source,
            }
        })?;
        let log = Arc::new(log);

        tracing::info!(stream = %name, content_type = log.content_type(), "created stream");
        streams.insert(name, log.clone());

        Ok((log, Creation::Created))
    }

    /// Append newline-delimited records of `body` to the named stream.
    /// If `auto_create`, a missing stream is first created with `content_type`.
    pub async fn append(
        &self,
        name: &StreamName,
        content_type: &str,
        body: &[u8],
        auto_create: bool,
    ) -> Result<Appended> {
        let framed = frame(body);
        if framed.begins.is_empty() {
            return Err(Error::EmptyAppend(name.clone()));
        }

        let log = match self.get(name) {
            Ok(log) => log,
            Err(Error::StreamNotFound(_)) if auto_create => {
                let (this, name, content_type) =
                    (self.clone(), name.clone(), content_type.to_string());
                tokio::task::spawn_blocking(move || this.create_blocking(name, content_type))
                    .await??
                    .0
            }
            Err(err) => return Err(err),
        };

        if log.content_type() != content_type {
            return Err(Error::ContentTypeMismatch {
                name: name.clone(),
                expected: log.content_type().to_string(),
                actual: content_type.to_string(),
            });
        }
        let bytes = framed.content.len() as u64;
        let appended = tokio::task::spawn_blocking(move || log.append(&framed)).await??;

        metrics::counter!("stream_appends_total").increment(1);
        metrics::counter!("stream_appended_records_total").increment(appended.records);
        metrics::counter!("stream_appended_bytes_total").increment(bytes);
        tracing::debug!(stream = %name, offset = %appended.last, next_offset = %appended.next, "appended");

        Ok(appended)
    }

    /// Read whole records of the named stream beginning at `from`,
    /// without waiting for new records to be appended.
    pub async fn read(&self, name: &StreamName, from: Offset, max_bytes: u64) -> Result<Batch> {
        let log = self.get(name)?;
        tokio::task::spawn_blocking(move || log.read(from, max_bytes)).await?
    }

    /// Read records of the named stream beginning at `from`. If none are
    /// available, wait until records are appended or `deadline` elapses,
    /// returning an empty Batch on the deadline.
    ///
    /// Dropping the returned future releases the wait.
    pub async fn wait(
        &self,
        name: &StreamName,
        from: Offset,
        max_bytes: u64,
        deadline: tokio::time::Instant,
    ) -> Result<Batch> {
        let log = self.get(name)?;
        // Subscribe prior to reading, so that no append goes unobserved.
        let mut head_rx = log.subscribe();
        let _guard = WaitGuard::new();

        loop {
            let batch = {
                let log = log.clone();
                tokio::task::spawn_blocking(move || log.read(from, max_bytes)).await??
            };
            if !batch.records.is_empty() {
                return Ok(batch);
            }

            let deleted = match tokio::time::timeout_at(
                deadline,
                head_rx.wait_for(|head| head.deleted || head.write_head > from.get()),
            )
            .await
            {
                Err(_elapsed) => return Ok(batch),
                Ok(Ok(head)) => head.deleted,
                Ok(Err(_closed)) => true,
            };

            if deleted {
                return Err(Error::StreamNotFound(name.clone()));
            }
        }
    }

    /// Delete the named stream and all of its records.
    /// Blocked readers of the stream fail with StreamNotFound.
    pub async fn delete(&self, name: &StreamName) -> Result<()> {
        let log = {
            let mut streams = self.inner.streams.lock().unwrap();
            streams
                .remove(name)
                .ok_or_else(|| Error::StreamNotFound(name.clone()))?
        };
        log.mark_deleted();

        // Rename out of the way first, so an interrupted removal isn't recovered on restart.
        let dir = log.dir().to_path_buf();
        let tombstone = self.inner.root.join(format!(
            "{TOMBSTONE_PREFIX}{}",
            dir.file_name().unwrap_or_default().to_string_lossy()
        ));
        let name = name.clone();

        tokio::task::spawn_blocking(move || {
            std::fs::rename(&dir, &tombstone)?;
            std::fs::remove_dir_all(&tombstone)
        })
        .await?
        .map_err(|source| Error::StreamUnavailable {
            name: name.clone(),
            source,
        })?;

        tracing::info!(stream = %name, "deleted stream");
        Ok(())
    }

    /// Metadata of the named stream.
    pub fn metadata(&self, name: &StreamName) -> Result<StreamMetadata> {
        let log = self.get(name)?;
        Ok(metadata(&log))
    }

    /// Number of long-polls currently waiting on the named stream.
    pub fn waiters(&self, name: &StreamName) -> usize {
        self.get(name).map(|log| log.waiters()).unwrap_or_default()
    }

    fn get(&self, name: &StreamName) -> Result<Arc<Log>> {
        self.inner
            .streams
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::StreamNotFound(name.clone()))
    }
}

fn metadata(log: &Log) -> StreamMetadata {
    StreamMetadata {
        name: log.name().clone(),
        content_type: log.content_type().to_string(),
        write_head: Offset::new(log.head().write_head),
    }
}

// Tracks the number of in-flight long-polls.
struct WaitGuard;

impl WaitGuard {
    fn new() -> Self {
        metrics::gauge!("stream_long_poll_waiters").increment(1.0);
        Self
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        metrics::gauge!("stream_long_poll_waiters").decrement(1.0);
    }
}
