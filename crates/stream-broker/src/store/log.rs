use crate::{Error, Result};
use bytes::Bytes;
use proto_streams::{Offset, StreamName};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

const LOG_FILE: &str = "log";
const META_FILE: &str = "meta.json";

/// Head is the published state of a Log, observed by long-polling readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    /// Offset at which the next record will begin.
    pub write_head: u64,
    /// The stream was deleted. No further records will be appended.
    pub deleted: bool,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    name: StreamName,
    content_type: String,
}

/// Records framed for appending: newline-terminated content
/// and the relative begin offset of each record within it.
#[derive(Debug, PartialEq)]
pub struct Framed {
    pub content: Vec<u8>,
    pub begins: Vec<u64>,
}

/// Frame a request body into records. Each non-empty line is a record.
pub fn frame(body: &[u8]) -> Framed {
    let mut content = Vec::with_capacity(body.len() + 1);
    let mut begins = Vec::new();

    for line in body.split(|b| *b == b'\n') {
        if line.is_empty() {
            continue;
        }
        begins.push(content.len() as u64);
        content.extend_from_slice(line);
        content.push(b'\n');
    }
    Framed { content, begins }
}

/// Outcome of a successful Log::append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// Offset of the last appended record.
    pub last: Offset,
    /// Write head after the append.
    pub next: Offset,
    pub records: u64,
}

struct Writer {
    head: u64,
    // Set if a failed append could not be rolled back, or the Log was deleted.
    // All further appends are refused.
    failed: bool,
}

/// Log is the append-only segment of a single stream: a file of
/// newline-terminated records, and an in-memory index of record begin offsets.
pub struct Log {
    name: StreamName,
    content_type: String,
    dir: PathBuf,
    file: File,
    writer: std::sync::Mutex<Writer>,
    index: std::sync::RwLock<Vec<u64>>,
    head: watch::Sender<Head>,
}

impl Log {
    /// Create a new, empty Log within `dir`, which must not exist.
    pub fn create(dir: PathBuf, name: StreamName, content_type: String) -> std::io::Result<Self> {
        std::fs::create_dir(&dir)?;

        let meta = Meta {
            name,
            content_type,
        };
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        let mut f = File::create(&tmp)?;
        serde_json::to_writer(&mut f, &meta)?;
        f.sync_all()?;
        std::fs::rename(&tmp, dir.join(META_FILE))?;

        let file = open_log_file(&dir)?;
        file.sync_all()?;

        Ok(Self::new(meta, dir, file, 0, Vec::new()))
    }

    /// Recover a Log previously created within `dir`.
    /// A trailing partial record, left by an interrupted append, is truncated.
    pub fn recover(dir: PathBuf) -> std::io::Result<Self> {
        let meta: Meta = serde_json::from_slice(&std::fs::read(dir.join(META_FILE))?)?;
        let file = open_log_file(&dir)?;
        let len = file.metadata()?.len();

        let mut reader = std::io::BufReader::with_capacity(1 << 17, &file);
        let mut index = Vec::new();
        let (mut offset, mut begin) = (0u64, 0u64);

        loop {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                break;
            }
            for pivot in memchr::memchr_iter(b'\n', chunk) {
                index.push(begin);
                begin = offset + pivot as u64 + 1;
            }
            let n = chunk.len();
            offset += n as u64;
            reader.consume(n);
        }
        std::mem::drop(reader);

        if begin != len {
            tracing::warn!(
                stream = %meta.name,
                len,
                truncate_to = begin,
                "truncating partial record at log tail"
            );
            file.set_len(begin)?;
            file.sync_all()?;
        }

        Ok(Self::new(meta, dir, file, begin, index))
    }

    fn new(meta: Meta, dir: PathBuf, file: File, head: u64, index: Vec<u64>) -> Self {
        let (head_tx, _) = watch::channel(Head {
            write_head: head,
            deleted: false,
        });

        Self {
            name: meta.name,
            content_type: meta.content_type,
            dir,
            file,
            writer: std::sync::Mutex::new(Writer {
                head,
                failed: false,
            }),
            index: std::sync::RwLock::new(index),
            head: head_tx,
        }
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn head(&self) -> Head {
        *self.head.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Head> {
        self.head.subscribe()
    }

    /// Number of readers currently subscribed to Head updates.
    pub fn waiters(&self) -> usize {
        self.head.receiver_count()
    }

    /// Durably append framed records, returning their assigned offsets.
    /// Blocks on file I/O and must be called from a blocking context.
    pub fn append(&self, framed: &Framed) -> Result<Appended> {
        let (Some(last), false) = (framed.begins.last(), framed.content.is_empty()) else {
            return Err(Error::EmptyAppend(self.name.clone()));
        };
        let mut writer = self.writer.lock().unwrap();

        if self.head.borrow().deleted {
            return Err(Error::StreamNotFound(self.name.clone()));
        } else if writer.failed {
            return Err(Error::StreamUnavailable {
                name: self.name.clone(),
                source: std::io::Error::other("log is failed and refuses further appends"),
            });
        }
        let begin = writer.head;

        if let Err(source) = (&self.file)
            .write_all(&framed.content)
            .and_then(|()| self.file.sync_data())
        {
            // Roll back so that no offset is handed out for content which isn't durable.
            if let Err(rollback) = self.file.set_len(begin) {
                tracing::error!(stream = %self.name, %rollback, "failed to roll back partial append");
                writer.failed = true;
            }
            return Err(Error::StreamUnavailable {
                name: self.name.clone(),
                source,
            });
        }

        // Extend the index *before* publishing the new head,
        // so readers of a published head always find its records indexed.
        self.index
            .write()
            .unwrap()
            .extend(framed.begins.iter().map(|b| begin + b));

        writer.head = begin + framed.content.len() as u64;
        self.head.send_replace(Head {
            write_head: writer.head,
            deleted: false,
        });

        Ok(Appended {
            last: Offset::new(begin + last),
            next: Offset::new(writer.head),
            records: framed.begins.len() as u64,
        })
    }

    /// Read whole records beginning at `from`, up to about `max_bytes`.
    /// Blocks on file I/O and must be called from a blocking context.
    pub fn read(&self, from: Offset, max_bytes: u64) -> Result<super::Batch> {
        let Head {
            write_head,
            deleted,
        } = self.head();

        if deleted {
            return Err(Error::StreamNotFound(self.name.clone()));
        } else if from.get() >= write_head {
            return Ok(super::Batch::empty(from, Offset::new(write_head)));
        }

        // Map `from` and `max_bytes` into a range of record begin offsets.
        let (begins, end) = {
            let index = self.index.read().unwrap();

            let Ok(first) = index.binary_search(&from.get()) else {
                return Err(Error::InvalidOffset {
                    name: self.name.clone(),
                    offset: from,
                });
            };
            // The index may extend beyond our `write_head` snapshot.
            let published = index.partition_point(|b| *b < write_head);
            let end_of = |i: usize| {
                if i + 1 < published {
                    index[i + 1]
                } else {
                    write_head
                }
            };

            let mut last = first;
            while last + 1 < published && end_of(last + 1) - from.get() <= max_bytes {
                last += 1;
            }
            (index[first..=last].to_vec(), end_of(last))
        };

        let mut buf = vec![0u8; (end - from.get()) as usize];
        self.file
            .read_exact_at(&mut buf, from.get())
            .map_err(|source| Error::StreamUnavailable {
                name: self.name.clone(),
                source,
            })?;
        let content = Bytes::from(buf);

        let records = begins
            .iter()
            .enumerate()
            .map(|(i, begin)| {
                let lo = (begin - from.get()) as usize;
                let hi = match begins.get(i + 1) {
                    Some(next) => (next - from.get()) as usize,
                    None => content.len(),
                };
                super::Record {
                    offset: Offset::new(*begin),
                    next_offset: Offset::new(from.get() + hi as u64),
                    // Strip the trailing newline.
                    payload: content.slice(lo..hi - 1),
                }
            })
            .collect();

        Ok(super::Batch {
            offset: from,
            next_offset: Offset::new(end),
            write_head: Offset::new(write_head),
            content,
            records,
        })
    }

    /// Mark the Log as deleted, waking all long-polling readers.
    pub fn mark_deleted(&self) {
        let mut writer = self.writer.lock().unwrap();
        writer.failed = true;

        self.head.send_replace(Head {
            write_head: writer.head,
            deleted: true,
        });
    }
}

fn open_log_file(dir: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(dir.join(LOG_FILE))
}
