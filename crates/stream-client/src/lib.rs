//! Client of durable streams: a Producer which appends records to a stream,
//! a Consumer which follows a stream from an offset and rides out
//! disconnections, and glue which pairs them into a worker Conversation.

use proto_streams::{ErrorBody, ErrorCode, Offset, StreamMetadata, StreamName};

pub mod codec;
pub mod completion;

mod consumer;
pub use consumer::{Consumer, ConsumerState, Record};

mod producer;
pub use producer::{Acquired, Producer};

mod read;
pub use read::{Chunk, ChunkSource};

pub mod worker;

/// Re-exported so that users may configure retries without their own dependency.
pub use exponential_backoff::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream '{0}' not found")]
    StreamNotFound(StreamName),
    #[error("stream is unavailable: {0}")]
    StreamUnavailable(String),
    #[error("{0}")]
    ContentTypeMismatch(String),
    #[error("{0}")]
    InvalidOffset(String),
    #[error("request was rejected ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("append failed after {attempts} attempts")]
    AppendFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("record at offset {offset} is not valid JSON")]
    MalformedRecord {
        offset: Offset,
        #[source]
        source: serde_json::Error,
    },
    #[error("consumer of '{stream}' disconnected at offset {offset}")]
    ConsumerDisconnected {
        stream: StreamName,
        offset: Offset,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid stream URL")]
    Url(#[from] url::ParseError),
    #[error("failed to encode record")]
    Encode(#[source] serde_json::Error),
    #[error("failed to persist cursor at {path:?}")]
    Cursor {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Is this a failure of the connection or of the broker, which a reader
    /// may expect to resolve by trying again?
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::StreamUnavailable(_) | Error::Protocol(_)
        )
    }
}

/// Client of a stream broker. It's cheaply cloned, and clones share
/// a pool of connections.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: url::Url,
    read_timeout: std::time::Duration,
}

/// Default bound on a read request, which exceeds the broker's default
/// long-poll duration of 30 seconds.
pub const DEFAULT_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

impl Client {
    /// Build a Client of the broker at `base`, such as "http://localhost:8080/".
    pub fn new(base: url::Url) -> Self {
        Self::with_http(reqwest::Client::new(), base)
    }

    /// Build a Client which issues requests through the provided reqwest::Client.
    pub fn with_http(http: reqwest::Client, mut base: url::Url) -> Self {
        // Joins are relative to the final path segment, which must be a directory.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            http,
            base,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Bound each read request by `timeout`, after which it fails with a
    /// transient Error::Transport. It must exceed the broker's long-poll duration.
    pub fn with_read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Create the named stream, returning its metadata and whether it was
    /// newly created (as opposed to already existing with this content-type).
    pub async fn create(
        &self,
        name: &StreamName,
        content_type: &str,
    ) -> Result<(StreamMetadata, bool)> {
        let resp = self
            .http
            .post(self.stream_url(name)?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .send()
            .await?;

        let resp = check(name, resp).await?;
        let created = resp.status() == reqwest::StatusCode::CREATED;

        Ok((resp.json().await?, created))
    }

    /// Fetch metadata of the named stream.
    pub async fn metadata(&self, name: &StreamName) -> Result<StreamMetadata> {
        let resp = self.http.head(self.stream_url(name)?).send().await?;
        let resp = check(name, resp).await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        Ok(StreamMetadata {
            name: name.clone(),
            content_type,
            write_head: offset_header(&resp, proto_streams::STREAM_NEXT_OFFSET)?,
        })
    }

    /// Delete the named stream and all of its records.
    pub async fn delete(&self, name: &StreamName) -> Result<()> {
        let resp = self.http.delete(self.stream_url(name)?).send().await?;
        check(name, resp).await?;
        Ok(())
    }

    fn stream_url(&self, name: &StreamName) -> Result<url::Url> {
        Ok(self.base.join(&format!("v1/stream/{name}"))?)
    }

    fn append_url(&self, name: &StreamName) -> Result<url::Url> {
        Ok(self.base.join(&format!(
            "v1/stream/{name}/{}",
            proto_streams::APPEND_SEGMENT
        ))?)
    }
}

// Map a non-success response into its Error, using the ErrorBody if present.
async fn check(name: &StreamName, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();

    if status.is_success() {
        return Ok(resp);
    } else if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::StreamNotFound(name.clone()));
    }
    let body = resp.bytes().await?;

    let Ok(ErrorBody { error, message }) = serde_json::from_slice::<ErrorBody>(&body) else {
        return Err(if status.is_server_error() {
            Error::StreamUnavailable(format!("broker responded with {status}"))
        } else {
            Error::Protocol(format!("unexpected response status {status}"))
        });
    };

    Err(match error {
        ErrorCode::StreamNotFound => Error::StreamNotFound(name.clone()),
        ErrorCode::StreamUnavailable => Error::StreamUnavailable(message),
        ErrorCode::ContentTypeMismatch => Error::ContentTypeMismatch(message),
        ErrorCode::InvalidOffset => Error::InvalidOffset(message),
        code => Error::Rejected { code, message },
    })
}

fn offset_header(resp: &reqwest::Response, header: &'static str) -> Result<Offset> {
    resp.headers()
        .get(header)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("response has no valid {header} header")))
}
