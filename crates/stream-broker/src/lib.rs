use proto_streams::{NameError, Offset, StreamName};

mod api;
pub use api::{build_router, App};

pub mod logging;

pub mod store;
pub use store::{Batch, Creation, Record, Store};

/// Error of a broker operation. Variants map onto the `ErrorCode`s
/// which are returned to clients in the body of a failed request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("stream '{0}' not found")]
    StreamNotFound(StreamName),
    #[error("stream '{name}' is unavailable")]
    StreamUnavailable {
        name: StreamName,
        #[source]
        source: std::io::Error,
    },
    #[error("stream '{name}' has content-type '{expected}', not '{actual}'")]
    ContentTypeMismatch {
        name: StreamName,
        expected: String,
        actual: String,
    },
    #[error("offset {offset} is not a record boundary of stream '{name}'")]
    InvalidOffset { name: StreamName, offset: Offset },
    #[error("invalid read parameters: {0}")]
    InvalidQuery(String),
    #[error(transparent)]
    InvalidName(#[from] NameError),
    #[error("append to stream '{0}' has no records")]
    EmptyAppend(StreamName),
    #[error("missing or invalid Content-Type header")]
    MissingContentType,
    #[error("failed to open store at {path:?}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("store task failed")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;
