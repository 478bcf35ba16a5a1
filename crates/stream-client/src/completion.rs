//! Accumulation of a chat completion from the records of its response stream.

use crate::{ChunkSource, Consumer};

/// CompletionChunk is a record of a response stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionChunk {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_complete: bool,
    /// Present if the completion failed. Any JSON value other than null is
    /// a failure, such as a message string or an object describing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("completion failed: {message}")]
    Failed { message: String, partial: String },
    #[error("response stream closed before the completion finished")]
    Incomplete { partial: String },
    #[error(transparent)]
    Stream(#[from] crate::Error),
}

/// Accumulate the content of CompletionChunks read by `consumer`, until a
/// chunk marks the completion as finished or failed. The consumer is left
/// positioned after that final chunk.
pub async fn collect_completion<S: ChunkSource>(
    consumer: &mut Consumer<CompletionChunk, S>,
) -> Result<String, CompletionError> {
    let mut text = String::new();

    while let Some(record) = consumer.next().await {
        let CompletionChunk {
            content,
            is_complete,
            error,
        } = record?.value;

        if let Some(error) = error {
            let message = match error {
                serde_json::Value::String(message) => message,
                other => other.to_string(),
            };
            return Err(CompletionError::Failed {
                message,
                partial: text,
            });
        }
        text.push_str(&content);

        if is_complete {
            return Ok(text);
        }
    }
    Err(CompletionError::Incomplete { partial: text })
}
