use crate::{check, codec, Client, Error, Result};
use exponential_backoff::Backoff;
use proto_streams::{AppendResponse, StreamName};
use std::time::Duration;

/// Producer appends records to a stream, retrying transport failures.
#[derive(Clone)]
pub struct Producer {
    client: Client,
    name: StreamName,
    content_type: String,
    backoff: Backoff,
}

/// Outcome of acquiring a Producer of a stream.
pub enum Acquired {
    /// The stream was created.
    Created(Producer),
    /// The stream already existed.
    Existing(Producer),
}

impl Acquired {
    pub fn into_producer(self) -> Producer {
        match self {
            Acquired::Created(producer) | Acquired::Existing(producer) => producer,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Acquired::Created(_))
    }
}

impl Client {
    /// Create the named stream if it doesn't exist, and return a Producer of it.
    /// Racing callers all succeed, and one of them observes `Created`.
    pub async fn create_or_connect(
        &self,
        name: &StreamName,
        content_type: &str,
    ) -> Result<Acquired> {
        let (metadata, created) = self.create(name, content_type).await?;

        tracing::debug!(
            stream = %name,
            created,
            write_head = %metadata.write_head,
            "acquired stream"
        );
        let producer = Producer::new(self.clone(), name.clone(), metadata.content_type);

        Ok(if created {
            Acquired::Created(producer)
        } else {
            Acquired::Existing(producer)
        })
    }

    async fn try_append(
        &self,
        name: &StreamName,
        content_type: &str,
        body: bytes::Bytes,
    ) -> Result<AppendResponse> {
        let resp = self
            .http
            .post(self.append_url(name)?)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;

        Ok(check(name, resp).await?.json().await?)
    }
}

impl Producer {
    /// Build a Producer of an existing stream having `content_type`.
    pub fn new(client: Client, name: StreamName, content_type: String) -> Self {
        Self {
            client,
            name,
            content_type,
            backoff: Backoff::new(5, Duration::from_millis(100), Some(Duration::from_secs(5))),
        }
    }

    /// Set the Backoff of retried appends. Its retry count
    /// bounds the total number of attempts of an append.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Append `payload`, which is one or more newline-delimited records.
    pub async fn append(&self, payload: impl Into<bytes::Bytes>) -> Result<AppendResponse> {
        let payload = payload.into();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match self
                .client
                .try_append(&self.name, &self.content_type, payload.clone())
                .await
            {
                Ok(resp) => return Ok(resp),
                // Only the transport is retried. The broker's errors are definitive.
                Err(err @ Error::Transport(_)) => err,
                Err(err) => return Err(err),
            };

            let Some(delay) = self.backoff.next(attempt) else {
                return Err(Error::AppendFailed {
                    attempts: attempt,
                    source: Box::new(err),
                });
            };
            tracing::warn!(stream = %self.name, attempt, %err, ?delay, "append failed (will retry)");
            tokio::time::sleep(delay).await;
        }
    }

    /// Append `value` as a JSON record.
    pub async fn append_json<T: serde::Serialize>(&self, value: &T) -> Result<AppendResponse> {
        let mut buf = Vec::new();
        codec::encode(value, &mut buf)?;
        self.append(buf).await
    }

    /// Append each of `values` as a JSON record, in a single request.
    /// The response offset is that of the last record.
    pub async fn append_batch<'v, T, I>(&self, values: I) -> Result<AppendResponse>
    where
        T: serde::Serialize + 'v,
        I: IntoIterator<Item = &'v T>,
    {
        let mut buf = Vec::new();
        for value in values {
            codec::encode(value, &mut buf)?;
        }
        self.append(buf).await
    }
}
