use crate::codec::{self, Line};
use crate::{ChunkSource, Client, Error, Result};
use proto_streams::{Offset, ReadMode, StreamName};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// State of a Consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not yet opened.
    Idle,
    /// Opened, and awaiting its first successful read.
    Connecting,
    /// Reading chunks of the stream.
    Streaming,
    /// A read failed. The Consumer will reconnect when next polled.
    Disconnected,
    /// Reading again from the cursor, following a disconnection.
    Reconnecting,
    /// Cancelled. The Consumer will read no further.
    Closed,
}

/// Record is a decoded record of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<T> {
    pub offset: Offset,
    /// Offset of the following record. A reader which has processed this
    /// Record resumes from here.
    pub next_offset: Offset,
    pub value: T,
}

/// Consumer follows a stream from an offset, decoding its newline-delimited
/// JSON records as type `T`. It reconnects after transient failures from the
/// offset of the last record it delivered, until cancelled.
pub struct Consumer<T, S = Client> {
    source: S,
    name: StreamName,
    cancel: CancellationToken,
    reconnect_delay: Duration,

    state: ConsumerState,
    // Offset from which the next read is issued.
    cursor: Offset,
    // Lines read but not yet delivered, and the offset through which they extend.
    pending: VecDeque<Line>,
    pending_end: Offset,
    // Whether the last read reached the write head.
    up_to_date: bool,
    last_error: Option<Error>,

    _value: std::marker::PhantomData<fn() -> T>,
}

impl<T, S> Consumer<T, S>
where
    T: serde::de::DeserializeOwned,
    S: ChunkSource,
{
    pub fn new(source: S, name: StreamName, cancel: CancellationToken) -> Self {
        Self {
            source,
            name,
            cancel,
            reconnect_delay: Duration::from_secs(5),
            state: ConsumerState::Idle,
            cursor: Offset::ZERO,
            pending: VecDeque::new(),
            pending_end: Offset::ZERO,
            up_to_date: false,
            last_error: None,
            _value: Default::default(),
        }
    }

    /// Set the delay before reconnecting after a failed read.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Open the Consumer to read records at or after `offset`.
    /// Records read but not yet delivered from a prior position are discarded.
    pub fn open(&mut self, offset: Offset) {
        if self.state == ConsumerState::Closed {
            return;
        }
        self.cursor = offset;
        self.pending.clear();
        self.pending_end = offset;
        self.up_to_date = false;
        self.state = ConsumerState::Connecting;

        tracing::debug!(stream = %self.name, %offset, "opened consumer");
    }

    pub fn name(&self) -> &StreamName {
        &self.name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Offset from which the Consumer resumes. It's the next offset of the
    /// last delivered record, and never regresses.
    pub fn cursor(&self) -> Offset {
        self.cursor
    }

    /// Error of the Consumer's most recent disconnection, if it hasn't since read successfully.
    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    /// Cancel the Consumer. Equivalent to cancelling its CancellationToken.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.closed();
    }

    /// Next record of the stream. Blocks until one is available.
    ///
    /// Returns None once the Consumer is cancelled. Errors which don't
    /// resolve with a retry, such as a missing stream, are returned, and the
    /// Consumer remains Disconnected: polling again reconnects after its
    /// reconnect delay.
    pub async fn next(&mut self) -> Option<Result<Record<T>>> {
        if self.state == ConsumerState::Idle {
            self.open(self.cursor);
        }

        loop {
            if self.state == ConsumerState::Closed || self.cancel.is_cancelled() {
                self.closed();
                return None;
            }

            if let Some(line) = self.pending.pop_front() {
                // Advance before delivery, so the cursor is never behind a delivered record.
                self.cursor = line.next_offset;

                match codec::decode(&line) {
                    Ok(value) => {
                        return Some(Ok(Record {
                            offset: line.offset,
                            next_offset: line.next_offset,
                            value,
                        }))
                    }
                    Err(err) => {
                        tracing::warn!(stream = %self.name, offset = %line.offset, %err, "skipping malformed record");
                        continue;
                    }
                }
            }
            // Skip past empty lines which trail the last delivered record.
            self.cursor = self.cursor.max(self.pending_end);

            if self.state == ConsumerState::Disconnected {
                let delay = self.reconnect_delay;
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => continue,
                    () = tokio::time::sleep(delay) => (),
                }
                self.state = ConsumerState::Reconnecting;
                tracing::debug!(stream = %self.name, offset = %self.cursor, "reconnecting");
            }

            // Long-poll only once we're caught up, and not while (re)connecting.
            let mode = if self.up_to_date && self.state == ConsumerState::Streaming {
                ReadMode::LongPoll
            } else {
                ReadMode::Immediate
            };

            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => continue,
                result = self.source.read_chunk(&self.name, self.cursor, mode) => result,
            };

            match result {
                Ok(chunk) => {
                    if self.state != ConsumerState::Streaming {
                        tracing::debug!(stream = %self.name, offset = %chunk.offset, "streaming");
                    }
                    self.state = ConsumerState::Streaming;
                    self.last_error = None;
                    self.up_to_date = chunk.up_to_date;

                    let (lines, end) = codec::split_lines(chunk.offset, &chunk.content);
                    self.pending.extend(lines);
                    self.pending_end = end;
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        stream = %self.name,
                        offset = %self.cursor,
                        %err,
                        delay = ?self.reconnect_delay,
                        "stream read failed (will retry)"
                    );
                    self.state = ConsumerState::Disconnected;
                    self.last_error = Some(Error::ConsumerDisconnected {
                        stream: self.name.clone(),
                        offset: self.cursor,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    self.state = ConsumerState::Disconnected;
                    return Some(Err(err));
                }
            }
        }
    }

    fn closed(&mut self) {
        if self.state != ConsumerState::Closed {
            tracing::debug!(stream = %self.name, offset = %self.cursor, "consumer closed");
            self.state = ConsumerState::Closed;
            self.pending.clear();
        }
    }
}

impl Client {
    /// Build a Consumer of the named stream which reads from `offset`.
    pub fn consumer<T: serde::de::DeserializeOwned>(
        &self,
        name: StreamName,
        offset: Offset,
        cancel: CancellationToken,
    ) -> Consumer<T> {
        let mut consumer = Consumer::new(self.clone(), name, cancel);
        consumer.open(offset);
        consumer
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::read::testing::{chunk, ScriptedSource};
    use serde_json::{json, Value};

    fn consumer(source: &ScriptedSource) -> Consumer<Value, ScriptedSource> {
        Consumer::new(
            source.clone(),
            StreamName::new("conversations/c1/responses").unwrap(),
            CancellationToken::new(),
        )
        .with_reconnect_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let source = ScriptedSource::new([chunk(0, "{\"a\":1}\nnot json\n{\"a\":2}\n", true)]);
        let mut consumer = consumer(&source);

        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!((first.offset, first.value), (Offset::ZERO, json!({"a": 1})));
        assert_eq!(consumer.cursor(), Offset::new(8));

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!((second.offset, second.value), (Offset::new(17), json!({"a": 2})));
        assert_eq!(consumer.cursor(), Offset::new(25));
        assert_eq!(consumer.state(), ConsumerState::Streaming);
    }

    #[tokio::test]
    async fn test_reconnects_from_cursor_after_transient_failure() {
        let source = ScriptedSource::new([
            chunk(0, "{\"n\":1}\n", false),
            Err(Error::StreamUnavailable("disk full".to_string())),
            chunk(8, "{\"n\":2}\n", true),
        ]);
        let mut consumer = consumer(&source);

        assert_eq!(consumer.next().await.unwrap().unwrap().value, json!({"n": 1}));
        assert_eq!(consumer.next().await.unwrap().unwrap().value, json!({"n": 2}));
        assert!(consumer.last_error().is_none());

        // The failed read and its retry are both issued from the cursor.
        assert_eq!(
            source.requests(),
            vec![
                (Offset::ZERO, ReadMode::Immediate),
                (Offset::new(8), ReadMode::Immediate),
                (Offset::new(8), ReadMode::Immediate),
            ]
        );

        // Caught up, the following read is a long-poll. It never completes.
        let pending = tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(pending.is_err());
        assert_eq!(
            source.requests().last(),
            Some(&(Offset::new(16), ReadMode::LongPoll))
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_reconnection() {
        let source = ScriptedSource::new([Err(Error::Protocol("bad header".to_string()))]);
        let cancel = CancellationToken::new();
        let mut consumer: Consumer<Value, _> = Consumer::new(
            source.clone(),
            StreamName::new("a/b").unwrap(),
            cancel.clone(),
        )
        .with_reconnect_delay(Duration::from_secs(60));

        let task = tokio::spawn(async move {
            let next = consumer.next().await;
            (next.is_none(), consumer.state(), consumer.cursor())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, (true, ConsumerState::Closed, Offset::ZERO));

        // No read was attempted after the failed one.
        assert_eq!(source.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_read() {
        let source = ScriptedSource::new([]);
        let mut consumer = consumer(&source);
        consumer.open(Offset::new(42));

        let cancel = consumer.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        assert!(consumer.next().await.is_none());
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert_eq!(source.requests(), vec![(Offset::new(42), ReadMode::Immediate)]);

        // Re-opening a closed Consumer has no effect.
        consumer.open(Offset::ZERO);
        assert!(consumer.next().await.is_none());
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_surfaced() {
        let name = StreamName::new("missing").unwrap();
        let source = ScriptedSource::new([
            Err(Error::StreamNotFound(name.clone())),
            chunk(0, "{}\n", true),
        ]);
        let mut consumer: Consumer<Value, _> =
            Consumer::new(source.clone(), name, CancellationToken::new())
                .with_reconnect_delay(Duration::from_millis(10));

        assert!(matches!(
            consumer.next().await,
            Some(Err(Error::StreamNotFound(_)))
        ));
        assert_eq!(consumer.state(), ConsumerState::Disconnected);

        // Polling again reconnects.
        assert_eq!(consumer.next().await.unwrap().unwrap().value, json!({}));
        assert_eq!(consumer.state(), ConsumerState::Streaming);
    }

    #[tokio::test]
    async fn test_partial_record_is_read_again() {
        let source = ScriptedSource::new([
            chunk(0, "{\"n\":1}\n{\"n\"", false),
            chunk(8, "{\"n\":2}\n", true),
        ]);
        let mut consumer = consumer(&source);

        assert_eq!(consumer.next().await.unwrap().unwrap().value, json!({"n": 1}));
        assert_eq!(consumer.next().await.unwrap().unwrap().value, json!({"n": 2}));
        assert_eq!(source.requests()[1], (Offset::new(8), ReadMode::Immediate));
    }
}
