//! Relay event streaming
//!
//! A relay reports through an [`EventEmitter`] and the caller reads a
//! [`RelayStream`]. The pair guarantees the reader sees exactly one terminal
//! event: the emitter refuses anything after its first terminal, and the
//! stream synthesizes a failure if the emitter vanishes without one.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

/// Successful end of a relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Tokens forwarded to the caller
    pub tokens: usize,

    /// Result links reported by the upstream, if any
    pub links: BTreeMap<String, String>,
}

/// Why a relay ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// Moderation flagged the accumulated output
    Blocked(String),

    /// Moderation could not be consulted
    ModerationUnavailable(String),

    /// The upstream reported a non-success status inside the stream
    Upstream { status: u16, message: String },

    Cancelled,

    DeadlineExceeded,

    /// The relay stopped without reporting an outcome
    Interrupted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Blocked(reason) => {
                write!(f, "content blocked by moderation: {}", reason)
            }
            FailureReason::ModerationUnavailable(reason) => {
                write!(f, "moderation unavailable: {}", reason)
            }
            FailureReason::Upstream { status, message } => {
                write!(f, "upstream returned status {}: {}", status, message)
            }
            FailureReason::Cancelled => f.write_str("cancelled"),
            FailureReason::DeadlineExceeded => f.write_str("deadline exceeded"),
            FailureReason::Interrupted => f.write_str("relay ended without a result"),
        }
    }
}

/// Event delivered to the caller of a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Token(String),
    Done(Completion),
    Failure(FailureReason),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token(_))
    }
}

/// Builder for an emitter/stream pair
pub struct StreamBuilder {
    buffer_size: usize,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self { buffer_size: 64 }
    }

    /// Set buffer size for the event channel
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    pub fn build(self) -> (EventEmitter, RelayStream) {
        let (tx, rx) = mpsc::channel(self.buffer_size);

        let emitter = EventEmitter {
            tx,
            sequence: 0,
            finished: false,
        };
        let stream = RelayStream {
            inner: ReceiverStream::new(rx),
            finished: false,
        };

        (emitter, stream)
    }
}

impl Default for StreamBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half used by the relay worker.
#[derive(Debug)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    sequence: u64,
    finished: bool,
}

impl EventEmitter {
    /// Forward a token. Returns `false` once the reader is gone or a
    /// terminal event has been sent.
    pub async fn token(&mut self, text: impl Into<String>) -> bool {
        if self.finished {
            return false;
        }
        self.send(StreamEvent::Token(text.into())).await
    }

    /// Send the success terminal. Only the first terminal is delivered.
    pub async fn done(&mut self, completion: Completion) -> bool {
        self.terminal(StreamEvent::Done(completion)).await
    }

    /// Send the failure terminal. Only the first terminal is delivered.
    pub async fn fail(&mut self, reason: FailureReason) -> bool {
        self.terminal(StreamEvent::Failure(reason)).await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Resolves when the reader has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Events sent so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    async fn terminal(&mut self, event: StreamEvent) -> bool {
        if self.finished {
            debug!(event = ?event, "Dropping event after terminal");
            return false;
        }
        self.finished = true;
        self.send(event).await
    }

    async fn send(&mut self, event: StreamEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => {
                self.sequence += 1;
                true
            }
            Err(_) => false,
        }
    }
}

/// Receiving half handed to the caller.
///
/// Ends after the terminal event.
pub struct RelayStream {
    inner: ReceiverStream<StreamEvent>,
    finished: bool,
}

impl RelayStream {
    /// Drain the stream into forwarded tokens and the terminal event.
    pub async fn collect_all(mut self) -> (Vec<String>, StreamEvent) {
        use futures::StreamExt;

        let mut tokens = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(text) => tokens.push(text),
                terminal => return (tokens, terminal),
            }
        }
        (tokens, StreamEvent::Failure(FailureReason::Interrupted))
    }
}

impl Stream for RelayStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(Some(StreamEvent::Failure(FailureReason::Interrupted)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_tokens_then_done() {
        let (mut emitter, stream) = StreamBuilder::new().buffer_size(8).build();

        tokio::spawn(async move {
            assert!(emitter.token("Hello").await);
            assert!(emitter.token(" world").await);
            assert!(emitter
                .done(Completion {
                    tokens: 2,
                    links: BTreeMap::new()
                })
                .await);
        });

        let (tokens, terminal) = stream.collect_all().await;
        assert_eq!(tokens, vec!["Hello", " world"]);
        assert!(matches!(terminal, StreamEvent::Done(Completion { tokens: 2, .. })));
    }

    #[tokio::test]
    async fn test_second_terminal_is_dropped() {
        let (mut emitter, mut stream) = StreamBuilder::new().build();

        assert!(emitter.fail(FailureReason::Cancelled).await);
        assert!(!emitter.done(Completion::default()).await);
        assert!(!emitter.token("late").await);
        drop(emitter);

        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Failure(FailureReason::Cancelled))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_vanished_emitter_yields_interrupted() {
        let (mut emitter, stream) = StreamBuilder::new().build();
        emitter.token("partial").await;
        drop(emitter);

        let (tokens, terminal) = stream.collect_all().await;
        assert_eq!(tokens, vec!["partial"]);
        assert_eq!(terminal, StreamEvent::Failure(FailureReason::Interrupted));
    }

    #[tokio::test]
    async fn test_dropped_reader_reports_false() {
        let (mut emitter, stream) = StreamBuilder::new().build();
        drop(stream);

        emitter.closed().await;
        assert!(!emitter.token("nobody").await);
    }

    #[test]
    fn test_event_serialization() {
        let event = StreamEvent::Failure(FailureReason::Upstream {
            status: 500,
            message: "overloaded".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failure");
        assert_eq!(json["data"]["kind"], "upstream");
        assert_eq!(json["data"]["detail"]["status"], 500);
    }
}
