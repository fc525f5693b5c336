//! Streaming relay
//!
//! Takes an endpoint from a pool, opens the upstream stream, and hands the
//! read loop to a dedicated worker. The worker forwards tokens in arrival
//! order, runs moderation every `skip_step` tokens, and reports exactly one
//! terminal event. The endpoint lease lives inside the worker, so the address
//! goes back to its pool however the worker ends.

use crate::executor::moderation::{Moderation, ModerationError};
use crate::executor::pool::{EndpointLease, EndpointPool};
use crate::executor::retry::{retry_with_backoff, RetryConfig};
use crate::executor::streaming::{Completion, EventEmitter, FailureReason};
use crate::{EngineError, Result};
use bigmodel_providers::framing::LineDecoder;
use bigmodel_providers::{ByteStream, GenerationRequest, ProviderAdapter, ProviderError, Transport};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Tokens between moderation checks
    pub skip_step: usize,

    /// Retry policy around acquire when the pool is exhausted
    pub wait: RetryConfig,

    /// Upper bound on a single relay, measured from worker start
    pub deadline: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            skip_step: 5,
            wait: RetryConfig::fixed(Duration::from_millis(500), 3),
            deadline: None,
        }
    }
}

/// Upstream relay shared by all dispatches.
#[derive(Clone)]
pub struct StreamingRelay {
    transport: Arc<dyn Transport>,
    config: RelayConfig,
}

impl StreamingRelay {
    pub fn new(transport: Arc<dyn Transport>, config: RelayConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Start relaying `request` through an endpoint from `pool`.
    ///
    /// Errors returned here happen before any event is emitted: no endpoint
    /// within the wait budget, an invalid request, a failed connect, or
    /// cancellation while connecting. Once this returns `Ok`, every outcome
    /// arrives as the emitter's terminal event.
    pub async fn execute(
        &self,
        pool: &EndpointPool,
        adapter: Arc<dyn ProviderAdapter>,
        request: &GenerationRequest,
        moderation: Arc<dyn Moderation>,
        emitter: EventEmitter,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let body = adapter.build_request(request).map_err(|e| match e {
            ProviderError::InvalidRequest(msg) => EngineError::Validation(msg),
            other => EngineError::Transport(other),
        })?;

        let mut lease = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            lease = self.acquire(pool) => lease?,
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.transport.open(lease.address(), &body) => Some(result),
        };
        let stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                warn!(
                    endpoint = %lease.address(),
                    pool = %lease.pool_name(),
                    error = %e,
                    "Failed to open upstream stream"
                );
                lease.mark_failed();
                return Err(EngineError::Transport(e));
            }
            None => return Err(EngineError::Cancelled),
        };

        let span = info_span!(
            "relay",
            task_type = %request.task_type,
            endpoint = %lease.address(),
            pool = %lease.pool_name()
        );
        let worker = RelayWorker {
            lease,
            stream,
            adapter,
            moderation,
            emitter,
            cancel,
            deadline: self.config.deadline.map(|d| Instant::now() + d),
            gate: ModerationGate::new(self.config.skip_step),
            completion: Completion::default(),
        };

        Ok(tokio::spawn(worker.run().instrument(span)))
    }

    async fn acquire(&self, pool: &EndpointPool) -> Result<EndpointLease> {
        retry_with_backoff(&self.config.wait, "acquire_endpoint", |attempt| async move {
            let result = pool.acquire(pool.acquire_timeout()).await;
            if result.is_err() && attempt.is_last {
                warn!(
                    pool = %pool.name(),
                    capacity = pool.capacity(),
                    "Endpoint pool still exhausted on final attempt"
                );
            }
            result
        })
        .await
    }
}

/// Counts forwarded tokens and releases the accumulated text every
/// `skip_step` tokens.
#[derive(Debug)]
struct ModerationGate {
    skip_step: usize,
    count: usize,
    pending: String,
}

impl ModerationGate {
    fn new(skip_step: usize) -> Self {
        Self {
            skip_step: skip_step.max(1),
            count: 0,
            pending: String::new(),
        }
    }

    fn record(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);
        self.count += 1;
        if self.count >= self.skip_step {
            self.count = 0;
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

enum Outcome {
    Done { clean: bool },
    Failed(FailureReason),
    /// The reader went away; nobody is left to tell.
    Abandoned,
}

struct RelayWorker {
    lease: EndpointLease,
    stream: ByteStream,
    adapter: Arc<dyn ProviderAdapter>,
    moderation: Arc<dyn Moderation>,
    emitter: EventEmitter,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    gate: ModerationGate,
    completion: Completion,
}

impl RelayWorker {
    async fn run(mut self) {
        let outcome = self.pump().await;

        match outcome {
            Outcome::Done { clean } => {
                if clean {
                    self.lease.mark_succeeded();
                } else {
                    self.lease.mark_failed();
                }
                info!(
                    tokens = self.completion.tokens,
                    links = self.completion.links.len(),
                    "Relay completed"
                );
                let completion = std::mem::take(&mut self.completion);
                self.emitter.done(completion).await;
            }
            Outcome::Failed(reason) => {
                if matches!(reason, FailureReason::Upstream { .. }) {
                    self.lease.mark_failed();
                }
                warn!(reason = %reason, tokens = self.completion.tokens, "Relay failed");
                self.emitter.fail(reason).await;
            }
            Outcome::Abandoned => {
                debug!(tokens = self.completion.tokens, "Reader dropped, stopping relay");
            }
        }
    }

    async fn pump(&mut self) -> Outcome {
        let mut decoder = LineDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Failed(FailureReason::Cancelled),
                _ = deadline_elapsed(self.deadline) => return Outcome::Failed(FailureReason::DeadlineExceeded),
                _ = self.emitter.closed() => return Outcome::Abandoned,
                item = self.stream.next() => item,
            };

            match next {
                Some(Ok(bytes)) => {
                    for line in decoder.push(&bytes) {
                        if let Some(outcome) = self.handle_line(&line).await {
                            return outcome;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Upstream read failed, ending relay");
                    return Outcome::Done { clean: false };
                }
                None => {
                    if let Some(line) = decoder.finish() {
                        if let Some(outcome) = self.handle_line(&line).await {
                            return outcome;
                        }
                    }
                    debug!("Upstream closed the stream");
                    return Outcome::Done { clean: true };
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Option<Outcome> {
        let Some(chunk) = self.adapter.parse_chunk(line) else {
            debug!(line, "Skipping undecodable line");
            return None;
        };

        if !self.adapter.is_success(&chunk) {
            return Some(Outcome::Failed(FailureReason::Upstream {
                status: chunk.status,
                message: chunk.message.unwrap_or_default(),
            }));
        }

        if !chunk.text.is_empty() {
            let delivered = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(Outcome::Failed(FailureReason::Cancelled)),
                sent = self.emitter.token(chunk.text.clone()) => sent,
            };
            if !delivered {
                return Some(Outcome::Abandoned);
            }
            self.completion.tokens += 1;

            if let Some(text) = self.gate.record(&chunk.text) {
                match self.moderation.check(&text).await {
                    Ok(()) => {}
                    Err(ModerationError::Blocked(reason)) => {
                        return Some(Outcome::Failed(FailureReason::Blocked(reason)));
                    }
                    Err(ModerationError::CheckFailed(reason)) => {
                        return Some(Outcome::Failed(FailureReason::ModerationUnavailable(reason)));
                    }
                }
            }
        }

        let terminal = self.adapter.is_terminal(&chunk);
        self.completion.links.extend(chunk.links);
        terminal.then_some(Outcome::Done { clean: true })
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
