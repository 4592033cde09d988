//! Transport session: half-duplex frame exchange with timeout and retry.
//!
//! A [`TransportSession`] owns the serial channel. [`TransportSession::invoke`]
//! assigns a sequence number, writes the encoded command frame, and waits for
//! a response frame with the matching sequence number. On timeout the same
//! frame (same sequence number) is re-sent, up to the configured attempt
//! limit. Stale responses from earlier timed-out attempts are discarded, and
//! a corrupt frame during the wait does not end the attempt: the decoder
//! resynchronizes and a valid late match may still arrive before the
//! deadline.
//!
//! The physical link is half-duplex, so at most one frame exchange is in
//! flight per channel. Concurrent callers suspend on a fair mutex and are
//! served strictly in the order they asked.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, warn};

use crate::catalog::{Catalog, TcmdId};
use crate::codec::{
    decode_response_payload, encode_command, DecodeStep, FrameDecoder, FrameKind,
};
use crate::command::{validate_args, ArgValue, EncodeError, Invocation};

/// Byte-oriented duplex stream supplied by a transport collaborator: a
/// physical serial port, a simulator, or a test double.
///
/// `recv` resolves with whatever bytes are available, possibly a partial
/// frame or several frames; an empty chunk means "nothing yet, keep
/// waiting". The session applies its own deadline around `recv`, so
/// implementations may block indefinitely.
#[allow(async_fn_in_trait)]
pub trait SerialChannel: Send {
    async fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
    async fn close(&mut self);
}

/// Timeout and retry policy for one session. Passed in explicitly; the
/// session has no environment or persisted configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionConfig {
    /// How long one attempt waits for a matching response.
    pub response_timeout: Duration,
    /// Total send attempts before the invocation is `Unresponsive`.
    pub max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            max_retries: 3,
        }
    }
}

/// Terminal outcome of one invocation, owned by the caller. Every link
/// failure mode is a value here, never a panic, so procedures can assert
/// on expected failures the same way they assert on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseRecord {
    /// The remote executed the command and answered with decoded fields.
    Success { fields: Vec<ArgValue> },
    /// The remote answered with a non-zero status code.
    Rejected { code: u8, fields: Vec<ArgValue> },
    /// Every attempt timed out without a matching response.
    Unresponsive { attempts: u32 },
    /// The caller's cancellation token fired while waiting.
    Cancelled,
    /// The transport collaborator reported a read or write failure. The
    /// session does not reopen the channel; that is the collaborator's job.
    Channel { message: String },
}

impl ResponseRecord {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseRecord::Success { .. })
    }

    /// Decoded response fields, for successful invocations.
    pub fn fields(&self) -> Option<&[ArgValue]> {
        match self {
            ResponseRecord::Success { fields } | ResponseRecord::Rejected { fields, .. } => {
                Some(fields)
            }
            _ => None,
        }
    }
}

/// Caller-side errors: nothing was sent on the wire.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("unknown telecommand id {0}")]
    UnknownId(TcmdId),
    #[error("unknown telecommand name `{0}`")]
    UnknownName(String),
}

/// External cancellation signal for an in-flight or queued invocation.
/// Cloning shares the signal; cancelling is idempotent.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking so a cancel between the check and
            // the await is not lost.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct SessionInner<C> {
    channel: C,
    decoder: FrameDecoder,
}

/// Synchronous-from-the-caller invoke over one half-duplex channel.
pub struct TransportSession<C> {
    inner: Mutex<SessionInner<C>>,
    catalog: Arc<Catalog>,
    config: SessionConfig,
    next_seq: AtomicU16,
}

impl<C: SerialChannel> TransportSession<C> {
    pub fn new(channel: C, catalog: Arc<Catalog>, config: SessionConfig) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                channel,
                decoder: FrameDecoder::new(),
            }),
            catalog,
            config,
            next_seq: AtomicU16::new(1),
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Invoke a telecommand by identifier and wait for its outcome.
    ///
    /// Suspends while another caller's exchange is in flight (FIFO order)
    /// and while waiting for the response. Link-level failures come back as
    /// [`ResponseRecord`] values; only caller errors (bad arguments,
    /// unknown id) are `Err`.
    pub async fn invoke(
        &self,
        id: TcmdId,
        args: &[ArgValue],
        cancel: &CancelToken,
    ) -> Result<ResponseRecord, InvokeError> {
        let def = self.catalog.get(id).ok_or(InvokeError::UnknownId(id))?;
        // Reject bad arguments before taking a turn on the channel.
        validate_args(def, args)?;

        // The fair mutex is the serialization slot: one frame exchange in
        // flight, waiters served in request order. Abandoning the wait on
        // cancel gives up our place without disturbing later callers.
        let mut inner = tokio::select! {
            guard = self.inner.lock() => guard,
            () = cancel.cancelled() => return Ok(ResponseRecord::Cancelled),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let frame_bytes = encode_command(seq, def, args)?;

        for attempt in 1..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Ok(ResponseRecord::Cancelled);
            }
            if attempt > 1 {
                warn!(%id, seq, attempt, "no matching response, re-sending frame");
            }
            if let Err(err) = inner.channel.send(&frame_bytes).await {
                return Ok(ResponseRecord::Channel {
                    message: err.to_string(),
                });
            }

            match Self::wait_for_match(&mut inner, seq, self.config.response_timeout, cancel)
                .await
            {
                WaitOutcome::Matched(record) => return Ok(record),
                WaitOutcome::TimedOut => {}
                WaitOutcome::Cancelled => return Ok(ResponseRecord::Cancelled),
                WaitOutcome::ChannelError(message) => {
                    return Ok(ResponseRecord::Channel { message })
                }
            }
        }

        debug!(%id, seq, attempts = self.config.max_retries, "invocation unresponsive");
        Ok(ResponseRecord::Unresponsive {
            attempts: self.config.max_retries,
        })
    }

    /// Invoke by human name, resolving through the shared catalog.
    pub async fn invoke_by_name(
        &self,
        name: &str,
        args: &[ArgValue],
        cancel: &CancelToken,
    ) -> Result<ResponseRecord, InvokeError> {
        let id = self
            .catalog
            .get_by_name(name)
            .map(|def| def.id)
            .ok_or_else(|| InvokeError::UnknownName(name.to_string()))?;
        self.invoke(id, args, cancel).await
    }

    /// Invoke a prepared [`Invocation`].
    pub async fn submit(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ResponseRecord, InvokeError> {
        self.invoke(invocation.id, &invocation.args, cancel).await
    }

    /// Close the underlying channel.
    pub async fn close(self) {
        let mut inner = self.inner.into_inner();
        inner.channel.close().await;
    }

    async fn wait_for_match(
        inner: &mut SessionInner<C>,
        seq: u16,
        response_timeout: Duration,
        cancel: &CancelToken,
    ) -> WaitOutcome {
        let deadline = Instant::now() + response_timeout;

        loop {
            // Drain whatever is already buffered before reading again.
            loop {
                match inner.decoder.next_frame() {
                    DecodeStep::NeedMoreData => break,
                    DecodeStep::Corrupt(kind) => {
                        // Not fatal to the attempt: the decoder has already
                        // resynchronized and a valid late match may follow.
                        warn!(%kind, "corrupt frame on channel, resynchronized");
                    }
                    DecodeStep::Frame(frame) => {
                        if frame.kind != FrameKind::Response {
                            debug!(seq = frame.seq, "discarding non-response frame");
                            continue;
                        }
                        if frame.seq != seq {
                            debug!(
                                got = frame.seq,
                                want = seq,
                                "discarding stale response frame"
                            );
                            continue;
                        }
                        match decode_response_payload(&frame.payload) {
                            Ok((0, fields)) => {
                                return WaitOutcome::Matched(ResponseRecord::Success {
                                    fields,
                                })
                            }
                            Ok((code, fields)) => {
                                return WaitOutcome::Matched(ResponseRecord::Rejected {
                                    code,
                                    fields,
                                })
                            }
                            Err(err) => {
                                // CRC passed but the payload is malformed;
                                // treat like corruption and keep waiting.
                                warn!(seq, %err, "malformed response payload, ignoring frame");
                            }
                        }
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }

            tokio::select! {
                () = cancel.cancelled() => return WaitOutcome::Cancelled,
                read = timeout(remaining, inner.channel.recv()) => match read {
                    Err(_) => return WaitOutcome::TimedOut,
                    Ok(Err(err)) => return WaitOutcome::ChannelError(err.to_string()),
                    Ok(Ok(chunk)) => {
                        if !chunk.is_empty() {
                            inner.decoder.feed(&chunk);
                        }
                    }
                },
            }
        }
    }
}

enum WaitOutcome {
    Matched(ResponseRecord),
    TimedOut,
    Cancelled,
    ChannelError(String),
}
