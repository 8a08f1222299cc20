use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use super::TransferReport;
use crate::error::{Result, SdkError};
use crate::protocol::Frame;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique id keying a context in the pending-response table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationToken(u64);

impl CorrelationToken {
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Completion callback of a context.
pub type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Correlates an outbound unit with its single completion.
pub struct Context<T> {
    token: CorrelationToken,
    timeout: Option<Duration>,
    callback: Callback<T>,
}

/// Context of a [`Command`](super::Command); completes with the response frame.
pub type CommandContext = Context<Frame>;

/// Context of a [`DataSequence`](super::DataSequence).
pub type DataObjContext = Context<TransferReport>;

impl<T: Send + 'static> Context<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self {
            token: CorrelationToken::next(),
            timeout: None,
            callback: Box::new(callback),
        }
    }

    /// A context whose result is delivered on a oneshot channel.
    ///
    /// If the receiver is gone the result is discarded.
    pub fn channel() -> (Self, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        let ctx = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (ctx, rx)
    }

    /// Deadline for this unit. A command context overrides the connection's
    /// request timeout; a data context bounds the whole transfer and has no
    /// deadline unless one is set here. Very long deadlines are clamped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<T> Context<T> {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Deliver the result. Consumes the context.
    pub fn complete(self, result: Result<T>) {
        (self.callback)(result)
    }

    pub(crate) fn into_parts(self) -> (CorrelationToken, Option<Duration>, Callback<T>) {
        (self.token, self.timeout, self.callback)
    }
}

impl<T> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("token", &self.token)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Await a oneshot fed by [`Context::channel`].
pub(crate) async fn recv<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    rx.await.unwrap_or_else(|_| {
        Err(SdkError::ConnectionLost(
            "connection dropped before completing the request".to_string(),
        ))
    })
}
