//! In-memory channel with scripted replies.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::debug;

use super::OffloadChannel;
use crate::engine::OffloadEngine;
use crate::error::ChannelError;
use crate::message::{OffloadReply, OffloadRequest};

/// How a [`MockChannel`] answers.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return the request payload unchanged.
    Loopback,
    /// Return the first `parity_units` cells of the payload.
    ParityPrefix {
        /// Cells to keep.
        parity_units: usize,
    },
    /// Compute real results with an engine.
    Compute(OffloadEngine),
    /// Never answer; `receive` waits out its timeout.
    Silent,
    /// Refuse every `send` as if the service were unreachable.
    Disconnected,
}

/// Call counters shared between a mock and the test holding it.
#[derive(Debug, Default)]
pub struct MockStats {
    sends: AtomicUsize,
    receives: AtomicUsize,
}

impl MockStats {
    /// Number of `send` calls.
    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of `receive` calls.
    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }

    /// Total channel calls.
    pub fn calls(&self) -> usize {
        self.sends() + self.receives()
    }
}

/// [`OffloadChannel`] answering from memory.
#[derive(Debug)]
pub struct MockChannel {
    mode: MockReply,
    pending: Option<OffloadRequest>,
    stats: Arc<MockStats>,
}

impl MockChannel {
    /// Mock answering in `mode`.
    pub fn new(mode: MockReply) -> Self {
        Self {
            mode,
            pending: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Mock echoing every payload.
    pub fn loopback() -> Self {
        Self::new(MockReply::Loopback)
    }

    /// Handle on this mock's counters.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait::async_trait]
impl OffloadChannel for MockChannel {
    async fn send(&mut self, request: OffloadRequest) -> Result<(), ChannelError> {
        self.stats.sends.fetch_add(1, Ordering::SeqCst);
        if matches!(self.mode, MockReply::Disconnected) {
            return Err(ChannelError::NotConnected("mock endpoint is down".into()));
        }
        if self.pending.is_some() {
            return Err(ChannelError::TransportFailure(
                "a request is already outstanding".into(),
            ));
        }
        debug!(
            erasure = %request.erasure_pattern,
            survival = %request.survival_pattern,
            bytes = request.payload.len(),
            "mock send"
        );
        self.pending = Some(request);
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<OffloadReply, ChannelError> {
        self.stats.receives.fetch_add(1, Ordering::SeqCst);
        let request = self.pending.take().ok_or_else(|| {
            ChannelError::TransportFailure("receive without an outstanding request".into())
        })?;

        match &self.mode {
            MockReply::Loopback => Ok(OffloadReply {
                payload: request.payload,
            }),
            MockReply::ParityPrefix { parity_units } => {
                let len = (parity_units * request.cell_length).min(request.payload.len());
                Ok(OffloadReply {
                    payload: request.payload.slice(..len),
                })
            }
            MockReply::Compute(engine) => engine
                .process(&request)
                .map_err(|e| ChannelError::TransportFailure(e.to_string())),
            MockReply::Silent => {
                tokio::time::sleep(timeout).await;
                Err(ChannelError::Timeout(timeout))
            }
            MockReply::Disconnected => Err(ChannelError::NotConnected(
                "mock endpoint is down".into(),
            )),
        }
    }

    fn endpoint(&self) -> &str {
        "mock"
    }
}
