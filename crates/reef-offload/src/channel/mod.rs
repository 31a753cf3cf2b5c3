//! Request/reply link to the compute service.
//!
//! - [`OffloadChannel`]: the single-flight send/receive contract.
//! - [`LiveChannel`]: TCP session to the offload proxy.
//! - [`MockChannel`]: in-memory replies, selected explicitly.

mod live;
mod mock;

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

pub use live::LiveChannel;
pub use mock::{MockChannel, MockReply, MockStats};

use crate::config::{CodingConfiguration, OffloadConfig};
use crate::error::ChannelError;
use crate::message::{OffloadReply, OffloadRequest};

/// Synchronous request/reply exchange with the compute service.
///
/// At most one request is outstanding per channel: every `send` must be
/// followed by a `receive` before the next `send`. Methods take `&mut self`
/// so a channel cannot be shared by concurrent callers.
///
/// Channels never retry. A failed exchange leaves the channel ready for a
/// fresh `send`.
#[async_trait::async_trait]
pub trait OffloadChannel: Send {
    /// Submit a request.
    async fn send(&mut self, request: OffloadRequest) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the reply to the outstanding request.
    async fn receive(&mut self, timeout: Duration) -> Result<OffloadReply, ChannelError>;

    /// Endpoint this channel talks to, for logs.
    fn endpoint(&self) -> &str;
}

/// Name of the queue carrying requests to `endpoint`.
pub fn request_queue(endpoint: &str) -> String {
    format!("Request{endpoint}")
}

/// Name of the queue carrying replies from `endpoint`.
pub fn response_queue(endpoint: &str) -> String {
    format!("Response{endpoint}")
}

/// Picks one endpoint out of the configured set.
///
/// Seed it for reproducible selection in tests.
#[derive(Debug, Clone)]
pub struct EndpointSelector {
    rng: StdRng,
}

impl EndpointSelector {
    /// Selector seeded from the operating system.
    pub fn from_os_rng() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic selector.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Choose uniformly among `endpoints`; `None` if empty.
    pub fn choose<'a>(&mut self, endpoints: &'a [String]) -> Option<&'a str> {
        if endpoints.is_empty() {
            return None;
        }
        let i = self.rng.random_range(0..endpoints.len());
        Some(endpoints[i].as_str())
    }
}

impl Default for EndpointSelector {
    fn default() -> Self {
        Self::from_os_rng()
    }
}

/// Open the channel selected by `config`.
///
/// Returns `None` when offload is disabled. May block on connection setup
/// for up to the configured connect timeout.
pub async fn open_channel(
    config: &OffloadConfig,
    coding: CodingConfiguration,
    selector: &mut EndpointSelector,
) -> Result<Option<Box<dyn OffloadChannel>>, ChannelError> {
    if !config.enabled {
        info!("offload disabled, coding locally");
        return Ok(None);
    }
    if config.mock {
        info!("offload in mock mode (loopback)");
        return Ok(Some(Box::new(MockChannel::loopback())));
    }
    let channel = LiveChannel::connect(config, coding, selector).await?;
    Ok(Some(Box::new(channel)))
}
