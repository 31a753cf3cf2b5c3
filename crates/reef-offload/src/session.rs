//! One offload round trip: pack, send, receive, unpack.
//!
//! Shared by the encoder and decoder. The session owns the channel (if
//! any) and the fallback policy; callers ask [`OffloadSession::should_offload`]
//! before doing any framing work.

use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{EndpointSelector, OffloadChannel, open_channel};
use crate::config::{CodingConfiguration, OffloadConfig};
use crate::error::CoderError;
use crate::framer;
use crate::message::OffloadRequest;
use crate::pattern::BitPattern;
use crate::policy::FallbackPolicy;

/// Channel plus the policy deciding when to use it.
pub(crate) struct OffloadSession {
    channel: Option<Box<dyn OffloadChannel>>,
    policy: FallbackPolicy,
    receive_timeout: Duration,
}

impl OffloadSession {
    /// Open the channel `config` selects.
    pub(crate) async fn open(
        coding: CodingConfiguration,
        config: &OffloadConfig,
    ) -> Result<Self, CoderError> {
        let mut selector = EndpointSelector::default();
        let channel = open_channel(config, coding, &mut selector).await?;
        let policy = FallbackPolicy::new(coding, channel.is_some());
        Ok(Self::new(channel, policy, config.receive_timeout))
    }

    pub(crate) fn new(
        channel: Option<Box<dyn OffloadChannel>>,
        policy: FallbackPolicy,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            policy,
            receive_timeout,
        }
    }

    pub(crate) fn set_policy(&mut self, policy: FallbackPolicy) {
        self.policy = policy;
    }

    pub(crate) fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    pub(crate) fn endpoint(&self) -> Option<&str> {
        self.channel.as_deref().map(|c| c.endpoint())
    }

    /// Whether a call with this cell length goes over the channel.
    pub(crate) fn should_offload(&self, cell_length: usize) -> bool {
        self.channel.is_some() && self.policy.should_offload(cell_length)
    }

    /// Send `inputs` and write the reply's leading cells into `outputs`.
    ///
    /// Outputs are zeroed once every length has been checked, so a failed
    /// exchange never leaves stale data behind.
    pub(crate) async fn round_trip(
        &mut self,
        erasure_pattern: BitPattern,
        survival_pattern: BitPattern,
        inputs: &[&[u8]],
        cell_length: usize,
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CoderError> {
        let channel = self
            .channel
            .as_deref_mut()
            .ok_or_else(|| CoderError::InvalidState("no offload channel is open".into()))?;

        let payload = framer::pack(inputs, cell_length)?;
        if let Some(bad) = outputs.iter().find(|o| o.len() != cell_length) {
            return Err(CoderError::LengthMismatch {
                expected: cell_length,
                got: bad.len(),
            });
        }
        framer::reset(outputs);

        channel
            .send(OffloadRequest {
                erasure_pattern,
                survival_pattern,
                cell_length,
                payload,
            })
            .await
            .inspect_err(|e| warn!(endpoint = channel.endpoint(), error = %e, "offload send failed"))?;
        let reply = channel
            .receive(self.receive_timeout)
            .await
            .inspect_err(|e| warn!(endpoint = channel.endpoint(), error = %e, "offload receive failed"))?;

        let expected = outputs.len() * cell_length;
        let got = reply.payload.len();
        if got < expected {
            return Err(CoderError::ShortReply { expected, got });
        }
        if got > expected {
            debug!(expected, got, "ignoring surplus reply bytes");
        }
        framer::unpack(&reply.payload[..expected], outputs.len(), cell_length, outputs)
    }
}
