//! Offloading Reed-Solomon encoder.
//!
//! Computes the `p` parity cells of a stripe from its `k` data cells,
//! either over the compute channel or with the local software coder.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::channel::OffloadChannel;
use crate::config::{CodingConfiguration, OffloadConfig};
use crate::error::CoderError;
use crate::pattern::{BitPattern, encode_indices};
use crate::policy::FallbackPolicy;
use crate::session::OffloadSession;
use crate::software::SoftwareCoder;

/// Encoder dispatching to the compute service or the software coder.
///
/// One instance is one channel session: calls take `&mut self` and must
/// not overlap. Use one encoder per concurrent caller.
pub struct OffloadEncoder {
    coding: CodingConfiguration,
    /// Data units `[0, k)`.
    survival_pattern: BitPattern,
    /// Parity units `[k, k + p)`.
    erasure_pattern: BitPattern,
    session: OffloadSession,
    software: Arc<dyn SoftwareCoder>,
}

impl OffloadEncoder {
    /// Build an encoder and open the channel `config` selects.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot be set up.
    pub async fn new(
        coding: CodingConfiguration,
        config: &OffloadConfig,
        software: Arc<dyn SoftwareCoder>,
    ) -> Result<Self, CoderError> {
        let session = OffloadSession::open(coding, config).await?;
        Ok(Self::from_session(coding, session, software))
    }

    /// Build an encoder over an already open channel.
    pub fn with_channel(
        coding: CodingConfiguration,
        channel: Box<dyn OffloadChannel>,
        receive_timeout: Duration,
        software: Arc<dyn SoftwareCoder>,
    ) -> Self {
        let session = OffloadSession::new(
            Some(channel),
            FallbackPolicy::new(coding, true),
            receive_timeout,
        );
        Self::from_session(coding, session, software)
    }

    /// Build an encoder that always codes locally.
    pub fn software_only(coding: CodingConfiguration, software: Arc<dyn SoftwareCoder>) -> Self {
        let session = OffloadSession::new(
            None,
            FallbackPolicy::new(coding, false),
            Duration::ZERO,
        );
        Self::from_session(coding, session, software)
    }

    fn from_session(
        coding: CodingConfiguration,
        session: OffloadSession,
        software: Arc<dyn SoftwareCoder>,
    ) -> Self {
        let k = coding.data_units();
        let n = coding.all_units();
        let data: Vec<usize> = (0..k).collect();
        let parity: Vec<usize> = (k..n).collect();
        Self {
            coding,
            survival_pattern: encode_indices(&data, n),
            erasure_pattern: encode_indices(&parity, n),
            session,
            software,
        }
    }

    /// Replace the fallback policy.
    pub fn with_policy(mut self, policy: FallbackPolicy) -> Self {
        self.session.set_policy(policy);
        self
    }

    /// The coding configuration.
    pub fn coding(&self) -> CodingConfiguration {
        self.coding
    }

    /// The fallback policy in force.
    pub fn policy(&self) -> FallbackPolicy {
        self.session.policy()
    }

    /// Endpoint of the open channel, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.session.endpoint()
    }

    /// Fill `outputs` (one per parity unit) with parity of `inputs` (one
    /// per data unit). All buffers share one cell length.
    ///
    /// # Errors
    ///
    /// [`CoderError::InvalidState`] for wrong buffer counts,
    /// [`CoderError::LengthMismatch`] for uneven buffers, channel and
    /// reply errors on the offload path, software errors otherwise.
    pub async fn encode(
        &mut self,
        inputs: &[&[u8]],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CoderError> {
        let cell_length = inputs.first().map_or(0, |i| i.len());
        if !self.session.should_offload(cell_length) {
            debug!(
                k = self.coding.data_units(),
                p = self.coding.parity_units(),
                cell_length,
                "encoding locally"
            );
            return Ok(self.software.encode(inputs, outputs)?);
        }

        if inputs.len() != self.coding.data_units() || outputs.len() != self.coding.parity_units() {
            return Err(CoderError::InvalidState(format!(
                "encode expects {} inputs and {} outputs, got {} and {}",
                self.coding.data_units(),
                self.coding.parity_units(),
                inputs.len(),
                outputs.len()
            )));
        }

        self.session
            .round_trip(
                self.erasure_pattern,
                self.survival_pattern,
                inputs,
                cell_length,
                outputs,
            )
            .await?;
        debug!(
            erasure = %self.erasure_pattern,
            survival = %self.survival_pattern,
            cell_length,
            "encode offloaded"
        );
        Ok(())
    }
}
