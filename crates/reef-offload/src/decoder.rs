//! Offloading Reed-Solomon decoder.
//!
//! Reconstructs erased units of a stripe from the units still present.
//! The compute service receives the first `k` present units and answers
//! with the erased units in ascending index order; the decoder writes
//! them back in the order the caller named them.

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

/// Patterns computed for one `(erased, valid)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PatternCache {
    erased: Vec<usize>,
    valid: Vec<usize>,
    erasure_pattern: BitPattern,
    survival_pattern: BitPattern,
    /// Positions in `erased`, sorted by the index they name.
    reply_order: Vec<usize>,
}

impl PatternCache {
    fn compute(erased: &[usize], valid: &[usize], num_all_units: usize) -> Self {
        let mut reply_order: Vec<usize> = (0..erased.len()).collect();
        reply_order.sort_by_key(|&position| erased[position]);
        Self {
            erased: erased.to_vec(),
            valid: valid.to_vec(),
            erasure_pattern: encode_indices(erased, num_all_units),
            survival_pattern: encode_indices(valid, num_all_units),
            reply_order,
        }
    }

    fn matches(&self, erased: &[usize], valid: &[usize]) -> bool {
        self.erased == erased && self.valid == valid
    }
}

/// Decoder dispatching to the compute service or the software coder.
///
/// One instance is one channel session: calls take `&mut self` and must
/// not overlap.
pub struct OffloadDecoder {
    coding: CodingConfiguration,
    session: OffloadSession,
    software: Arc<dyn SoftwareCoder>,
    cache: Option<PatternCache>,
    cache_hits: u64,
}

impl OffloadDecoder {
    /// Build a decoder and open the channel `config` selects.
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

    /// Build a decoder over an already open channel.
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

    /// Build a decoder that always codes locally.
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
        Self {
            coding,
            session,
            software,
            cache: None,
            cache_hits: 0,
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

    /// Offloaded calls that reused the previous call's patterns.
    pub fn pattern_cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Reconstruct the units named by `erased_indexes`.
    ///
    /// `inputs` has one slot per unit; `None` marks a missing unit.
    /// `outputs[i]` receives unit `erased_indexes[i]`. Units that are
    /// missing but not erased are simply not used.
    ///
    /// # Errors
    ///
    /// [`CoderError::InvalidState`] if fewer than `k` units are present
    /// or `erased_indexes` names a unit that is out of range, repeated,
    /// or still present. [`CoderError::LengthMismatch`] if the present
    /// units differ in length. No channel traffic happens in those cases.
    pub async fn decode(
        &mut self,
        inputs: &[Option<&[u8]>],
        erased_indexes: &[usize],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CoderError> {
        let valid = self.check_arguments(inputs, erased_indexes, outputs.len())?;
        if erased_indexes.is_empty() {
            return Ok(());
        }

        let cell_length = inputs.iter().flatten().next().map_or(0, |i| i.len());
        if !self.session.should_offload(cell_length) {
            debug!(
                k = self.coding.data_units(),
                p = self.coding.parity_units(),
                cell_length,
                erased = erased_indexes.len(),
                "decoding locally"
            );
            return Ok(self.software.decode(inputs, erased_indexes, outputs)?);
        }

        match &self.cache {
            Some(cache) if cache.matches(erased_indexes, &valid) => self.cache_hits += 1,
            _ => {
                self.cache = Some(PatternCache::compute(
                    erased_indexes,
                    &valid,
                    self.coding.all_units(),
                ));
            }
        }
        let Some(patterns) = self.cache.as_ref() else {
            return Err(CoderError::InvalidState("decode patterns unavailable".into()));
        };

        let selected: Vec<&[u8]> = valid
            .iter()
            .take(self.coding.data_units())
            .filter_map(|&i| inputs[i])
            .collect();

        // Reply cells arrive in ascending unit order.
        let mut slots: Vec<Option<&mut [u8]>> =
            outputs.iter_mut().map(|o| Some(&mut **o)).collect();
        let mut ordered: Vec<&mut [u8]> = patterns
            .reply_order
            .iter()
            .filter_map(|&position| slots[position].take())
            .collect();

        let (erasure_pattern, survival_pattern) =
            (patterns.erasure_pattern, patterns.survival_pattern);
        self.session
            .round_trip(
                erasure_pattern,
                survival_pattern,
                &selected,
                cell_length,
                &mut ordered,
            )
            .await?;
        debug!(
            erasure = %erasure_pattern,
            survival = %survival_pattern,
            cell_length,
            "decode offloaded"
        );
        Ok(())
    }

    /// Validate the call and return the present unit indices, ascending.
    fn check_arguments(
        &self,
        inputs: &[Option<&[u8]>],
        erased_indexes: &[usize],
        num_outputs: usize,
    ) -> Result<Vec<usize>, CoderError> {
        let n = self.coding.all_units();
        let k = self.coding.data_units();
        if inputs.len() != n {
            return Err(CoderError::InvalidState(format!(
                "decode expects {n} input slots, got {}",
                inputs.len()
            )));
        }
        if num_outputs != erased_indexes.len() {
            return Err(CoderError::InvalidState(format!(
                "{} erased units but {num_outputs} outputs",
                erased_indexes.len()
            )));
        }

        let mut seen = 0u32;
        for &index in erased_indexes {
            if index >= n {
                return Err(CoderError::InvalidState(format!(
                    "erased index {index} out of range 0..{n}"
                )));
            }
            if seen & (1 << index) != 0 {
                return Err(CoderError::InvalidState(format!(
                    "erased index {index} listed twice"
                )));
            }
            if inputs[index].is_some() {
                return Err(CoderError::InvalidState(format!(
                    "erased unit {index} is still present"
                )));
            }
            seen |= 1 << index;
        }

        let valid: Vec<usize> = inputs
            .iter()
            .enumerate()
            .filter_map(|(i, input)| input.map(|_| i))
            .collect();
        if valid.len() < k {
            return Err(CoderError::InvalidState(format!(
                "{} units present, need at least {k}",
                valid.len()
            )));
        }

        let mut present = inputs.iter().flatten();
        let expected = present.next().map_or(0, |i| i.len());
        if let Some(bad) = present.find(|i| i.len() != expected) {
            return Err(CoderError::LengthMismatch {
                expected,
                got: bad.len(),
            });
        }
        Ok(valid)
    }
}
