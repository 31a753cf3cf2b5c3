//! Request processor standing in for the compute hardware.
//!
//! Interprets an [`OffloadRequest`] exactly as the hardware does: the
//! payload carries the cells of the lowest `k` set bits of the survival
//! pattern, and the reply carries the units of the erasure pattern in
//! ascending order.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::debug;

use crate::config::CodingConfiguration;
use crate::error::CoderError;
use crate::message::{OffloadReply, OffloadRequest};
use crate::software::{ReedSolomonCoder, SoftwareCoder};

/// Serves offload requests with a [`SoftwareCoder`].
#[derive(Clone)]
pub struct OffloadEngine {
    coding: CodingConfiguration,
    coder: Arc<dyn SoftwareCoder>,
}

impl std::fmt::Debug for OffloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadEngine")
            .field("coding", &self.coding)
            .finish_non_exhaustive()
    }
}

impl OffloadEngine {
    /// Engine backed by [`ReedSolomonCoder`].
    pub fn new(coding: CodingConfiguration) -> Self {
        Self::with_coder(
            coding,
            Arc::new(ReedSolomonCoder::new(coding.data_units(), coding.parity_units())),
        )
    }

    /// Engine backed by a caller-supplied coder.
    pub fn with_coder(coding: CodingConfiguration, coder: Arc<dyn SoftwareCoder>) -> Self {
        Self { coding, coder }
    }

    /// The coding configuration served.
    pub fn coding(&self) -> CodingConfiguration {
        self.coding
    }

    /// Compute the reply for `request`.
    ///
    /// # Errors
    ///
    /// [`CoderError::InvalidState`] if fewer than `k` survivors are named,
    /// [`CoderError::LengthMismatch`] if the payload does not hold exactly
    /// `k` cells, or the coder's own failure.
    pub fn process(&self, request: &OffloadRequest) -> Result<OffloadReply, CoderError> {
        let k = self.coding.data_units();
        let n = self.coding.all_units();
        let cell = request.cell_length;

        let mut survivors = request.survival_pattern.indices(n);
        if survivors.len() < k {
            return Err(CoderError::InvalidState(format!(
                "survival pattern {} names {} units, need {k}",
                request.survival_pattern,
                survivors.len()
            )));
        }
        survivors.truncate(k);

        let expected = k * cell;
        if request.payload.len() != expected {
            return Err(CoderError::LengthMismatch {
                expected,
                got: request.payload.len(),
            });
        }

        let erased = request.erasure_pattern.indices(n);
        let mut out = BytesMut::zeroed(erased.len() * cell);
        if erased.is_empty() || cell == 0 {
            return Ok(OffloadReply {
                payload: out.freeze(),
            });
        }

        let cells: Vec<&[u8]> = request.payload.chunks_exact(cell).collect();
        let mut outputs: Vec<&mut [u8]> = out.chunks_exact_mut(cell).collect();

        let is_encode = survivors.iter().copied().eq(0..k) && erased.iter().all(|&i| i >= k);
        if is_encode && erased.len() == self.coding.parity_units() {
            self.coder.encode(&cells, &mut outputs)?;
        } else {
            let mut inputs: Vec<Option<&[u8]>> = vec![None; n];
            for (&index, &data) in survivors.iter().zip(&cells) {
                inputs[index] = Some(data);
            }
            self.coder.decode(&inputs, &erased, &mut outputs)?;
        }

        debug!(
            erasure = %request.erasure_pattern,
            survival = %request.survival_pattern,
            cell_length = cell,
            "engine processed request"
        );
        Ok(OffloadReply {
            payload: out.freeze(),
        })
    }
}
