//! Offload eligibility.
//!
//! Small or misaligned cells cost more on the wire than they save in
//! compute, so they are coded locally instead.
//!
//! | Configuration | Threshold |
//! |---------------|-----------|
//! | RS(3,2)       | 512 KiB   |
//! | RS(6,3)       | 256 KiB   |
//! | anything else | 256 KiB   |

use crate::config::CodingConfiguration;

/// Offloaded cells must be a multiple of this many bytes.
pub const OFFLOAD_ALIGNMENT: usize = 64;

/// Threshold applied to configurations without a table entry.
pub const DEFAULT_THRESHOLD: usize = 256 * 1024;

const THRESHOLDS: &[((usize, usize), usize)] = &[((3, 2), 512 * 1024), ((6, 3), 256 * 1024)];

/// Whether a cell of `cell_length` bytes may be sent to the compute service.
pub fn is_offload_eligible(cell_length: usize, threshold: usize) -> bool {
    cell_length.is_multiple_of(OFFLOAD_ALIGNMENT) && cell_length >= threshold
}

/// Minimum cell length worth offloading for `(data_units, parity_units)`.
pub fn fallback_threshold(data_units: usize, parity_units: usize) -> usize {
    THRESHOLDS
        .iter()
        .find(|(config, _)| *config == (data_units, parity_units))
        .map(|(_, threshold)| *threshold)
        .unwrap_or(DEFAULT_THRESHOLD)
}

/// Per-dispatcher offload decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackPolicy {
    threshold: usize,
    offload_enabled: bool,
}

impl FallbackPolicy {
    /// Policy for `coding`, using the table threshold.
    pub fn new(coding: CodingConfiguration, offload_enabled: bool) -> Self {
        Self {
            threshold: fallback_threshold(coding.data_units(), coding.parity_units()),
            offload_enabled,
        }
    }

    /// Policy with an explicit threshold.
    pub fn with_threshold(threshold: usize, offload_enabled: bool) -> Self {
        Self {
            threshold,
            offload_enabled,
        }
    }

    /// Threshold in bytes.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Whether a call with this cell length goes to the compute service.
    pub fn should_offload(&self, cell_length: usize) -> bool {
        self.offload_enabled && is_offload_eligible(cell_length, self.threshold)
    }
}
