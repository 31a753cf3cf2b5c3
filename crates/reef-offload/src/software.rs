//! Local Reed-Solomon coding.
//!
//! Used for calls the compute service should not see (small or misaligned
//! cells, offload disabled) and by the engine that answers offload
//! requests in the proxy and in compute-mode mocks.

use tracing::debug;

use crate::error::CodingError;

/// A local erasure coder working on caller-owned buffers.
///
/// Inputs and outputs are cells of equal length. Unit indices run
/// `0..k` for data and `k..k+p` for parity.
pub trait SoftwareCoder: Send + Sync {
    /// Compute all `p` parity cells from the `k` data cells.
    fn encode(&self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), CodingError>;

    /// Reconstruct the units in `erased` from the present entries of
    /// `inputs` (one slot per unit, `None` when missing). `outputs[i]`
    /// receives unit `erased[i]`.
    fn decode(
        &self,
        inputs: &[Option<&[u8]>],
        erased: &[usize],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CodingError>;
}

/// [`SoftwareCoder`] backed by `reed-solomon-simd`.
///
/// The library works on 16-bit symbols, so cells must be non-zero and of
/// even length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReedSolomonCoder {
    /// Number of data units.
    k: usize,
    /// Number of parity units.
    p: usize,
}

impl ReedSolomonCoder {
    /// Create a coder for `k` data and `p` parity units.
    pub fn new(k: usize, p: usize) -> Self {
        Self { k, p }
    }

    /// Number of data units.
    pub fn data_units(&self) -> usize {
        self.k
    }

    /// Number of parity units.
    pub fn parity_units(&self) -> usize {
        self.p
    }

    fn parity(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>, CodingError> {
        Ok(reed_solomon_simd::encode(self.k, self.p, data)?)
    }
}

/// Common length of all buffers, checked to be codable.
fn cell_length<'a>(mut buffers: impl Iterator<Item = &'a [u8]>) -> Result<usize, CodingError> {
    let len = buffers
        .next()
        .map(<[u8]>::len)
        .ok_or_else(|| CodingError::ShapeMismatch("no buffers".into()))?;
    if len == 0 || !len.is_multiple_of(2) {
        return Err(CodingError::UnsupportedCellLength(len));
    }
    if let Some(other) = buffers.find(|b| b.len() != len) {
        return Err(CodingError::ShapeMismatch(format!(
            "cell of {} bytes among cells of {len} bytes",
            other.len()
        )));
    }
    Ok(len)
}

impl SoftwareCoder for ReedSolomonCoder {
    fn encode(&self, inputs: &[&[u8]], outputs: &mut [&mut [u8]]) -> Result<(), CodingError> {
        if inputs.len() != self.k || outputs.len() != self.p {
            return Err(CodingError::ShapeMismatch(format!(
                "encode expects {} inputs and {} outputs, got {} and {}",
                self.k,
                self.p,
                inputs.len(),
                outputs.len()
            )));
        }
        let len = cell_length(inputs.iter().copied().chain(outputs.iter().map(|o| &**o)))?;

        let recovery = self.parity(inputs)?;
        for (output, parity) in outputs.iter_mut().zip(&recovery) {
            output.copy_from_slice(parity);
        }

        debug!(k = self.k, p = self.p, cell_length = len, "software encode");
        Ok(())
    }

    fn decode(
        &self,
        inputs: &[Option<&[u8]>],
        erased: &[usize],
        outputs: &mut [&mut [u8]],
    ) -> Result<(), CodingError> {
        let n = self.k + self.p;
        if inputs.len() != n || outputs.len() != erased.len() {
            return Err(CodingError::ShapeMismatch(format!(
                "decode expects {n} input slots and one output per erased unit, got {} and {} for {}",
                inputs.len(),
                outputs.len(),
                erased.len()
            )));
        }
        if let Some(&bad) = erased.iter().find(|&&i| i >= n) {
            return Err(CodingError::ShapeMismatch(format!(
                "erased index {bad} out of range 0..{n}"
            )));
        }

        let present = inputs.iter().filter(|i| i.is_some()).count();
        if present < self.k {
            return Err(CodingError::NotEnoughShards {
                needed: self.k,
                got: present,
            });
        }
        let len = cell_length(inputs.iter().flatten().copied().chain(outputs.iter().map(|o| &**o)))?;

        // Separate into originals (index < k) and recovery (index >= k).
        let originals: Vec<(usize, &[u8])> = inputs[..self.k]
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell.map(|c| (i, c)))
            .collect();
        let recovery: Vec<(usize, &[u8])> = inputs[self.k..]
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell.map(|c| (i, c)))
            .collect();

        let restored = if originals.len() == self.k {
            Default::default()
        } else {
            reed_solomon_simd::decode(self.k, self.p, originals, recovery)?
        };

        // Full data set: what we had plus what was restored.
        let mut data: Vec<&[u8]> = Vec::with_capacity(self.k);
        for (i, cell) in inputs[..self.k].iter().enumerate() {
            match cell.or_else(|| restored.get(&i).map(Vec::as_slice)) {
                Some(c) => data.push(c),
                None => {
                    return Err(CodingError::ShapeMismatch(format!(
                        "data unit {i} was not restored"
                    )));
                }
            }
        }

        let parity = if erased.iter().any(|&i| i >= self.k) {
            self.parity(&data)?
        } else {
            Vec::new()
        };

        for (output, &index) in outputs.iter_mut().zip(erased) {
            let cell = if index < self.k {
                data[index]
            } else {
                parity[index - self.k].as_slice()
            };
            output.copy_from_slice(cell);
        }

        debug!(
            k = self.k,
            p = self.p,
            cell_length = len,
            erased = erased.len(),
            restored = restored.len(),
            "software decode"
        );
        Ok(())
    }
}
