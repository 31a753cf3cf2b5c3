//! Packing equal-length cells into one flat buffer and back.
//!
//! Layout is unit-major: cell `i` occupies `[i * cell_length, (i + 1) * cell_length)`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CoderError;

/// Concatenate `buffers` into one contiguous buffer.
///
/// # Errors
///
/// Returns [`CoderError::LengthMismatch`] if any buffer is not exactly
/// `cell_length` bytes.
pub fn pack<B: AsRef<[u8]>>(buffers: &[B], cell_length: usize) -> Result<Bytes, CoderError> {
    let mut flat = BytesMut::with_capacity(buffers.len() * cell_length);
    for buffer in buffers {
        let buffer = buffer.as_ref();
        check_len(buffer.len(), cell_length)?;
        flat.put_slice(buffer);
    }
    Ok(flat.freeze())
}

/// Copy `flat` back into caller-owned `outputs`, one cell per output.
///
/// Nothing is written unless every length checks out.
///
/// # Errors
///
/// Returns [`CoderError::LengthMismatch`] if `flat` is not exactly
/// `num_buffers * cell_length` bytes, if `outputs` does not hold
/// `num_buffers` buffers, or if any output is not `cell_length` bytes.
pub fn unpack(
    flat: &[u8],
    num_buffers: usize,
    cell_length: usize,
    outputs: &mut [&mut [u8]],
) -> Result<(), CoderError> {
    check_len(flat.len(), num_buffers * cell_length)?;
    check_len(outputs.len(), num_buffers)?;
    for output in outputs.iter() {
        check_len(output.len(), cell_length)?;
    }

    if cell_length == 0 {
        return Ok(());
    }
    for (output, cell) in outputs.iter_mut().zip(flat.chunks_exact(cell_length)) {
        output.copy_from_slice(cell);
    }
    Ok(())
}

/// Fill every output with zeros.
pub fn reset(outputs: &mut [&mut [u8]]) {
    for output in outputs.iter_mut() {
        output.fill(0);
    }
}

fn check_len(got: usize, expected: usize) -> Result<(), CoderError> {
    if got != expected {
        return Err(CoderError::LengthMismatch { expected, got });
    }
    Ok(())
}
