//! Helpers for row-major (C ordered) array shapes.

use crate::error::{DecompError, Result};

/// Check the shape is non-empty with strictly positive dimensions.
pub fn validate(shape: &[usize]) -> Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(DecompError::InvalidShape(shape.to_vec()));
    }
    Ok(())
}

/// Check `axis` indexes into `shape`.
pub fn check_axis(shape: &[usize], axis: usize) -> Result<()> {
    if axis >= shape.len() {
        return Err(DecompError::InvalidAxis {
            axis,
            ndim: shape.len(),
        });
    }
    Ok(())
}

/// Return the total number of cells for the given dimension sizes.
pub fn cell_count(shape: &[usize]) -> Result<u64> {
    shape.iter().try_fold(1u64, |acc, &n| {
        acc.checked_mul(n as u64)
            .ok_or(DecompError::Overflow("cell count"))
    })
}

/// The number of cells in one hyperslab of thickness 1 along `axis`.
///
/// This is the product of every dimension except `axis`.
pub fn undivided_cells(shape: &[usize], axis: usize) -> Result<u64> {
    check_axis(shape, axis)?;
    shape
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != axis)
        .try_fold(1u64, |acc, (_, &n)| {
            acc.checked_mul(n as u64)
                .ok_or(DecompError::Overflow("slab cell count"))
        })
}

/// Copy of `shape` with `shape[axis]` replaced by `len`.
pub fn with_axis_len(shape: &[usize], axis: usize, len: usize) -> Vec<usize> {
    let mut out = shape.to_vec();
    out[axis] = len;
    out
}

/// True when a split along `axis` gives contiguous byte ranges in a C ordered file,
/// i.e. every dimension slower than `axis` has extent 1.
pub fn is_slab_contiguous(shape: &[usize], axis: usize) -> bool {
    shape[..axis].iter().all(|&n| n == 1)
}
