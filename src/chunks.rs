//! Splitting one rank's block into sub-calls that each fit in accelerator memory.

use num_traits::ToPrimitive;

use crate::domain::SizeTable;
use crate::error::{DecompError, Result};
use crate::shape;

/// Memory needed for a whole block and how many sub-calls it takes to stay under the ceiling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkBudget {
    pub total_memory_required: f64,
    pub num_chunks: usize,
}

/// `ceil(cells * peak_bytes_per_cell * overhead_factor / memory_ceiling)`, at least 1.
///
/// `overhead_factor` is an empirical multiplier for the accelerator's working memory on top of
/// the estimated per-cell peak; it has to come from the caller.
pub fn chunk_budget(
    local_shape: &[usize],
    peak_bytes_per_cell: u64,
    overhead_factor: f64,
    memory_ceiling: u64,
) -> Result<ChunkBudget> {
    if memory_ceiling == 0 {
        return Err(DecompError::InvalidMemoryCeiling);
    }
    if !overhead_factor.is_finite() || overhead_factor <= 0.0 {
        return Err(DecompError::InvalidOverhead(overhead_factor));
    }

    let cells = shape::cell_count(local_shape)?;
    let total_memory_required = cells as f64 * peak_bytes_per_cell as f64 * overhead_factor;
    let num_chunks = (total_memory_required / memory_ceiling as f64)
        .ceil()
        .to_usize()
        .ok_or(DecompError::Overflow("chunk count"))?
        .max(1);

    Ok(ChunkBudget {
        total_memory_required,
        num_chunks,
    })
}

/// Sizes of the sub-calls along `axis`, balanced the same way ranks are.
pub fn plan_chunks(
    local_shape: &[usize],
    axis: usize,
    peak_bytes_per_cell: u64,
    overhead_factor: f64,
    memory_ceiling: u64,
) -> Result<SizeTable> {
    shape::check_axis(local_shape, axis)?;
    let budget = chunk_budget(
        local_shape,
        peak_bytes_per_cell,
        overhead_factor,
        memory_ceiling,
    )?;
    SizeTable::balanced(local_shape[axis], budget.num_chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_chunks() {
        // 34 * 4 * 4 * 8 = 4352 bytes over a 4096 byte ceiling.
        let budget = chunk_budget(&[34, 4, 4], 8, 1.0, 4096).unwrap();
        assert_eq!(budget.total_memory_required, 4352.0);
        assert_eq!(budget.num_chunks, 2);
        assert_eq!(
            plan_chunks(&[34, 4, 4], 0, 8, 1.0, 4096).unwrap().sizes(),
            &[17, 17]
        );

        assert_eq!(
            plan_chunks(&[34, 4, 4], 0, 8, 1.0, 1 << 20).unwrap().sizes(),
            &[34]
        );
        assert_eq!(
            plan_chunks(&[34, 4, 4], 0, 8, 2.5, 4096).unwrap().sizes(),
            &[12, 11, 11]
        );
    }

    #[test]
    fn test_plan_chunks_other_axis() {
        assert_eq!(
            plan_chunks(&[2, 9, 4], 1, 8, 1.0, 200).unwrap().sizes(),
            &[3, 3, 3]
        );
    }

    #[test]
    fn test_empty_block_gets_one_chunk() {
        // A rank with nothing to do still yields a single (empty) sub-call.
        let budget = chunk_budget(&[0, 4, 4], 8, 1.0, 4096).unwrap();
        assert_eq!(budget.num_chunks, 1);
        assert_eq!(plan_chunks(&[0, 4, 4], 0, 8, 1.0, 4096).unwrap().sizes(), &[0]);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            plan_chunks(&[34, 4, 4], 0, 8, 1.0, 0),
            Err(DecompError::InvalidMemoryCeiling)
        ));
        assert!(matches!(
            plan_chunks(&[34, 4, 4], 0, 8, 0.0, 4096),
            Err(DecompError::InvalidOverhead(_))
        ));
        assert!(matches!(
            plan_chunks(&[34, 4, 4], 0, 8, f64::INFINITY, 4096),
            Err(DecompError::InvalidOverhead(_))
        ));
        assert!(matches!(
            plan_chunks(&[34, 4, 4], 3, 8, 1.0, 4096),
            Err(DecompError::InvalidAxis { .. })
        ));
    }

    #[test]
    fn test_more_memory_never_means_more_chunks() {
        let shape = [97, 13, 5];
        for overhead in [1.0, 1.7, 3.0] {
            let mut ceiling = 64;
            let mut last = usize::MAX;
            while ceiling < 1 << 24 {
                let n = chunk_budget(&shape, 8, overhead, ceiling).unwrap().num_chunks;
                assert!(n <= last, "{} chunks at {} bytes after {}", n, ceiling, last);
                last = n;
                ceiling *= 2;
            }
            assert_eq!(last, 1);
        }
    }
}
