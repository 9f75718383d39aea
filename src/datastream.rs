use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::chunks::{chunk_budget, ChunkBudget};
use crate::domain::{byte_offset, DecompositionKind, Partition, SizeTable, SlabDecomposition};
use crate::error::{DecompError, Result};
use crate::shape;

/// What to decompose: a flat row-major file holding an array of `shape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatastreamSpec {
    pub shape: Vec<usize>,
    /// Size of one cell in the file.
    pub bytes_per_cell: u64,
    /// Estimated peak accelerator memory per cell while processing.
    pub peak_bytes_per_cell: u64,
    pub overhead_factor: f64,
    pub kind: DecompositionKind,
    pub axis: usize,
}

impl DatastreamSpec {
    pub fn new(
        shape: impl Into<Vec<usize>>,
        bytes_per_cell: u64,
        peak_bytes_per_cell: u64,
        overhead_factor: f64,
    ) -> Self {
        Self {
            shape: shape.into(),
            bytes_per_cell,
            peak_bytes_per_cell,
            overhead_factor,
            kind: DecompositionKind::Slab,
            axis: 0,
        }
    }

    pub fn with_axis(mut self, axis: usize) -> Self {
        self.axis = axis;
        self
    }

    pub fn with_kind(mut self, kind: DecompositionKind) -> Self {
        self.kind = kind;
        self
    }
}

/// One accelerator sub-call's worth of data.
///
/// `start..stop` are global indices along the divide axis; `byte_offset` is the absolute
/// position of the first cell in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub start: usize,
    pub stop: usize,
    pub byte_offset: u64,
    pub shape: Vec<usize>,
}

impl ChunkDescriptor {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    pub fn cell_count(&self) -> Result<u64> {
        shape::cell_count(&self.shape)
    }

    pub fn byte_len(&self, bytes_per_cell: u64) -> Result<u64> {
        self.cell_count()?
            .checked_mul(bytes_per_cell)
            .ok_or(DecompError::Overflow("chunk length"))
    }

    /// The contiguous span of the file holding this chunk.
    pub fn byte_range(&self, bytes_per_cell: u64) -> Result<Range<u64>> {
        let end = self
            .byte_offset
            .checked_add(self.byte_len(bytes_per_cell)?)
            .ok_or(DecompError::Overflow("chunk end"))?;
        Ok(self.byte_offset..end)
    }
}

/// One rank's plan: its slab of the global array and how that slab is cut into sub-calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Datastream {
    partition: Partition,
    rank_offset: u64,
    local_shape: Vec<usize>,
    axis: usize,
    budget: ChunkBudget,
    chunk_sizes: SizeTable,
    chunk_offsets: Vec<u64>,
}

impl Datastream {
    pub fn plan(
        spec: &DatastreamSpec,
        slabs: &SlabDecomposition,
        memory_ceiling: u64,
    ) -> Result<Self> {
        match spec.kind {
            DecompositionKind::Slab => {}
        }
        shape::validate(&spec.shape)?;
        shape::check_axis(&spec.shape, spec.axis)?;
        if spec.bytes_per_cell == 0 {
            return Err(DecompError::InvalidCellSize);
        }
        if slabs.axis() != spec.axis || slabs.sizes().total() != spec.shape[spec.axis] {
            return Err(DecompError::InvalidShape(spec.shape.clone()));
        }

        let partition = slabs.partition();
        let rank_offset = slabs.byte_offset(&spec.shape, spec.bytes_per_cell)?;
        let local_shape = slabs.local_shape(&spec.shape);

        let budget = chunk_budget(
            &local_shape,
            spec.peak_bytes_per_cell,
            spec.overhead_factor,
            memory_ceiling,
        )?;
        let chunk_sizes = SizeTable::balanced(local_shape[spec.axis], budget.num_chunks)?;

        let layer_bytes = byte_offset(&local_shape, spec.axis, spec.bytes_per_cell, 1)?;
        let mut chunk_offsets = Vec::with_capacity(chunk_sizes.len());
        let mut offset = rank_offset;
        for &len in chunk_sizes.sizes() {
            chunk_offsets.push(offset);
            offset = (len as u64)
                .checked_mul(layer_bytes)
                .and_then(|b| b.checked_add(offset))
                .ok_or(DecompError::Overflow("chunk offset"))?;
        }

        Ok(Self {
            partition,
            rank_offset,
            local_shape,
            axis: spec.axis,
            budget,
            chunk_sizes,
            chunk_offsets,
        })
    }

    /// Plan for `rank` out of `num_ranks` without any communication.
    pub fn plan_rank(
        spec: &DatastreamSpec,
        num_ranks: usize,
        rank: usize,
        memory_ceiling: u64,
    ) -> Result<Self> {
        let slabs = SlabDecomposition::compute(&spec.shape, spec.axis, num_ranks, rank)?;
        Self::plan(spec, &slabs, memory_ceiling)
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn rank_offset(&self) -> u64 {
        self.rank_offset
    }

    pub fn local_shape(&self) -> &[usize] {
        &self.local_shape
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn total_memory_required(&self) -> f64 {
        self.budget.total_memory_required
    }

    pub fn chunk_sizes(&self) -> &SizeTable {
        &self.chunk_sizes
    }

    pub fn chunk_offsets(&self) -> &[u64] {
        &self.chunk_offsets
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_sizes.len()
    }

    /// Walk the sub-calls in order along the divide axis. Can be called any number of times.
    pub fn iter(&self) -> Chunks<'_> {
        Chunks {
            stream: self,
            index: 0,
            start: self.partition.start,
        }
    }
}

impl<'a> IntoIterator for &'a Datastream {
    type Item = ChunkDescriptor;
    type IntoIter = Chunks<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the [`ChunkDescriptor`]s of a [`Datastream`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    stream: &'a Datastream,
    index: usize,
    start: usize,
}

impl Iterator for Chunks<'_> {
    type Item = ChunkDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let len = *self.stream.chunk_sizes.sizes().get(self.index)?;
        let chunk = ChunkDescriptor {
            start: self.start,
            stop: self.start + len,
            byte_offset: self.stream.chunk_offsets[self.index],
            shape: shape::with_axis_len(&self.stream.local_shape, self.stream.axis, len),
        };
        self.index += 1;
        self.start += len;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.stream.num_chunks() - self.index;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{s, Array3};

    #[test]
    fn test_single_rank_two_chunks() {
        // Rank 0 of 3 owns 34 slabs of 4x4 cells; 34*4*4*8 bytes needs two 4096 byte calls.
        let spec = DatastreamSpec::new([100, 4, 4], 4, 8, 1.0);
        let stream = Datastream::plan_rank(&spec, 3, 0, 4096).unwrap();
        assert_eq!(stream.chunk_sizes().sizes(), &[17, 17]);

        let chunks: Vec<_> = stream.iter().collect();
        assert_eq!(
            chunks,
            vec![
                ChunkDescriptor {
                    start: 0,
                    stop: 17,
                    byte_offset: 0,
                    shape: vec![17, 4, 4],
                },
                ChunkDescriptor {
                    start: 17,
                    stop: 34,
                    byte_offset: 17 * 16 * 4,
                    shape: vec![17, 4, 4],
                },
            ]
        );
    }

    #[test]
    fn test_global_indices_and_offsets() {
        let spec = DatastreamSpec::new([100, 4, 4], 4, 8, 1.0);
        let stream = Datastream::plan_rank(&spec, 3, 1, 4096).unwrap();
        assert_eq!(stream.partition(), Partition { start: 34, stop: 67 });
        assert_eq!(stream.rank_offset(), 34 * 16 * 4);
        assert_eq!(stream.local_shape(), &[33, 4, 4]);
        assert_eq!(stream.chunk_sizes().sizes(), &[17, 16]);

        let chunks: Vec<_> = stream.iter().collect();
        assert_eq!((chunks[0].start, chunks[0].stop), (34, 51));
        assert_eq!((chunks[1].start, chunks[1].stop), (51, 67));
        assert_eq!(chunks[0].byte_offset, 34 * 64);
        assert_eq!(chunks[1].byte_offset, 51 * 64);
        assert_eq!(chunks[1].shape, vec![16, 4, 4]);
    }

    #[test]
    fn test_iter_is_restartable() {
        let spec = DatastreamSpec::new([50, 3, 7], 8, 16, 1.5);
        let stream = Datastream::plan_rank(&spec, 4, 2, 1000).unwrap();
        let it = stream.iter();
        assert_eq!(it.len(), stream.num_chunks());

        let first: Vec<_> = stream.iter().collect();
        let second: Vec<_> = (&stream).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(
            Datastream::plan_rank(&spec, 4, 2, 1000).unwrap(),
            stream
        );
    }

    #[test]
    fn test_offsets_monotonic() {
        let spec = DatastreamSpec::new([61, 5, 5], 4, 8, 1.0);
        let mut last_end = 0;
        for rank in 0..4 {
            let stream = Datastream::plan_rank(&spec, 4, rank, 512).unwrap();
            for chunk in &stream {
                assert_eq!(chunk.byte_offset, last_end);
                last_end = chunk.byte_range(4).unwrap().end;
            }
        }
        assert_eq!(last_end, 61 * 25 * 4);
    }

    #[test]
    fn test_chunks_address_their_slabs() {
        // A file holding each cell's own flat index; every chunk's bytes must be its slab.
        let bytes_per_cell = 8;
        let data = Array3::from_shape_fn((23, 3, 4), |(i, j, k)| (i * 12 + j * 4 + k) as f64);
        let flat = data.as_slice().unwrap();
        let spec = DatastreamSpec::new([23, 3, 4], bytes_per_cell, 8, 1.0);

        let mut seen = 0;
        for rank in 0..3 {
            let stream = Datastream::plan_rank(&spec, 3, rank, 300).unwrap();
            assert!(stream.num_chunks() > 1);
            for chunk in &stream {
                let range = chunk.byte_range(bytes_per_cell).unwrap();
                let cells = (range.start / bytes_per_cell) as usize..(range.end / bytes_per_cell) as usize;
                let expected: Vec<f64> = data
                    .slice(s![chunk.start..chunk.stop, .., ..])
                    .iter()
                    .copied()
                    .collect();
                assert_eq!(&flat[cells], expected.as_slice());
                seen += chunk.len();
            }
        }
        assert_eq!(seen, 23);
    }

    #[test]
    fn test_more_ranks_than_slabs() {
        let spec = DatastreamSpec::new([2, 4], 4, 4, 1.0);
        let stream = Datastream::plan_rank(&spec, 3, 2, 4096).unwrap();
        assert_eq!(stream.partition(), Partition { start: 2, stop: 2 });
        let chunks: Vec<_> = stream.iter().collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_empty());
        assert_eq!(chunks[0].byte_offset, 2 * 4 * 4);
    }

    #[test]
    fn test_many_chunks_plan_quickly() {
        // One byte per sub-call: every slab becomes its own chunk.
        let spec = DatastreamSpec::new([300_000, 1], 1, 1, 1.0);
        let stream = Datastream::plan_rank(&spec, 2, 1, 1).unwrap();
        assert_eq!(stream.num_chunks(), 150_000);
        assert_eq!(stream.chunk_offsets()[0], 150_000);
        assert_eq!(stream.chunk_offsets()[149_999], 299_999);

        let last = stream.iter().last().unwrap();
        assert_eq!((last.start, last.stop), (299_999, 300_000));
        assert_eq!(last.byte_range(1).unwrap(), 299_999..300_000);
    }

    #[test]
    fn test_descriptor_sizes_are_checked() {
        let chunk = ChunkDescriptor {
            start: 0,
            stop: 3,
            byte_offset: 40,
            shape: vec![3, 5],
        };
        assert_eq!(chunk.cell_count().unwrap(), 15);
        assert_eq!(chunk.byte_len(8).unwrap(), 120);
        assert_eq!(chunk.byte_range(8).unwrap(), 40..160);
        assert!(matches!(
            chunk.byte_len(u64::MAX),
            Err(DecompError::Overflow(_))
        ));

        let huge = ChunkDescriptor {
            start: 0,
            stop: usize::MAX,
            byte_offset: u64::MAX - 1,
            shape: vec![usize::MAX, 4],
        };
        assert!(matches!(huge.cell_count(), Err(DecompError::Overflow(_))));
        let tail = ChunkDescriptor {
            shape: vec![2],
            ..huge
        };
        assert!(matches!(tail.byte_range(1), Err(DecompError::Overflow(_))));
    }

    #[test]
    fn test_plan_rejects_rank_outside_table() {
        let spec = DatastreamSpec::new([10, 4], 4, 4, 1.0);
        let table = SizeTable::balanced(10, 2).unwrap();
        assert!(matches!(
            SlabDecomposition::from_table(0, table.clone(), 5)
                .and_then(|slabs| Datastream::plan(&spec, &slabs, 4096)),
            Err(DecompError::UnitOutOfRange { unit: 5, units: 2 })
        ));

        let slabs = SlabDecomposition::from_table(0, table, 1).unwrap();
        let stream = Datastream::plan(&spec, &slabs, 4096).unwrap();
        assert_eq!(stream.partition(), Partition { start: 5, stop: 10 });
    }

    #[test]
    fn test_invalid_spec() {
        let spec = DatastreamSpec::new([10, 4], 0, 4, 1.0);
        assert!(matches!(
            Datastream::plan_rank(&spec, 2, 0, 4096),
            Err(DecompError::InvalidCellSize)
        ));

        let spec = DatastreamSpec::new([10, 4], 4, 4, 1.0);
        assert!(matches!(
            Datastream::plan_rank(&spec, 2, 0, 0),
            Err(DecompError::InvalidMemoryCeiling)
        ));
        assert!(matches!(
            Datastream::plan_rank(&spec, 0, 0, 4096),
            Err(DecompError::InvalidUnitCount(0))
        ));

        let slabs = SlabDecomposition::compute(&[10, 4], 0, 2, 0).unwrap();
        let other = DatastreamSpec::new([12, 4], 4, 4, 1.0);
        assert!(Datastream::plan(&other, &slabs, 4096).is_err());
    }
}
