use std::fmt;
use std::str::FromStr;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{DecompError, Result};
use crate::group::{broadcast, ProcessGroup, ROOT};
use crate::shape;

/// Half-open range `[start, stop)` along the divide axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub start: usize,
    pub stop: usize,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.stop - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }
}

/// How many elements each unit (rank or chunk) receives.
///
/// Built by balanced remainder distribution: with `Q = total / units` and `R = total % units`
/// the first `R` units get `Q + 1` and the rest get `Q`, so entries sum to `total` and differ by
/// at most one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeTable(Vec<usize>);

impl SizeTable {
    pub fn balanced(total: usize, units: usize) -> Result<Self> {
        if units == 0 {
            return Err(DecompError::InvalidUnitCount(units));
        }
        let q = total / units;
        let r = total % units;
        Ok(Self((0..units).map(|i| q + usize::from(i < r)).collect()))
    }

    pub fn sizes(&self) -> &[usize] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }

    /// Sum of the sizes of every unit before `unit`.
    pub fn prefix(&self, unit: usize) -> usize {
        self.0[..unit].iter().sum()
    }

    pub fn partition(&self, unit: usize) -> Result<Partition> {
        if unit >= self.0.len() {
            return Err(DecompError::UnitOutOfRange {
                unit,
                units: self.0.len(),
            });
        }
        let start = self.prefix(unit);
        Ok(Partition {
            start,
            stop: start + self.0[unit],
        })
    }
}

/// The sub-range of `global_shape[axis]` owned by `unit_id` out of `num_units`.
pub fn divide(
    global_shape: &[usize],
    axis: usize,
    num_units: usize,
    unit_id: usize,
) -> Result<Partition> {
    shape::validate(global_shape)?;
    shape::check_axis(global_shape, axis)?;
    SizeTable::balanced(global_shape[axis], num_units)?.partition(unit_id)
}

/// Absolute byte position of the first cell after `units_before` hyperslabs along `axis`.
///
/// Only exact for slab splits where the layers before `axis` are all of extent 1, see
/// [`shape::is_slab_contiguous`].
pub fn byte_offset(
    global_shape: &[usize],
    axis: usize,
    bytes_per_cell: u64,
    units_before: usize,
) -> Result<u64> {
    shape::undivided_cells(global_shape, axis)?
        .checked_mul(bytes_per_cell)
        .and_then(|b| b.checked_mul(units_before as u64))
        .ok_or(DecompError::Overflow("byte offset"))
}

/// Supported decompositions. Only slabs for now; anything else is rejected when parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DecompositionKind {
    #[default]
    Slab,
}

impl FromStr for DecompositionKind {
    type Err = DecompError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "slab" => Ok(Self::Slab),
            _ => Err(DecompError::UnsupportedDecomposition(s.to_string())),
        }
    }
}

impl fmt::Display for DecompositionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slab => write!(f, "slab"),
        }
    }
}

/// The split of a global array across every rank of a process group, seen from one rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabDecomposition {
    axis: usize,
    sizes: SizeTable,
    rank: usize,
}

impl SlabDecomposition {
    /// Compute the decomposition locally, without any communication.
    pub fn compute(
        global_shape: &[usize],
        axis: usize,
        num_units: usize,
        rank: usize,
    ) -> Result<Self> {
        shape::validate(global_shape)?;
        shape::check_axis(global_shape, axis)?;
        let sizes = SizeTable::balanced(global_shape[axis], num_units)?;
        Self::from_table(axis, sizes, rank)
    }

    /// Wrap a size table obtained elsewhere, e.g. read back from a previous run.
    pub fn from_table(axis: usize, sizes: SizeTable, rank: usize) -> Result<Self> {
        if rank >= sizes.len() {
            return Err(DecompError::UnitOutOfRange {
                unit: rank,
                units: sizes.len(),
            });
        }
        Ok(Self { axis, sizes, rank })
    }

    /// Root computes the size table and every rank receives it through `group`.
    ///
    /// Inputs are validated on every rank before the broadcast so a bad shape fails everywhere
    /// instead of leaving the other ranks blocked.
    pub fn negotiate<G: ProcessGroup + ?Sized>(
        group: &G,
        global_shape: &[usize],
        axis: usize,
    ) -> Result<Self> {
        shape::validate(global_shape)?;
        shape::check_axis(global_shape, axis)?;

        let table = if group.rank() == ROOT {
            Some(SizeTable::balanced(global_shape[axis], group.size())?)
        } else {
            None
        };
        let sizes: SizeTable = broadcast(group, table.as_ref(), ROOT)?;
        if sizes.len() != group.size() || sizes.total() != global_shape[axis] {
            return Err(DecompError::Collective(format!(
                "received size table {:?} does not match {} ranks over {} slabs",
                sizes.sizes(),
                group.size(),
                global_shape[axis]
            )));
        }
        debug!("rank {} received slab sizes {:?}", group.rank(), sizes.sizes());

        if !shape::is_slab_contiguous(global_shape, axis) {
            warn!(
                "dividing axis {} of {:?} does not give contiguous byte ranges",
                axis, global_shape
            );
        }

        Ok(Self {
            axis,
            sizes,
            rank: group.rank(),
        })
    }

    pub fn axis(&self) -> usize {
        self.axis
    }

    pub fn sizes(&self) -> &SizeTable {
        &self.sizes
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn partition(&self) -> Partition {
        let start = self.sizes.prefix(self.rank);
        Partition {
            start,
            stop: start + self.sizes.sizes()[self.rank],
        }
    }

    /// Shape of this rank's block of the global array.
    pub fn local_shape(&self, global_shape: &[usize]) -> Vec<usize> {
        shape::with_axis_len(global_shape, self.axis, self.sizes.sizes()[self.rank])
    }

    /// Byte offset of this rank's block within the global file.
    pub fn byte_offset(&self, global_shape: &[usize], bytes_per_cell: u64) -> Result<u64> {
        byte_offset(
            global_shape,
            self.axis,
            bytes_per_cell,
            self.sizes.prefix(self.rank),
        )
    }
}
