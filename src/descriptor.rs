//! Distribution descriptors.
//!
//! The rearranger decides which blocks of a variable every i/o task holds
//! and produces a [`DecompositionMap`]. The i/o system turns it into a
//! [`DistributionDescriptor`]: the per-task [region slots](RegionSlots) the
//! transfer strategies iterate, and the buffer lengths derived from them.

use crate::{
    error::TransportError,
    region::{Region, RegionSlots},
};

pub type DescriptorId = u32;

/// The element type of a variable or descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    Byte = 1,
    Char = 2,
    Short = 3,
    Int = 4,
    Float = 5,
    Double = 6,
    Int64 = 10,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::Byte | ElementType::Char => 1,
            ElementType::Short => 2,
            ElementType::Int | ElementType::Float => 4,
            ElementType::Double | ElementType::Int64 => 8,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ElementType::Byte),
            2 => Some(ElementType::Char),
            3 => Some(ElementType::Short),
            4 => Some(ElementType::Int),
            5 => Some(ElementType::Float),
            6 => Some(ElementType::Double),
            10 => Some(ElementType::Int64),
            _ => None,
        }
    }
}

/// A rectangular block of the global array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Block {
    pub fn new(start: impl Into<Vec<u64>>, count: impl Into<Vec<u64>>) -> Self {
        Self {
            start: start.into(),
            count: count.into(),
        }
    }
}

/// The rearranger's description of one decomposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompositionMap {
    pub element: ElementType,
    /// The global shape, without a record dimension.
    pub dims: Vec<u64>,
    /// The blocks of every i/o task, in local buffer order.
    pub blocks: Vec<Vec<Block>>,
    /// Whether some elements of the global shape are owned by no task.
    pub needs_fill: bool,
    /// The blocks of every i/o task that are written with the fill value.
    pub fill_blocks: Vec<Vec<Block>>,
}

impl DecompositionMap {
    pub fn new(element: ElementType, dims: impl Into<Vec<u64>>, blocks: Vec<Vec<Block>>) -> Self {
        Self {
            element,
            dims: dims.into(),
            blocks,
            needs_fill: false,
            fill_blocks: Vec::new(),
        }
    }

    pub fn with_fill_blocks(mut self, fill_blocks: Vec<Vec<Block>>) -> Self {
        self.needs_fill = true;
        self.fill_blocks = fill_blocks;
        self
    }
}

/// Indicates a decomposition map that does not fit the i/o system.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("The global shape has no dimensions")]
    EmptyShape,

    #[error("Expected blocks for {expected} i/o tasks, got {actual}")]
    TaskCount { expected: usize, actual: usize },

    #[error("Block of task {task} has {actual} dimensions, expected {expected}")]
    RankMismatch {
        task: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Block of task {task} exceeds dimension {dim}")]
    OutOfBounds { task: usize, dim: usize },
}

#[derive(Debug, Clone)]
pub struct DistributionDescriptor {
    id: DescriptorId,
    element: ElementType,
    dims: Vec<u64>,
    regions: Vec<RegionSlots>,
    fill_regions: Vec<RegionSlots>,
    local_lens: Vec<usize>,
    hole_lens: Vec<usize>,
    needs_fill: bool,
}

impl DistributionDescriptor {
    pub fn new(
        id: DescriptorId,
        map: &DecompositionMap,
        num_io_tasks: usize,
    ) -> Result<Self, DescriptorError> {
        validate(map, num_io_tasks)?;

        let max_regions = map.blocks.iter().map(Vec::len).max().unwrap_or(0);
        let max_fill_regions = map.fill_blocks.iter().map(Vec::len).max().unwrap_or(0);

        let regions: Vec<RegionSlots> = map
            .blocks
            .iter()
            .map(|blocks| slots(blocks, max_regions))
            .collect();
        let fill_regions: Vec<RegionSlots> = if map.fill_blocks.is_empty() {
            (0..num_io_tasks)
                .map(|_| RegionSlots::new(Vec::new(), 0))
                .collect()
        } else {
            map.fill_blocks
                .iter()
                .map(|blocks| slots(blocks, max_fill_regions))
                .collect()
        };

        let local_lens = regions.iter().map(RegionSlots::local_len).collect();
        let hole_lens = fill_regions.iter().map(RegionSlots::local_len).collect();

        Ok(Self {
            id,
            element: map.element,
            dims: map.dims.clone(),
            regions,
            fill_regions,
            local_lens,
            hole_lens,
            needs_fill: map.needs_fill,
        })
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn element_size(&self) -> usize {
        self.element.size()
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn needs_fill(&self) -> bool {
        self.needs_fill
    }

    /// The number of region iterations every task performs.
    pub fn max_regions(&self) -> usize {
        self.regions.first().map_or(0, RegionSlots::len)
    }

    pub fn max_fill_regions(&self) -> usize {
        self.fill_regions.first().map_or(0, RegionSlots::len)
    }

    pub fn num_tasks(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self, task: usize) -> &RegionSlots {
        &self.regions[task]
    }

    pub fn fill_regions(&self, task: usize) -> &RegionSlots {
        &self.fill_regions[task]
    }

    /// Elements of one variable held by `task`.
    pub fn local_len(&self, task: usize) -> usize {
        self.local_lens[task]
    }

    /// Fill elements of one variable written by `task`.
    pub fn hole_len(&self, task: usize) -> usize {
        self.hole_lens[task]
    }

    pub fn max_io_len(&self) -> usize {
        self.local_lens.iter().copied().max().unwrap_or(0)
    }

    /// Elements of one variable across all tasks.
    pub fn total_len(&self) -> usize {
        self.local_lens.iter().sum()
    }

    /// Element offset of `task`'s share within a buffer that holds every
    /// task's local buffer in task order.
    pub fn staged_offset(&self, task: usize) -> usize {
        self.local_lens[..task].iter().sum()
    }
}

fn slots(blocks: &[Block], max_regions: usize) -> RegionSlots {
    let mut offset = 0;
    let regions = blocks
        .iter()
        .map(|block| {
            let region = Region {
                offset,
                start: block.start.clone(),
                count: block.count.clone(),
            };
            offset += region.len();
            region
        })
        .collect();
    RegionSlots::new(regions, max_regions)
}

fn validate(map: &DecompositionMap, num_io_tasks: usize) -> Result<(), DescriptorError> {
    if map.dims.is_empty() {
        return Err(DescriptorError::EmptyShape);
    }
    if map.blocks.len() != num_io_tasks {
        return Err(DescriptorError::TaskCount {
            expected: num_io_tasks,
            actual: map.blocks.len(),
        });
    }
    if !map.fill_blocks.is_empty() && map.fill_blocks.len() != num_io_tasks {
        return Err(DescriptorError::TaskCount {
            expected: num_io_tasks,
            actual: map.fill_blocks.len(),
        });
    }

    let ndims = map.dims.len();
    for table in [&map.blocks, &map.fill_blocks] {
        for (task, blocks) in table.iter().enumerate() {
            for block in blocks {
                for actual in [block.start.len(), block.count.len()] {
                    if actual != ndims {
                        return Err(DescriptorError::RankMismatch {
                            task,
                            expected: ndims,
                            actual,
                        });
                    }
                }
                for dim in 0..ndims {
                    if block.start[dim] + block.count[dim] > map.dims[dim] {
                        return Err(DescriptorError::OutOfBounds { task, dim });
                    }
                }
            }
        }
    }

    Ok(())
}

/// Flattens a block table: per task the block count, then every block's
/// start followed by its count.
pub(crate) fn encode_blocks(table: &[Vec<Block>]) -> Vec<u64> {
    let mut values = Vec::new();
    for blocks in table {
        values.push(blocks.len() as u64);
        for block in blocks {
            values.extend_from_slice(&block.start);
            values.extend_from_slice(&block.count);
        }
    }
    values
}

pub(crate) fn decode_blocks(
    values: &[u64],
    tasks: usize,
    ndims: usize,
) -> Result<Vec<Vec<Block>>, TransportError> {
    const MALFORMED: TransportError = TransportError::Malformed("block table");

    let mut values = values.iter().copied();
    let mut table = Vec::with_capacity(tasks);
    for _ in 0..tasks {
        let count = values.next().ok_or(MALFORMED)?;
        let mut blocks = Vec::new();
        for _ in 0..count {
            let start: Vec<u64> = values.by_ref().take(ndims).collect();
            let count: Vec<u64> = values.by_ref().take(ndims).collect();
            if start.len() != ndims || count.len() != ndims {
                return Err(MALFORMED);
            }
            blocks.push(Block { start, count });
        }
        table.push(blocks);
    }
    if values.next().is_some() {
        return Err(MALFORMED);
    }
    Ok(table)
}
