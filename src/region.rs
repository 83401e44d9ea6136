//! Regions of a task's local buffer and their translation into backend calls.
//!
//! A [`Region`] is one rectangular block of a variable's decomposed shape,
//! stored contiguously in the task's local buffer starting at `offset`.
//! Every task of an i/o group iterates the same number of region slots for a
//! given descriptor; tasks with fewer regions hold empty slots.

/// One contiguous rectangular block owned by a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Element offset of the block within the task's local buffer.
    pub offset: usize,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Region {
    /// Number of elements in the block.
    pub fn len(&self) -> usize {
        self.count.iter().product::<u64>() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fixed number of region slots, the trailing ones possibly empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSlots {
    slots: Box<[Option<Region>]>,
}

impl RegionSlots {
    /// Places `regions` into `max_regions` slots.
    pub fn new(regions: Vec<Region>, max_regions: usize) -> Self {
        debug_assert!(regions.len() <= max_regions);
        let mut slots: Vec<Option<Region>> = regions.into_iter().map(Some).collect();
        slots.resize(max_regions, None);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// The number of slots, which is the same on every task.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&Region>> + '_ {
        self.slots.iter().map(Option::as_ref)
    }

    /// The occupied slots.
    pub fn regions(&self) -> impl Iterator<Item = &Region> + '_ {
        self.slots.iter().flatten()
    }

    pub fn occupied(&self) -> usize {
        self.regions().count()
    }

    /// The number of local elements covered by all regions.
    pub fn local_len(&self) -> usize {
        self.regions().map(Region::len).sum()
    }
}

/// The start/count arguments of one backend call, in file dimensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extent {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

impl Extent {
    pub fn zeroed(fndims: usize) -> Self {
        Self {
            start: vec![0; fndims],
            count: vec![0; fndims],
        }
    }

    pub fn len(&self) -> usize {
        self.count.iter().product::<u64>() as usize
    }

    /// An empty extent is skipped by every transfer strategy.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a descriptor's regions map onto one variable of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Dimensionality of the descriptor.
    pub ndims: usize,
    /// Dimensionality of the variable in the file.
    pub fndims: usize,
    /// Whether the variable has an unlimited record dimension.
    pub record: bool,
}

impl Layout {
    /// Positions a region within the variable, leaving the record index at
    /// zero.
    pub fn place(&self, region: Option<&Region>) -> Extent {
        let mut extent = Extent::zeroed(self.fndims);
        let Some(region) = region else {
            return extent;
        };

        if self.record && self.fndims > self.ndims {
            let shift = self.fndims - self.ndims;
            for i in shift..self.fndims {
                extent.start[i] = region.start[i - shift];
                extent.count[i] = region.count[i - shift];
            }
            if self.fndims > 1 && extent.count[1] > 0 {
                extent.count[0] = 1;
            }
        } else {
            let n = self.ndims.min(self.fndims);
            extent.start[..n].copy_from_slice(&region.start[..n]);
            extent.count[..n].copy_from_slice(&region.count[..n]);
        }

        extent
    }

    /// Moves a placed extent to record `frame`.
    ///
    /// When the variable has a dimension more than the descriptor, the
    /// leading start is set to the frame. When both have the same
    /// dimensionality, the frame is added to the region's own leading start.
    pub fn apply_frame(&self, extent: &mut Extent, frame: u64) {
        if !self.record || extent.is_empty() {
            return;
        }
        if self.fndims > self.ndims {
            extent.start[0] = frame;
        } else if self.fndims == self.ndims {
            extent.start[0] += frame;
        }
    }

    /// Translates one region slot into the arguments of a backend call.
    pub fn translate(&self, region: Option<&Region>, frame: u64) -> Extent {
        let mut extent = self.place(region);
        self.apply_frame(&mut extent, frame);
        extent
    }
}
