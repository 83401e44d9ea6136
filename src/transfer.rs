//! Parallel transfer strategies.
//!
//! Every strategy iterates all region slots of its task, so all i/o tasks
//! perform the same number of iterations for a descriptor. Empty slots are
//! skipped without a backend call.

use std::ops::Range;

use crate::{
    backend::{Backend, RequestId, StrategyKind, VarId},
    error::{Status, TransportError},
    gather::SerialGather,
    group::ProcessGroup,
    region::{Extent, Layout, Region, RegionSlots},
};

/// One variable of a multi-variable transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Target {
    pub var: VarId,
    pub frame: u64,
}

/// The regions and local buffer layout of one transfer on one i/o task.
///
/// The local buffer holds `llen` elements for each target, in target order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Pass<'a> {
    pub layout: Layout,
    pub targets: &'a [Target],
    pub slots: &'a RegionSlots,
    pub llen: usize,
    pub element_size: usize,
}

impl Pass<'_> {
    pub fn buffer_len(&self) -> usize {
        self.targets.len() * self.llen * self.element_size
    }

    /// Bytes of `region` for the target at position `nv`.
    pub fn region_bytes(&self, nv: usize, region: &Region) -> Range<usize> {
        let start = self.element_size * (nv * self.llen + region.offset);
        start..start + region.len() * self.element_size
    }

    /// All bytes of the target at position `nv`.
    pub fn target_bytes(&self, nv: usize) -> Range<usize> {
        let start = self.element_size * nv * self.llen;
        start..start + self.llen * self.element_size
    }

    /// The placed extents of every slot, the record index left at zero.
    pub fn placed(&self) -> Vec<Extent> {
        self.slots.iter().map(|slot| self.layout.place(slot)).collect()
    }
}

#[derive(Debug)]
pub(crate) struct WriteOutcome {
    pub status: Status,
    /// Requests started, by target position.
    pub requests: Vec<(usize, RequestId)>,
}

impl WriteOutcome {
    pub fn completed(status: Status) -> Self {
        Self {
            status,
            requests: Vec::new(),
        }
    }
}

/// Moves the local buffers of the i/o tasks to and from a backend.
///
/// Backend failures are reported through the returned status; only
/// transport failures are returned as errors.
pub(crate) trait Strategy: Send + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    fn write(
        &self,
        io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError>;

    /// Reads the single target of `pass` into `out`.
    fn read(
        &self,
        io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        out: &mut [u8],
    ) -> Result<Status, TransportError>;
}

pub(crate) fn strategy(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Independent => Box::new(Independent),
        StrategyKind::Batched => Box::new(Batched),
        StrategyKind::Serial => Box::new(SerialGather),
    }
}

/// One blocking backend call per region and variable.
#[derive(Debug)]
pub(crate) struct Independent;

impl Strategy for Independent {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Independent
    }

    fn write(
        &self,
        _io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        debug_assert!(data.len() >= pass.buffer_len());

        // A failed variable skips its remaining regions, the others go on.
        let mut statuses = vec![Status::OK; pass.targets.len()];
        for (index, slot) in pass.slots.iter().enumerate() {
            let Some(region) = slot else {
                continue;
            };
            for (nv, target) in pass.targets.iter().enumerate() {
                let extent = pass.layout.translate(slot, target.frame);
                if extent.is_empty() || !statuses[nv].is_ok() {
                    continue;
                }
                let bytes = &data[pass.region_bytes(nv, region)];
                if let Err(err) = backend.put_region(target.var, &extent, bytes) {
                    tracing::warn!(var = target.var, region = index, %err, "region write failed");
                    statuses[nv] = err.status();
                }
            }
        }

        let status = statuses
            .into_iter()
            .fold(Status::OK, Status::first_error);
        Ok(WriteOutcome::completed(status))
    }

    fn read(
        &self,
        _io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        out: &mut [u8],
    ) -> Result<Status, TransportError> {
        let Some(target) = pass.targets.first() else {
            return Ok(Status::OK);
        };
        for (index, slot) in pass.slots.iter().enumerate() {
            let Some(region) = slot else {
                continue;
            };
            let extent = pass.layout.translate(slot, target.frame);
            if extent.is_empty() {
                continue;
            }
            let bytes = &mut out[pass.region_bytes(0, region)];
            if let Err(err) = backend.get_region(target.var, &extent, bytes) {
                tracing::warn!(var = target.var, region = index, %err, "region read failed");
                return Ok(err.status());
            }
        }
        Ok(Status::OK)
    }
}

/// One nonblocking backend call per variable covering all its regions.
#[derive(Debug)]
pub(crate) struct Batched;

impl Batched {
    /// Accumulates the non-empty extents of every slot and hands them to
    /// `issue` once the last slot was visited.
    fn collect(pass: &Pass, mut issue: impl FnMut(&[Extent])) {
        let last = pass.slots.len().saturating_sub(1);
        let mut extents: Vec<Extent> = Vec::new();
        for (index, slot) in pass.slots.iter().enumerate() {
            let extent = pass.layout.place(slot);
            if !extent.is_empty() {
                extents.push(extent);
            }
            if index == last && !extents.is_empty() {
                tracing::trace!(regions = extents.len(), "issue batched call");
                issue(&extents);
            }
        }
    }

    fn framed(pass: &Pass, extents: &[Extent], frame: u64) -> Vec<Extent> {
        extents
            .iter()
            .cloned()
            .map(|mut extent| {
                pass.layout.apply_frame(&mut extent, frame);
                extent
            })
            .collect()
    }
}

impl Strategy for Batched {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Batched
    }

    fn write(
        &self,
        _io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        debug_assert!(data.len() >= pass.buffer_len());

        let mut outcome = WriteOutcome::completed(Status::OK);
        Batched::collect(pass, |extents| {
            for (nv, target) in pass.targets.iter().enumerate() {
                let framed = Batched::framed(pass, extents, target.frame);
                let bytes = &data[pass.target_bytes(nv)];
                match backend.put_regions_nb(target.var, &framed, bytes) {
                    Ok(request) => outcome.requests.push((nv, request)),
                    Err(err) => {
                        tracing::warn!(var = target.var, %err, "batched write failed");
                        outcome.status = outcome.status.first_error(err.status());
                    }
                }
            }
        });
        Ok(outcome)
    }

    fn read(
        &self,
        _io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        out: &mut [u8],
    ) -> Result<Status, TransportError> {
        let Some(target) = pass.targets.first() else {
            return Ok(Status::OK);
        };
        let mut status = Status::OK;
        Batched::collect(pass, |extents| {
            let framed = Batched::framed(pass, extents, target.frame);
            let bytes = &mut out[pass.target_bytes(0)];
            if let Err(err) = backend.get_regions(target.var, &framed, bytes) {
                tracing::warn!(var = target.var, %err, "batched read failed");
                status = err.status();
            }
        });
        Ok(status)
    }
}
