//! An in-memory backend.
//!
//! A [`MemoryNamespace`] holds named [`Dataset`]s that every rank of a
//! [`LocalFabric`](crate::fabric::LocalFabric) can open. Variables are stored
//! row-major; record variables grow along their leading dimension and new
//! records start out filled with the variable's fill value. Every backend
//! call is logged so callers can observe how the engine drove the backend.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use crossbeam::channel::{Receiver, Sender};
use dashmap::DashMap;

use crate::{
    backend::{Backend, Capabilities, Opener, RequestId, VarId, VarMeta},
    descriptor::ElementType,
    error::BackendError,
    region::Extent,
};

/// Which backend flavor a dataset emulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// Every i/o task writes with blocking calls.
    Independent,
    /// Every i/o task writes with queued requests that complete in `wait`.
    Batched,
    /// Only i/o task 0 may call the backend.
    Serial,
}

impl DriverMode {
    fn capabilities(self) -> Capabilities {
        match self {
            DriverMode::Independent => Capabilities {
                parallel: true,
                nonblocking: false,
            },
            DriverMode::Batched => Capabilities {
                parallel: true,
                nonblocking: true,
            },
            DriverMode::Serial => Capabilities {
                parallel: false,
                nonblocking: false,
            },
        }
    }
}

/// The definition of a variable.
#[derive(Debug, Clone)]
pub struct VarDef {
    pub element: ElementType,
    /// The fixed dimensions. A record variable has an additional leading
    /// dimension that grows as records are written.
    pub dims: Vec<u64>,
    pub record: bool,
    pub fill: Option<Vec<u8>>,
    pub contiguous: bool,
}

impl VarDef {
    pub fn new(element: ElementType, dims: impl Into<Vec<u64>>) -> Self {
        Self {
            element,
            dims: dims.into(),
            record: false,
            fill: None,
            contiguous: false,
        }
    }

    pub fn record(mut self) -> Self {
        self.record = true;
        self
    }

    pub fn fill(mut self, fill: impl Into<Vec<u8>>) -> Self {
        self.fill = Some(fill.into());
        self
    }

    pub fn contiguous(mut self) -> Self {
        self.contiguous = true;
        self
    }
}

/// One backend call, as seen by a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put {
        io_index: usize,
        var: VarId,
        extent: Extent,
    },
    Get {
        io_index: usize,
        var: VarId,
        extent: Extent,
    },
    PutMany {
        io_index: usize,
        var: VarId,
        extents: usize,
    },
    GetMany {
        io_index: usize,
        var: VarId,
        extents: usize,
    },
    Wait {
        io_index: usize,
        requests: usize,
    },
    Sync {
        io_index: usize,
    },
}

#[derive(Debug)]
struct StoredVar {
    meta: VarMeta,
    shape: Vec<u64>,
    data: Vec<u8>,
}

impl StoredVar {
    fn new(def: VarDef) -> Self {
        let size = def.element.size();
        let fill = match def.fill {
            Some(fill) if fill.len() == size => fill,
            _ => vec![0; size],
        };
        let mut shape = def.dims;
        if def.record {
            shape.insert(0, 0);
        }
        let elements: u64 = shape.iter().product();
        let data = fill.repeat(elements as usize);

        Self {
            meta: VarMeta {
                element: def.element,
                ndims: shape.len(),
                record: def.record,
                fill,
                contiguous: def.contiguous,
            },
            shape,
            data,
        }
    }

    fn element_size(&self) -> usize {
        self.meta.element.size()
    }

    fn check(&self, extent: &Extent, buffer_len: usize) -> Result<(), BackendError> {
        let ndims = self.shape.len();
        for actual in [extent.start.len(), extent.count.len()] {
            if actual != ndims {
                return Err(BackendError::RankMismatch {
                    expected: ndims,
                    actual,
                });
            }
        }
        for dim in 0..ndims {
            if self.meta.record && dim == 0 {
                continue;
            }
            let (start, count, len) = (extent.start[dim], extent.count[dim], self.shape[dim]);
            if start + count > len {
                return Err(BackendError::EdgeExceeded {
                    dim,
                    start,
                    count,
                    len,
                });
            }
        }
        let expected = extent.len() * self.element_size();
        if buffer_len != expected {
            return Err(BackendError::BufferSize {
                expected,
                actual: buffer_len,
            });
        }
        Ok(())
    }

    fn grow(&mut self, records: u64) {
        if !self.meta.record || records <= self.shape[0] {
            return;
        }
        let per_record: u64 = self.shape[1..].iter().product();
        let added = (records - self.shape[0]) * per_record;
        self.data
            .extend(self.meta.fill.repeat(added as usize));
        self.shape[0] = records;
    }

    fn put(&mut self, extent: &Extent, data: &[u8]) -> Result<(), BackendError> {
        self.check(extent, data.len())?;
        if extent.is_empty() {
            return Ok(());
        }
        if self.meta.record {
            self.grow(extent.start[0] + extent.count[0]);
        }
        let size = self.element_size();
        for_each_row(&self.shape, extent, |file, buffer, len| {
            self.data[file * size..(file + len) * size]
                .copy_from_slice(&data[buffer * size..(buffer + len) * size]);
        });
        Ok(())
    }

    fn get(&self, extent: &Extent, out: &mut [u8]) -> Result<(), BackendError> {
        self.check(extent, out.len())?;
        if extent.is_empty() {
            return Ok(());
        }
        if self.meta.record && extent.start[0] + extent.count[0] > self.shape[0] {
            return Err(BackendError::EdgeExceeded {
                dim: 0,
                start: extent.start[0],
                count: extent.count[0],
                len: self.shape[0],
            });
        }
        let size = self.element_size();
        for_each_row(&self.shape, extent, |file, buffer, len| {
            out[buffer * size..(buffer + len) * size]
                .copy_from_slice(&self.data[file * size..(file + len) * size]);
        });
        Ok(())
    }
}

/// Calls `f(file_offset, buffer_offset, len)` for every contiguous row of
/// `extent` within an array of `shape`. Offsets and lengths are in elements.
fn for_each_row(shape: &[u64], extent: &Extent, mut f: impl FnMut(usize, usize, usize)) {
    let ndims = shape.len();
    if ndims == 0 {
        f(0, 0, 1);
        return;
    }

    let mut strides = vec![1u64; ndims];
    for dim in (0..ndims - 1).rev() {
        strides[dim] = strides[dim + 1] * shape[dim + 1];
    }

    let row = extent.count[ndims - 1] as usize;
    let rows: u64 = extent.count[..ndims - 1].iter().product();
    let mut index = vec![0u64; ndims - 1];
    for r in 0..rows as usize {
        let file: u64 = (0..ndims - 1)
            .map(|dim| (extent.start[dim] + index[dim]) * strides[dim])
            .sum::<u64>()
            + extent.start[ndims - 1];
        f(file as usize, r * row, row);

        for dim in (0..ndims - 1).rev() {
            index[dim] += 1;
            if index[dim] < extent.count[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

/// A named collection of variables shared by every rank that opens it.
#[derive(Debug)]
pub struct Dataset {
    mode: DriverMode,
    vars: DashMap<VarId, StoredVar, ahash::RandomState>,
    next_var: AtomicU32,
    log: Sender<Call>,
    calls: Receiver<Call>,
}

impl Dataset {
    pub fn new(mode: DriverMode) -> Self {
        let (log, calls) = crossbeam::channel::unbounded();
        Self {
            mode,
            vars: DashMap::with_hasher(ahash::RandomState::new()),
            next_var: AtomicU32::new(0),
            log,
            calls,
        }
    }

    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    pub fn define_var(&self, def: VarDef) -> VarId {
        let var = self.next_var.fetch_add(1, Ordering::Relaxed);
        self.vars.insert(var, StoredVar::new(def));
        var
    }

    /// The whole content of a variable.
    pub fn read_all(&self, var: VarId) -> Option<Vec<u8>> {
        self.vars.get(&var).map(|stored| stored.data.clone())
    }

    pub fn shape(&self, var: VarId) -> Option<Vec<u64>> {
        self.vars.get(&var).map(|stored| stored.shape.clone())
    }

    /// The number of records of a record variable.
    pub fn records(&self, var: VarId) -> Option<u64> {
        self.vars
            .get(&var)
            .filter(|stored| stored.meta.record)
            .map(|stored| stored.shape[0])
    }

    /// Drains the log of backend calls made since the last call.
    pub fn take_calls(&self) -> Vec<Call> {
        self.calls.try_iter().collect()
    }

    fn record(&self, call: Call) {
        // The receiver lives as long as the dataset.
        let _ = self.log.send(call);
    }

    fn put(&self, var: VarId, extent: &Extent, data: &[u8]) -> Result<(), BackendError> {
        let mut stored = self
            .vars
            .get_mut(&var)
            .ok_or(BackendError::UnknownVariable(var))?;
        stored.put(extent, data)
    }

    fn get(&self, var: VarId, extent: &Extent, out: &mut [u8]) -> Result<(), BackendError> {
        let stored = self
            .vars
            .get(&var)
            .ok_or(BackendError::UnknownVariable(var))?;
        stored.get(extent, out)
    }
}

/// The datasets visible to an i/o system.
#[derive(Debug, Default)]
pub struct MemoryNamespace {
    datasets: DashMap<String, Arc<Dataset>, ahash::RandomState>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, path: &str, mode: DriverMode) -> Arc<Dataset> {
        let dataset = Arc::new(Dataset::new(mode));
        self.datasets.insert(path.to_string(), dataset.clone());
        dataset
    }

    pub fn get(&self, path: &str) -> Option<Arc<Dataset>> {
        self.datasets.get(path).map(|dataset| dataset.clone())
    }
}

impl Opener for MemoryNamespace {
    fn open(
        &self,
        path: &str,
        writable: bool,
        io_index: usize,
    ) -> Result<Box<dyn Backend>, BackendError> {
        let dataset = self
            .get(path)
            .ok_or_else(|| BackendError::UnknownDataset(path.to_string()))?;
        tracing::debug!(path, writable, io_index, mode = ?dataset.mode, "open dataset");

        Ok(Box::new(MemoryBackend {
            dataset,
            writable,
            io_index,
            pending: Vec::new(),
            next_request: 0,
        }))
    }
}

#[derive(Debug)]
struct PendingPut {
    id: RequestId,
    var: VarId,
    extents: Vec<Extent>,
    data: Vec<u8>,
}

/// The view of a [`Dataset`] from one i/o task.
#[derive(Debug)]
pub struct MemoryBackend {
    dataset: Arc<Dataset>,
    writable: bool,
    io_index: usize,
    pending: Vec<PendingPut>,
    next_request: u64,
}

impl MemoryBackend {
    fn check_caller(&self) -> Result<(), BackendError> {
        if self.dataset.mode == DriverMode::Serial && self.io_index != 0 {
            return Err(BackendError::NotLeader(self.io_index));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), BackendError> {
        self.check_caller()?;
        if !self.writable {
            return Err(BackendError::ReadOnly);
        }
        Ok(())
    }

    fn element_size(&self, var: VarId) -> Result<usize, BackendError> {
        self.dataset
            .vars
            .get(&var)
            .map(|stored| stored.element_size())
            .ok_or(BackendError::UnknownVariable(var))
    }
}

impl Backend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        self.dataset.mode.capabilities()
    }

    fn variables(&self) -> Vec<(VarId, VarMeta)> {
        let mut vars: Vec<(VarId, VarMeta)> = self
            .dataset
            .vars
            .iter()
            .map(|entry| (*entry.key(), entry.value().meta.clone()))
            .collect();
        vars.sort_by_key(|(var, _)| *var);
        vars
    }

    fn put_region(&mut self, var: VarId, extent: &Extent, data: &[u8]) -> Result<(), BackendError> {
        self.check_writable()?;
        self.dataset.record(Call::Put {
            io_index: self.io_index,
            var,
            extent: extent.clone(),
        });
        self.dataset.put(var, extent, data)
    }

    fn get_region(
        &mut self,
        var: VarId,
        extent: &Extent,
        out: &mut [u8],
    ) -> Result<(), BackendError> {
        self.check_caller()?;
        self.dataset.record(Call::Get {
            io_index: self.io_index,
            var,
            extent: extent.clone(),
        });
        self.dataset.get(var, extent, out)
    }

    fn put_regions_nb(
        &mut self,
        var: VarId,
        extents: &[Extent],
        data: &[u8],
    ) -> Result<RequestId, BackendError> {
        if self.dataset.mode != DriverMode::Batched {
            return Err(BackendError::Unsupported("nonblocking writes"));
        }
        self.check_writable()?;

        let size = self.element_size(var)?;
        let expected = extents.iter().map(Extent::len).sum::<usize>() * size;
        if data.len() != expected {
            return Err(BackendError::BufferSize {
                expected,
                actual: data.len(),
            });
        }

        self.dataset.record(Call::PutMany {
            io_index: self.io_index,
            var,
            extents: extents.len(),
        });
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.pending.push(PendingPut {
            id,
            var,
            extents: extents.to_vec(),
            data: data.to_vec(),
        });
        Ok(id)
    }

    fn get_regions(
        &mut self,
        var: VarId,
        extents: &[Extent],
        out: &mut [u8],
    ) -> Result<(), BackendError> {
        self.check_caller()?;
        let size = self.element_size(var)?;
        let expected = extents.iter().map(Extent::len).sum::<usize>() * size;
        if out.len() != expected {
            return Err(BackendError::BufferSize {
                expected,
                actual: out.len(),
            });
        }

        self.dataset.record(Call::GetMany {
            io_index: self.io_index,
            var,
            extents: extents.len(),
        });
        let mut offset = 0;
        for extent in extents {
            let len = extent.len() * size;
            self.dataset.get(var, extent, &mut out[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    fn wait(&mut self, requests: &[RequestId]) -> Result<(), BackendError> {
        if requests.is_empty() {
            return Ok(());
        }
        self.dataset.record(Call::Wait {
            io_index: self.io_index,
            requests: requests.len(),
        });

        let mut result = Ok(());
        for id in requests {
            let Some(position) = self.pending.iter().position(|put| put.id == *id) else {
                result = result.and(Err(BackendError::UnknownRequest(id.0)));
                continue;
            };
            let put = self.pending.remove(position);
            let size = self.element_size(put.var)?;
            let mut offset = 0;
            for extent in &put.extents {
                let len = extent.len() * size;
                let bytes = &put.data[offset..offset + len];
                if let Err(err) = self.dataset.put(put.var, extent, bytes) {
                    result = result.and(Err(err));
                }
                offset += len;
            }
        }
        result
    }

    fn buffer_usage(&self) -> u64 {
        self.pending.iter().map(|put| put.data.len() as u64).sum()
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        self.dataset.record(Call::Sync {
            io_index: self.io_index,
        });
        Ok(())
    }
}
