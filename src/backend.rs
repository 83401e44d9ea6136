//! The storage backend driver interface.
//!
//! A [`Backend`] is opened once per file on every i/o task through an
//! [`Opener`]. Its [`Capabilities`] decide, at open time, which transfer
//! strategy the file uses; the engine never inspects the concrete backend
//! type afterwards.

use crate::{
    descriptor::ElementType,
    error::BackendError,
    region::Extent,
};

pub type VarId = u32;

/// Identifies an outstanding nonblocking request of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Every i/o task may call the backend.
    pub parallel: bool,
    /// The backend supports batched nonblocking writes.
    pub nonblocking: bool,
}

/// How a file moves data between the i/o tasks and its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// One blocking call per region and variable on every i/o task.
    Independent,
    /// One nonblocking call per variable on every i/o task.
    Batched,
    /// Every i/o task ships its regions to the i/o leader, which performs
    /// all backend calls.
    Serial,
}

impl StrategyKind {
    pub fn select(capabilities: Capabilities) -> Self {
        match capabilities {
            Capabilities {
                parallel: true,
                nonblocking: true,
            } => StrategyKind::Batched,
            Capabilities { parallel: true, .. } => StrategyKind::Independent,
            _ => StrategyKind::Serial,
        }
    }
}

/// The static properties of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarMeta {
    pub element: ElementType,
    /// Dimensionality in the file, including a record dimension.
    pub ndims: usize,
    pub record: bool,
    /// The fill value, one element.
    pub fill: Vec<u8>,
    pub contiguous: bool,
}

pub trait Backend: Send {
    fn capabilities(&self) -> Capabilities;

    /// All variables of the file.
    fn variables(&self) -> Vec<(VarId, VarMeta)>;

    fn put_region(&mut self, var: VarId, extent: &Extent, data: &[u8]) -> Result<(), BackendError>;

    fn get_region(
        &mut self,
        var: VarId,
        extent: &Extent,
        out: &mut [u8],
    ) -> Result<(), BackendError>;

    /// Starts a write of several extents whose data is stored back to back
    /// in `data`.
    fn put_regions_nb(
        &mut self,
        _var: VarId,
        _extents: &[Extent],
        _data: &[u8],
    ) -> Result<RequestId, BackendError> {
        Err(BackendError::Unsupported("nonblocking writes"))
    }

    /// Reads several extents back to back into `out`.
    fn get_regions(
        &mut self,
        _var: VarId,
        _extents: &[Extent],
        _out: &mut [u8],
    ) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("batched reads"))
    }

    /// Completes the given requests.
    fn wait(&mut self, requests: &[RequestId]) -> Result<(), BackendError> {
        match requests.first() {
            Some(request) => Err(BackendError::UnknownRequest(request.0)),
            None => Ok(()),
        }
    }

    /// Bytes held by outstanding requests.
    fn buffer_usage(&self) -> u64 {
        0
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("capabilities", &self.capabilities())
            .field("buffer_usage", &self.buffer_usage())
            .finish()
    }
}

/// Opens the backend of a file on one i/o task.
pub trait Opener: Send + Sync {
    fn open(
        &self,
        path: &str,
        writable: bool,
        io_index: usize,
    ) -> Result<Box<dyn Backend>, BackendError>;
}
