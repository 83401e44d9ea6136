use ahash::HashMap;
use zerocopy::{byteorder::network_endian::*, AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::{
    aggregator::Aggregator,
    backend::{Backend, VarId, VarMeta},
    descriptor::ElementType,
    error::TransportError,
    request::{self, PendingRequest},
    transfer::Strategy,
};

pub type FileId = u32;

/// Per-rank state of one variable of an open file.
#[derive(Debug)]
pub(crate) struct VarState {
    meta: VarMeta,
    /// The record the next transfer of a record variable targets.
    pub frame: u64,
    /// Requests started for this variable and not yet waited on. Only ever
    /// non-empty on i/o tasks.
    pub requests: Vec<PendingRequest>,
}

impl VarState {
    pub fn new(meta: VarMeta) -> Self {
        Self {
            meta,
            frame: 0,
            requests: Vec::new(),
        }
    }

    pub fn element(&self) -> ElementType {
        self.meta.element
    }

    pub fn ndims(&self) -> usize {
        self.meta.ndims
    }

    pub fn is_record(&self) -> bool {
        self.meta.record
    }

    pub fn fill(&self) -> &[u8] {
        &self.meta.fill
    }

    pub fn is_contiguous(&self) -> bool {
        self.meta.contiguous
    }
}

/// The backend of a file and the strategy that drives it. Present on i/o
/// tasks only.
#[derive(Debug)]
pub(crate) struct IoHandle {
    pub backend: Box<dyn Backend>,
    pub strategy: Box<dyn Strategy>,
}

#[derive(Debug)]
pub(crate) struct OpenFile {
    pub path: String,
    pub writable: bool,
    pub io: Option<IoHandle>,
    pub vars: HashMap<VarId, VarState>,
    /// Writes buffered on compute tasks.
    pub aggregator: Aggregator,
    /// The largest backend buffer usage seen by a flush check.
    pub max_usage: u64,
}

impl OpenFile {
    pub fn new(path: String, writable: bool, io: Option<IoHandle>) -> Self {
        Self {
            path,
            writable,
            io,
            vars: HashMap::default(),
            aggregator: Aggregator::default(),
            max_usage: 0,
        }
    }

    /// Request lists of the given variables, skipping unknown ones.
    pub fn request_lists<'a>(
        vars: &'a mut HashMap<VarId, VarState>,
        ids: &'a [VarId],
    ) -> impl Iterator<Item = &'a mut Vec<PendingRequest>> + 'a {
        vars.iter_mut()
            .filter(move |(var, _)| ids.contains(*var))
            .map(|(_, state)| &mut state.requests)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        let Some(handle) = self.io.as_mut() else {
            return;
        };
        let pending: usize = self.vars.values().map(|state| state.requests.len()).sum();
        if pending == 0 {
            return;
        }
        tracing::warn!(path = %self.path, pending, "file dropped with outstanding requests");
        let lists = self.vars.values_mut().map(|state| &mut state.requests);
        if let Err(err) = request::wait_all(handle.backend.as_mut(), lists) {
            tracing::warn!(path = %self.path, %err, "outstanding requests failed");
        }
    }
}

/// A variable's metadata as shipped from the i/o leader to every rank.
#[derive(Debug, FromBytes, AsBytes, FromZeroes, Unaligned)]
#[repr(C)]
struct VarEntry {
    var: U32,
    element: u8,
    ndims: U16,
    record: u8,
    contiguous: u8,
    fill_len: u8,
    fill: [u8; 8],
}

pub(crate) fn encode_vars(vars: &[(VarId, VarMeta)]) -> Vec<u8> {
    let entries: Vec<VarEntry> = vars
        .iter()
        .map(|(var, meta)| {
            let mut fill = [0; 8];
            let fill_len = meta.fill.len().min(fill.len());
            fill[..fill_len].copy_from_slice(&meta.fill[..fill_len]);
            VarEntry {
                var: U32::new(*var),
                element: meta.element.code(),
                ndims: U16::new(meta.ndims as u16),
                record: meta.record.into(),
                contiguous: meta.contiguous.into(),
                fill_len: fill_len as u8,
                fill,
            }
        })
        .collect();
    entries.as_bytes().to_vec()
}

pub(crate) fn decode_vars(bytes: &[u8]) -> Result<Vec<(VarId, VarMeta)>, TransportError> {
    const MALFORMED: TransportError = TransportError::Malformed("variable table");

    let entries = VarEntry::slice_from(bytes).ok_or(MALFORMED)?;
    entries
        .iter()
        .map(|entry| {
            let element = ElementType::from_code(entry.element).ok_or(MALFORMED)?;
            let fill_len = (entry.fill_len as usize).min(entry.fill.len());
            Ok((
                entry.var.get(),
                VarMeta {
                    element,
                    ndims: entry.ndims.get() as usize,
                    record: entry.record != 0,
                    fill: entry.fill[..fill_len].to_vec(),
                    contiguous: entry.contiguous != 0,
                },
            ))
        })
        .collect()
}
