//! Buffers single-variable writes until they are flushed as one
//! multi-variable transfer.
//!
//! Writes are grouped by descriptor and record flag: everything in one
//! [`WriteBuffer`] can be moved by a single transfer. An aggregator is either
//! empty or accumulating; flushing takes every buffer out at once, so it is
//! empty again whatever the outcome of the transfer.

use crate::{
    backend::VarId,
    descriptor::DescriptorId,
    pool::{BufferPool, PooledBuffer},
};

#[derive(Debug)]
pub(crate) struct WriteBuffer {
    pub descriptor: DescriptorId,
    pub record: bool,
    pub vars: Vec<VarId>,
    pub frames: Vec<u64>,
    /// One fill element per variable.
    pub fills: Vec<u8>,
    /// The local data of every variable, back to back.
    pub data: PooledBuffer,
}

impl WriteBuffer {
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// One pending write.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Append<'a> {
    pub descriptor: DescriptorId,
    pub record: bool,
    pub var: VarId,
    pub frame: u64,
    pub fill: &'a [u8],
    pub data: &'a [u8],
}

#[derive(Debug, Default)]
pub(crate) struct Aggregator {
    buffers: Vec<WriteBuffer>,
}

impl Aggregator {
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes of data held by all buffers.
    pub fn usage(&self) -> u64 {
        self.buffers
            .iter()
            .map(|buffer| buffer.data.len() as u64)
            .sum()
    }

    pub fn append(&mut self, pool: &BufferPool, write: Append) {
        let position = self
            .buffers
            .iter()
            .position(|buffer| {
                buffer.descriptor == write.descriptor && buffer.record == write.record
            });
        let buffer = match position {
            Some(position) => &mut self.buffers[position],
            None => {
                self.buffers.push(WriteBuffer {
                    descriptor: write.descriptor,
                    record: write.record,
                    vars: Vec::new(),
                    frames: Vec::new(),
                    fills: Vec::new(),
                    data: pool.allocate(),
                });
                let last = self.buffers.len() - 1;
                &mut self.buffers[last]
            }
        };

        buffer.vars.push(write.var);
        buffer.frames.push(write.frame);
        buffer.fills.extend_from_slice(write.fill);
        buffer.data.extend_from_slice(write.data);
        tracing::trace!(
            descriptor = write.descriptor,
            var = write.var,
            frame = write.frame,
            arrays = buffer.len(),
            "buffered write"
        );
    }

    /// Removes every buffer, leaving the aggregator empty.
    pub fn take(&mut self) -> Vec<WriteBuffer> {
        std::mem::take(&mut self.buffers)
    }
}
