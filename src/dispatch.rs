//! Forwarding of calls from the compute tasks to disjoint i/o tasks.
//!
//! The compute leader announces a call by sending its opcode to the i/o
//! leader, which broadcasts it within the i/o group. The leader then sends
//! every i/o task the argument frame followed by the call's payloads, each
//! payload preceded by its length. All of it travels on the union group, so
//! the i/o tasks can tell forwarded calls apart from their own collectives.

use crate::{
    error::TransportError,
    message,
    protocol::{CallHeader, Opcode},
    topology::Topology,
    transport::Lane,
};

/// A variable-length argument of a forwarded call.
#[derive(Debug)]
pub(crate) enum Payload<'a> {
    /// The same bytes for every i/o task.
    Shared(&'a [u8]),
    /// One buffer per i/o task, in i/o group order.
    PerTask(Vec<Vec<u8>>),
}

impl Payload<'_> {
    fn bytes(&self, task: usize) -> &[u8] {
        match self {
            Payload::Shared(bytes) => bytes,
            Payload::PerTask(buffers) => buffers.get(task).map(Vec::as_slice).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Dispatcher<'a> {
    topology: &'a Topology,
}

impl<'a> Dispatcher<'a> {
    pub fn new(topology: &'a Topology) -> Self {
        Self { topology }
    }

    /// Sends a call to the i/o tasks.
    ///
    /// Called by every compute task; only the compute leader sends. Does
    /// nothing unless the groups are disjoint.
    #[tracing::instrument(skip_all, fields(opcode = T::opcode()))]
    pub fn forward<T: CallHeader>(
        &self,
        header: &T,
        payloads: &[Payload],
    ) -> Result<(), TransportError> {
        if !self.topology.is_disjoint() || !self.topology.is_compute_leader() {
            return Ok(());
        }

        let union = self.topology.union();
        let io = self.topology.io();
        union.send(io.leader(), Lane::Opcode, vec![T::opcode()])?;

        let frame = message::encode(header);
        for (task, &rank) in io.members().iter().enumerate() {
            union.send(rank, Lane::Args, frame.clone())?;
            for payload in payloads {
                let bytes = payload.bytes(task);
                union.send_u64(rank, Lane::Args, bytes.len() as u64)?;
                union.send(rank, Lane::Args, bytes.to_vec())?;
            }
        }
        tracing::trace!(payloads = payloads.len(), "forwarded call");
        Ok(())
    }

    /// Waits for the next forwarded call. Called by every i/o task.
    pub fn receive_opcode(&self) -> Result<Opcode, TransportError> {
        let io = self.topology.io();
        let announced = if io.is_leader() {
            self.topology
                .union()
                .recv(self.topology.compute_leader(), Lane::Opcode)?
        } else {
            Vec::new()
        };

        match io.broadcast(0, announced)?.as_slice() {
            [opcode] => Ok(*opcode),
            _ => Err(io.fail(TransportError::Malformed("opcode"))),
        }
    }

    pub fn receive_args(&self) -> Result<Vec<u8>, TransportError> {
        self.topology
            .union()
            .recv(self.topology.compute_leader(), Lane::Args)
    }

    pub fn receive_payload(&self) -> Result<Vec<u8>, TransportError> {
        let union = self.topology.union();
        let leader = self.topology.compute_leader();
        let len = union.recv_u64(leader, Lane::Args)?;
        let bytes = union.recv(leader, Lane::Args)?;
        if bytes.len() as u64 != len {
            return Err(union.fail(TransportError::Malformed("payload length")));
        }
        Ok(bytes)
    }
}
