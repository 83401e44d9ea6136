//! Process groups and the collective primitives the engine is built on.
//!
//! All collectives are rooted at a member of the group and implemented with
//! point-to-point messages on dedicated [lanes](Lane). Any transport failure
//! aborts the whole fabric: a collective that completed on some members but
//! not on others cannot be repaired.

use std::sync::Arc;

use crate::{
    error::{Status, TransportError},
    protocol,
    transport::{ChannelId, GroupId, Lane, Rank, Transport},
};

/// An ordered set of ranks that take part in the same collective calls.
///
/// Members are addressed by their index within the group. A rank may hold a
/// group it is not a member of, e.g. to address the i/o tasks from a compute
/// task, but only members can take part in its collectives.
#[derive(Clone)]
pub struct ProcessGroup {
    id: GroupId,
    members: Vec<Rank>,
    index: Option<usize>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("index", &self.index)
            .finish()
    }
}

impl ProcessGroup {
    pub fn new(id: GroupId, members: Vec<Rank>, transport: Arc<dyn Transport>) -> Self {
        let index = members.iter().position(|&rank| rank == transport.rank());
        Self {
            id,
            members,
            index,
            transport,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The index of this rank within the group, if it is a member.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn is_member(&self) -> bool {
        self.index.is_some()
    }

    pub fn is_leader(&self) -> bool {
        self.index == Some(0)
    }

    /// The rank of member 0.
    pub fn leader(&self) -> Rank {
        self.members[0]
    }

    pub fn rank_of(&self, index: usize) -> Rank {
        self.members[index]
    }

    fn channel(&self, lane: Lane) -> ChannelId {
        ChannelId::new(self.id, lane)
    }

    fn member_index(&self) -> Result<usize, TransportError> {
        debug_assert!(self.index.is_some(), "collective called by a non-member");
        self.index
            .ok_or(TransportError::UnknownRank(self.transport.rank()))
    }

    /// Aborts the fabric on behalf of this group.
    pub(crate) fn fail(&self, err: TransportError) -> TransportError {
        if !matches!(err, TransportError::Aborted(_)) {
            tracing::error!(group = self.id, %err, "transport failure, aborting");
            self.transport.abort(&err.to_string());
        }
        err
    }

    pub fn send(&self, to: usize, lane: Lane, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.transport
            .send(self.members[to], self.channel(lane), bytes)
            .map_err(|err| self.fail(err))
    }

    pub fn recv(&self, from: usize, lane: Lane) -> Result<Vec<u8>, TransportError> {
        self.transport
            .recv(self.members[from], self.channel(lane))
            .map_err(|err| self.fail(err))
    }

    pub fn send_u64(&self, to: usize, lane: Lane, value: u64) -> Result<(), TransportError> {
        self.send(to, lane, protocol::encode_u64(value))
    }

    pub fn recv_u64(&self, from: usize, lane: Lane) -> Result<u64, TransportError> {
        let bytes = self.recv(from, lane)?;
        protocol::decode_u64(&bytes).map_err(|err| self.fail(err))
    }

    pub fn send_u64s(&self, to: usize, lane: Lane, values: &[u64]) -> Result<(), TransportError> {
        self.send(to, lane, protocol::encode_u64s(values.iter().copied()))
    }

    pub fn recv_u64s(&self, from: usize, lane: Lane) -> Result<Vec<u64>, TransportError> {
        let bytes = self.recv(from, lane)?;
        protocol::decode_u64s(&bytes).map_err(|err| self.fail(err))
    }

    /// Sends `bytes` from the member `root` to all other members.
    ///
    /// Non-root members pass an empty buffer and receive the root's.
    #[tracing::instrument(skip(self, bytes), fields(group = self.id))]
    pub fn broadcast(&self, root: usize, bytes: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        let index = self.member_index()?;
        if index == root {
            for member in (0..self.members.len()).filter(|&m| m != root) {
                self.send(member, Lane::Broadcast, bytes.clone())?;
            }
            Ok(bytes)
        } else {
            self.recv(root, Lane::Broadcast)
        }
    }

    /// Returns the largest `value` passed by any member, on every member.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn allreduce_max(&self, value: u64) -> Result<u64, TransportError> {
        let index = self.member_index()?;
        if index == 0 {
            let mut max = value;
            for member in 1..self.members.len() {
                max = max.max(self.recv_u64(member, Lane::Reduce)?);
            }
            for member in 1..self.members.len() {
                self.send_u64(member, Lane::Reduce, max)?;
            }
            tracing::trace!(max, "reduced");
            Ok(max)
        } else {
            self.send_u64(0, Lane::Reduce, value)?;
            self.recv_u64(0, Lane::Reduce)
        }
    }

    pub fn barrier(&self) -> Result<(), TransportError> {
        self.allreduce_max(0).map(|_| ())
    }

    /// Agrees on one status for the whole group.
    ///
    /// The result is the first failure in member order, or [`Status::OK`] if
    /// every member succeeded. Every member returns the same value.
    #[tracing::instrument(skip(self), fields(group = self.id))]
    pub fn agree(&self, status: Status) -> Result<Status, TransportError> {
        let index = self.member_index()?;
        if index == 0 {
            let mut agreed = status;
            for member in 1..self.members.len() {
                let bytes = self.recv(member, Lane::Agree)?;
                let code = protocol::decode_i32(&bytes).map_err(|err| self.fail(err))?;
                agreed = agreed.first_error(Status::from_code(code));
            }
            for member in 1..self.members.len() {
                self.send(member, Lane::Agree, protocol::encode_i32(agreed.code()))?;
            }
            if !agreed.is_ok() {
                tracing::debug!(%agreed, "group agreed on failure");
            }
            Ok(agreed)
        } else {
            self.send(0, Lane::Agree, protocol::encode_i32(status.code()))?;
            let bytes = self.recv(0, Lane::Agree)?;
            let code = protocol::decode_i32(&bytes).map_err(|err| self.fail(err))?;
            Ok(Status::from_code(code))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use crate::transport::group_id;

    fn union(transport: Arc<dyn Transport>) -> ProcessGroup {
        let members = (0..transport.size()).collect();
        ProcessGroup::new(group_id::UNION, members, transport)
    }

    #[test]
    fn broadcast_reaches_every_member() {
        init_logger();

        let received = run_ranks(4, |transport| {
            let group = union(transport);
            let bytes = if group.index() == Some(2) {
                b"hello".to_vec()
            } else {
                Vec::new()
            };
            group.broadcast(2, bytes).unwrap()
        });

        assert!(received.iter().all(|bytes| bytes == b"hello"));
    }

    #[test]
    fn allreduce_returns_group_maximum() {
        let maxima = run_ranks(5, |transport| {
            let rank = transport.rank() as u64;
            let group = union(transport);
            let first = group.allreduce_max(rank * 10).unwrap();
            group.barrier().unwrap();
            let second = group.allreduce_max(100 - rank).unwrap();
            (first, second)
        });

        assert!(maxima.iter().all(|&maxima| maxima == (40, 100)));
    }

    #[test]
    fn agree_picks_first_failure_in_member_order() {
        let statuses = run_ranks(4, |transport| {
            let status = match transport.rank() {
                1 => Status::EDGE,
                3 => Status::INVALID,
                _ => Status::OK,
            };
            union(transport).agree(status).unwrap()
        });

        assert!(statuses.iter().all(|&status| status == Status::EDGE));
    }

    #[test]
    fn subgroup_members_are_addressed_by_index() {
        let results = run_ranks(4, |transport| {
            let group = ProcessGroup::new(group_id::IO, vec![3, 1], transport);
            match group.index() {
                Some(0) => {
                    group.send_u64s(1, Lane::GatherStarts, &[7, 8]).unwrap();
                    Vec::new()
                }
                Some(_) => group.recv_u64s(0, Lane::GatherStarts).unwrap(),
                None => Vec::new(),
            }
        });

        assert_eq!(results[1], vec![7, 8]);
        assert!(results[0].is_empty() && results[2].is_empty() && results[3].is_empty());
    }

    #[test]
    fn transport_failure_aborts_the_fabric() {
        let results = run_ranks(3, |transport| {
            let group = union(transport.clone());
            if transport.rank() == 0 {
                group.send(0, Lane::Agree, vec![1, 2, 3]).unwrap();
                let err = group.recv_u64(0, Lane::Agree).unwrap_err();
                matches!(err, TransportError::Malformed(_)) && transport.is_aborted()
            } else {
                let err = group.allreduce_max(1).unwrap_err();
                matches!(err, TransportError::Aborted(_))
            }
        });

        assert!(results.iter().all(|&aborted| aborted));
    }
}
