//! The group-messaging substrate the engine runs on.
//!
//! A [`Transport`] moves opaque byte messages between ranks on logical
//! [channels](ChannelId). Two messages sent from one rank to another on the
//! same channel are received in the order they were sent; there is no
//! ordering between different channels.

use crate::error::TransportError;

/// Index of a process within the whole fabric.
pub type Rank = usize;

/// Identifies one of the process groups of a [`Topology`](crate::topology::Topology).
pub type GroupId = u16;

pub mod group_id {
    use super::GroupId;

    pub const UNION: GroupId = 0;
    pub const COMPUTE: GroupId = 1;
    pub const IO: GroupId = 2;
}

/// The kind of message carried on a channel.
///
/// Every step of a protocol that could otherwise be confused with another
/// step uses its own lane, so concurrent senders never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Broadcast,
    Reduce,
    Agree,

    // Dispatch of forwarded calls.
    Opcode,
    Args,

    // Serial-gather transfers.
    GatherReady,
    GatherLength,
    GatherRegionCount,
    GatherStarts,
    GatherCounts,
    GatherData,

    // Read results returned to the compute leader.
    ReadData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub group: GroupId,
    pub lane: Lane,
}

impl ChannelId {
    pub const fn new(group: GroupId, lane: Lane) -> Self {
        Self { group, lane }
    }
}

/// Point-to-point messaging between the ranks of one fabric.
///
/// Implementations must deliver messages between a pair of ranks on one
/// channel in FIFO order. Once [`abort`](Transport::abort) was called by any
/// rank, every pending and future operation on every rank fails with
/// [`TransportError::Aborted`].
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    fn send(&self, to: Rank, channel: ChannelId, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Blocks until a message from `from` arrives on `channel`.
    fn recv(&self, from: Rank, channel: ChannelId) -> Result<Vec<u8>, TransportError>;

    fn abort(&self, reason: &str);

    fn is_aborted(&self) -> bool;
}
