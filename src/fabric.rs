//! An in-process [`Transport`] connecting a fixed number of ranks.
//!
//! Every rank is driven by its own thread and talks to the others through
//! unbounded channels, one per (source, destination, channel) triple.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;

use crate::{
    config::IoSystemConfig,
    error::TransportError,
    transport::{ChannelId, Rank, Transport},
};

type MailboxKey = (Rank, Rank, ChannelId);

#[derive(Debug)]
struct Mailbox {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

#[derive(Debug)]
struct FabricState {
    size: usize,
    poll_interval: Duration,
    mailboxes: DashMap<MailboxKey, Mailbox, ahash::RandomState>,
    abort_reason: OnceLock<String>,
}

impl FabricState {
    fn mailbox(&self, key: MailboxKey) -> (Sender<Vec<u8>>, Receiver<Vec<u8>>) {
        // Cloned ends only; the shard lock is released before anyone blocks.
        let mailbox = self.mailboxes.entry(key).or_insert_with(|| {
            let (sender, receiver) = crossbeam::channel::unbounded();
            Mailbox { sender, receiver }
        });
        (mailbox.sender.clone(), mailbox.receiver.clone())
    }

    fn aborted(&self) -> Option<TransportError> {
        self.abort_reason
            .get()
            .map(|reason| TransportError::Aborted(reason.clone()))
    }
}

/// A set of ranks living in one process.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    state: Arc<FabricState>,
}

impl LocalFabric {
    pub fn new(size: usize) -> Self {
        Self::with_poll_interval(size, Duration::from_millis(50))
    }

    /// Creates a fabric whose blocked receives check for an abort every
    /// `poll_interval`.
    pub fn with_poll_interval(size: usize, poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(FabricState {
                size,
                poll_interval,
                mailboxes: DashMap::with_hasher(ahash::RandomState::new()),
                abort_reason: OnceLock::new(),
            }),
        }
    }

    /// Creates a fabric that polls for aborts as often as `config` asks.
    pub fn with_config(size: usize, config: &IoSystemConfig) -> Self {
        Self::with_poll_interval(size, config.abort_poll_interval)
    }

    pub fn size(&self) -> usize {
        self.state.size
    }

    pub fn endpoint(&self, rank: Rank) -> Result<LocalEndpoint, TransportError> {
        if rank >= self.state.size {
            return Err(TransportError::UnknownRank(rank));
        }
        Ok(LocalEndpoint {
            rank,
            state: self.state.clone(),
        })
    }

    pub fn endpoints(&self) -> Vec<LocalEndpoint> {
        (0..self.state.size)
            .map(|rank| LocalEndpoint {
                rank,
                state: self.state.clone(),
            })
            .collect()
    }
}

/// The view of a [`LocalFabric`] from one rank.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    rank: Rank,
    state: Arc<FabricState>,
}

impl Transport for LocalEndpoint {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.state.size
    }

    fn send(&self, to: Rank, channel: ChannelId, bytes: Vec<u8>) -> Result<(), TransportError> {
        if let Some(err) = self.state.aborted() {
            return Err(err);
        }
        if to >= self.state.size {
            return Err(TransportError::UnknownRank(to));
        }

        tracing::trace!(
            from = self.rank,
            to,
            ?channel,
            len = bytes.len(),
            "send message"
        );
        let (sender, _) = self.state.mailbox((self.rank, to, channel));
        sender
            .send(bytes)
            .map_err(|_| TransportError::Disconnected(to))
    }

    fn recv(&self, from: Rank, channel: ChannelId) -> Result<Vec<u8>, TransportError> {
        if from >= self.state.size {
            return Err(TransportError::UnknownRank(from));
        }

        let (_, receiver) = self.state.mailbox((from, self.rank, channel));
        loop {
            if let Some(err) = self.state.aborted() {
                return Err(err);
            }
            match receiver.recv_timeout(self.state.poll_interval) {
                Ok(bytes) => {
                    tracing::trace!(
                        from,
                        to = self.rank,
                        ?channel,
                        len = bytes.len(),
                        "received message"
                    );
                    return Ok(bytes);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::Disconnected(from))
                }
            }
        }
    }

    fn abort(&self, reason: &str) {
        if self.state.abort_reason.set(reason.to_string()).is_ok() {
            tracing::error!(rank = self.rank, reason, "fabric aborted");
        }
    }

    fn is_aborted(&self) -> bool {
        self.state.abort_reason.get().is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use crate::transport::{group_id, Lane};
    use std::thread;

    const CHANNEL: ChannelId = ChannelId::new(group_id::UNION, Lane::Args);

    #[test]
    fn messages_arrive_in_order() -> Result<()> {
        init_logger();

        let fabric = LocalFabric::new(2);
        let a = fabric.endpoint(0)?;
        let b = fabric.endpoint(1)?;

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..100u8 {
                    a.send(1, CHANNEL, vec![i]).unwrap();
                }
            });
            s.spawn(|| {
                for i in 0..100u8 {
                    assert_eq!(b.recv(0, CHANNEL).unwrap(), vec![i]);
                }
            });
        });

        Ok(())
    }

    #[test]
    fn lanes_are_independent() -> Result<()> {
        let fabric = LocalFabric::new(2);
        let a = fabric.endpoint(0)?;
        let b = fabric.endpoint(1)?;

        let other = ChannelId::new(group_id::UNION, Lane::Opcode);
        a.send(1, CHANNEL, vec![1])?;
        a.send(1, other, vec![2])?;

        assert_eq!(b.recv(0, other)?, vec![2]);
        assert_eq!(b.recv(0, CHANNEL)?, vec![1]);

        Ok(())
    }

    #[test]
    fn abort_releases_blocked_receivers() -> Result<()> {
        init_logger();

        let fabric = LocalFabric::with_poll_interval(3, Duration::from_millis(5));
        let endpoints = fabric.endpoints();

        thread::scope(|s| {
            for endpoint in &endpoints[1..] {
                s.spawn(move || {
                    let err = endpoint.recv(0, CHANNEL).unwrap_err();
                    assert!(matches!(err, TransportError::Aborted(_)));
                });
            }
            s.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                endpoints[0].abort("test");
            });
        });

        assert!(endpoints[2].is_aborted());
        assert!(matches!(
            endpoints[1].send(0, CHANNEL, vec![]),
            Err(TransportError::Aborted(_))
        ));

        Ok(())
    }

    #[test]
    fn unknown_rank_is_rejected() {
        let fabric = LocalFabric::new(1);
        assert!(fabric.endpoint(1).is_err());
        let endpoint = &fabric.endpoints()[0];
        assert_eq!(
            endpoint.send(4, CHANNEL, vec![]),
            Err(TransportError::UnknownRank(4))
        );
    }
}
