//! Collective transfer of distributed arrays through a subset of i/o tasks.
//!
//! Every rank of a parallel job holds a piece of one or more global
//! multi-dimensional arrays. A [`DecompositionMap`] says which hyperslabs of
//! the global shape each i/o task owns; an [`IoSystem`] turns it into a
//! [`DistributionDescriptor`] and moves the pieces to and from a storage
//! [`Backend`] with collective operations that every compute task calls in
//! the same order.
//!
//! # Layouts
//! The ranks are organized by a [`Topology`].
//! - *Intracomm*: every rank computes and some of them also do i/o. Each i/o
//!   task passes its own local buffer.
//! - *Disjoint*: the i/o tasks do nothing but execute the calls the compute
//!   leader forwards to them, inside [`IoSystem::serve`]. The compute leader
//!   passes every i/o task's local buffer, one after the other.
//!
//! # Transfers
//! How data reaches a backend depends on what the backend can do, see
//! [`Capabilities`](backend::Capabilities): parallel backends are written by
//! every i/o task, with blocking calls or with one batched request per
//! variable; a serial backend is written by the i/o leader, which gathers
//! the data of all other i/o tasks first.
//!
//! Single-variable writes are buffered and flushed as one multi-variable
//! transfer once the buffered amount exceeds
//! [`IoSystemConfig::buffer_size_limit`].
//!
//! # Failures
//! Every operation ends with all ranks agreeing on one [`Status`]; a failure
//! on any rank is reported on every rank as [`Error::Failed`]. A failure of
//! the messaging substrate aborts the whole [`fabric`](fabric::LocalFabric)
//! and surfaces as [`Error::Transport`].

pub(crate) mod aggregator;
pub(crate) mod dispatch;
pub(crate) mod file;
pub(crate) mod gather;
pub(crate) mod message;
pub(crate) mod pool;
pub(crate) mod protocol;
pub(crate) mod request;
pub(crate) mod transfer;

pub mod backend;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fabric;
pub mod group;
pub mod iosystem;
pub mod memory;
pub mod region;
pub mod topology;
pub mod transport;

pub use backend::Backend;
pub use config::IoSystemConfig;
pub use descriptor::{Block, DecompositionMap, DescriptorId, DistributionDescriptor, ElementType};
pub use error::{Error, Result, Status};
pub use file::FileId;
pub use iosystem::{IoSystem, MultiWrite};
pub use topology::Topology;
