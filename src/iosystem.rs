//! The i/o system context and its collective operations.
//!
//! An [`IoSystem`] lives on every rank of a [`Topology`]. Every operation is
//! collective: all compute tasks call it in the same order and all of them
//! observe the same outcome. In the disjoint layout the compute leader
//! forwards each call to the i/o tasks, which execute it inside
//! [`IoSystem::serve`].
//!
//! Arguments that are identical on every rank (ids, variable lists) are
//! checked before any communication and rejected on every rank alike. A
//! buffer of the wrong length is a per-rank failure: the rank still takes
//! part in the transfer, as if it held no data, and its status is agreed
//! with the others.

use std::sync::Arc;

use ahash::HashMap;
use zerocopy::byteorder::network_endian::{U16, U32, U64};

use crate::{
    aggregator::Append,
    backend::{Opener, RequestId, StrategyKind, VarId},
    config::{ConfigError, IoSystemConfig},
    descriptor::{
        decode_blocks, encode_blocks, DecompositionMap, DescriptorId, DistributionDescriptor,
        ElementType,
    },
    dispatch::{Dispatcher, Payload},
    error::{Error, Result, Status, TransportError},
    file::{decode_vars, encode_vars, FileId, IoHandle, OpenFile, VarState},
    message::{self, Call},
    pool::BufferPool,
    protocol,
    region::{Layout, RegionSlots},
    request::{self, PendingRequest},
    topology::Topology,
    transfer::{self, Pass, Target},
    transport::Lane,
};

type TransportResult<T> = std::result::Result<T, TransportError>;

/// The variables of a multi-variable write and how to write them.
#[derive(Debug, Clone, Copy)]
pub struct MultiWrite<'a> {
    pub vars: &'a [VarId],
    /// The record written for every variable. Each variable's current frame
    /// is used if not given.
    pub frames: Option<&'a [u64]>,
    /// One fill element per variable. Enables the fill pass for descriptors
    /// with holes.
    pub fills: Option<&'a [u8]>,
    /// Complete the backend requests before returning.
    pub flush_to_disk: bool,
}

impl<'a> MultiWrite<'a> {
    pub fn new(vars: &'a [VarId]) -> Self {
        Self {
            vars,
            frames: None,
            fills: None,
            flush_to_disk: false,
        }
    }

    pub fn frames(mut self, frames: &'a [u64]) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn fills(mut self, fills: &'a [u8]) -> Self {
        self.fills = Some(fills);
        self
    }

    pub fn flush_to_disk(mut self) -> Self {
        self.flush_to_disk = true;
        self
    }
}

/// A multi-variable write with every argument resolved.
#[derive(Debug)]
struct WriteArgs {
    file: FileId,
    descriptor: DescriptorId,
    targets: Vec<Target>,
    fills: Vec<u8>,
    flush_to_disk: bool,
}

/// The state shared by every collective operation on one rank.
pub struct IoSystem {
    topology: Topology,
    config: IoSystemConfig,
    opener: Arc<dyn Opener>,
    descriptors: HashMap<DescriptorId, DistributionDescriptor>,
    files: HashMap<FileId, OpenFile>,
    next_descriptor: DescriptorId,
    next_file: FileId,
    pool: BufferPool,
}

impl std::fmt::Debug for IoSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSystem")
            .field("topology", &self.topology)
            .field("config", &self.config)
            .field("descriptors", &self.descriptors.len())
            .field("files", &self.files.len())
            .finish()
    }
}

impl IoSystem {
    pub fn new(
        topology: Topology,
        config: IoSystemConfig,
        opener: Arc<dyn Opener>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        tracing::debug!(
            rank = topology.rank(),
            role = ?topology.role(),
            disjoint = topology.is_disjoint(),
            "created i/o system"
        );

        Ok(Self {
            topology,
            config,
            opener,
            descriptors: HashMap::default(),
            files: HashMap::default(),
            next_descriptor: 0,
            next_file: 0,
            pool: BufferPool::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &IoSystemConfig {
        &self.config
    }

    pub fn descriptor(&self, id: DescriptorId) -> Option<&DistributionDescriptor> {
        self.descriptors.get(&id)
    }

    pub fn is_open(&self, file: FileId) -> bool {
        self.files.contains_key(&file)
    }

    /// The record the next transfer of `var` targets.
    pub fn frame(&self, file: FileId, var: VarId) -> Option<u64> {
        self.files
            .get(&file)
            .and_then(|open| open.vars.get(&var))
            .map(|state| state.frame)
    }

    /// Bytes of writes buffered on this rank.
    pub fn buffered(&self, file: FileId) -> Option<u64> {
        self.files.get(&file).map(|open| open.aggregator.usage())
    }

    /// The largest backend buffer usage any flush check of the file saw.
    pub fn max_usage(&self, file: FileId) -> Option<u64> {
        self.files.get(&file).map(|open| open.max_usage)
    }

    /// Sets the byte budget of buffered data and returns the previous one.
    ///
    /// A limit of zero is ignored.
    pub fn set_buffer_size_limit(&mut self, limit: u64) -> u64 {
        let previous = self.config.buffer_size_limit;
        self.config = self.config.clone().with_buffer_size_limit(limit);
        previous
    }

    fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.topology)
    }

    fn agree(&self, status: Status) -> TransportResult<Status> {
        self.topology.union().agree(status)
    }

    fn fail(&self, err: TransportError) -> TransportError {
        self.topology.union().fail(err)
    }

    fn open_file_ref(&self, file: FileId) -> Result<&OpenFile> {
        self.files.get(&file).ok_or(Error::Failed(Status::BAD_ID))
    }

    fn descriptor_ref(&self, id: DescriptorId) -> Result<&DistributionDescriptor> {
        self.descriptors.get(&id).ok_or(Error::Failed(Status::BAD_ID))
    }

    /// Elements of one variable this rank passes to a write or read.
    ///
    /// In the disjoint layout the compute leader holds every i/o task's
    /// share, in i/o task order.
    fn share_len(&self, descriptor: &DistributionDescriptor) -> usize {
        if self.topology.is_disjoint() {
            if self.topology.is_compute_leader() {
                descriptor.total_len()
            } else {
                0
            }
        } else {
            self.topology
                .io_index()
                .map_or(0, |task| descriptor.local_len(task))
        }
    }

    /// Registers a decomposition on every rank.
    #[tracing::instrument(skip(self, map), fields(rank = self.topology.rank()))]
    pub fn define_descriptor(&mut self, map: &DecompositionMap) -> Result<DescriptorId> {
        let id = self.next_descriptor;
        let descriptor = DistributionDescriptor::new(id, map, self.topology.num_io_tasks())
            .map_err(|err| {
                tracing::warn!(%err, "rejected decomposition");
                Error::Failed(Status::INVALID)
            })?;
        self.next_descriptor += 1;

        let dims = protocol::encode_u64s(map.dims.iter().copied());
        let blocks = protocol::encode_u64s(encode_blocks(&map.blocks));
        let fill_blocks = protocol::encode_u64s(encode_blocks(&map.fill_blocks));
        self.dispatcher().forward(
            &protocol::DefineDescriptor {
                descriptor: U32::new(id),
                element: map.element.code(),
                ndims: U16::new(map.dims.len() as u16),
                tasks: U32::new(map.blocks.len() as u32),
                fill_tasks: U32::new(map.fill_blocks.len() as u32),
                needs_fill: map.needs_fill.into(),
            },
            &[
                Payload::Shared(&dims),
                Payload::Shared(&blocks),
                Payload::Shared(&fill_blocks),
            ],
        )?;

        self.descriptors.insert(id, descriptor);
        self.agree(Status::OK)?.into_result()?;
        Ok(id)
    }

    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn free_descriptor(&mut self, id: DescriptorId) -> Result<()> {
        self.descriptor_ref(id)?;
        self.dispatcher().forward(
            &protocol::FreeDescriptor {
                descriptor: U32::new(id),
            },
            &[],
        )?;
        let status = self.free_descriptor_local(id);
        self.agree(status)?.into_result()
    }

    fn free_descriptor_local(&mut self, id: DescriptorId) -> Status {
        match self.descriptors.remove(&id) {
            Some(_) => Status::OK,
            None => Status::BAD_ID,
        }
    }

    /// Opens a dataset on every i/o task and replicates its variable table
    /// to every rank.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn open_file(&mut self, path: &str, writable: bool) -> Result<FileId> {
        let file = self.next_file;
        self.next_file += 1;
        self.dispatcher().forward(
            &protocol::OpenFile {
                file: U32::new(file),
                writable: writable.into(),
            },
            &[Payload::Shared(path.as_bytes())],
        )?;
        self.open_file_local(file, path, writable)?.into_result()?;
        Ok(file)
    }

    fn open_file_local(
        &mut self,
        file: FileId,
        path: &str,
        writable: bool,
    ) -> TransportResult<Status> {
        let mut status = Status::OK;
        let mut io = None;
        if let Some(io_index) = self.topology.io_index() {
            match self.opener.open(path, writable, io_index) {
                Ok(backend) => {
                    let kind = StrategyKind::select(backend.capabilities());
                    tracing::debug!(path, io_index, ?kind, "opened backend");
                    io = Some(IoHandle {
                        backend,
                        strategy: transfer::strategy(kind),
                    });
                }
                Err(err) => {
                    tracing::warn!(path, io_index, %err, "cannot open backend");
                    status = err.status();
                }
            }
        }
        let status = self.agree(status)?;
        if !status.is_ok() {
            return Ok(status);
        }

        // Union members are ordered by rank.
        let union = self.topology.union();
        let table = match &io {
            Some(handle) if self.topology.io().is_leader() => {
                encode_vars(&handle.backend.variables())
            }
            _ => Vec::new(),
        };
        let table = union.broadcast(self.topology.io_leader(), table)?;
        let vars = decode_vars(&table).map_err(|err| union.fail(err))?;

        let mut open = OpenFile::new(path.to_string(), writable, io);
        open.vars = vars
            .into_iter()
            .map(|(var, meta)| (var, VarState::new(meta)))
            .collect();
        self.files.insert(file, open);
        Ok(Status::OK)
    }

    /// Flushes buffered writes, completes every request and closes the file.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn close_file(&mut self, file: FileId) -> Result<()> {
        self.open_file_ref(file)?;
        let flushed = self.flush(file, true);
        if let Err(err @ Error::Transport(_)) = &flushed {
            return Err(err.clone());
        }

        self.dispatcher()
            .forward(&protocol::CloseFile { file: U32::new(file) }, &[])?;
        let status = self.close_file_local(file)?;
        flushed.and(status.into_result())
    }

    fn close_file_local(&mut self, file: FileId) -> TransportResult<Status> {
        let status = match self.files.remove(&file) {
            Some(mut open) => complete_requests(&mut open),
            None => Status::BAD_ID,
        };
        tracing::debug!(file, %status, "closed file");
        self.agree(status)
    }

    /// Flushes buffered writes and brings the backend up to date.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn sync_file(&mut self, file: FileId) -> Result<()> {
        self.open_file_ref(file)?;
        let flushed = self.flush(file, true);
        if let Err(err @ Error::Transport(_)) = &flushed {
            return Err(err.clone());
        }

        self.dispatcher()
            .forward(&protocol::SyncFile { file: U32::new(file) }, &[])?;
        let status = self.sync_file_local(file)?;
        flushed.and(status.into_result())
    }

    fn sync_file_local(&mut self, file: FileId) -> TransportResult<Status> {
        let is_io_leader = self.topology.io().is_leader();
        let status = match self.files.get_mut(&file) {
            Some(open) => {
                let mut status = complete_requests(open);
                if let Some(handle) = open.io.as_mut() {
                    // A serial backend only answers the i/o leader.
                    if handle.strategy.kind() != StrategyKind::Serial || is_io_leader {
                        if let Err(err) = handle.backend.sync() {
                            tracing::warn!(file, %err, "sync failed");
                            status = status.first_error(err.status());
                        }
                    }
                }
                status
            }
            None => Status::BAD_ID,
        };
        self.agree(status)
    }

    /// Buffers one variable's data for a later multi-variable write.
    ///
    /// `data` is this rank's share: its local buffer on an i/o task of the
    /// intracomm layout, every task's local buffer on the compute leader of
    /// the disjoint layout, nothing otherwise. A `fill` value must match the
    /// variable's.
    #[tracing::instrument(skip(self, data, fill), fields(rank = self.topology.rank()))]
    pub fn write_darray(
        &mut self,
        file: FileId,
        var: VarId,
        descriptor: DescriptorId,
        data: &[u8],
        fill: Option<&[u8]>,
    ) -> Result<()> {
        let open = self.open_file_ref(file)?;
        let desc = self.descriptor_ref(descriptor)?;
        let state = open.vars.get(&var).ok_or(Error::Failed(Status::BAD_ID))?;
        if !open.writable {
            return Err(Error::Failed(Status::PERMISSION));
        }
        if state.element() != desc.element() {
            return Err(Error::Failed(Status::INVALID));
        }

        let mut status = Status::OK;
        let expected = self.share_len(desc) * desc.element_size();
        if data.len() != expected {
            tracing::warn!(expected, actual = data.len(), "write buffer has the wrong length");
            status = Status::INVALID;
        }
        if fill.is_some_and(|fill| fill != state.fill()) {
            tracing::warn!(var, "fill value differs from the variable's");
            status = Status::INVALID;
        }
        self.topology.compute().agree(status)?.into_result()?;

        let Some(open) = self.files.get_mut(&file) else {
            return Err(Error::Failed(Status::BAD_ID));
        };
        let Some(state) = open.vars.get(&var) else {
            return Err(Error::Failed(Status::BAD_ID));
        };
        open.aggregator.append(
            &self.pool,
            Append {
                descriptor,
                record: state.is_record(),
                var,
                frame: state.frame,
                fill: fill.unwrap_or(state.fill()),
                data,
            },
        );

        self.flush(file, false)
    }

    /// Writes buffered data if `force` is set or the largest buffered amount
    /// across the compute tasks exceeds the buffer size limit.
    ///
    /// The aggregator is empty afterwards, whether the writes succeeded or
    /// not.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn flush(&mut self, file: FileId, force: bool) -> Result<()> {
        let usage = self.open_file_ref(file)?.aggregator.usage();
        if !force {
            let max = self.topology.compute().allreduce_max(usage)?;
            if max <= self.config.buffer_size_limit {
                return Ok(());
            }
            tracing::debug!(
                max,
                limit = self.config.buffer_size_limit,
                "buffered writes exceed the limit"
            );
        }

        let buffers = match self.files.get_mut(&file) {
            Some(open) => open.aggregator.take(),
            None => Vec::new(),
        };
        let mut result = Ok(());
        for buffer in buffers {
            let write = MultiWrite {
                vars: &buffer.vars,
                frames: Some(buffer.frames.as_slice()),
                fills: Some(buffer.fills.as_slice()),
                flush_to_disk: true,
            };
            let data = buffer.data.as_slice();
            match self.write_darray_multi(file, buffer.descriptor, write, data) {
                Ok(()) => {}
                Err(err @ Error::Transport(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(descriptor = buffer.descriptor, %err, "buffered write failed");
                    result = result.and(Err(err));
                }
            }
        }
        result
    }

    /// Writes several variables sharing one descriptor.
    ///
    /// `data` holds every variable's share, variable after variable. See
    /// [`write_darray`](Self::write_darray) for what a rank's share is.
    #[tracing::instrument(
        skip(self, write, data),
        fields(rank = self.topology.rank(), nvars = write.vars.len())
    )]
    pub fn write_darray_multi(
        &mut self,
        file: FileId,
        descriptor: DescriptorId,
        write: MultiWrite,
        data: &[u8],
    ) -> Result<()> {
        let args = self.resolve_write(file, descriptor, &write)?;
        let desc = self.descriptor_ref(descriptor)?;
        let es = desc.element_size();
        let nvars = args.targets.len();

        let mut status = Status::OK;
        let expected = nvars * self.share_len(desc) * es;
        let data = if data.len() == expected {
            data
        } else {
            tracing::warn!(expected, actual = data.len(), "write buffer has the wrong length");
            status = Status::INVALID;
            &[]
        };

        if self.topology.is_disjoint() && self.topology.is_compute_leader() {
            let per_task = if status.is_ok() {
                split_staged(desc, nvars, data)
            } else {
                vec![Vec::new(); desc.num_tasks()]
            };
            let vars = protocol::encode_u64s(args.targets.iter().map(|target| target.var as u64));
            let frames = protocol::encode_u64s(args.targets.iter().map(|target| target.frame));
            self.dispatcher().forward(
                &protocol::WriteDarrayMulti {
                    file: U32::new(file),
                    descriptor: U32::new(descriptor),
                    nvars: U32::new(nvars as u32),
                    flush_to_disk: args.flush_to_disk.into(),
                    fill_present: (!args.fills.is_empty()).into(),
                },
                &[
                    Payload::Shared(&vars),
                    Payload::Shared(&frames),
                    Payload::Shared(&args.fills),
                    Payload::PerTask(per_task),
                ],
            )?;
        }

        let local = self.write_local(&args, data)?;
        self.agree(status.first_error(local))?.into_result()
    }

    fn resolve_write(
        &self,
        file: FileId,
        descriptor: DescriptorId,
        write: &MultiWrite,
    ) -> Result<WriteArgs> {
        let open = self.open_file_ref(file)?;
        let desc = self.descriptor_ref(descriptor)?;
        let frames_len = write.frames.map_or(write.vars.len(), <[u64]>::len);
        let fills = write.fills.unwrap_or_default();
        check_write(open, desc, write.vars, frames_len, fills.len()).into_result()?;

        let targets = match write.frames {
            Some(frames) => write
                .vars
                .iter()
                .zip(frames)
                .map(|(&var, &frame)| Target { var, frame })
                .collect(),
            None => write
                .vars
                .iter()
                .map(|&var| Target {
                    var,
                    frame: open.vars.get(&var).map_or(0, |state| state.frame),
                })
                .collect(),
        };
        Ok(WriteArgs {
            file,
            descriptor,
            targets,
            fills: fills.to_vec(),
            flush_to_disk: write.flush_to_disk,
        })
    }

    /// Runs the transfer of a multi-variable write on an i/o task.
    fn write_local(&mut self, args: &WriteArgs, data: &[u8]) -> TransportResult<Status> {
        let Some(task) = self.topology.io_index() else {
            return Ok(Status::OK);
        };
        let Self {
            topology,
            config,
            descriptors,
            files,
            ..
        } = self;
        let (Some(desc), Some(open)) = (
            descriptors.get(&args.descriptor),
            files.get_mut(&args.file),
        ) else {
            return Ok(Status::BAD_ID);
        };
        let OpenFile {
            io: Some(handle),
            vars,
            max_usage,
            ..
        } = open
        else {
            return Ok(Status::BAD_ID);
        };
        let Some(first) = args.targets.first().and_then(|target| vars.get(&target.var)) else {
            return Ok(Status::BAD_ID);
        };

        let io = topology.io();
        let es = desc.element_size();
        let nvars = args.targets.len();
        let layout = Layout {
            ndims: desc.ndims(),
            fndims: first.ndims(),
            record: first.is_record(),
        };

        let mut status = Status::OK;
        let empty = RegionSlots::new(Vec::new(), desc.max_regions());
        let (slots, llen) = if data.len() == nvars * desc.local_len(task) * es {
            (desc.regions(task), desc.local_len(task))
        } else {
            tracing::warn!(task, actual = data.len(), "local buffer has the wrong length");
            status = Status::INVALID;
            (&empty, 0)
        };

        let kind = handle.strategy.kind();
        if kind == StrategyKind::Batched {
            for target in &args.targets {
                if let Some(state) = vars.get_mut(&target.var) {
                    if state.requests.try_reserve(config.request_reserve).is_err() {
                        status = status.first_error(Status::NO_MEMORY);
                    }
                }
            }
        }

        let pass = Pass {
            layout,
            targets: &args.targets,
            slots,
            llen,
            element_size: es,
        };
        let outcome = handle.strategy.write(io, handle.backend.as_mut(), &pass, data)?;
        status = status.first_error(outcome.status);
        track(vars, &args.targets, outcome.requests);

        if desc.needs_fill() && !args.fills.is_empty() && desc.max_fill_regions() > 0 {
            let hole_len = desc.hole_len(task);
            let fill: Vec<u8> = args
                .fills
                .chunks(es)
                .flat_map(|element| element.repeat(hole_len))
                .collect();
            let pass = Pass {
                slots: desc.fill_regions(task),
                llen: hole_len,
                ..pass
            };
            let outcome = handle.strategy.write(io, handle.backend.as_mut(), &pass, &fill)?;
            status = status.first_error(outcome.status);
            track(vars, &args.targets, outcome.requests);
        }

        if args.flush_to_disk {
            let ids: Vec<VarId> = args.targets.iter().map(|target| target.var).collect();
            let lists = OpenFile::request_lists(vars, &ids);
            if let Err(err) = request::wait_all(handle.backend.as_mut(), lists) {
                tracing::warn!(%err, "waiting on requests failed");
                status = status.first_error(err.status());
            }
        } else if kind == StrategyKind::Batched {
            let usage = io.allreduce_max(handle.backend.buffer_usage())?;
            *max_usage = (*max_usage).max(usage);
            if usage > config.buffer_size_limit {
                tracing::debug!(
                    usage,
                    limit = config.buffer_size_limit,
                    "backend buffers exceed the limit"
                );
                let lists = vars.values_mut().map(|state| &mut state.requests);
                if let Err(err) = request::wait_all(handle.backend.as_mut(), lists) {
                    tracing::warn!(%err, "waiting on requests failed");
                    status = status.first_error(err.status());
                }
            }
        }

        Ok(status)
    }

    /// Reads one variable.
    ///
    /// `out` receives this rank's share, laid out as for
    /// [`write_darray`](Self::write_darray).
    #[tracing::instrument(skip(self, out), fields(rank = self.topology.rank()))]
    pub fn read_darray(
        &mut self,
        file: FileId,
        var: VarId,
        descriptor: DescriptorId,
        out: &mut [u8],
    ) -> Result<()> {
        let open = self.open_file_ref(file)?;
        let desc = self.descriptor_ref(descriptor)?;
        check_read(open, desc, var).into_result()?;

        let mut status = Status::OK;
        let expected = self.share_len(desc) * desc.element_size();
        if out.len() != expected {
            tracing::warn!(expected, actual = out.len(), "read buffer has the wrong length");
            status = Status::INVALID;
        }

        self.dispatcher().forward(
            &protocol::ReadDarray {
                file: U32::new(file),
                descriptor: U32::new(descriptor),
                var: U32::new(var),
            },
            &[],
        )?;

        if self.topology.is_disjoint() {
            if self.topology.is_compute_leader() {
                self.collect_read(descriptor, out, status.is_ok())?;
            }
        } else {
            let out: &mut [u8] = if status.is_ok() { out } else { &mut [] };
            status = status.first_error(self.read_local(file, var, descriptor, out)?);
        }
        self.agree(status)?.into_result()
    }

    /// Receives every i/o task's local buffer on the compute leader.
    fn collect_read(
        &self,
        descriptor: DescriptorId,
        out: &mut [u8],
        keep: bool,
    ) -> TransportResult<()> {
        let union = self.topology.union();
        let io = self.topology.io();
        let Some(desc) = self.descriptors.get(&descriptor) else {
            return Ok(());
        };
        let es = desc.element_size();
        for task in 0..io.len() {
            let bytes = union.recv(io.rank_of(task), Lane::ReadData)?;
            let len = desc.local_len(task) * es;
            if bytes.len() != len {
                return Err(union.fail(TransportError::Malformed("read data length")));
            }
            if keep {
                let start = desc.staged_offset(task) * es;
                out[start..start + len].copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    /// Runs the transfer of a read on an i/o task.
    fn read_local(
        &mut self,
        file: FileId,
        var: VarId,
        descriptor: DescriptorId,
        out: &mut [u8],
    ) -> TransportResult<Status> {
        let Some(task) = self.topology.io_index() else {
            return Ok(Status::OK);
        };
        let Self {
            topology,
            descriptors,
            files,
            ..
        } = self;
        let (Some(desc), Some(open)) = (descriptors.get(&descriptor), files.get_mut(&file)) else {
            return Ok(Status::BAD_ID);
        };
        let OpenFile {
            io: Some(handle),
            vars,
            ..
        } = open
        else {
            return Ok(Status::BAD_ID);
        };
        let Some(state) = vars.get_mut(&var) else {
            return Ok(Status::BAD_ID);
        };

        // Pending writes of the variable land before it is read.
        let mut status = Status::OK;
        if let Err(err) = request::wait_all(handle.backend.as_mut(), [&mut state.requests]) {
            tracing::warn!(var, %err, "waiting on requests failed");
            status = err.status();
        }

        let es = desc.element_size();
        let empty = RegionSlots::new(Vec::new(), desc.max_regions());
        let (slots, llen) = if out.len() == desc.local_len(task) * es {
            (desc.regions(task), desc.local_len(task))
        } else {
            tracing::warn!(task, actual = out.len(), "local buffer has the wrong length");
            status = status.first_error(Status::INVALID);
            (&empty, 0)
        };
        let targets = [Target {
            var,
            frame: state.frame,
        }];
        let pass = Pass {
            layout: Layout {
                ndims: desc.ndims(),
                fndims: state.ndims(),
                record: state.is_record(),
            },
            targets: &targets,
            slots,
            llen,
            element_size: es,
        };
        let read = handle
            .strategy
            .read(topology.io(), handle.backend.as_mut(), &pass, out)?;
        Ok(status.first_error(read))
    }

    /// Sets the record the next transfer of `var` targets.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn set_frame(&mut self, file: FileId, var: VarId, frame: u64) -> Result<()> {
        self.check_var(file, var)?;
        self.dispatcher().forward(
            &protocol::SetFrame {
                file: U32::new(file),
                var: U32::new(var),
                frame: U64::new(frame),
            },
            &[],
        )?;
        let status = self.update_frame(file, var, |_| frame);
        self.agree(status)?.into_result()
    }

    /// Moves `var` to its next record.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn advance_frame(&mut self, file: FileId, var: VarId) -> Result<()> {
        self.check_var(file, var)?;
        self.dispatcher().forward(
            &protocol::AdvanceFrame {
                file: U32::new(file),
                var: U32::new(var),
            },
            &[],
        )?;
        let status = self.update_frame(file, var, |frame| frame + 1);
        self.agree(status)?.into_result()
    }

    fn check_var(&self, file: FileId, var: VarId) -> Result<()> {
        match self.open_file_ref(file)?.vars.contains_key(&var) {
            true => Ok(()),
            false => Err(Error::Failed(Status::BAD_ID)),
        }
    }

    fn update_frame(
        &mut self,
        file: FileId,
        var: VarId,
        update: impl FnOnce(u64) -> u64,
    ) -> Status {
        match self
            .files
            .get_mut(&file)
            .and_then(|open| open.vars.get_mut(&var))
        {
            Some(state) => {
                state.frame = update(state.frame);
                tracing::trace!(file, var, frame = state.frame, "set frame");
                Status::OK
            }
            None => Status::BAD_ID,
        }
    }

    /// Closes every open file and shuts the i/o system down.
    ///
    /// In the disjoint layout this ends [`serve`](Self::serve) on the i/o
    /// tasks.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn finalize(mut self) -> Result<()> {
        if !self.topology.is_compute() {
            return Ok(());
        }

        let mut files: Vec<FileId> = self.files.keys().copied().collect();
        files.sort_unstable();
        let mut result = Ok(());
        for file in files {
            match self.close_file(file) {
                Ok(()) => {}
                Err(err @ Error::Transport(_)) => return Err(err),
                Err(err) => result = result.and(Err(err)),
            }
        }

        self.dispatcher().forward(&protocol::Exit {}, &[])?;
        self.agree(Status::OK)?.into_result()?;
        result
    }

    /// Executes forwarded calls until the compute tasks finalize.
    ///
    /// Returns immediately unless this rank is an i/o task of the disjoint
    /// layout.
    #[tracing::instrument(skip(self), fields(rank = self.topology.rank()))]
    pub fn serve(&mut self) -> Result<()> {
        if !self.topology.is_disjoint() || !self.topology.is_io() {
            return Ok(());
        }

        loop {
            let dispatcher = self.dispatcher();
            let opcode = dispatcher.receive_opcode()?;
            let frame = dispatcher.receive_args()?;
            let call = message::validate(&frame, opcode).map_err(|err| self.fail(err.into()))?;
            tracing::debug!(?call, "serving call");

            if let Call::Exit(_) = call {
                self.agree(Status::OK)?;
                break;
            }
            self.serve_call(call)?;
        }

        tracing::debug!("server loop finished");
        Ok(())
    }

    fn serve_call(&mut self, call: Call) -> TransportResult<()> {
        match call {
            Call::DefineDescriptor(header) => self.serve_define_descriptor(header),
            Call::FreeDescriptor(header) => {
                let status = self.free_descriptor_local(header.descriptor.get());
                self.agree(status)?;
                Ok(())
            }
            Call::OpenFile(header) => {
                let path = self.dispatcher().receive_payload()?;
                let path = String::from_utf8(path)
                    .map_err(|_| self.fail(TransportError::Malformed("file path")))?;
                let file = header.file.get();
                self.next_file = file + 1;
                self.open_file_local(file, &path, header.writable != 0)?;
                Ok(())
            }
            Call::CloseFile(header) => {
                self.close_file_local(header.file.get())?;
                Ok(())
            }
            Call::SyncFile(header) => {
                self.sync_file_local(header.file.get())?;
                Ok(())
            }
            Call::WriteDarrayMulti(header) => self.serve_write(header),
            Call::ReadDarray(header) => self.serve_read(header),
            Call::SetFrame(header) => {
                let frame = header.frame.get();
                let status = self.update_frame(header.file.get(), header.var.get(), |_| frame);
                self.agree(status)?;
                Ok(())
            }
            Call::AdvanceFrame(header) => {
                let status =
                    self.update_frame(header.file.get(), header.var.get(), |frame| frame + 1);
                self.agree(status)?;
                Ok(())
            }
            Call::Exit(_) => Ok(()),
        }
    }

    fn serve_define_descriptor(
        &mut self,
        header: &protocol::DefineDescriptor,
    ) -> TransportResult<()> {
        let dispatcher = self.dispatcher();
        let dims = protocol::decode_u64s(&dispatcher.receive_payload()?);
        let blocks = protocol::decode_u64s(&dispatcher.receive_payload()?);
        let fill_blocks = protocol::decode_u64s(&dispatcher.receive_payload()?);

        let ndims = header.ndims.get() as usize;
        let map = (|| {
            let element = ElementType::from_code(header.element)
                .ok_or(TransportError::Malformed("element type"))?;
            Ok::<_, TransportError>(DecompositionMap {
                element,
                dims: dims?,
                blocks: decode_blocks(&blocks?, header.tasks.get() as usize, ndims)?,
                needs_fill: header.needs_fill != 0,
                fill_blocks: decode_blocks(&fill_blocks?, header.fill_tasks.get() as usize, ndims)?,
            })
        })()
        .map_err(|err| self.fail(err))?;

        let id = header.descriptor.get();
        self.next_descriptor = id + 1;
        let status = match DistributionDescriptor::new(id, &map, self.topology.num_io_tasks()) {
            Ok(descriptor) => {
                self.descriptors.insert(id, descriptor);
                Status::OK
            }
            Err(err) => {
                tracing::warn!(%err, "rejected forwarded decomposition");
                Status::INVALID
            }
        };
        self.agree(status)?;
        Ok(())
    }

    fn serve_write(&mut self, header: &protocol::WriteDarrayMulti) -> TransportResult<()> {
        let dispatcher = self.dispatcher();
        let vars =
            protocol::decode_u64s(&dispatcher.receive_payload()?).map_err(|err| self.fail(err))?;
        let frames =
            protocol::decode_u64s(&dispatcher.receive_payload()?).map_err(|err| self.fail(err))?;
        let fills = dispatcher.receive_payload()?;
        let data = dispatcher.receive_payload()?;
        if vars.len() != header.nvars.get() as usize
            || frames.len() != vars.len()
            || (header.fill_present != 0) == fills.is_empty()
        {
            return Err(self.fail(TransportError::Malformed("write arguments")));
        }

        let args = WriteArgs {
            file: header.file.get(),
            descriptor: header.descriptor.get(),
            targets: vars
                .iter()
                .zip(&frames)
                .map(|(&var, &frame)| Target {
                    var: var as VarId,
                    frame,
                })
                .collect(),
            fills,
            flush_to_disk: header.flush_to_disk != 0,
        };
        let status = match (
            self.files.get(&args.file),
            self.descriptors.get(&args.descriptor),
        ) {
            (Some(open), Some(desc)) => {
                let vars: Vec<VarId> = args.targets.iter().map(|target| target.var).collect();
                check_write(open, desc, &vars, vars.len(), args.fills.len())
            }
            _ => Status::BAD_ID,
        };
        let status = if status.is_ok() {
            self.write_local(&args, &data)?
        } else {
            status
        };
        self.agree(status)?;
        Ok(())
    }

    fn serve_read(&mut self, header: &protocol::ReadDarray) -> TransportResult<()> {
        let (file, var) = (header.file.get(), header.var.get());
        let descriptor = header.descriptor.get();
        let checked = match (self.files.get(&file), self.descriptors.get(&descriptor)) {
            (Some(open), Some(desc)) => {
                let len = self
                    .topology
                    .io_index()
                    .map_or(0, |task| desc.local_len(task) * desc.element_size());
                (check_read(open, desc, var), len)
            }
            _ => (Status::BAD_ID, 0),
        };

        let (mut status, len) = checked;
        let mut buffer = vec![0; len];
        if status.is_ok() {
            status = self.read_local(file, var, descriptor, &mut buffer)?;
        }
        self.topology
            .union()
            .send(self.topology.compute_leader(), Lane::ReadData, buffer)?;
        self.agree(status)?;
        Ok(())
    }
}

/// Checks the arguments of a multi-variable write that every rank shares.
fn check_write(
    open: &OpenFile,
    desc: &DistributionDescriptor,
    vars: &[VarId],
    frames_len: usize,
    fills_len: usize,
) -> Status {
    if !open.writable {
        return Status::PERMISSION;
    }
    if vars.is_empty() || frames_len != vars.len() {
        return Status::INVALID;
    }
    if fills_len != 0 && fills_len != vars.len() * desc.element_size() {
        return Status::INVALID;
    }

    let mut shape = None;
    for var in vars {
        let Some(state) = open.vars.get(var) else {
            return Status::BAD_ID;
        };
        if state.element() != desc.element() {
            return Status::INVALID;
        }
        // Every variable of one transfer shares the region layout.
        let this = (state.ndims(), state.is_record());
        if *shape.get_or_insert(this) != this {
            return Status::INVALID;
        }
    }
    Status::OK
}

fn check_read(open: &OpenFile, desc: &DistributionDescriptor, var: VarId) -> Status {
    match open.vars.get(&var) {
        None => Status::BAD_ID,
        Some(state) if state.element() != desc.element() => Status::INVALID,
        Some(_) => Status::OK,
    }
}

/// Waits on every outstanding request of a file.
fn complete_requests(open: &mut OpenFile) -> Status {
    let Some(handle) = open.io.as_mut() else {
        return Status::OK;
    };
    let lists = open.vars.values_mut().map(|state| &mut state.requests);
    match request::wait_all(handle.backend.as_mut(), lists) {
        Ok(()) => Status::OK,
        Err(err) => {
            tracing::warn!(path = %open.path, %err, "waiting on requests failed");
            err.status()
        }
    }
}

/// Files started requests with the variables they belong to.
fn track(
    vars: &mut HashMap<VarId, VarState>,
    targets: &[Target],
    requests: Vec<(usize, RequestId)>,
) {
    for (nv, id) in requests {
        if let Some(state) = vars.get_mut(&targets[nv].var) {
            state.requests.push(PendingRequest::new(id));
        }
    }
}

/// Splits a variable-major staged buffer into one buffer per i/o task.
fn split_staged(desc: &DistributionDescriptor, nvars: usize, data: &[u8]) -> Vec<Vec<u8>> {
    let es = desc.element_size();
    let total = desc.total_len();
    (0..desc.num_tasks())
        .map(|task| {
            let offset = desc.staged_offset(task);
            let len = desc.local_len(task) * es;
            let mut buffer = Vec::with_capacity(nvars * len);
            for nv in 0..nvars {
                let start = es * (nv * total + offset);
                buffer.extend_from_slice(&data[start..start + len]);
            }
            buffer
        })
        .collect()
}

#[cfg(test)]
mod test {
    use rand::Rng;

    use super::*;
    use crate::{
        descriptor::Block,
        memory::{Call as BackendCall, DriverMode, MemoryNamespace, VarDef},
        test::*,
    };

    /// Runs `f` on every rank of an intracomm layout whose first `num_io`
    /// ranks do i/o, then finalizes.
    fn run_intracomm<T, F>(
        size: usize,
        num_io: usize,
        config: IoSystemConfig,
        namespace: &Arc<MemoryNamespace>,
        f: F,
    ) -> Vec<T>
    where
        T: Send,
        F: Fn(&mut IoSystem) -> T + Sync,
    {
        run_ranks(size, |transport| {
            let topology = Topology::intracomm(transport, num_io, 1, 0).unwrap();
            let mut system = IoSystem::new(topology, config.clone(), namespace.clone()).unwrap();
            let value = f(&mut system);
            system.finalize().unwrap();
            value
        })
    }

    fn share(system: &IoSystem, shares: &[Vec<u8>]) -> Vec<u8> {
        system
            .topology()
            .io_index()
            .map(|task| shares[task].clone())
            .unwrap_or_default()
    }

    #[test]
    fn serial_leader_writes_every_task() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("serial", DriverMode::Serial);
        let var = dataset.define_var(VarDef::new(ElementType::Int, [40]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [40],
            (0..4).map(|t| vec![Block::new([10 * t], [10])]).collect(),
        );

        run_intracomm(4, 4, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("serial", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            let rank = system.topology().rank() as i32;
            system
                .write_darray(file, var, desc, &ints(10 * rank..10 * rank + 10), None)
                .unwrap();
            system.close_file(file).unwrap();
        });

        assert_eq!(dataset.read_all(var).unwrap(), ints(0..40));
        let calls = dataset.take_calls();
        assert_eq!(calls.len(), 4);
        assert!(calls
            .iter()
            .all(|call| matches!(call, BackendCall::Put { io_index: 0, .. })));
    }

    #[test]
    fn batched_writes_queue_one_request_per_variable() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("batched", DriverMode::Batched);
        let a = dataset.define_var(VarDef::new(ElementType::Int, [12]));
        let b = dataset.define_var(VarDef::new(ElementType::Int, [12]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [12],
            vec![
                vec![
                    Block::new([0], [2]),
                    Block::new([4], [3]),
                    Block::new([10], [2]),
                ],
                vec![Block::new([2], [2]), Block::new([7], [3])],
            ],
        );
        let owned: [Vec<i32>; 2] = [vec![0, 1, 4, 5, 6, 10, 11], vec![2, 3, 7, 8, 9]];

        run_intracomm(2, 2, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("batched", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            assert_eq!(system.descriptor(desc).unwrap().max_regions(), 3);

            let task = system.topology().rank();
            let mut data = ints(owned[task].iter().copied());
            data.extend(ints(owned[task].iter().map(|i| i + 100)));
            system
                .write_darray_multi(file, desc, MultiWrite::new(&[a, b]), &data)
                .unwrap();

            let open = &system.files[&file];
            assert_eq!(open.vars[&a].requests.len(), 1);
            assert_eq!(open.vars[&b].requests.len(), 1);
            system.close_file(file).unwrap();
        });

        let calls = dataset.take_calls();
        for var in [a, b] {
            assert!(calls.contains(&BackendCall::PutMany {
                io_index: 0,
                var,
                extents: 3
            }));
            assert!(calls.contains(&BackendCall::PutMany {
                io_index: 1,
                var,
                extents: 2
            }));
        }
        assert!(calls
            .iter()
            .any(|call| matches!(call, BackendCall::Wait { requests: 2, .. })));
        assert_eq!(dataset.read_all(a).unwrap(), ints(0..12));
        assert_eq!(dataset.read_all(b).unwrap(), ints(100..112));
    }

    #[test]
    fn buffered_writes_flush_past_the_limit() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("limit", DriverMode::Independent);
        let a = dataset.define_var(VarDef::new(ElementType::Int, [10]));
        let b = dataset.define_var(VarDef::new(ElementType::Int, [10]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [10],
            vec![vec![Block::new([0], [2])], vec![Block::new([2], [8])]],
        );
        let config = IoSystemConfig {
            buffer_size_limit: 40,
            ..Default::default()
        };
        let shares = [ints(0..2), ints(2..10)];

        run_intracomm(2, 2, config, &namespace, |system| {
            let file = system.open_file("limit", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            let data = share(system, &shares);

            system.write_darray(file, a, desc, &data, None).unwrap();
            assert_eq!(system.buffered(file), Some(data.len() as u64));

            system.write_darray(file, b, desc, &data, None).unwrap();
            assert_eq!(system.buffered(file), Some(0));
            system.close_file(file).unwrap();
        });

        assert_eq!(dataset.read_all(a).unwrap(), ints(0..10));
        assert_eq!(dataset.read_all(b).unwrap(), ints(0..10));
    }

    fn rows_of(split: u64, task: usize) -> Vec<u64> {
        match task {
            0 => (0..split).collect(),
            _ => (split..4).collect(),
        }
    }

    fn rows(rows: &[u64], base: i32) -> Vec<u8> {
        ints(
            rows.iter()
                .flat_map(|&r| (0..6).map(move |c| base + (r * 6 + c) as i32)),
        )
    }

    #[test]
    fn every_driver_reads_back_what_it_wrote() {
        init_logger();

        for mode in [
            DriverMode::Independent,
            DriverMode::Batched,
            DriverMode::Serial,
        ] {
            let split = rand::thread_rng().gen_range(0..=4);
            let namespace = Arc::new(MemoryNamespace::new());
            let dataset = namespace.create("roundtrip", mode);
            let grid = dataset.define_var(VarDef::new(ElementType::Int, [4, 6]));
            let series = dataset.define_var(VarDef::new(ElementType::Int, [4, 6]).record());
            let map = DecompositionMap::new(
                ElementType::Int,
                [4, 6],
                (0..2)
                    .map(|task| {
                        rows_of(split, task)
                            .into_iter()
                            .map(|r| Block::new([r, 0], [1, 6]))
                            .collect()
                    })
                    .collect(),
            );

            // Two i/o tasks and one compute-only rank.
            run_intracomm(3, 2, IoSystemConfig::default(), &namespace, |system| {
                let file = system.open_file("roundtrip", true).unwrap();
                let desc = system.define_descriptor(&map).unwrap();
                let task = system.topology().io_index();
                let local = |base| match task {
                    Some(task) => rows(&rows_of(split, task), base),
                    None => Vec::new(),
                };

                system.write_darray(file, grid, desc, &local(1000), None).unwrap();
                system.write_darray(file, series, desc, &local(0), None).unwrap();
                system.advance_frame(file, series).unwrap();
                system.write_darray(file, series, desc, &local(100), None).unwrap();
                system.sync_file(file).unwrap();

                let mut out = vec![0; local(0).len()];
                system.read_darray(file, grid, desc, &mut out).unwrap();
                assert_eq!(out, local(1000), "{mode:?}");
                for (frame, base) in [(0, 0), (1, 100)] {
                    system.set_frame(file, series, frame).unwrap();
                    system.read_darray(file, series, desc, &mut out).unwrap();
                    assert_eq!(out, local(base), "{mode:?} frame {frame}");
                }
                system.close_file(file).unwrap();
            });

            assert_eq!(dataset.read_all(grid).unwrap(), ints(1000..1024));
            assert_eq!(dataset.records(series), Some(2));
            let mut expected = ints(0..24);
            expected.extend(ints(100..124));
            assert_eq!(dataset.read_all(series).unwrap(), expected);
        }
    }

    #[test]
    fn flushing_nothing_touches_no_backend() {
        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("idle", DriverMode::Batched);
        dataset.define_var(VarDef::new(ElementType::Int, [4]));

        run_intracomm(2, 2, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("idle", true).unwrap();
            system.flush(file, true).unwrap();
            system.flush(file, true).unwrap();
            system.flush(file, false).unwrap();
            system.close_file(file).unwrap();
        });

        assert!(dataset.take_calls().is_empty());
    }

    #[test]
    fn serial_task_without_data_takes_part() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("lopsided", DriverMode::Serial);
        let var = dataset.define_var(VarDef::new(ElementType::Int, [5]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [5],
            vec![vec![Block::new([0], [5])], vec![]],
        );
        let shares = [ints(0..5), Vec::new()];

        run_intracomm(2, 2, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("lopsided", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            let data = share(system, &shares);
            system.write_darray(file, var, desc, &data, None).unwrap();
            system.flush(file, true).unwrap();

            let mut out = vec![0; data.len()];
            system.read_darray(file, var, desc, &mut out).unwrap();
            assert_eq!(out, data);
        });

        assert_eq!(dataset.read_all(var).unwrap(), ints(0..5));
    }

    #[test]
    fn disjoint_io_tasks_serve_forwarded_calls() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("disjoint", DriverMode::Independent);
        let x = dataset.define_var(VarDef::new(ElementType::Int, [8]));
        let y = dataset.define_var(VarDef::new(ElementType::Int, [8]));
        let series = dataset.define_var(VarDef::new(ElementType::Int, [8]).record());
        let map = DecompositionMap::new(
            ElementType::Int,
            [8],
            vec![
                vec![Block::new([0], [3]), Block::new([6], [2])],
                vec![Block::new([3], [3])],
            ],
        );
        // Every task's share in task order.
        let staged = |base: i32| ints([0, 1, 2, 6, 7, 3, 4, 5].map(|i| base + i));

        let frames = run_ranks(4, |transport| {
            let topology = Topology::disjoint(transport, vec![0, 1], vec![2, 3]).unwrap();
            let mut system =
                IoSystem::new(topology, IoSystemConfig::default(), namespace.clone()).unwrap();
            if !system.topology().is_compute() {
                system.serve().unwrap();
                system.finalize().unwrap();
                return None;
            }

            let leader = system.topology().is_compute_leader();
            let data = |base| if leader { staged(base) } else { Vec::new() };
            let file = system.open_file("disjoint", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();

            system.write_darray(file, x, desc, &data(0), None).unwrap();
            system.write_darray(file, y, desc, &data(100), None).unwrap();
            system.set_frame(file, series, 2).unwrap();
            system.write_darray(file, series, desc, &data(10), None).unwrap();
            system.advance_frame(file, series).unwrap();
            system.sync_file(file).unwrap();

            let mut out = vec![0; data(0).len()];
            system.read_darray(file, y, desc, &mut out).unwrap();
            assert_eq!(out, data(100));

            let frame = system.frame(file, series);
            system.close_file(file).unwrap();
            system.finalize().unwrap();
            frame
        });

        assert_eq!(frames, vec![Some(3), Some(3), None, None]);
        assert_eq!(dataset.read_all(x).unwrap(), ints(0..8));
        assert_eq!(dataset.read_all(y).unwrap(), ints(100..108));
        assert_eq!(dataset.records(series), Some(3));
        let record = dataset.read_all(series).unwrap();
        assert_eq!(record[2 * 32..], ints(10..18)[..]);
    }

    #[test]
    fn failures_are_agreed_on_every_rank() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("errors", DriverMode::Independent);
        let narrow = dataset.define_var(VarDef::new(ElementType::Int, [5]));
        let wide = dataset.define_var(VarDef::new(ElementType::Int, [8]));
        let double = dataset.define_var(VarDef::new(ElementType::Double, [8]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [8],
            vec![vec![Block::new([0], [4])], vec![Block::new([4], [4])]],
        );
        let shares = [ints(0..4), ints(4..8)];

        run_intracomm(2, 2, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("errors", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            let data = share(system, &shares);
            let rank = system.topology().rank();

            // Only task 1 runs past the edge of the narrow variable.
            let vars = [narrow];
            let write = MultiWrite::new(&vars).flush_to_disk();
            assert_eq!(
                system.write_darray_multi(file, desc, write, &data),
                Err(Error::Failed(Status::EDGE))
            );

            assert_eq!(
                system.write_darray(99, wide, desc, &data, None),
                Err(Error::Failed(Status::BAD_ID))
            );
            assert_eq!(
                system.write_darray(file, double, desc, &data, None),
                Err(Error::Failed(Status::INVALID))
            );

            let short = if rank == 1 { &data[..4] } else { &data[..] };
            assert_eq!(
                system.write_darray(file, wide, desc, short, None),
                Err(Error::Failed(Status::INVALID))
            );
            let vars = [wide];
            let write = MultiWrite::new(&vars).flush_to_disk();
            assert_eq!(
                system.write_darray_multi(file, desc, write, short),
                Err(Error::Failed(Status::INVALID))
            );
            let mut out = vec![0; if rank == 0 { 3 } else { 16 }];
            assert_eq!(
                system.read_darray(file, wide, desc, &mut out),
                Err(Error::Failed(Status::INVALID))
            );

            // The group stays in step after every failure.
            system.write_darray(file, wide, desc, &data, None).unwrap();
            system.close_file(file).unwrap();

            let file = system.open_file("errors", false).unwrap();
            assert_eq!(
                system.write_darray(file, wide, desc, &data, None),
                Err(Error::Failed(Status::PERMISSION))
            );
            let mut out = vec![0; data.len()];
            system.read_darray(file, wide, desc, &mut out).unwrap();
            assert_eq!(out, data);

            assert_eq!(
                system.open_file("missing", true),
                Err(Error::Failed(Status::IO))
            );
            system.free_descriptor(desc).unwrap();
            assert_eq!(
                system.free_descriptor(desc),
                Err(Error::Failed(Status::BAD_ID))
            );
        });

        assert_eq!(dataset.read_all(narrow).unwrap(), ints([0, 1, 2, 3, 0]));
        assert_eq!(dataset.read_all(wide).unwrap(), ints(0..8));
    }

    #[test]
    fn holes_are_written_with_the_fill_value() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        let dataset = namespace.create("holes", DriverMode::Independent);
        let var = dataset.define_var(VarDef::new(ElementType::Int, [6]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [6],
            vec![vec![Block::new([0], [2])], vec![Block::new([4], [2])]],
        )
        .with_fill_blocks(vec![vec![Block::new([2], [2])], vec![]]);
        let shares = [ints([7, 8]), ints([9, 10])];

        run_intracomm(2, 2, IoSystemConfig::default(), &namespace, |system| {
            let file = system.open_file("holes", true).unwrap();
            let desc = system.define_descriptor(&map).unwrap();
            let data = share(system, &shares);

            // The variable's own fill value is zero.
            assert_eq!(
                system.write_darray(file, var, desc, &data, Some(ints([-1]).as_slice())),
                Err(Error::Failed(Status::INVALID))
            );

            let (vars, fill) = ([var], ints([-1]));
            let write = MultiWrite::new(&vars).fills(&fill).flush_to_disk();
            system.write_darray_multi(file, desc, write, &data).unwrap();
            system.close_file(file).unwrap();
        });

        assert_eq!(dataset.read_all(var).unwrap(), ints([7, 8, -1, -1, 9, 10]));
    }

    #[test]
    fn transport_failure_reaches_every_rank() {
        init_logger();

        let namespace = Arc::new(MemoryNamespace::new());
        namespace.create("abort", DriverMode::Independent);

        let results = run_ranks(3, |transport| {
            let topology = Topology::intracomm(transport, 3, 1, 0).unwrap();
            let mut system =
                IoSystem::new(topology, IoSystemConfig::default(), namespace.clone()).unwrap();
            if system.topology().rank() == 0 {
                system.fail(TransportError::Malformed("test"));
                return true;
            }
            matches!(system.open_file("abort", true), Err(Error::Transport(_)))
        });
        assert_eq!(results, vec![true; 3]);
    }

    #[test]
    fn buffer_size_limit_can_be_replaced() {
        let results = run_ranks(1, |transport| {
            let topology = Topology::intracomm(transport, 1, 1, 0).unwrap();
            let mut system = IoSystem::new(
                topology,
                IoSystemConfig::default(),
                Arc::new(MemoryNamespace::new()),
            )
            .unwrap();
            let previous = system.set_buffer_size_limit(64);
            (previous, system.set_buffer_size_limit(0), system.config().buffer_size_limit)
        });
        assert_eq!(results, vec![(10 * 1024 * 1024, 64, 64)]);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let results = run_ranks(1, |transport| {
            let topology = Topology::intracomm(transport, 1, 1, 0).unwrap();
            let config = IoSystemConfig {
                request_reserve: 0,
                ..Default::default()
            };
            IoSystem::new(topology, config, Arc::new(MemoryNamespace::new())).unwrap_err()
        });
        assert_eq!(results, vec![ConfigError::RequestReserveZero]);
    }
}
