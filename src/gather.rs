//! The serial-gather strategy for backends with a single writer.
//!
//! Every i/o task other than the leader ships its placed extents and local
//! data to the leader, which replays them one region at a time. A sender
//! emits its messages in a fixed order, each kind on its own lane:
//!
//! | step | lane | write | read |
//! |---|---|---|---|
//! | 1 | `GatherReady` | leader to sender, empty | (none) |
//! | 2 | `GatherLength` | local length in elements | local length |
//! | 3 | `GatherRegionCount` | number of region slots | number of region slots |
//! | 4 | `GatherStarts` / `GatherCounts` | starts, then counts | counts, then starts |
//! | 5 | `GatherData` | local data | leader to sender, local data |
//!
//! A length of zero ends the exchange after step 2. Written extents carry a
//! record index of zero and the leader applies each variable's frame; read
//! extents are framed by the sender.

use crate::{
    backend::{Backend, StrategyKind},
    error::{Status, TransportError},
    group::ProcessGroup,
    region::Extent,
    transfer::{Pass, Strategy, WriteOutcome},
    transport::Lane,
};

const LEADER: usize = 0;

#[derive(Debug)]
pub(crate) struct SerialGather;

fn flatten<'a>(extents: &'a [Extent], field: impl Fn(&'a Extent) -> &'a [u64]) -> Vec<u64> {
    extents.iter().flat_map(|extent| field(extent).iter().copied()).collect()
}

/// The region arrays received from one sender.
struct Shipment {
    llen: usize,
    extents: Vec<Extent>,
}

impl Shipment {
    fn assemble(
        io: &ProcessGroup,
        llen: usize,
        fndims: usize,
        slots: u64,
        starts: Vec<u64>,
        counts: Vec<u64>,
    ) -> Result<Self, TransportError> {
        let expected = slots as usize * fndims;
        if starts.len() != expected || counts.len() != expected {
            return Err(io.fail(TransportError::Malformed("gathered region arrays")));
        }
        let extents: Vec<Extent> = starts
            .chunks(fndims.max(1))
            .zip(counts.chunks(fndims.max(1)))
            .map(|(start, count)| Extent {
                start: start.to_vec(),
                count: count.to_vec(),
            })
            .collect();
        if extents.iter().map(Extent::len).sum::<usize>() != llen {
            return Err(io.fail(TransportError::Malformed("gathered region lengths")));
        }
        Ok(Self { llen, extents })
    }
}

impl SerialGather {
    fn send_write(
        io: &ProcessGroup,
        pass: &Pass,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        io.recv(LEADER, Lane::GatherReady)?;
        io.send_u64(LEADER, Lane::GatherLength, pass.llen as u64)?;
        if pass.llen == 0 {
            return Ok(WriteOutcome::completed(Status::OK));
        }

        let extents = pass.placed();
        io.send_u64(LEADER, Lane::GatherRegionCount, extents.len() as u64)?;
        io.send_u64s(LEADER, Lane::GatherStarts, &flatten(&extents, |e| e.start.as_slice()))?;
        io.send_u64s(LEADER, Lane::GatherCounts, &flatten(&extents, |e| e.count.as_slice()))?;
        io.send(LEADER, Lane::GatherData, data[..pass.buffer_len()].to_vec())?;
        tracing::trace!(llen = pass.llen, regions = extents.len(), "shipped regions to leader");
        Ok(WriteOutcome::completed(Status::OK))
    }

    fn receive_write(
        io: &ProcessGroup,
        task: usize,
        pass: &Pass,
    ) -> Result<Option<(Shipment, Vec<u8>)>, TransportError> {
        io.send(task, Lane::GatherReady, Vec::new())?;
        let llen = io.recv_u64(task, Lane::GatherLength)? as usize;
        if llen == 0 {
            return Ok(None);
        }
        let slots = io.recv_u64(task, Lane::GatherRegionCount)?;
        let starts = io.recv_u64s(task, Lane::GatherStarts)?;
        let counts = io.recv_u64s(task, Lane::GatherCounts)?;
        let data = io.recv(task, Lane::GatherData)?;

        let shipment = Shipment::assemble(io, llen, pass.layout.fndims, slots, starts, counts)?;
        if data.len() != pass.targets.len() * llen * pass.element_size {
            return Err(io.fail(TransportError::Malformed("gathered data length")));
        }
        tracing::trace!(task, llen, regions = shipment.extents.len(), "received regions");
        Ok(Some((shipment, data)))
    }

    /// Writes every region of one task, variable after variable.
    fn replay(
        backend: &mut dyn Backend,
        pass: &Pass,
        shipment: &Shipment,
        data: &[u8],
        status: &mut Status,
    ) {
        let es = pass.element_size;
        let mut loffset = 0;
        for extent in shipment.extents.iter().filter(|extent| !extent.is_empty()) {
            let len = extent.len();
            for (nv, target) in pass.targets.iter().enumerate() {
                let mut framed = extent.clone();
                pass.layout.apply_frame(&mut framed, target.frame);
                let start = es * (nv * shipment.llen + loffset);
                let bytes = &data[start..start + len * es];
                if let Err(err) = backend.put_region(target.var, &framed, bytes) {
                    tracing::warn!(var = target.var, %err, "replayed region write failed");
                    *status = status.first_error(err.status());
                }
            }
            loffset += len;
        }
    }

    fn send_read(io: &ProcessGroup, pass: &Pass, out: &mut [u8]) -> Result<Status, TransportError> {
        io.send_u64(LEADER, Lane::GatherLength, pass.llen as u64)?;
        if pass.llen == 0 {
            return Ok(Status::OK);
        }

        let frame = pass.targets.first().map_or(0, |target| target.frame);
        let extents: Vec<Extent> = pass
            .slots
            .iter()
            .map(|slot| pass.layout.translate(slot, frame))
            .collect();
        io.send_u64(LEADER, Lane::GatherRegionCount, extents.len() as u64)?;
        io.send_u64s(LEADER, Lane::GatherCounts, &flatten(&extents, |e| e.count.as_slice()))?;
        io.send_u64s(LEADER, Lane::GatherStarts, &flatten(&extents, |e| e.start.as_slice()))?;

        let data = io.recv(LEADER, Lane::GatherData)?;
        let len = pass.llen * pass.element_size;
        if data.len() != len {
            return Err(io.fail(TransportError::Malformed("gathered read length")));
        }
        out[..len].copy_from_slice(&data);
        Ok(Status::OK)
    }

    /// Reads framed extents back to back into `out`.
    fn read_extents(
        backend: &mut dyn Backend,
        pass: &Pass,
        extents: &[Extent],
        out: &mut [u8],
    ) -> Status {
        let Some(target) = pass.targets.first() else {
            return Status::OK;
        };
        let mut offset = 0;
        for extent in extents.iter().filter(|extent| !extent.is_empty()) {
            let len = extent.len() * pass.element_size;
            let slice = &mut out[offset..offset + len];
            if let Err(err) = backend.get_region(target.var, extent, slice) {
                tracing::warn!(var = target.var, %err, "serial region read failed");
                return err.status();
            }
            offset += len;
        }
        Status::OK
    }
}

impl Strategy for SerialGather {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Serial
    }

    #[tracing::instrument(skip_all, fields(llen = pass.llen))]
    fn write(
        &self,
        io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        data: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        if !io.is_leader() {
            return SerialGather::send_write(io, pass, data);
        }

        let mut status = Status::OK;
        let own = Shipment {
            llen: pass.llen,
            extents: pass.placed(),
        };
        SerialGather::replay(backend, pass, &own, data, &mut status);

        for task in 1..io.len() {
            if let Some((shipment, data)) = SerialGather::receive_write(io, task, pass)? {
                SerialGather::replay(backend, pass, &shipment, &data, &mut status);
            }
        }
        Ok(WriteOutcome::completed(status))
    }

    #[tracing::instrument(skip_all, fields(llen = pass.llen))]
    fn read(
        &self,
        io: &ProcessGroup,
        backend: &mut dyn Backend,
        pass: &Pass,
        out: &mut [u8],
    ) -> Result<Status, TransportError> {
        if !io.is_leader() {
            return SerialGather::send_read(io, pass, out);
        }

        let frame = pass.targets.first().map_or(0, |target| target.frame);
        let own: Vec<Extent> = pass
            .slots
            .iter()
            .map(|slot| pass.layout.translate(slot, frame))
            .collect();
        let mut status = SerialGather::read_extents(backend, pass, &own, out);

        for task in 1..io.len() {
            let llen = io.recv_u64(task, Lane::GatherLength)? as usize;
            if llen == 0 {
                continue;
            }
            let slots = io.recv_u64(task, Lane::GatherRegionCount)?;
            let counts = io.recv_u64s(task, Lane::GatherCounts)?;
            let starts = io.recv_u64s(task, Lane::GatherStarts)?;
            let shipment = Shipment::assemble(io, llen, pass.layout.fndims, slots, starts, counts)?;

            // The sender waits for its data even if the read failed.
            let mut buffer = vec![0; llen * pass.element_size];
            let task_status =
                SerialGather::read_extents(backend, pass, &shipment.extents, &mut buffer);
            status = status.first_error(task_status);
            io.send(task, Lane::GatherData, buffer)?;
        }
        Ok(status)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        backend::Opener,
        descriptor::{Block, DecompositionMap, DistributionDescriptor, ElementType},
        memory::{Call, DriverMode, MemoryNamespace, VarDef},
        region::Layout,
        test::*,
        transfer::Target,
        transport::group_id,
    };

    fn ints(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
        values.into_iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    fn io_group(transport: Arc<dyn crate::transport::Transport>) -> ProcessGroup {
        let members = (0..transport.size()).collect();
        ProcessGroup::new(group_id::IO, members, transport)
    }

    #[test]
    fn leader_writes_every_task_in_rank_order() {
        init_logger();

        let namespace = MemoryNamespace::new();
        let dataset = namespace.create("serial", DriverMode::Serial);
        let var = dataset.define_var(VarDef::new(ElementType::Int, [40]));
        let map = DecompositionMap::new(
            ElementType::Int,
            [40],
            (0..4).map(|task| vec![Block::new([task * 10], [10])]).collect(),
        );
        let descriptor = DistributionDescriptor::new(0, &map, 4).unwrap();

        let statuses = run_ranks(4, |transport| {
            let io = io_group(transport);
            let task = io.index().unwrap();
            let mut backend = namespace.open("serial", true, task).unwrap();
            let targets = [Target { var, frame: 0 }];
            let pass = Pass {
                layout: Layout {
                    ndims: 1,
                    fndims: 1,
                    record: false,
                },
                targets: &targets,
                slots: descriptor.regions(task),
                llen: descriptor.local_len(task),
                element_size: 4,
            };
            let data = ints((0..10).map(|i| task as i32 * 100 + i));
            SerialGather
                .write(&io, backend.as_mut(), &pass, &data)
                .unwrap()
                .status
        });

        assert!(statuses.iter().all(|status| status.is_ok()));
        let expected = ints((0..4).flat_map(|task| (0..10).map(move |i| task * 100 + i)));
        assert_eq!(dataset.read_all(var).unwrap(), expected);

        // Only the leader touched the backend, one call per region.
        let calls = dataset.take_calls();
        assert_eq!(calls.len(), 4);
        assert!(calls
            .iter()
            .all(|call| matches!(call, Call::Put { io_index: 0, .. })));
    }

    #[test]
    fn empty_senders_keep_the_exchange_in_step() {
        let namespace = MemoryNamespace::new();
        let dataset = namespace.create("sparse", DriverMode::Serial);
        let a = dataset.define_var(VarDef::new(ElementType::Short, [6]).record());
        let b = dataset.define_var(VarDef::new(ElementType::Short, [6]).record());
        // Task 1 holds nothing, task 2 holds two regions.
        let map = DecompositionMap::new(
            ElementType::Short,
            [6],
            vec![
                vec![Block::new([0], [2])],
                vec![],
                vec![Block::new([2], [1]), Block::new([4], [2])],
            ],
        );
        let descriptor = DistributionDescriptor::new(0, &map, 3).unwrap();
        let shorts =
            |values: &[i16]| -> Vec<u8> { values.iter().flat_map(|v| v.to_ne_bytes()).collect() };

        run_ranks(3, |transport| {
            let io = io_group(transport);
            let task = io.index().unwrap();
            let mut backend = namespace.open("sparse", true, task).unwrap();
            let targets = [Target { var: a, frame: 1 }, Target { var: b, frame: 0 }];
            let pass = Pass {
                layout: Layout {
                    ndims: 1,
                    fndims: 2,
                    record: true,
                },
                targets: &targets,
                slots: descriptor.regions(task),
                llen: descriptor.local_len(task),
                element_size: 2,
            };
            let data = match task {
                0 => shorts(&[1, 2, 11, 12]),
                1 => Vec::new(),
                _ => shorts(&[3, 5, 6, 13, 15, 16]),
            };
            let outcome = SerialGather.write(&io, backend.as_mut(), &pass, &data).unwrap();
            assert!(outcome.status.is_ok());

            // Read variable b back through the same exchange.
            let targets = [Target { var: b, frame: 0 }];
            let pass = Pass {
                targets: &targets,
                ..pass
            };
            let mut out = vec![0; pass.llen * 2];
            assert!(SerialGather.read(&io, backend.as_mut(), &pass, &mut out).unwrap().is_ok());
            let expected = match task {
                0 => shorts(&[11, 12]),
                1 => Vec::new(),
                _ => shorts(&[13, 15, 16]),
            };
            assert_eq!(out, expected);
        });

        assert_eq!(dataset.records(a), Some(2));
        assert_eq!(
            dataset.read_all(a).unwrap(),
            shorts(&[0, 0, 0, 0, 0, 0, 1, 2, 3, 0, 5, 6])
        );
        assert_eq!(dataset.read_all(b).unwrap(), shorts(&[11, 12, 13, 0, 15, 16]));
    }

    #[test]
    fn replay_failures_do_not_stop_the_drain() {
        let namespace = MemoryNamespace::new();
        let dataset = namespace.create("narrow", DriverMode::Serial);
        let var = dataset.define_var(VarDef::new(ElementType::Byte, [3]));
        let map = DecompositionMap::new(
            ElementType::Byte,
            [4],
            vec![vec![Block::new([3], [1])], vec![Block::new([0], [3])]],
        );
        let descriptor = DistributionDescriptor::new(0, &map, 2).unwrap();

        let statuses = run_ranks(2, |transport| {
            let io = io_group(transport);
            let task = io.index().unwrap();
            let mut backend = namespace.open("narrow", true, task).unwrap();
            let targets = [Target { var, frame: 0 }];
            let pass = Pass {
                layout: Layout {
                    ndims: 1,
                    fndims: 1,
                    record: false,
                },
                targets: &targets,
                slots: descriptor.regions(task),
                llen: descriptor.local_len(task),
                element_size: 1,
            };
            let data: Vec<u8> = if task == 0 { vec![9] } else { vec![1, 2, 3] };
            SerialGather
                .write(&io, backend.as_mut(), &pass, &data)
                .unwrap()
                .status
        });

        // The leader's own region is out of bounds; task 1 is still written.
        assert_eq!(statuses[0], Status::EDGE);
        assert!(statuses[1].is_ok());
        assert_eq!(dataset.read_all(var).unwrap(), vec![1, 2, 3]);
    }
}
