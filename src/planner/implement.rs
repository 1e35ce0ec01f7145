//! Lowering: per-batch coll lists become per-batch command lists bound to
//! backend handles.
//!
//! Adjacent colls on the same library are fused when no buffer range
//! written by one is touched by the other; fused edges ride one backend
//! communicator and one start/wait pair. Self-transfers onto an identical
//! range are dropped here, before any handle sees them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{CommHandle, DeviceAdapter, Fabric, WireEdge};
use crate::error::Result;
use crate::planner::coll::{ranges_overlap, Coll, ReduceWork};
use crate::types::{DataType, Rank};

/// Local fold work attached to a command; runs between the command's
/// `wait` and the next command's `start` on the same batch.
pub struct Compute {
    items: Vec<ReduceWork>,
    dtype: DataType,
    rank: Rank,
    adapter: Arc<dyn DeviceAdapter>,
}

impl Compute {
    pub fn start(&mut self) -> Result<()> {
        let elem = self.dtype.size_in_bytes();
        for item in self.items.iter().filter(|i| i.owner == self.rank) {
            let dst = item.dstbuf + (item.dstoffset * elem) as u64;
            for &(buf, off) in &item.srcs {
                let src_addr = buf + (off * elem) as u64;
                let staged = unsafe {
                    self.adapter.stage_for_send(src_addr, item.count * elem)?
                };
                unsafe {
                    self.adapter
                        .reduce_inplace(dst, &staged, item.count, self.dtype, item.op)?;
                }
            }
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    /// Folds this rank performs.
    pub fn numcomp(&self) -> usize {
        self.items.iter().filter(|i| i.owner == self.rank).count()
    }
}

/// A lowered, executable unit: one backend communicator plus optional
/// compute.
pub struct Command {
    pub comm: Box<dyn CommHandle>,
    pub compute: Option<Compute>,
}

impl Command {
    pub fn numsend(&self) -> usize {
        self.comm.numsend()
    }

    pub fn numrecv(&self) -> usize {
        self.comm.numrecv()
    }

    pub fn numcomp(&self) -> usize {
        self.compute.as_ref().map_or(0, Compute::numcomp)
    }
}

/// Fuse adjacent same-library colls whose buffer ranges are independent.
pub(crate) fn fuse_colls(colls: Vec<Coll>) -> Vec<Coll> {
    let mut out: Vec<Coll> = Vec::with_capacity(colls.len());
    for coll in colls {
        if let Some(cur) = out.last_mut() {
            if cur.lib == coll.lib && independent(cur, &coll) {
                cur.edges.extend(coll.edges);
                cur.computes.extend(coll.computes);
                continue;
            }
        }
        out.push(coll);
    }
    out
}

fn independent(a: &Coll, b: &Coll) -> bool {
    let a_writes = a.write_ranges();
    let a_reads = a.read_ranges();
    let b_writes = b.write_ranges();
    let b_reads = b.read_ranges();
    !ranges_overlap(&a_writes, &b_reads)
        && !ranges_overlap(&a_writes, &b_writes)
        && !ranges_overlap(&a_reads, &b_writes)
}

/// Lower per-batch coll lists into per-batch command lists.
pub(crate) fn implement(
    coll_batch: Vec<Vec<Coll>>,
    fabric: &Arc<dyn Fabric>,
    adapter: &Arc<dyn DeviceAdapter>,
    dtype: DataType,
) -> Result<Vec<Vec<Command>>> {
    let elem = dtype.size_in_bytes();
    let rank = fabric.rank();
    let mut command_batch = Vec::with_capacity(coll_batch.len());

    for (batch, colls) in coll_batch.into_iter().enumerate() {
        let mut colls: Vec<Coll> = colls
            .into_iter()
            .map(|mut c| {
                c.edges.retain(|e| !e.is_noop());
                c
            })
            .collect();
        colls.retain(|c| !c.is_empty());
        let colls = fuse_colls(colls);

        let mut seq: HashMap<(Rank, Rank), u32> = HashMap::new();
        let mut commands = Vec::with_capacity(colls.len());
        for coll in colls {
            let mut comm = fabric.open(coll.lib)?;
            for e in &coll.edges {
                let counter = seq.entry((e.sendid, e.recvid)).or_insert(0);
                let edge_seq = *counter;
                *counter += 1;
                comm.add(WireEdge {
                    src: e.sendid,
                    dst: e.recvid,
                    send_addr: e.sendbuf + (e.sendoffset * elem) as u64,
                    recv_addr: e.recvbuf + (e.recvoffset * elem) as u64,
                    bytes: e.count * elem,
                    batch: batch as u32,
                    seq: edge_seq,
                })?;
            }
            let compute = (!coll.computes.is_empty()).then(|| Compute {
                items: coll.computes,
                dtype,
                rank,
                adapter: Arc::clone(adapter),
            });
            commands.push(Command { comm, compute });
        }
        command_batch.push(commands);
    }
    Ok(command_batch)
}
