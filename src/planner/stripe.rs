//! Striping across the node boundary.
//!
//! An inter-group primitive is rewritten so its inter-group hop is split
//! into `numstripe` parallel wires, one per member of each node group:
//! many short parallel links beat one long one. The split phase (sender
//! hands chunk `p` to its in-group peer `p`) is expressed as single-sender
//! reduces so the reduce tree routes each hand-off on the right library;
//! the merge phase of a striped reduction is expressed as single-receiver
//! broadcasts lowered through the broadcast tree after the inter-group
//! phase.

use crate::error::Result;
use crate::planner::{chunk_count, chunk_offset, PlanCtx};
use crate::primitive::{Broadcast, Reduce};
use crate::types::{Rank, ReduceOp};

/// Rewrite inter-group broadcasts into per-chunk broadcasts with the
/// sender's node peers as chunk owners. Hand-off ops land in `split_out`.
pub(crate) fn stripe_bcasts(
    ctx: &mut PlanCtx<'_>,
    list: &mut Vec<Broadcast>,
    split_out: &mut Vec<Reduce>,
) -> Result<()> {
    let numstripe = ctx.config.numstripe;
    let Some(nodesize) = ctx.hier.node_size() else {
        return Ok(());
    };
    if numstripe <= 1 {
        return Ok(());
    }

    let mut rewritten: Vec<Broadcast> = Vec::new();
    for bcast in list.drain(..) {
        let inter = bcast
            .recvids
            .iter()
            .any(|&r| !ctx.hier.same_group(r, bcast.sendid, 1));
        if !inter || bcast.count == 0 {
            rewritten.push(bcast);
            continue;
        }

        let sendgroup = ctx.hier.group_of(bcast.sendid, 1);
        for p in 0..numstripe {
            let len = chunk_count(bcast.count, numstripe, p);
            if len == 0 {
                continue;
            }
            let shift = chunk_offset(bcast.count, numstripe, p);
            let peer = (sendgroup * nodesize + p) as Rank;
            if peer == bcast.sendid {
                // The sender keeps its own chunk; no hand-off needed.
                rewritten.push(Broadcast {
                    sendoffset: bcast.sendoffset + shift,
                    recvoffset: bcast.recvoffset + shift,
                    count: len,
                    ..bcast.clone()
                });
            } else {
                let stage = ctx.alloc_staging(peer, len)?;
                split_out.push(Reduce {
                    sendbuf: bcast.sendbuf,
                    sendoffset: bcast.sendoffset + shift,
                    recvbuf: stage,
                    recvoffset: 0,
                    count: len,
                    sendids: vec![bcast.sendid],
                    recvid: peer,
                    op: ReduceOp::Sum,
                });
                rewritten.push(Broadcast {
                    sendbuf: stage,
                    sendoffset: 0,
                    recvbuf: bcast.recvbuf,
                    recvoffset: bcast.recvoffset + shift,
                    count: len,
                    sendid: peer,
                    recvids: bcast.recvids.clone(),
                });
            }
        }
    }
    *list = rewritten;
    Ok(())
}

/// Rewrite inter-group reductions into per-chunk reductions converging on
/// the receiver's node peers. Merge ops land in `merge_out`.
pub(crate) fn stripe_reduces(
    ctx: &mut PlanCtx<'_>,
    list: &mut Vec<Reduce>,
    merge_out: &mut Vec<Broadcast>,
) -> Result<()> {
    let numstripe = ctx.config.numstripe;
    let Some(nodesize) = ctx.hier.node_size() else {
        return Ok(());
    };
    if numstripe <= 1 {
        return Ok(());
    }

    let mut rewritten: Vec<Reduce> = Vec::new();
    for reduce in list.drain(..) {
        let inter = reduce
            .sendids
            .iter()
            .any(|&s| !ctx.hier.same_group(s, reduce.recvid, 1));
        if !inter || reduce.count == 0 {
            rewritten.push(reduce);
            continue;
        }

        let recvgroup = ctx.hier.group_of(reduce.recvid, 1);
        for p in 0..numstripe {
            let len = chunk_count(reduce.count, numstripe, p);
            if len == 0 {
                continue;
            }
            let shift = chunk_offset(reduce.count, numstripe, p);
            let proxy = (recvgroup * nodesize + p) as Rank;
            if proxy == reduce.recvid {
                rewritten.push(Reduce {
                    sendoffset: reduce.sendoffset + shift,
                    recvoffset: reduce.recvoffset + shift,
                    count: len,
                    ..reduce.clone()
                });
            } else {
                let stage = ctx.alloc_staging(proxy, len)?;
                rewritten.push(Reduce {
                    sendbuf: reduce.sendbuf,
                    sendoffset: reduce.sendoffset + shift,
                    recvbuf: stage,
                    recvoffset: 0,
                    count: len,
                    sendids: reduce.sendids.clone(),
                    recvid: proxy,
                    op: reduce.op,
                });
                merge_out.push(Broadcast {
                    sendbuf: stage,
                    sendoffset: 0,
                    recvbuf: reduce.recvbuf,
                    recvoffset: reduce.recvoffset + shift,
                    count: len,
                    sendid: proxy,
                    recvids: vec![reduce.recvid],
                });
            }
        }
    }
    *list = rewritten;
    Ok(())
}
