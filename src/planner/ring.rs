//! Inter-group rings.
//!
//! With three or more participating top-level groups, a cycle over group
//! leaders amortizes bandwidth: every leader forwards chunks to its
//! successor instead of the sender fanning whole buffers to every group.
//! Broadcasts run a pipelined scatter ring then an all-gather ring, each
//! `n - 1` steps. Reductions run a reduce-scatter ring (`n - 1` steps, op
//! applied at every hop) and one chunk-gather step into the receiver.
//!
//! Leaders are elected with the same ordinal-preserving rule as tree
//! bridges, so the sender (resp. receiver) is always its own group's
//! leader and the chunk trees of a striped primitive stay on parallel
//! links.

use indexmap::IndexSet;

use crate::error::Result;
use crate::planner::coll::{Coll, ReduceWork};
use crate::planner::tree::reduce_tree;
use crate::planner::{chunk_count, chunk_offset, PlanCtx};
use crate::primitive::{Broadcast, Reduce};
use crate::types::Rank;

/// Grow `slots` to `len` colls on the top-level library.
fn ensure_slots(ctx: &PlanCtx<'_>, slots: &mut Vec<Coll>, len: usize) {
    while slots.len() < len {
        slots.push(Coll::new(ctx.hier.lib(0)));
    }
}

/// Ring the inter-group half of each broadcast. Primitives spanning fewer
/// than `ring_min_groups` groups fall back to the tree (`residual`), along
/// with every intra-group fan-out the ring leaves behind.
pub(crate) fn bcast_ring(
    ctx: &mut PlanCtx<'_>,
    list: Vec<Broadcast>,
    colls: &mut Vec<Coll>,
    residual: &mut Vec<Broadcast>,
) -> Result<()> {
    let mut slots: Vec<Coll> = Vec::new();

    for bcast in list {
        if bcast.count == 0 {
            continue;
        }
        let mut groups: IndexSet<usize> = IndexSet::new();
        groups.insert(ctx.hier.group_of(bcast.sendid, 1));
        for &r in &bcast.recvids {
            groups.insert(ctx.hier.group_of(r, 1));
        }
        let n = groups.len();
        if n < ctx.config.ring_min_groups {
            residual.push(bcast);
            continue;
        }

        let leaders: Vec<Rank> = groups
            .iter()
            .map(|&g| ctx.hier.bridge(g, 1, bcast.sendid))
            .collect();
        debug_assert_eq!(leaders[0], bcast.sendid);

        // Each leader's working view of the payload: the sender reads its
        // sendbuf, receiving leaders land in their recvbuf, pure bridges
        // get a staging buffer.
        let mut views: Vec<(u64, usize)> = Vec::with_capacity(n);
        views.push((bcast.sendbuf, bcast.sendoffset));
        for &leader in leaders.iter().skip(1) {
            if bcast.recvids.contains(&leader) {
                views.push((bcast.recvbuf, bcast.recvoffset));
            } else {
                views.push((ctx.alloc_staging(leader, bcast.count)?, 0));
            }
        }

        ensure_slots(ctx, &mut slots, 2 * (n - 1));

        // Scatter ring: chunk j leaves the sender at step n-1-j and walks
        // to leader j, one hop per step.
        for k in 0..n - 1 {
            for j in 1..n {
                let Some(i) = (k + 1 + j).checked_sub(n) else {
                    continue;
                };
                if i >= j {
                    continue;
                }
                let len = chunk_count(bcast.count, n, j);
                let off = chunk_offset(bcast.count, n, j);
                slots[k].add_edge(
                    views[i].0,
                    views[i].1 + off,
                    views[i + 1].0,
                    views[i + 1].1 + off,
                    len,
                    leaders[i],
                    leaders[i + 1],
                );
            }
        }

        // All-gather ring: at step k, leader i forwards chunk (i-k) mod n
        // to its successor. Deliveries the scatter already made are
        // skipped; the sender's own copy is a local transfer.
        let base = n - 1;
        if bcast.recvids.contains(&bcast.sendid) {
            slots[base].add_edge(
                bcast.sendbuf,
                bcast.sendoffset,
                bcast.recvbuf,
                bcast.recvoffset,
                bcast.count,
                bcast.sendid,
                bcast.sendid,
            );
        }
        for k in 0..n - 1 {
            for i in 0..n {
                let next = (i + 1) % n;
                if next == 0 {
                    continue;
                }
                let c = (i + n - k) % n;
                if c >= next {
                    continue;
                }
                let len = chunk_count(bcast.count, n, c);
                let off = chunk_offset(bcast.count, n, c);
                slots[base + k].add_edge(
                    views[i].0,
                    views[i].1 + off,
                    views[next].0,
                    views[next].1 + off,
                    len,
                    leaders[i],
                    leaders[next],
                );
            }
        }

        // Intra-group fan-out from each leader goes to the tree.
        for (idx, &g) in groups.iter().enumerate() {
            let members: Vec<Rank> = bcast
                .recvids
                .iter()
                .copied()
                .filter(|&r| ctx.hier.group_of(r, 1) == g && r != leaders[idx])
                .collect();
            if members.is_empty() {
                continue;
            }
            let (srcbuf, srcoffset, src) = if idx == 0 {
                (bcast.sendbuf, bcast.sendoffset, bcast.sendid)
            } else {
                (views[idx].0, views[idx].1, leaders[idx])
            };
            residual.push(Broadcast {
                sendbuf: srcbuf,
                sendoffset: srcoffset,
                recvbuf: bcast.recvbuf,
                recvoffset: bcast.recvoffset,
                count: bcast.count,
                sendid: src,
                recvids: members,
            });
        }
    }

    colls.extend(slots.into_iter().filter(|c| !c.is_empty()));
    Ok(())
}

/// Ring the inter-group half of each reduction.
pub(crate) fn reduce_ring(
    ctx: &mut PlanCtx<'_>,
    list: Vec<Reduce>,
    colls: &mut Vec<Coll>,
    residual: &mut Vec<Reduce>,
) -> Result<()> {
    let mut pre: Vec<Reduce> = Vec::new();
    let mut slots: Vec<Coll> = Vec::new();

    for reduce in list {
        if reduce.count == 0 {
            continue;
        }
        let recvgroup = ctx.hier.group_of(reduce.recvid, 1);
        let mut groups: IndexSet<usize> = IndexSet::new();
        for &s in &reduce.sendids {
            groups.insert(ctx.hier.group_of(s, 1));
        }
        // The receiver's group closes the cycle so the final hop already
        // sits next to the destination.
        let recv_in_ring = groups.shift_remove(&recvgroup);
        let mut members: Vec<usize> = groups.into_iter().collect();
        if recv_in_ring {
            members.push(recvgroup);
        }
        let n = members.len();
        if n < ctx.config.ring_min_groups {
            residual.push(reduce);
            continue;
        }

        let leaders: Vec<Rank> = members
            .iter()
            .map(|&g| ctx.hier.bridge(g, 1, reduce.recvid))
            .collect();
        if recv_in_ring {
            debug_assert_eq!(leaders[n - 1], reduce.recvid);
        }

        // Accumulation buffers: the receiver accumulates in place, every
        // other leader in staging.
        let mut accum: Vec<(u64, usize)> = Vec::with_capacity(n);
        for (i, &leader) in leaders.iter().enumerate() {
            if recv_in_ring && i == n - 1 {
                accum.push((reduce.recvbuf, reduce.recvoffset));
            } else {
                accum.push((ctx.alloc_staging(leader, reduce.count)?, 0));
            }
        }

        // Group partials converge on their leader before the ring turns.
        for (i, &g) in members.iter().enumerate() {
            let senders: Vec<Rank> = reduce
                .sendids
                .iter()
                .copied()
                .filter(|&s| ctx.hier.group_of(s, 1) == g)
                .collect();
            pre.push(Reduce {
                sendbuf: reduce.sendbuf,
                sendoffset: reduce.sendoffset,
                recvbuf: accum[i].0,
                recvoffset: accum[i].1,
                count: reduce.count,
                sendids: senders,
                recvid: leaders[i],
                op: reduce.op,
            });
        }

        ensure_slots(ctx, &mut slots, n);

        // Reduce-scatter ring: at step k, leader i passes chunk (i-k) mod n
        // onward and the successor folds it in. After n-1 steps leader i
        // holds the finished chunk (i+1) mod n.
        for k in 0..n - 1 {
            for i in 0..n {
                let next = (i + 1) % n;
                let c = (i + n - k) % n;
                let len = chunk_count(reduce.count, n, c);
                if len == 0 {
                    continue;
                }
                let off = chunk_offset(reduce.count, n, c);
                let arrival = ctx.alloc_staging(leaders[next], len)?;
                slots[k].add_edge(
                    accum[i].0,
                    accum[i].1 + off,
                    arrival,
                    0,
                    len,
                    leaders[i],
                    leaders[next],
                );
                slots[k].add_compute(ReduceWork {
                    srcs: vec![(arrival, 0)],
                    dstbuf: accum[next].0,
                    dstoffset: accum[next].1 + off,
                    count: len,
                    op: reduce.op,
                    owner: leaders[next],
                });
            }
        }

        // Chunk gather: every leader lands its finished chunk in the
        // receiver's range. The receiver's own chunk is already in place.
        for i in 0..n {
            if recv_in_ring && i == n - 1 {
                continue;
            }
            let c = (i + 1) % n;
            let len = chunk_count(reduce.count, n, c);
            let off = chunk_offset(reduce.count, n, c);
            slots[n - 1].add_edge(
                accum[i].0,
                accum[i].1 + off,
                reduce.recvbuf,
                reduce.recvoffset + off,
                len,
                leaders[i],
                reduce.recvid,
            );
        }
    }

    reduce_tree(ctx, pre, 1, colls)?;
    colls.extend(slots.into_iter().filter(|c| !c.is_empty()));
    Ok(())
}
