//! Recursive tree expansion across the level hierarchy.
//!
//! A broadcast is peeled one level at a time: receivers sharing the
//! sender's group are deferred to the next level, and every foreign group
//! elects a bridge rank that takes one inter-group edge and fans out
//! deeper. The reduce builder is the time-reversed dual: group partials
//! converge to bridges, bridges converge to the receiver, and staged
//! arrivals are folded with the primitive's associative op.

use indexmap::IndexMap;

use crate::config::IntraTopology;
use crate::error::Result;
use crate::planner::coll::{Coll, ReduceWork};
use crate::planner::PlanCtx;
use crate::primitive::{Broadcast, Reduce};
use crate::types::Rank;

/// Expand `list` from `level` down to the leaves, appending one coll per
/// visited level. Level `l` edges run on the library of level `l - 1`.
pub(crate) fn bcast_tree(
    ctx: &mut PlanCtx<'_>,
    list: Vec<Broadcast>,
    level: usize,
    colls: &mut Vec<Coll>,
) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let numlevel = ctx.hier.numlevel();

    if level == numlevel {
        return match ctx.config.intra_topology {
            IntraTopology::Tree => bcast_leaf_star(ctx, &list, colls),
            IntraTopology::Ring => bcast_leaf_chain(ctx, &list, colls),
        };
    }

    let mut coll = Coll::new(ctx.hier.lib(level - 1));
    let mut next: Vec<Broadcast> = Vec::new();

    // Local edges: receivers in the sender's own group stay a broadcast,
    // confined to that group, expanded at the next level.
    for bcast in &list {
        let sendgroup = ctx.hier.group_of(bcast.sendid, level);
        let local: Vec<Rank> = bcast
            .recvids
            .iter()
            .copied()
            .filter(|&r| ctx.hier.group_of(r, level) == sendgroup)
            .collect();
        if !local.is_empty() {
            next.push(Broadcast {
                recvids: local,
                ..bcast.clone()
            });
        }
    }

    // Global edges: one bridge per foreign group holding receivers.
    for recvgroup in 0..ctx.hier.num_groups(level) {
        for bcast in &list {
            if ctx.hier.group_of(bcast.sendid, level) == recvgroup {
                continue;
            }
            let mut remaining: Vec<Rank> = bcast
                .recvids
                .iter()
                .copied()
                .filter(|&r| ctx.hier.group_of(r, level) == recvgroup)
                .collect();
            if remaining.is_empty() {
                continue;
            }
            let bridge = ctx.hier.bridge(recvgroup, level, bcast.sendid);
            let (landbuf, landoffset) = if let Some(pos) = remaining.iter().position(|&r| r == bridge)
            {
                // The bridge is itself a receiver: land in its recvbuf.
                remaining.remove(pos);
                (bcast.recvbuf, bcast.recvoffset)
            } else {
                (ctx.alloc_staging(bridge, bcast.count)?, 0)
            };
            coll.add_edge(
                bcast.sendbuf,
                bcast.sendoffset,
                landbuf,
                landoffset,
                bcast.count,
                bcast.sendid,
                bridge,
            );
            if !remaining.is_empty() {
                next.push(Broadcast {
                    sendbuf: landbuf,
                    sendoffset: landoffset,
                    recvbuf: bcast.recvbuf,
                    recvoffset: bcast.recvoffset,
                    count: bcast.count,
                    sendid: bridge,
                    recvids: remaining,
                });
            }
        }
    }

    if !coll.is_empty() {
        colls.push(coll);
    }
    bcast_tree(ctx, next, level + 1, colls)
}

/// Leaf expansion, star shape: one direct edge per receiver.
fn bcast_leaf_star(
    ctx: &mut PlanCtx<'_>,
    list: &[Broadcast],
    colls: &mut Vec<Coll>,
) -> Result<()> {
    let mut coll = Coll::new(ctx.hier.lib(ctx.hier.numlevel() - 1));
    for bcast in list {
        for &recvid in &bcast.recvids {
            coll.add_edge(
                bcast.sendbuf,
                bcast.sendoffset,
                bcast.recvbuf,
                bcast.recvoffset,
                bcast.count,
                bcast.sendid,
                recvid,
            );
        }
    }
    if !coll.is_empty() {
        colls.push(coll);
    }
    Ok(())
}

/// Leaf expansion, chain shape: receivers forward hop by hop in rank
/// order. Each hop is its own coll so hops stay strictly ordered.
fn bcast_leaf_chain(
    ctx: &mut PlanCtx<'_>,
    list: &[Broadcast],
    colls: &mut Vec<Coll>,
) -> Result<()> {
    let lib = ctx.hier.lib(ctx.hier.numlevel() - 1);
    let depth = list.iter().map(|b| b.recvids.len()).max().unwrap_or(0);
    for hop in 0..depth {
        let mut coll = Coll::new(lib);
        for bcast in list {
            if hop >= bcast.recvids.len() {
                continue;
            }
            let (srcbuf, srcoffset, src) = if hop == 0 {
                (bcast.sendbuf, bcast.sendoffset, bcast.sendid)
            } else {
                (bcast.recvbuf, bcast.recvoffset, bcast.recvids[hop - 1])
            };
            coll.add_edge(
                srcbuf,
                srcoffset,
                bcast.recvbuf,
                bcast.recvoffset,
                bcast.count,
                src,
                bcast.recvids[hop],
            );
        }
        if !coll.is_empty() {
            colls.push(coll);
        }
    }
    Ok(())
}

/// Converge `list` from `level` down to the leaves. Deeper levels are
/// emitted first so every bridge partial exists before the edge that
/// forwards it.
pub(crate) fn reduce_tree(
    ctx: &mut PlanCtx<'_>,
    list: Vec<Reduce>,
    level: usize,
    colls: &mut Vec<Coll>,
) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let numlevel = ctx.hier.numlevel();

    if level == numlevel {
        return reduce_leaf(ctx, &list, colls);
    }

    let mut coll = Coll::new(ctx.hier.lib(level - 1));
    let mut sublist: Vec<Reduce> = Vec::new();

    for reduce in &list {
        let recvgroup = ctx.hier.group_of(reduce.recvid, level);
        let mut by_group: IndexMap<usize, Vec<Rank>> = IndexMap::new();
        for &s in &reduce.sendids {
            by_group
                .entry(ctx.hier.group_of(s, level))
                .or_default()
                .push(s);
        }

        // The receiver's own group reduces straight into the destination
        // range at the next level; that establishes the fold target.
        let mut dst_ready = false;
        if let Some(local) = by_group.shift_remove(&recvgroup) {
            sublist.push(Reduce {
                sendids: local,
                ..reduce.clone()
            });
            dst_ready = true;
        }

        let mut srcs: Vec<(u64, usize)> = Vec::new();
        for (group, senders) in by_group {
            let bridge = ctx.hier.bridge(group, level, reduce.recvid);
            let (partbuf, partoffset, partholder) = if senders.len() == 1 {
                // A lone contributor is its own partial; skip the staging
                // hop and send from it directly.
                (reduce.sendbuf, reduce.sendoffset, senders[0])
            } else {
                let part = ctx.alloc_staging(bridge, reduce.count)?;
                sublist.push(Reduce {
                    sendbuf: reduce.sendbuf,
                    sendoffset: reduce.sendoffset,
                    recvbuf: part,
                    recvoffset: 0,
                    count: reduce.count,
                    sendids: senders,
                    recvid: bridge,
                    op: reduce.op,
                });
                (part, 0, bridge)
            };
            if !dst_ready {
                coll.add_edge(
                    partbuf,
                    partoffset,
                    reduce.recvbuf,
                    reduce.recvoffset,
                    reduce.count,
                    partholder,
                    reduce.recvid,
                );
                dst_ready = true;
            } else {
                let arrival = ctx.alloc_staging(reduce.recvid, reduce.count)?;
                coll.add_edge(
                    partbuf,
                    partoffset,
                    arrival,
                    0,
                    reduce.count,
                    partholder,
                    reduce.recvid,
                );
                srcs.push((arrival, 0));
            }
        }
        if !srcs.is_empty() {
            coll.add_compute(ReduceWork {
                srcs,
                dstbuf: reduce.recvbuf,
                dstoffset: reduce.recvoffset,
                count: reduce.count,
                op: reduce.op,
                owner: reduce.recvid,
            });
        }
    }

    reduce_tree(ctx, sublist, level + 1, colls)?;
    if !coll.is_empty() {
        colls.push(coll);
    }
    Ok(())
}

/// Leaf convergence: every sender is its own group of one.
fn reduce_leaf(ctx: &mut PlanCtx<'_>, list: &[Reduce], colls: &mut Vec<Coll>) -> Result<()> {
    let mut coll = Coll::new(ctx.hier.lib(ctx.hier.numlevel() - 1));
    for reduce in list {
        let mut dst_ready = false;
        if reduce.sendids.contains(&reduce.recvid) {
            // Own contribution; a no-op when the ranges alias.
            coll.add_edge(
                reduce.sendbuf,
                reduce.sendoffset,
                reduce.recvbuf,
                reduce.recvoffset,
                reduce.count,
                reduce.recvid,
                reduce.recvid,
            );
            dst_ready = true;
        }
        let mut srcs: Vec<(u64, usize)> = Vec::new();
        for &s in reduce.sendids.iter().filter(|&&s| s != reduce.recvid) {
            if !dst_ready {
                coll.add_edge(
                    reduce.sendbuf,
                    reduce.sendoffset,
                    reduce.recvbuf,
                    reduce.recvoffset,
                    reduce.count,
                    s,
                    reduce.recvid,
                );
                dst_ready = true;
            } else {
                let arrival = ctx.alloc_staging(reduce.recvid, reduce.count)?;
                coll.add_edge(
                    reduce.sendbuf,
                    reduce.sendoffset,
                    arrival,
                    0,
                    reduce.count,
                    s,
                    reduce.recvid,
                );
                srcs.push((arrival, 0));
            }
        }
        if !srcs.is_empty() {
            coll.add_compute(ReduceWork {
                srcs,
                dstbuf: reduce.recvbuf,
                dstoffset: reduce.recvoffset,
                count: reduce.count,
                op: reduce.op,
                owner: reduce.recvid,
            });
        }
    }
    if !coll.is_empty() {
        colls.push(coll);
    }
    Ok(())
}
