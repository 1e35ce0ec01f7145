//! Batch partitioning: each primitive is cut into `numbatch` contiguous
//! stripes so independent batches can overlap in the pipeline.

use crate::primitive::{Broadcast, Reduce};

/// Stripe length and offset shift for batch `b` of a `count`-element
/// primitive. The last stripe absorbs the remainder; a primitive shorter
/// than the batch count collapses into batch 0.
fn stripe_of(count: usize, numbatch: usize, b: usize) -> Option<(usize, usize)> {
    if count == 0 {
        return None;
    }
    if count < numbatch {
        return (b == 0).then_some((0, count));
    }
    let s = count / numbatch;
    let len = if b == numbatch - 1 {
        s + count % numbatch
    } else {
        s
    };
    Some((b * s, len))
}

pub(crate) fn partition_bcasts(list: &[Broadcast], numbatch: usize) -> Vec<Vec<Broadcast>> {
    let mut batches = vec![Vec::new(); numbatch];
    for bcast in list {
        for (b, batch) in batches.iter_mut().enumerate() {
            if let Some((shift, len)) = stripe_of(bcast.count, numbatch, b) {
                batch.push(Broadcast {
                    sendoffset: bcast.sendoffset + shift,
                    recvoffset: bcast.recvoffset + shift,
                    count: len,
                    recvids: bcast.recvids.clone(),
                    ..*bcast
                });
            }
        }
    }
    batches
}

pub(crate) fn partition_reduces(list: &[Reduce], numbatch: usize) -> Vec<Vec<Reduce>> {
    let mut batches = vec![Vec::new(); numbatch];
    for reduce in list {
        for (b, batch) in batches.iter_mut().enumerate() {
            if let Some((shift, len)) = stripe_of(reduce.count, numbatch, b) {
                batch.push(Reduce {
                    sendoffset: reduce.sendoffset + shift,
                    recvoffset: reduce.recvoffset + shift,
                    count: len,
                    sendids: reduce.sendids.clone(),
                    ..*reduce
                });
            }
        }
    }
    batches
}
