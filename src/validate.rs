//! Serial reference model.
//!
//! Executes declared primitives one at a time over host mirrors of every
//! rank's buffers. The compiled plan must land bit-identical results; the
//! bench harness and the equivalence tests compare against this.
//!
//! Buffer addresses inside the primitives are ignored here: `sends[r]` and
//! `recvs[r]` stand in for rank `r`'s send and receive arrays, and only
//! offsets and counts are used.

use crate::primitive::{Broadcast, Epoch, Reduce};
use crate::reduce::reduce_slice;
use crate::types::Scalar;

/// Mirror selector: a primitive whose buffer field equals `SEND_BUF` reads
/// the rank's send mirror.
pub const SEND_BUF: u64 = 0;
/// Mirror selector: a primitive whose buffer field equals `RECV_BUF` reads
/// the rank's receive mirror (used when an epoch consumes an earlier
/// epoch's output, e.g. the broadcast half of an allreduce).
pub const RECV_BUF: u64 = 1;

fn as_bytes<T: Scalar>(s: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(s.as_ptr() as *const u8, std::mem::size_of_val(s)) }
}

fn as_bytes_mut<T: Scalar>(s: &mut [T]) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(s.as_mut_ptr() as *mut u8, std::mem::size_of_val(s)) }
}

fn source_slice<T: Scalar>(
    sends: &[Vec<T>],
    recvs: &[Vec<T>],
    selector: u64,
    rank: u32,
    offset: usize,
    count: usize,
) -> Vec<T> {
    let arr = if selector == RECV_BUF {
        &recvs[rank as usize]
    } else {
        &sends[rank as usize]
    };
    arr[offset..offset + count].to_vec()
}

pub fn apply_broadcast<T: Scalar>(sends: &[Vec<T>], recvs: &mut [Vec<T>], b: &Broadcast) {
    let src = source_slice(sends, recvs, b.sendbuf, b.sendid, b.sendoffset, b.count);
    for &r in &b.recvids {
        recvs[r as usize][b.recvoffset..b.recvoffset + b.count].copy_from_slice(&src);
    }
}

pub fn apply_reduce<T: Scalar>(sends: &[Vec<T>], recvs: &mut [Vec<T>], r: &Reduce) {
    let first = source_slice(sends, recvs, r.sendbuf, r.sendids[0], r.sendoffset, r.count);
    recvs[r.recvid as usize][r.recvoffset..r.recvoffset + r.count].copy_from_slice(&first);
    for &s in &r.sendids[1..] {
        let src = source_slice(sends, recvs, r.sendbuf, s, r.sendoffset, r.count);
        reduce_slice(
            as_bytes_mut(&mut recvs[r.recvid as usize][r.recvoffset..r.recvoffset + r.count]),
            as_bytes(&src),
            r.count,
            T::DTYPE,
            r.op,
        )
        .expect("reference reduce");
    }
}

/// Execute every epoch in declaration order.
pub fn run_reference<T: Scalar>(sends: &[Vec<T>], recvs: &mut [Vec<T>], epochs: &[Epoch]) {
    for epoch in epochs {
        for b in &epoch.bcasts {
            apply_broadcast(sends, recvs, b);
        }
        for r in &epoch.reduces {
            apply_reduce(sends, recvs, r);
        }
    }
}
