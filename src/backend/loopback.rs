//! In-process reference fabric.
//!
//! Every rank lives in the same process (one thread per rank) and
//! exchanges payloads through per-destination mailboxes keyed by
//! `(batch, src, seq)`. Matching on keys rather than per-link FIFO order
//! lets interleaved pipeline batches run out of lockstep without
//! misdelivering, the same role tags play on a real transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Barrier, Condvar, Mutex};

use bytes::Bytes;

use crate::backend::{CommHandle, CpuAdapter, DeviceAdapter, Fabric, WireEdge};
use crate::error::{HicollError, Result};
use crate::types::{Library, Rank};

type EdgeKey = (u32, Rank, u32);

#[derive(Default)]
struct Mailbox {
    slots: Mutex<HashMap<EdgeKey, VecDeque<Bytes>>>,
    cv: Condvar,
}

impl Mailbox {
    fn post(&self, key: EdgeKey, payload: Bytes) -> Result<()> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| HicollError::LockPoisoned("mailbox"))?;
        slots.entry(key).or_default().push_back(payload);
        self.cv.notify_all();
        Ok(())
    }

    fn take(&self, key: EdgeKey) -> Result<Bytes> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| HicollError::LockPoisoned("mailbox"))?;
        loop {
            if let Some(queue) = slots.get_mut(&key) {
                if let Some(payload) = queue.pop_front() {
                    if queue.is_empty() {
                        slots.remove(&key);
                    }
                    return Ok(payload);
                }
            }
            slots = self
                .cv
                .wait(slots)
                .map_err(|_| HicollError::LockPoisoned("mailbox"))?;
        }
    }

    fn ready(&self, key: EdgeKey) -> Result<bool> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| HicollError::LockPoisoned("mailbox"))?;
        Ok(slots.get(&key).is_some_and(|q| !q.is_empty()))
    }
}

struct GatherState {
    vals: Vec<Option<u64>>,
    deposited: u32,
    draining: u32,
    snapshot: Vec<u64>,
    generation: u64,
}

struct Shared {
    size: u32,
    mailboxes: Vec<Mailbox>,
    barrier: Barrier,
    gather: Mutex<GatherState>,
    gather_cv: Condvar,
}

/// One rank's endpoint of the in-process world.
pub struct LoopbackFabric {
    shared: Arc<Shared>,
    rank: Rank,
    adapter: Arc<dyn DeviceAdapter>,
}

impl LoopbackFabric {
    /// Build a `size`-rank world backed by host memory.
    pub fn world(size: u32) -> Vec<LoopbackFabric> {
        let adapter: Arc<dyn DeviceAdapter> = Arc::new(CpuAdapter::new());
        Self::world_with(vec![adapter; size as usize])
    }

    /// Build a world with one device adapter per rank.
    pub fn world_with(adapters: Vec<Arc<dyn DeviceAdapter>>) -> Vec<LoopbackFabric> {
        let size = adapters.len() as u32;
        let shared = Arc::new(Shared {
            size,
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            barrier: Barrier::new(size as usize),
            gather: Mutex::new(GatherState {
                vals: vec![None; size as usize],
                deposited: 0,
                draining: 0,
                snapshot: Vec::new(),
                generation: 0,
            }),
            gather_cv: Condvar::new(),
        });
        adapters
            .into_iter()
            .enumerate()
            .map(|(rank, adapter)| LoopbackFabric {
                shared: Arc::clone(&shared),
                rank: rank as Rank,
                adapter,
            })
            .collect()
    }

    /// The device adapter this endpoint stages through.
    pub fn adapter(&self) -> Arc<dyn DeviceAdapter> {
        Arc::clone(&self.adapter)
    }
}

impl Fabric for LoopbackFabric {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.shared.size
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn allgather(&self, value: u64) -> Result<Vec<u64>> {
        let shared = &self.shared;
        let mut st = shared
            .gather
            .lock()
            .map_err(|_| HicollError::LockPoisoned("allgather"))?;
        // A previous round may still be handing out its snapshot.
        while st.draining > 0 {
            st = shared
                .gather_cv
                .wait(st)
                .map_err(|_| HicollError::LockPoisoned("allgather"))?;
        }
        st.vals[self.rank as usize] = Some(value);
        st.deposited += 1;
        if st.deposited == shared.size {
            st.snapshot = st.vals.iter().map(|v| v.unwrap_or(0)).collect();
            st.generation += 1;
            st.draining = shared.size;
            st.deposited = 0;
            st.vals.iter_mut().for_each(|v| *v = None);
            shared.gather_cv.notify_all();
        } else {
            let gen_id = st.generation;
            while st.generation == gen_id {
                st = shared
                    .gather_cv
                    .wait(st)
                    .map_err(|_| HicollError::LockPoisoned("allgather"))?;
            }
        }
        let out = st.snapshot.clone();
        st.draining -= 1;
        if st.draining == 0 {
            shared.gather_cv.notify_all();
        }
        Ok(out)
    }

    fn open(&self, lib: Library) -> Result<Box<dyn CommHandle>> {
        Ok(Box::new(LoopbackComm {
            lib,
            rank: self.rank,
            shared: Arc::clone(&self.shared),
            adapter: Arc::clone(&self.adapter),
            edges: Vec::new(),
        }))
    }
}

struct LoopbackComm {
    lib: Library,
    rank: Rank,
    shared: Arc<Shared>,
    adapter: Arc<dyn DeviceAdapter>,
    edges: Vec<WireEdge>,
}

impl CommHandle for LoopbackComm {
    fn library(&self) -> Library {
        self.lib
    }

    fn add(&mut self, edge: WireEdge) -> Result<()> {
        self.edges.push(edge);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        for e in &self.edges {
            if e.src != self.rank {
                continue;
            }
            if e.dst == self.rank {
                unsafe {
                    self.adapter
                        .copy_within_device(e.recv_addr, e.send_addr, e.bytes)?;
                }
            } else {
                let staged = unsafe { self.adapter.stage_for_send(e.send_addr, e.bytes)? };
                self.shared.mailboxes[e.dst as usize]
                    .post((e.batch, e.src, e.seq), Bytes::from(staged))?;
            }
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<()> {
        for e in &self.edges {
            if e.dst != self.rank || e.src == self.rank {
                continue;
            }
            let payload = self.shared.mailboxes[self.rank as usize].take((e.batch, e.src, e.seq))?;
            if payload.len() != e.bytes {
                return Err(HicollError::backend(
                    self.lib,
                    format!(
                        "payload size mismatch from rank {}: expected {} bytes, got {}",
                        e.src,
                        e.bytes,
                        payload.len()
                    ),
                ));
            }
            unsafe { self.adapter.receive_to_device(&payload, e.recv_addr)? };
        }
        Ok(())
    }

    fn test(&mut self) -> Result<bool> {
        for e in &self.edges {
            if e.dst != self.rank || e.src == self.rank {
                continue;
            }
            if !self.shared.mailboxes[self.rank as usize].ready((e.batch, e.src, e.seq))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn numsend(&self) -> usize {
        self.edges
            .iter()
            .filter(|e| e.src == self.rank && e.dst != self.rank)
            .count()
    }

    fn numrecv(&self) -> usize {
        self.edges
            .iter()
            .filter(|e| e.dst == self.rank && e.src != self.rank)
            .count()
    }
}
