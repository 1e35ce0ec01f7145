//! End-to-end execution over the loopback fabric: equivalence against the
//! serial reference, idempotence, and command ordering.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{run_world, two_node_hierarchy, Elem};
use hicoll::{
    CommHandle, Communicator, Fabric, Hierarchy, HicollConfig, HicollError, IntraTopology,
    Library, LoopbackFabric, Rank, ReduceOp, ReduceOrder, WireEdge,
};

fn cfg() -> HicollConfig {
    HicollConfig::default()
}

#[test]
fn test_broadcast_reaches_every_rank() {
    // Broadcast(0 -> all) over {8,4,1} with two pipeline batches.
    let (sizes, libs) = two_node_hierarchy();
    let config = HicollConfig {
        pipedepth: 2,
        ..cfg()
    };
    let out = run_world(
        8,
        1024,
        sizes,
        libs,
        config,
        |r, i| if r == 0 { 3 * i as Elem + 7 } else { -1 },
        |comm, send, recv| {
            comm.add_bcast(send, 0, recv, 0, 1024, 0, (0..8).collect());
        },
        1,
    );
    for rank in 0..8 {
        assert_eq!(out.recvs[rank], out.sends[0], "rank {rank}");
    }
}

#[test]
fn test_allgather_as_eight_broadcasts() {
    // Allgather declared as one broadcast per sender, 128 elements each.
    let (sizes, libs) = two_node_hierarchy();
    let out = run_world(
        8,
        1024,
        sizes,
        libs,
        cfg(),
        |r, i| (r * 1000) as Elem + i as Elem,
        |comm, send, recv| {
            for sender in 0..8u32 {
                comm.add_bcast(
                    send,
                    0,
                    recv,
                    sender as usize * 128,
                    128,
                    sender,
                    (0..8).collect(),
                );
            }
        },
        1,
    );
    for rank in 0..8 {
        for sender in 0..8usize {
            assert_eq!(
                &out.recvs[rank][sender * 128..(sender + 1) * 128],
                &out.sends[sender][..128],
                "rank {rank} slot {sender}"
            );
        }
    }
}

#[test]
fn test_reduce_sums_all_contributions() {
    // With sendbuf_p[i] = p, the sum over 8 ranks is 28 everywhere.
    let (sizes, libs) = two_node_hierarchy();
    let out = run_world(
        8,
        1024,
        sizes,
        libs,
        cfg(),
        |r, _| r as Elem,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 1024, (0..8).collect(), 0, ReduceOp::Sum);
        },
        1,
    );
    assert_eq!(out.recvs[0], vec![28; 1024]);
    for rank in 1..8 {
        assert_eq!(out.recvs[rank], vec![0; 1024], "rank {rank} untouched");
    }
}

#[test]
fn test_scatter_as_eight_broadcasts() {
    // Scatter: rank p receives rank 0's p-th slice.
    let (sizes, libs) = two_node_hierarchy();
    let out = run_world(
        8,
        1024,
        sizes,
        libs,
        cfg(),
        |_, i| i as Elem,
        |comm, send, recv| {
            for p in 0..8u32 {
                comm.add_bcast_one(send, p as usize * 128, recv, 0, 128, 0, p);
            }
        },
        1,
    );
    for p in 0..8usize {
        assert_eq!(
            &out.recvs[p][..128],
            &out.sends[0][p * 128..(p + 1) * 128],
            "rank {p}"
        );
    }
}

#[test]
fn test_run_is_idempotent() {
    // The same compiled plan twice, bit-for-bit.
    let (sizes, libs) = two_node_hierarchy();
    let once = run_world(
        8,
        512,
        sizes.clone(),
        libs.clone(),
        cfg(),
        |r, i| (r as Elem) * 31 + i as Elem % 17,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 512, (0..8).collect(), 3, ReduceOp::Sum);
        },
        1,
    );
    let twice = run_world(
        8,
        512,
        sizes,
        libs,
        cfg(),
        |r, i| (r as Elem) * 31 + i as Elem % 17,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 512, (0..8).collect(), 3, ReduceOp::Sum);
        },
        2,
    );
    assert_eq!(once.recvs, twice.recvs);
}

#[test]
fn test_alltoall_small_world() {
    let sizes = vec![4, 2, 1];
    let libs = vec![Library::Msg, Library::Xccl, Library::Ipc];
    let out = run_world(
        4,
        64,
        sizes,
        libs,
        cfg(),
        |r, i| (r * 100) as Elem + i as Elem,
        |comm, send, recv| {
            for s in 0..4u32 {
                for r in 0..4u32 {
                    comm.add_bcast_one(
                        send,
                        r as usize * 16,
                        recv,
                        s as usize * 16,
                        16,
                        s,
                        r,
                    );
                }
            }
        },
        1,
    );
    for me in 0..4usize {
        for s in 0..4usize {
            assert_eq!(
                &out.recvs[me][s * 16..(s + 1) * 16],
                &out.sends[s][me * 16..(me + 1) * 16],
                "rank {me} from {s}"
            );
        }
    }
}

#[test]
fn test_allreduce_via_fenced_epochs() {
    // Reduce into rank 0, fence, broadcast the reduced buffer back out.
    let (sizes, libs) = two_node_hierarchy();
    let out = run_world(
        8,
        256,
        sizes,
        libs,
        cfg(),
        |r, _| r as Elem + 1,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 256, (0..8).collect(), 0, ReduceOp::Sum);
            comm.add_fence();
            comm.add_bcast(recv, 0, recv, 0, 256, 0, (0..8).collect());
        },
        1,
    );
    for rank in 0..8 {
        assert_eq!(out.recvs[rank], vec![36; 256], "rank {rank}");
    }
}

#[test]
fn test_striped_broadcast_matches_plain() {
    let config = HicollConfig {
        numstripe: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        1024,
        vec![8, 4],
        vec![Library::Msg, Library::Ipc],
        config,
        |r, i| if r == 0 { i as Elem } else { 0 },
        |comm, send, recv| {
            comm.add_bcast(send, 0, recv, 0, 1024, 0, (0..8).collect());
        },
        1,
    );
    for rank in 0..8 {
        assert_eq!(out.recvs[rank], out.sends[0], "rank {rank}");
    }
}

#[test]
fn test_striped_reduce_matches_plain() {
    let config = HicollConfig {
        numstripe: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        1000,
        vec![8, 4],
        vec![Library::Msg, Library::Ipc],
        config,
        |r, i| r as Elem * 2 + (i % 5) as Elem,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 1000, (0..8).collect(), 2, ReduceOp::Sum);
        },
        1,
    );
    let expected: Vec<Elem> = (0..1000)
        .map(|i| (0..8).map(|r| r * 2 + (i % 5) as Elem).sum())
        .collect();
    assert_eq!(out.recvs[2], expected);
}

#[test]
fn test_ring_broadcast_matches_tree() {
    let config = HicollConfig {
        ringnodes: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        1024,
        vec![8, 2, 1],
        vec![Library::Msg, Library::Xccl, Library::Ipc],
        config,
        |r, i| if r == 0 { 7 - (i as Elem % 13) } else { 0 },
        |comm, send, recv| {
            comm.add_bcast(send, 0, recv, 0, 1024, 0, (0..8).collect());
        },
        1,
    );
    for rank in 0..8 {
        assert_eq!(out.recvs[rank], out.sends[0], "rank {rank}");
    }
}

#[test]
fn test_ring_reduce_applies_op_once_per_contributor() {
    let config = HicollConfig {
        ringnodes: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        1024,
        vec![8, 2, 1],
        vec![Library::Msg, Library::Xccl, Library::Ipc],
        config,
        |r, i| r as Elem + i as Elem % 3,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 1024, (0..8).collect(), 0, ReduceOp::Sum);
        },
        1,
    );
    let expected: Vec<Elem> = (0..1024)
        .map(|i| (0..8).map(|r| r + (i % 3) as Elem).sum())
        .collect();
    assert_eq!(out.recvs[0], expected);
}

#[test]
fn test_ring_reduce_max_op() {
    let config = HicollConfig {
        ringnodes: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        128,
        vec![8, 2, 1],
        vec![Library::Msg, Library::Xccl, Library::Ipc],
        config,
        |r, i| ((r as Elem * 7 + i as Elem) % 23) - 11,
        |comm, send, recv| {
            comm.add_reduce(send, 0, recv, 0, 128, (0..8).collect(), 5, ReduceOp::Max);
        },
        1,
    );
    let expected: Vec<Elem> = (0..128)
        .map(|i| (0..8).map(|r| ((r * 7 + i as Elem) % 23) - 11).max().unwrap())
        .collect();
    assert_eq!(out.recvs[5], expected);
}

#[test]
fn test_reduce_order_policies_agree() {
    for order in [ReduceOrder::StripeThenRing, ReduceOrder::RingThenStripe] {
        let config = HicollConfig {
            numstripe: 2,
            ringnodes: 4,
            reduce_order: order,
            ..cfg()
        };
        let out = run_world(
            8,
            512,
            vec![8, 2, 1],
            vec![Library::Msg, Library::Xccl, Library::Ipc],
            config,
            |r, i| r as Elem * 3 + i as Elem % 7,
            |comm, send, recv| {
                comm.add_reduce(send, 0, recv, 0, 512, (0..8).collect(), 1, ReduceOp::Sum);
            },
            1,
        );
        let expected: Vec<Elem> = (0..512)
            .map(|i| (0..8).map(|r| r * 3 + (i % 7) as Elem).sum())
            .collect();
        assert_eq!(out.recvs[1], expected, "{order:?}");
    }
}

#[test]
fn test_intra_chain_topology() {
    // {8,4} bottoms out with whole node groups at the leaf level, which is
    // where the chain shape applies.
    let config = HicollConfig {
        intra_topology: IntraTopology::Ring,
        ..cfg()
    };
    let out = run_world(
        8,
        256,
        vec![8, 4],
        vec![Library::Msg, Library::Ipc],
        config,
        |r, i| if r == 2 { i as Elem + 1 } else { 0 },
        |comm, send, recv| {
            comm.add_bcast(send, 0, recv, 0, 256, 2, (0..8).collect());
        },
        1,
    );
    for rank in 0..8 {
        assert_eq!(out.recvs[rank], out.sends[2], "rank {rank}");
    }
}

#[test]
fn test_pipelined_mixed_pattern_matches_reference() {
    // A mixed declaration with four batches, checked against the
    // serial reference.
    let (sizes, libs) = two_node_hierarchy();
    let config = HicollConfig {
        pipedepth: 4,
        ..cfg()
    };
    let out = run_world(
        8,
        2048,
        sizes,
        libs,
        config,
        |r, i| (r as Elem * 131 + i as Elem * 3) % 97,
        |comm, send, recv| {
            // A gather, a scatter, and a reduction sharing one epoch.
            for p in 0..8u32 {
                comm.add_bcast_one(send, 0, recv, p as usize * 128, 128, p, 6);
            }
            for p in 0..8u32 {
                comm.add_bcast_one(send, 1024 + p as usize * 64, recv, 1024, 64, 3, p);
            }
            comm.add_reduce(
                send,
                512,
                recv,
                1536,
                512,
                (0..8).collect(),
                4,
                ReduceOp::Sum,
            );
        },
        1,
    );

    use hicoll::primitive::Epoch;
    use hicoll::validate::{run_reference, RECV_BUF, SEND_BUF};
    let mut epoch = Epoch::default();
    for p in 0..8u32 {
        epoch.bcasts.push(hicoll::Broadcast::new(
            SEND_BUF,
            0,
            RECV_BUF,
            p as usize * 128,
            128,
            p,
            vec![6],
        ));
    }
    for p in 0..8u32 {
        epoch.bcasts.push(hicoll::Broadcast::new(
            SEND_BUF,
            1024 + p as usize * 64,
            RECV_BUF,
            1024,
            64,
            3,
            vec![p],
        ));
    }
    epoch.reduces.push(hicoll::Reduce::new(
        SEND_BUF,
        512,
        RECV_BUF,
        1536,
        512,
        (0..8).collect(),
        4,
        ReduceOp::Sum,
    ));
    let mut expected = vec![vec![0 as Elem; 2048]; 8];
    run_reference(&out.sends, &mut expected, &[epoch]);
    assert_eq!(out.recvs, expected);
}

// --- ordering probe -----------------------------------------------------

type EventLog = Arc<Mutex<Vec<(Rank, usize, &'static str)>>>;

struct ProbeFabric {
    inner: LoopbackFabric,
    log: EventLog,
    next_id: AtomicUsize,
}

impl Fabric for ProbeFabric {
    fn rank(&self) -> Rank {
        self.inner.rank()
    }

    fn size(&self) -> u32 {
        self.inner.size()
    }

    fn barrier(&self) -> hicoll::Result<()> {
        self.inner.barrier()
    }

    fn allgather(&self, value: u64) -> hicoll::Result<Vec<u64>> {
        self.inner.allgather(value)
    }

    fn open(&self, lib: Library) -> hicoll::Result<Box<dyn CommHandle>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ProbeComm {
            inner: self.inner.open(lib)?,
            rank: self.inner.rank(),
            id,
            log: Arc::clone(&self.log),
        }))
    }
}

struct ProbeComm {
    inner: Box<dyn CommHandle>,
    rank: Rank,
    id: usize,
    log: EventLog,
}

impl CommHandle for ProbeComm {
    fn library(&self) -> Library {
        self.inner.library()
    }

    fn add(&mut self, edge: WireEdge) -> hicoll::Result<()> {
        self.inner.add(edge)
    }

    fn start(&mut self) -> hicoll::Result<()> {
        self.log.lock().unwrap().push((self.rank, self.id, "start"));
        self.inner.start()
    }

    fn wait(&mut self) -> hicoll::Result<()> {
        let out = self.inner.wait();
        self.log.lock().unwrap().push((self.rank, self.id, "wait"));
        out
    }

    fn test(&mut self) -> hicoll::Result<bool> {
        self.inner.test()
    }

    fn numsend(&self) -> usize {
        self.inner.numsend()
    }

    fn numrecv(&self) -> usize {
        self.inner.numrecv()
    }

    fn measure(&mut self, warmup: u32, numiter: u32) -> hicoll::Result<Duration> {
        self.inner.measure(warmup, numiter)
    }
}

#[test]
fn test_within_batch_ordering() {
    // With a single batch, no command may start before its
    // predecessor's wait returned on the same rank.
    let (sizes, libs) = two_node_hierarchy();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    let sends: Vec<Vec<Elem>> = (0..8).map(|r| vec![r as Elem; 256]).collect();
    let mut recvs: Vec<Vec<Elem>> = vec![vec![0; 256]; 8];

    std::thread::scope(|s| {
        for ((fabric, send), recv) in LoopbackFabric::world(8)
            .into_iter()
            .zip(sends.iter())
            .zip(recvs.iter_mut())
        {
            let sizes = sizes.clone();
            let libs = libs.clone();
            let log = Arc::clone(&log);
            s.spawn(move || {
                let adapter = fabric.adapter();
                let probe: Arc<dyn Fabric> = Arc::new(ProbeFabric {
                    inner: fabric,
                    log,
                    next_id: AtomicUsize::new(0),
                });
                let mut comm = Communicator::<Elem>::new(probe, adapter);
                comm.add_bcast(send.as_ptr() as u64, 0, recv.as_mut_ptr() as u64, 0, 256, 1, (0..8).collect());
                comm.init(Hierarchy::new(sizes, libs).unwrap()).unwrap();
                comm.run().unwrap();
            });
        }
    });

    let log = log.lock().unwrap();
    for rank in 0..8u32 {
        let events: Vec<&(Rank, usize, &str)> = log.iter().filter(|e| e.0 == rank).collect();
        assert!(!events.is_empty());
        let mut expected_id = 0usize;
        let mut chunks = events.chunks_exact(2);
        for pair in &mut chunks {
            assert_eq!(pair[0], &(rank, expected_id, "start"), "rank {rank}");
            assert_eq!(pair[1], &(rank, expected_id, "wait"), "rank {rank}");
            expected_id += 1;
        }
        assert!(chunks.remainder().is_empty(), "rank {rank} dangling event");
    }
}

// --- Failure semantics --------------------------------------------------

fn solo_comm() -> Communicator<Elem> {
    let fabric = LoopbackFabric::world(1).pop().unwrap();
    let adapter = fabric.adapter();
    Communicator::<Elem>::new(Arc::new(fabric), adapter)
}

#[test]
fn test_init_rejects_empty_plan() {
    let mut comm = solo_comm();
    let err = comm
        .init(Hierarchy::new(vec![1], vec![Library::Ipc]).unwrap())
        .unwrap_err();
    assert!(matches!(err, HicollError::EmptyPlan));
}

#[test]
fn test_init_rejects_world_mismatch() {
    let mut comm = solo_comm();
    comm.add_bcast_one(0x1000, 0, 0x2000, 0, 16, 0, 0);
    let err = comm
        .init(Hierarchy::new(vec![2, 1], vec![Library::Msg, Library::Ipc]).unwrap())
        .unwrap_err();
    assert!(matches!(err, HicollError::HierarchyMismatch { .. }));
}

#[test]
fn test_init_rejects_out_of_range_rank() {
    let mut comm = solo_comm();
    comm.add_bcast_one(0x1000, 0, 0x2000, 0, 16, 0, 9);
    let err = comm
        .init(Hierarchy::new(vec![1], vec![Library::Ipc]).unwrap())
        .unwrap_err();
    assert!(matches!(err, HicollError::InvalidRank { rank: 9, .. }));
}

#[test]
fn test_init_rejects_striping_without_node_level() {
    let config = HicollConfig {
        numstripe: 2,
        ..HicollConfig::default()
    };
    let fabric = LoopbackFabric::world(1).pop().unwrap();
    let adapter = fabric.adapter();
    let mut comm = Communicator::<Elem>::with_config(Arc::new(fabric), adapter, config);
    comm.add_bcast_one(0x1000, 0, 0x2000, 0, 16, 0, 0);
    let err = comm
        .init(Hierarchy::new(vec![1], vec![Library::Ipc]).unwrap())
        .unwrap_err();
    assert!(matches!(err, HicollError::StripeNeedsHierarchy(2)));
}

#[test]
fn test_run_before_init_fails() {
    let mut comm = solo_comm();
    assert!(matches!(comm.run(), Err(HicollError::NotInitialized)));
}

#[test]
fn test_second_init_fails() {
    let mut comm = solo_comm();
    comm.add_bcast_one(0x1000, 0, 0x1000, 0, 0, 0, 0);
    // Zero-count primitive still counts as a declaration; plan is empty
    // but valid.
    comm.init(Hierarchy::new(vec![1], vec![Library::Ipc]).unwrap())
        .unwrap();
    let err = comm
        .init(Hierarchy::new(vec![1], vec![Library::Ipc]).unwrap())
        .unwrap_err();
    assert!(matches!(err, HicollError::AlreadyInitialized));
}
