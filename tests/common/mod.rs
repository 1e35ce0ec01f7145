//! Multi-rank in-process worlds for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use hicoll::planner::Coll;
use hicoll::{Communicator, Fabric, Hierarchy, HicollConfig, Library, LoopbackFabric};

pub type Elem = i32;

/// Spawn `world` rank threads, declare primitives, compile, and hand rank
/// 0's communicator to `inspect`. Planning never dereferences user buffer
/// addresses, so declarations may use synthetic ones.
pub fn compile_world<R, D, I>(
    world: u32,
    sizes: Vec<usize>,
    libs: Vec<Library>,
    config: HicollConfig,
    declare: D,
    inspect: I,
) -> R
where
    D: Fn(&mut Communicator<Elem>) + Sync,
    I: FnOnce(&Communicator<Elem>) -> R,
{
    let mut fabrics = LoopbackFabric::world(world).into_iter();
    let rank0 = fabrics.next().unwrap();
    let declare = &declare;

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for fabric in fabrics {
            let sizes = sizes.clone();
            let libs = libs.clone();
            let config = config.clone();
            handles.push(s.spawn(move || {
                let adapter = fabric.adapter();
                let fabric: Arc<dyn Fabric> = Arc::new(fabric);
                let mut comm = Communicator::<Elem>::with_config(fabric, adapter, config);
                declare(&mut comm);
                comm.init(Hierarchy::new(sizes, libs).unwrap()).unwrap();
            }));
        }

        let adapter = rank0.adapter();
        let fabric: Arc<dyn Fabric> = Arc::new(rank0);
        let mut comm = Communicator::<Elem>::with_config(fabric, adapter, config.clone());
        declare(&mut comm);
        comm.init(Hierarchy::new(sizes.clone(), libs.clone()).unwrap())
            .unwrap();
        let result = inspect(&comm);

        for h in handles {
            h.join().unwrap();
        }
        result
    })
}

/// Rank 0's pre-lowering plan for the declared primitives.
pub fn compile_plan<D>(
    world: u32,
    sizes: Vec<usize>,
    libs: Vec<Library>,
    config: HicollConfig,
    declare: D,
) -> Vec<Vec<Coll>>
where
    D: Fn(&mut Communicator<Elem>) + Sync,
{
    compile_world(world, sizes, libs, config, declare, |comm| {
        comm.plan().to_vec()
    })
}

pub struct WorldRun {
    pub sends: Vec<Vec<Elem>>,
    pub recvs: Vec<Vec<Elem>>,
}

/// Full pipeline: allocate per-rank buffers, declare, compile, and run
/// `runs` times over the loopback fabric. `fill(rank, i)` seeds the send
/// buffers; receive buffers start at zero.
pub fn run_world<F, D>(
    world: u32,
    buflen: usize,
    sizes: Vec<usize>,
    libs: Vec<Library>,
    config: HicollConfig,
    fill: F,
    declare: D,
    runs: usize,
) -> WorldRun
where
    F: Fn(u32, usize) -> Elem,
    D: Fn(&mut Communicator<Elem>, u64, u64) + Sync,
{
    let sends: Vec<Vec<Elem>> = (0..world)
        .map(|r| (0..buflen).map(|i| fill(r, i)).collect())
        .collect();
    let mut recvs: Vec<Vec<Elem>> = vec![vec![0; buflen]; world as usize];

    let fabrics = LoopbackFabric::world(world);
    let declare = &declare;

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        for ((fabric, send), recv) in fabrics.into_iter().zip(sends.iter()).zip(recvs.iter_mut()) {
            let sizes = sizes.clone();
            let libs = libs.clone();
            let config = config.clone();
            handles.push(s.spawn(move || {
                let adapter = fabric.adapter();
                let fabric: Arc<dyn Fabric> = Arc::new(fabric);
                let mut comm = Communicator::<Elem>::with_config(fabric, adapter, config);
                declare(&mut comm, send.as_ptr() as u64, recv.as_mut_ptr() as u64);
                comm.init(Hierarchy::new(sizes, libs).unwrap()).unwrap();
                for _ in 0..runs {
                    comm.run().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    });

    WorldRun { sends, recvs }
}

/// The `{8, 4, 1}` two-node hierarchy used by most scenarios.
pub fn two_node_hierarchy() -> (Vec<usize>, Vec<Library>) {
    (
        vec![8, 4, 1],
        vec![Library::Msg, Library::Xccl, Library::Ipc],
    )
}
