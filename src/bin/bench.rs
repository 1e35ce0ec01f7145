//! Pattern benchmark and validation harness.
//!
//! Spawns an in-process world (one thread per rank), declares the chosen
//! pattern as broadcast/reduce primitives, compiles and runs the plan,
//! validates every rank's receive buffer against the serial reference
//! model, then runs the calibration loops.
//!
//! ```bash
//! hicoll-bench broadcast 2 1024 5 10
//! hicoll-bench allreduce 4 4096 5 10 --ranks 8 --hierarchy 8,4,1 --libs msg,xccl,ipc
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use hicoll::validate::{RECV_BUF, SEND_BUF};
use hicoll::{
    Communicator, Fabric, Hierarchy, HicollConfig, Library, LoopbackFabric, Rank, ReduceOp,
};
use hicoll::primitive::Epoch;

type Elem = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Pattern {
    Pt2pt,
    Gather,
    Scatter,
    Reduce,
    Broadcast,
    Alltoall,
    Allgather,
    Allreduce,
}

#[derive(Parser, Debug)]
#[command(name = "hicoll-bench", about = "Collective pattern benchmark")]
struct Args {
    /// Communication pattern to compile.
    #[arg(value_enum)]
    pattern: Pattern,

    /// Pipeline depth (number of batches).
    numbatch: usize,

    /// Elements per point-to-point transfer.
    count: usize,

    /// Untimed calibration iterations.
    warmup: u32,

    /// Timed calibration iterations.
    numiter: u32,

    /// World size.
    #[arg(long, default_value_t = 8)]
    ranks: u32,

    /// Comma-separated per-level group sizes, outermost first.
    #[arg(long, value_delimiter = ',')]
    hierarchy: Option<Vec<usize>>,

    /// Comma-separated per-level library tags (ipc, msg, xccl, stage).
    #[arg(long, value_delimiter = ',')]
    libs: Option<Vec<String>>,

    /// Stripes per inter-group primitive.
    #[arg(long)]
    numstripe: Option<usize>,

    /// Enable the inter-group ring path.
    #[arg(long)]
    ringnodes: Option<usize>,
}

/// Declare `pattern` as primitives over `sendbuf`/`recvbuf`. Buffer fields
/// double as mirror selectors for the reference model.
fn build_epochs(
    pattern: Pattern,
    world: u32,
    count: usize,
    sendbuf: u64,
    recvbuf: u64,
) -> Vec<Epoch> {
    let all: Vec<Rank> = (0..world).collect();
    let mut epoch = Epoch::default();
    let mut epochs = Vec::new();
    match pattern {
        Pattern::Pt2pt => {
            epoch
                .bcasts
                .push(hicoll::Broadcast::new(sendbuf, 0, recvbuf, 0, count, 0, vec![world / 2]));
        }
        Pattern::Gather => {
            for p in 0..world {
                epoch.bcasts.push(hicoll::Broadcast::new(
                    sendbuf,
                    0,
                    recvbuf,
                    p as usize * count,
                    count,
                    p,
                    vec![0],
                ));
            }
        }
        Pattern::Scatter => {
            for p in 0..world {
                epoch.bcasts.push(hicoll::Broadcast::new(
                    sendbuf,
                    p as usize * count,
                    recvbuf,
                    0,
                    count,
                    0,
                    vec![p],
                ));
            }
        }
        Pattern::Reduce => {
            epoch.reduces.push(hicoll::Reduce::new(
                sendbuf,
                0,
                recvbuf,
                0,
                count,
                all.clone(),
                0,
                ReduceOp::Sum,
            ));
        }
        Pattern::Broadcast => {
            epoch
                .bcasts
                .push(hicoll::Broadcast::new(sendbuf, 0, recvbuf, 0, count, 0, all.clone()));
        }
        Pattern::Alltoall => {
            for sender in 0..world {
                for recver in 0..world {
                    epoch.bcasts.push(hicoll::Broadcast::new(
                        sendbuf,
                        recver as usize * count,
                        recvbuf,
                        sender as usize * count,
                        count,
                        sender,
                        vec![recver],
                    ));
                }
            }
        }
        Pattern::Allgather => {
            for sender in 0..world {
                epoch.bcasts.push(hicoll::Broadcast::new(
                    sendbuf,
                    0,
                    recvbuf,
                    sender as usize * count,
                    count,
                    sender,
                    all.clone(),
                ));
            }
        }
        Pattern::Allreduce => {
            epoch.reduces.push(hicoll::Reduce::new(
                sendbuf,
                0,
                recvbuf,
                0,
                count,
                all.clone(),
                0,
                ReduceOp::Sum,
            ));
            epochs.push(std::mem::take(&mut epoch));
            // Second epoch: fan the reduced buffer back out.
            epoch
                .bcasts
                .push(hicoll::Broadcast::new(recvbuf, 0, recvbuf, 0, count, 0, all));
        }
    }
    epochs.push(epoch);
    epochs
}

fn default_hierarchy(world: u32) -> (Vec<usize>, Vec<Library>) {
    let world = world as usize;
    if world >= 8 && world % 4 == 0 {
        (
            vec![world, 4, 1],
            vec![Library::Msg, Library::Xccl, Library::Ipc],
        )
    } else if world > 1 {
        (vec![world, 1], vec![Library::Msg, Library::Ipc])
    } else {
        (vec![1], vec![Library::Ipc])
    }
}

fn rank_main(
    fabric: LoopbackFabric,
    args: &Args,
    hier: (Vec<usize>, Vec<Library>),
    send: &[Elem],
    recv: &mut [Elem],
    snapshot: &mut Vec<Elem>,
) -> hicoll::Result<()> {
    let mut config = HicollConfig::from_env();
    config.pipedepth = args.numbatch.max(1);
    if let Some(n) = args.numstripe {
        config.numstripe = n;
    }
    if let Some(n) = args.ringnodes {
        config.ringnodes = n;
    }

    let adapter = fabric.adapter();
    let world = fabric.size();
    let fabric: Arc<dyn Fabric> = Arc::new(fabric);
    let mut comm = Communicator::<Elem>::with_config(fabric, adapter, config);

    let sendbuf = send.as_ptr() as u64;
    let recvbuf = recv.as_mut_ptr() as u64;
    let epochs = build_epochs(args.pattern, world, args.count, sendbuf, recvbuf);
    for (i, epoch) in epochs.iter().enumerate() {
        if i > 0 {
            comm.add_fence();
        }
        for b in &epoch.bcasts {
            comm.add_bcast(
                b.sendbuf, b.sendoffset, b.recvbuf, b.recvoffset, b.count, b.sendid,
                b.recvids.clone(),
            );
        }
        for r in &epoch.reduces {
            comm.add_reduce(
                r.sendbuf, r.sendoffset, r.recvbuf, r.recvoffset, r.count,
                r.sendids.clone(), r.recvid, r.op,
            );
        }
    }

    comm.init(Hierarchy::new(hier.0, hier.1)?)?;
    comm.report();
    comm.run()?;
    *snapshot = recv.to_vec();

    if args.warmup + args.numiter > 0 {
        comm.measure(args.warmup, args.numiter)?;
        comm.time()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let world = args.ranks.max(1);
    let buflen = args.count * world as usize;

    let parsed_libs = match &args.libs {
        Some(tags) => {
            let mut libs = Vec::with_capacity(tags.len());
            for tag in tags {
                match tag.parse::<Library>() {
                    Ok(lib) => libs.push(lib),
                    Err(e) => {
                        error!("{e}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            Some(libs)
        }
        None => None,
    };
    let (sizes, libs) = match (&args.hierarchy, parsed_libs) {
        (Some(sizes), Some(libs)) => (sizes.clone(), libs),
        (Some(sizes), None) => {
            let libs = std::iter::once(Library::Msg)
                .chain(std::iter::repeat(Library::Ipc))
                .take(sizes.len())
                .collect();
            (sizes.clone(), libs)
        }
        _ => default_hierarchy(world),
    };

    info!(
        pattern = ?args.pattern,
        ranks = world,
        numbatch = args.numbatch,
        count = args.count,
        warmup = args.warmup,
        numiter = args.numiter,
        "starting bench world"
    );

    let sends: Vec<Vec<Elem>> = (0..world)
        .map(|r| (0..buflen).map(|i| (r as usize * buflen + i) as Elem).collect())
        .collect();
    let mut recvs: Vec<Vec<Elem>> = vec![vec![0; buflen]; world as usize];
    let mut snapshots: Vec<Vec<Elem>> = vec![Vec::new(); world as usize];

    let fabrics = LoopbackFabric::world(world);
    let mut failures: Vec<String> = Vec::new();

    std::thread::scope(|s| {
        let mut handles = Vec::new();
        let sends = &sends;
        for (((fabric, send), recv), snapshot) in fabrics
            .into_iter()
            .zip(sends.iter())
            .zip(recvs.iter_mut())
            .zip(snapshots.iter_mut())
        {
            let args = &args;
            let hier = (sizes.clone(), libs.clone());
            handles.push(s.spawn(move || {
                let rank = fabric.rank();
                rank_main(fabric, args, hier, send, recv, snapshot)
                    .map_err(|e| format!("rank {rank}: {e}"))
            }));
        }
        for h in handles {
            match h.join() {
                Ok(Ok(())) => {}
                Ok(Err(msg)) => failures.push(msg),
                Err(_) => failures.push("rank panicked".into()),
            }
        }
    });

    for f in &failures {
        error!("{f}");
    }
    if !failures.is_empty() {
        return ExitCode::FAILURE;
    }

    // Validate against the serial reference.
    let reference_epochs = build_epochs(args.pattern, world, args.count, SEND_BUF, RECV_BUF);
    let mut expected: Vec<Vec<Elem>> = vec![vec![0; buflen]; world as usize];
    hicoll::validate::run_reference(&sends, &mut expected, &reference_epochs);

    let mut bad = 0usize;
    for (rank, (got, want)) in snapshots.iter().zip(expected.iter()).enumerate() {
        if got != want {
            let first = got
                .iter()
                .zip(want.iter())
                .position(|(g, w)| g != w)
                .unwrap_or(0);
            error!(
                rank,
                index = first,
                got = got.get(first).copied().unwrap_or_default(),
                want = want.get(first).copied().unwrap_or_default(),
                "validation mismatch"
            );
            bad += 1;
        }
    }

    if bad > 0 {
        error!(bad_ranks = bad, "validation FAILED");
        ExitCode::FAILURE
    } else {
        info!("validation passed");
        ExitCode::SUCCESS
    }
}
