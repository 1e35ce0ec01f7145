//! The user-facing communicator.
//!
//! Declare broadcasts and reductions (optionally split into epochs with
//! `add_fence`), compile them once with `init`, then execute the compiled
//! pipeline with `run`. The plan is immutable after init.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::backend::{DeviceAdapter, Fabric};
use crate::config::{HicollConfig, ReduceOrder};
use crate::error::{HicollError, Result};
use crate::executor;
use crate::hierarchy::Hierarchy;
use crate::planner::coll::Coll;
use crate::planner::{implement, partition, ring, stripe, tree};
use crate::planner::{Command, PlanCtx, StagingBuffer};
use crate::primitive::{Broadcast, Epoch, Reduce};
use crate::report::DiagCtx;
use crate::types::{Library, Rank, ReduceOp, Scalar};

struct Endpoints {
    sendbuf: u64,
    sendcount: usize,
    recvbuf: u64,
    recvcount: usize,
}

pub struct Communicator<T: Scalar> {
    fabric: Arc<dyn Fabric>,
    adapter: Arc<dyn DeviceAdapter>,
    config: HicollConfig,
    diag: DiagCtx,
    epochs: Vec<Epoch>,
    coll_batch: Vec<Vec<Coll>>,
    command_batch: Vec<Vec<Command>>,
    staging: Vec<StagingBuffer>,
    staged_elems: usize,
    endpoints: Option<Endpoints>,
    initialized: bool,
    _elem: PhantomData<T>,
}

impl<T: Scalar> Communicator<T> {
    pub fn new(fabric: Arc<dyn Fabric>, adapter: Arc<dyn DeviceAdapter>) -> Self {
        Self::with_config(fabric, adapter, HicollConfig::default())
    }

    pub fn with_config(
        fabric: Arc<dyn Fabric>,
        adapter: Arc<dyn DeviceAdapter>,
        config: HicollConfig,
    ) -> Self {
        let diag = DiagCtx::new(fabric.rank(), 0);
        Self {
            fabric,
            adapter,
            config,
            diag,
            epochs: vec![Epoch::default()],
            coll_batch: Vec::new(),
            command_batch: Vec::new(),
            staging: Vec::new(),
            staged_elems: 0,
            endpoints: None,
            initialized: false,
            _elem: PhantomData,
        }
    }

    pub fn config(&self) -> &HicollConfig {
        &self.config
    }

    /// Echo the planner parameters, print rank only.
    pub fn print_parameters(&self) {
        if !self.diag.on() {
            return;
        }
        info!(
            numstripe = self.config.numstripe,
            ringnodes = self.config.ringnodes,
            pipedepth = self.config.pipedepth,
            reduce_order = ?self.config.reduce_order,
            intra_topology = ?self.config.intra_topology,
            epochs = self.epochs.len(),
            "planner parameters"
        );
    }

    pub fn set_print_rank(&mut self, print_rank: Rank) {
        self.diag = DiagCtx::new(self.fabric.rank(), print_rank);
    }

    /// Close the current epoch. Later primitives only start once every
    /// earlier epoch has completed.
    pub fn add_fence(&mut self) {
        if self.guard_sealed("add_fence") {
            return;
        }
        self.epochs.push(Epoch::default());
        if self.diag.on() {
            info!(epoch = self.epochs.len() - 1, "opened epoch");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_bcast(
        &mut self,
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendid: Rank,
        recvids: Vec<Rank>,
    ) {
        if self.guard_sealed("add_bcast") {
            return;
        }
        self.epochs.last_mut().expect("default epoch").bcasts.push(Broadcast::new(
            sendbuf, sendoffset, recvbuf, recvoffset, count, sendid, recvids,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_bcast_one(
        &mut self,
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendid: Rank,
        recvid: Rank,
    ) {
        self.add_bcast(
            sendbuf,
            sendoffset,
            recvbuf,
            recvoffset,
            count,
            sendid,
            vec![recvid],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_reduce(
        &mut self,
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendids: Vec<Rank>,
        recvid: Rank,
        op: ReduceOp,
    ) {
        if self.guard_sealed("add_reduce") {
            return;
        }
        self.epochs.last_mut().expect("default epoch").reduces.push(Reduce::new(
            sendbuf, sendoffset, recvbuf, recvoffset, count, sendids, recvid, op,
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_reduce_one(
        &mut self,
        sendbuf: u64,
        sendoffset: usize,
        recvbuf: u64,
        recvoffset: usize,
        count: usize,
        sendid: Rank,
        recvid: Rank,
        op: ReduceOp,
    ) {
        self.add_reduce(
            sendbuf,
            sendoffset,
            recvbuf,
            recvoffset,
            count,
            vec![sendid],
            recvid,
            op,
        );
    }

    /// Register the endpoint buffers `run_with` copies through.
    pub fn set_endpoints(
        &mut self,
        sendbuf: u64,
        sendcount: usize,
        recvbuf: u64,
        recvcount: usize,
    ) {
        self.endpoints = Some(Endpoints {
            sendbuf,
            sendcount,
            recvbuf,
            recvcount,
        });
    }

    fn guard_sealed(&self, what: &str) -> bool {
        if self.initialized {
            warn!(what, "plan already compiled; call ignored");
        }
        self.initialized
    }

    /// Compile the declared primitives against `hier`.
    ///
    /// Collective: every rank must call `init` with the same hierarchy and
    /// primitive structure. Fails fast on misconfiguration, leaving no
    /// partial plan behind.
    pub fn init(&mut self, hier: Hierarchy) -> Result<()> {
        if self.initialized {
            return Err(HicollError::AlreadyInitialized);
        }
        self.fabric.barrier()?;
        let begin = Instant::now();

        if let Err(e) = self.build_plan(&hier) {
            self.coll_batch.clear();
            self.command_batch.clear();
            self.release_staging();
            return Err(e);
        }

        let staged_bytes = (self.staged_elems * size_of::<T>()) as u64;
        let all_bytes = self.fabric.allgather(staged_bytes)?;
        if self.diag.on() {
            for (rank, bytes) in all_bytes.iter().copied().enumerate() {
                info!(rank, bytes, "staging memory");
            }
            info!(elapsed = ?begin.elapsed(), "plan compiled");
        }

        self.fabric.barrier()?;
        self.initialized = true;
        Ok(())
    }

    /// `init` with explicit striping and pipelining overrides.
    pub fn init_with(&mut self, hier: Hierarchy, numstripe: usize, numbatch: usize) -> Result<()> {
        self.config.numstripe = numstripe;
        self.config.pipedepth = numbatch;
        self.init(hier)
    }

    fn build_plan(&mut self, hier: &Hierarchy) -> Result<()> {
        let world = self.fabric.size();
        hier.validate_world(world)?;

        if self.config.pipedepth == 0 {
            return Err(HicollError::InvalidBatchCount(0));
        }
        if self.config.numstripe > 1 {
            match hier.node_size() {
                None => return Err(HicollError::StripeNeedsHierarchy(self.config.numstripe)),
                Some(nodesize) if self.config.numstripe > nodesize => {
                    return Err(HicollError::InvalidStripeCount {
                        numstripe: self.config.numstripe,
                        nodesize,
                    });
                }
                Some(_) => {}
            }
        }

        let mut total = 0usize;
        for epoch in &self.epochs {
            for (i, b) in epoch.bcasts.iter().enumerate() {
                b.validate(world, i)?;
            }
            for (i, r) in epoch.reduces.iter().enumerate() {
                r.validate(world, i)?;
            }
            total += epoch.bcasts.len() + epoch.reduces.len();
        }
        if total == 0 {
            return Err(HicollError::EmptyPlan);
        }

        self.log_parameters(hier);

        let numbatch = self.config.pipedepth;
        let mut coll_batch: Vec<Vec<Coll>> = vec![Vec::new(); numbatch];
        let epochs = self.epochs.clone();
        let reduce_order = self.config.reduce_order;
        let ring_on = self.config.ring_enabled();

        let mut ctx = PlanCtx {
            hier,
            config: &self.config,
            rank: self.fabric.rank(),
            elem: size_of::<T>(),
            adapter: &self.adapter,
            staging: &mut self.staging,
            staged_elems: &mut self.staged_elems,
        };

        for epoch in &epochs {
            if !epoch.bcasts.is_empty() {
                let batches = partition::partition_bcasts(&epoch.bcasts, numbatch);
                for (b, mut list) in batches.into_iter().enumerate() {
                    let mut split: Vec<Reduce> = Vec::new();
                    stripe::stripe_bcasts(&mut ctx, &mut list, &mut split)?;
                    tree::reduce_tree(&mut ctx, split, 1, &mut coll_batch[b])?;
                    let mut residual: Vec<Broadcast> = Vec::new();
                    if ring_on {
                        ring::bcast_ring(&mut ctx, list, &mut coll_batch[b], &mut residual)?;
                    } else {
                        residual = list;
                    }
                    tree::bcast_tree(&mut ctx, residual, 1, &mut coll_batch[b])?;
                }
            }
            if !epoch.reduces.is_empty() {
                let batches = partition::partition_reduces(&epoch.reduces, numbatch);
                for (b, mut list) in batches.into_iter().enumerate() {
                    let mut merge: Vec<Broadcast> = Vec::new();
                    let mut residual: Vec<Reduce> = Vec::new();
                    match reduce_order {
                        ReduceOrder::StripeThenRing => {
                            stripe::stripe_reduces(&mut ctx, &mut list, &mut merge)?;
                            if ring_on {
                                ring::reduce_ring(&mut ctx, list, &mut coll_batch[b], &mut residual)?;
                            } else {
                                residual = list;
                            }
                        }
                        ReduceOrder::RingThenStripe => {
                            if ring_on {
                                ring::reduce_ring(&mut ctx, list, &mut coll_batch[b], &mut residual)?;
                            } else {
                                residual = list;
                            }
                            stripe::stripe_reduces(&mut ctx, &mut residual, &mut merge)?;
                        }
                    }
                    tree::reduce_tree(&mut ctx, residual, 1, &mut coll_batch[b])?;
                    tree::bcast_tree(&mut ctx, merge, 1, &mut coll_batch[b])?;
                }
            }
        }

        self.coll_batch = coll_batch;
        self.command_batch = implement::implement(
            self.coll_batch.clone(),
            &self.fabric,
            &self.adapter,
            T::DTYPE,
        )?;

        // Stagger batch starts so batch b issues its first real command at
        // time step b. The fill commands must be true no-ops.
        for (b, commands) in self.command_batch.iter_mut().enumerate() {
            if b == 0 {
                continue;
            }
            let mut prefix = Vec::with_capacity(b + commands.len());
            for _ in 0..b {
                let dummy = self.fabric.open(Library::Msg)?;
                assert!(
                    dummy.numsend() == 0 && dummy.numrecv() == 0,
                    "pipeline-fill command must be a no-op"
                );
                prefix.push(Command {
                    comm: dummy,
                    compute: None,
                });
            }
            prefix.append(commands);
            *commands = prefix;
        }
        Ok(())
    }

    fn log_parameters(&self, hier: &Hierarchy) {
        if !self.diag.on() {
            return;
        }
        info!(
            epochs = self.epochs.len(),
            numstripe = self.config.numstripe,
            ringnodes = self.config.ringnodes,
            pipedepth = self.config.pipedepth,
            "compiling plan"
        );
        for (level, (&size, &lib)) in hier.sizes().iter().zip(hier.libs().iter()).enumerate() {
            info!(level, groupsize = size, library = %lib, "hierarchy level");
        }
        for (e, epoch) in self.epochs.iter().enumerate() {
            info!(
                epoch = e,
                bcasts = epoch.bcasts.len(),
                reduces = epoch.reduces.len(),
                "epoch contents"
            );
        }
    }

    /// Execute the compiled pipeline once.
    pub fn run(&mut self) -> Result<()> {
        if !self.initialized {
            return Err(HicollError::NotInitialized);
        }
        executor::overlap_run(&mut self.command_batch)
    }

    /// Execute with user buffers copied through the registered endpoints.
    pub fn run_with(&mut self, sendbuf: u64, recvbuf: u64) -> Result<()> {
        let (ep_send, sendcount, ep_recv, recvcount) = {
            let ep = self
                .endpoints
                .as_ref()
                .ok_or(HicollError::EndpointsNotSet)?;
            (ep.sendbuf, ep.sendcount, ep.recvbuf, ep.recvcount)
        };
        unsafe {
            self.adapter
                .copy_within_device(ep_send, sendbuf, sendcount * size_of::<T>())?;
        }
        self.run()?;
        unsafe {
            self.adapter
                .copy_within_device(recvbuf, ep_recv, recvcount * size_of::<T>())?;
        }
        Ok(())
    }

    /// Per-command calibration. Collective: all ranks walk their command
    /// lists in lockstep.
    pub fn measure(&mut self, warmup: u32, numiter: u32) -> Result<()> {
        if !self.initialized {
            return Err(HicollError::NotInitialized);
        }
        if self.diag.on() {
            info!(
                pipedepth = self.command_batch.len(),
                commands = self.command_batch.first().map_or(0, Vec::len),
                "measuring commands"
            );
        }
        self.fabric.barrier()?;
        let mut cursor = vec![0usize; self.command_batch.len()];
        loop {
            let mut finished = true;
            for (i, batch) in self.command_batch.iter_mut().enumerate() {
                if let Some(cmd) = batch.get_mut(cursor[i]) {
                    finished = false;
                    let elapsed = cmd.comm.measure(warmup, numiter)?;
                    if self.diag.on() {
                        info!(
                            batch = i,
                            step = cursor[i],
                            library = %cmd.comm.library(),
                            numsend = cmd.numsend(),
                            numrecv = cmd.numrecv(),
                            ?elapsed,
                            "command measured"
                        );
                    }
                    cursor[i] += 1;
                }
            }
            if finished {
                return Ok(());
            }
        }
    }

    /// Structural dump of batch 0's command list.
    pub fn report(&self) {
        if !self.diag.on() {
            return;
        }
        info!(
            pipedepth = self.command_batch.len(),
            commands = self.command_batch.first().map_or(0, Vec::len),
            "plan structure"
        );
        for (step, cmd) in self.command_batch.first().iter().flat_map(|b| b.iter()).enumerate() {
            info!(
                step,
                library = %cmd.comm.library(),
                numsend = cmd.numsend(),
                numrecv = cmd.numrecv(),
                numcomp = cmd.numcomp(),
                "command"
            );
        }
    }

    /// Per-step wall times with barriers around the start and wait phases,
    /// preceded by the per-batch command table.
    pub fn time(&mut self) -> Result<Duration> {
        if !self.initialized {
            return Err(HicollError::NotInitialized);
        }
        if self.diag.on() {
            let mut cursor = vec![0usize; self.command_batch.len()];
            let mut step = 0usize;
            loop {
                let mut row = String::new();
                let mut active = false;
                for (i, batch) in self.command_batch.iter().enumerate() {
                    match batch.get(cursor[i]) {
                        Some(cmd) => {
                            active = true;
                            let cell = format!(
                                " {}+{} {}{} |",
                                cmd.numsend(),
                                cmd.numrecv(),
                                cmd.comm.library(),
                                if cmd.numcomp() > 0 {
                                    format!(" {}*", cmd.numcomp())
                                } else {
                                    String::new()
                                }
                            );
                            row.push_str(&cell);
                            cursor[i] += 1;
                        }
                        None => row.push_str("         |"),
                    }
                }
                if !active {
                    break;
                }
                info!(step, row = %row, "pipeline step");
                step += 1;
            }
        }

        let mut cursor = vec![0usize; self.command_batch.len()];
        let mut total_start = Duration::ZERO;
        let mut total_wait = Duration::ZERO;
        self.fabric.barrier()?;
        let whole = Instant::now();
        let mut step = 0usize;
        loop {
            self.fabric.barrier()?;
            let t0 = Instant::now();
            let mut finished = true;
            for (i, batch) in self.command_batch.iter_mut().enumerate() {
                if let Some(cmd) = batch.get_mut(cursor[i]) {
                    cmd.comm.start()?;
                    finished = false;
                }
            }
            self.fabric.barrier()?;
            let start_time = t0.elapsed();
            // Finish collectively so no rank is left at a barrier.
            let finished_all = self.fabric.allgather(u64::from(finished))?;
            if finished_all.iter().any(|&f| f != 0) {
                break;
            }
            let t0 = Instant::now();
            for i in (0..self.command_batch.len()).rev() {
                if let Some(cmd) = self.command_batch[i].get_mut(cursor[i]) {
                    cmd.comm.wait()?;
                    if let Some(compute) = cmd.compute.as_mut() {
                        compute.start()?;
                        compute.wait()?;
                    }
                    cursor[i] += 1;
                }
            }
            self.fabric.barrier()?;
            let wait_time = t0.elapsed();
            if self.diag.on() {
                info!(step, start = ?start_time, wait = ?wait_time, "step timed");
            }
            total_start += start_time;
            total_wait += wait_time;
            step += 1;
        }
        let total = whole.elapsed();
        if self.diag.on() {
            info!(?total_start, ?total_wait, ?total, "pipeline timed");
        }
        Ok(total)
    }

    /// The pre-lowering plan, one coll list per batch.
    pub fn plan(&self) -> &[Vec<Coll>] {
        &self.coll_batch
    }

    /// The lowered plan, one command list per batch (fill commands
    /// included).
    pub fn commands(&self) -> &[Vec<Command>] {
        &self.command_batch
    }

    fn release_staging(&mut self) {
        for buf in self.staging.drain(..) {
            unsafe { self.adapter.dealloc(buf.ptr, buf.bytes) };
        }
        self.staged_elems = 0;
    }
}

impl<T: Scalar> Drop for Communicator<T> {
    fn drop(&mut self) {
        self.release_staging();
    }
}
