//! Overlap execution.
//!
//! One cursor per batch walks that batch's command list. Every time step
//! starts the current command of each still-active batch, then waits on
//! them, then runs their folds and advances. Commands within a batch stay
//! strictly ordered; commands of different batches share each time step,
//! which is where the pipeline overlap comes from.

use crate::error::Result;
use crate::planner::Command;

pub fn overlap_run(batches: &mut [Vec<Command>]) -> Result<()> {
    let mut cursor = vec![0usize; batches.len()];
    loop {
        let mut finished = true;
        for (i, batch) in batches.iter_mut().enumerate() {
            if let Some(cmd) = batch.get_mut(cursor[i]) {
                cmd.comm.start()?;
                finished = false;
            }
        }
        if finished {
            return Ok(());
        }
        // Folds overlap the next batch's wire time, so kick them off as
        // soon as each wait returns.
        for i in (0..batches.len()).rev() {
            if let Some(cmd) = batches[i].get_mut(cursor[i]) {
                cmd.comm.wait()?;
                if let Some(compute) = cmd.compute.as_mut() {
                    compute.start()?;
                }
            }
        }
        for (i, batch) in batches.iter_mut().enumerate() {
            if let Some(cmd) = batch.get_mut(cursor[i]) {
                if let Some(compute) = cmd.compute.as_mut() {
                    compute.wait()?;
                }
                cursor[i] += 1;
            }
        }
    }
}
