//! The step loop: run the target one instruction at a time and stream a
//! record for each.

use std::io::Write;
use std::mem;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::insn::{self, FetchError};
use crate::record::diff;
use crate::state::{Reg, Snapshot};
use crate::target::{Target, TargetError};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The target stopped for something other than the single-step trap.
    /// Registers may have changed unobserved, so the trace cannot go on.
    #[error("target stopped unexpectedly: {0:?}")]
    UnexpectedStop(WaitStatus),
    #[error("writing the trace failed: {0}")]
    Write(#[source] std::io::Error),
}

/// Drives a freshly spawned target to completion one instruction at a time,
/// writing one record per executed instruction.
pub struct Tracer<T, W> {
    pub target: T,
    pub out: W,
    /// Put the fetched instruction bytes into every record.
    pub capture_insn: bool,
}

impl<T: Target, W: Write> Tracer<T, W> {
    /// Run the target until it exits and return its exit code.
    ///
    /// The first record diffs against an all-zero state, so replaying the
    /// stream from zero reproduces every snapshot the tracer saw.
    pub fn run(&mut self) -> Result<i32, TraceError> {
        let outcome = self.step_loop();
        // The loop error wins over a flush error, losing trace data matters
        // less than why we stopped tracing.
        let flushed = self.out.flush();
        let code = outcome?;
        flushed.map_err(TraceError::Write)?;
        Ok(code)
    }

    fn step_loop(&mut self) -> Result<i32, TraceError> {
        let mut cur;
        let mut prev = Snapshot::default();
        let mut records: u64 = 0;

        loop {
            cur = Snapshot::from(&self.target.regs()?);
            let pswa = cur[Reg::PswAddr];
            let insn = insn::fetch(&mut self.target, pswa)?;
            if records == 0 {
                debug!(
                    "first stop at {pswa:#x}, flags {:?}, cc {}",
                    cur.psw_flags(),
                    cur.cc()
                );
            }

            let record = diff(&cur, &prev, self.capture_insn.then_some(insn));
            trace!(
                "step {records} pswa={pswa:#x} cc={} insn={} | {record}",
                cur.cc(),
                hex::encode(insn.bytes())
            );
            record.write_to(&mut self.out).map_err(TraceError::Write)?;
            records += 1;

            self.target.step()?;
            match self.target.wait()? {
                WaitStatus::Exited(_, code) => {
                    info!("target exited with {code} after {records} records");
                    return Ok(code);
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
                status => return Err(TraceError::UnexpectedStop(status)),
            }

            mem::swap(&mut cur, &mut prev);
        }
    }
}
