//! Spawning and controlling the traced process.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::process;

use anyhow::Context;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::S390Regs;

/// Process-control operations the tracer needs from the kernel.
///
/// [`Ptraced`] is the real thing; tests script their own.
pub trait Target {
    /// Read the full register set of the stopped target.
    fn regs(&mut self) -> Result<S390Regs, TargetError>;

    /// pread from the target's memory image. `Ok(0)` means the channel no
    /// longer refers to the target's current address space.
    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, TargetError>;

    /// Replace the memory channel after the address space went away.
    fn reopen_mem(&mut self) -> Result<(), TargetError>;

    /// Resume the target for exactly one instruction.
    fn step(&mut self) -> Result<(), TargetError>;

    /// Block until the target stops or terminates.
    fn wait(&mut self) -> Result<WaitStatus, TargetError>;
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("ptrace {op} failed: {errno}")]
    Ptrace { op: &'static str, errno: Errno },
    #[error("waitpid failed: {0}")]
    Wait(Errno),
    #[error("opening {path} failed: {source}")]
    OpenMem { path: String, source: io::Error },
    #[error("reading target memory at {addr:#x} failed: {source}")]
    ReadMem { addr: u64, source: io::Error },
}

/// A child process under PTRACE_TRACEME, held in its pre-exec stop.
pub struct Ptraced {
    pid: Pid,
    mem: File,
}

impl Ptraced {
    /// Fork the program to trace.
    ///
    /// The child requests tracing of itself and stops before exec, so every
    /// instruction of the new program is observed from the first one on.
    pub fn spawn(command: &[String]) -> anyhow::Result<Self> {
        anyhow::ensure!(!command.is_empty(), "no program to trace");
        let argv = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("argument contains a NUL byte")?;

        let child = match unsafe { fork() }.context("fork failed")? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                // Reached only if the setup fails, exec does not return.
                let errno = trace_self_and_exec(&argv);
                eprintln!("steplog: exec {}: {}", command[0], errno.desc());
                process::exit(1);
            }
        };
        debug!("forked {child}, waiting for it to stop itself");

        match waitpid(child, Some(WaitPidFlag::WUNTRACED))
            .context("waitpid for the initial stop failed")?
        {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => anyhow::bail!("target did not stop for tracing: {status:?}"),
        }
        let mem = Self::open_mem(child)?;
        info!("target {child} stopped before exec of {}", command[0]);

        Ok(Self { pid: child, mem })
    }

    fn open_mem(pid: Pid) -> Result<File, TargetError> {
        let path = format!("/proc/{pid}/mem");
        File::open(&path).map_err(|source| TargetError::OpenMem { path, source })
    }
}

impl Target for Ptraced {
    fn regs(&mut self) -> Result<S390Regs, TargetError> {
        let mut regs = S390Regs::default();
        let mut iov = libc::iovec {
            iov_base: (&mut regs as *mut S390Regs).cast(),
            iov_len: std::mem::size_of::<S390Regs>(),
        };
        // nix has no typed wrapper for this regset, so go through libc.
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                self.pid.as_raw(),
                libc::NT_PRSTATUS as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec,
            )
        };
        Errno::result(rc)
            .map(|_| regs)
            .map_err(|errno| TargetError::Ptrace { op: "GETREGSET", errno })
    }

    fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, TargetError> {
        self.mem
            .read_at(buf, addr)
            .map_err(|source| TargetError::ReadMem { addr, source })
    }

    fn reopen_mem(&mut self) -> Result<(), TargetError> {
        self.mem = Self::open_mem(self.pid)?;
        Ok(())
    }

    fn step(&mut self) -> Result<(), TargetError> {
        // No signal is passed on, this also swallows the pending SIGSTOP on
        // the first step.
        ptrace::step(self.pid, None).map_err(|errno| TargetError::Ptrace {
            op: "SINGLESTEP",
            errno,
        })
    }

    fn wait(&mut self) -> Result<WaitStatus, TargetError> {
        waitpid(self.pid, Some(WaitPidFlag::__WALL)).map_err(TargetError::Wait)
    }
}

/// Child side of the fork, returns only on failure.
fn trace_self_and_exec(argv: &[CString]) -> Errno {
    if let Err(errno) = ptrace::traceme() {
        return errno;
    }
    // Parks the child until the parent is ready to drive it.
    if let Err(errno) = signal::raise(Signal::SIGSTOP) {
        return errno;
    }
    match execvp(&argv[0], argv) {
        Ok(never) => match never {},
        Err(errno) => errno,
    }
}
