//! Fetching the instruction the target is about to execute.

use thiserror::Error;

use crate::target::{Target, TargetError};

/// Longest instruction format of the architecture.
pub const MAX_INSN_LEN: usize = 6;

/// Instruction length in bytes, decided by the two top bits of the first
/// opcode byte.
pub const fn ilen(opcode: u8) -> usize {
    match opcode >> 6 {
        0b00 => 2,
        0b01 | 0b10 => 4,
        _ => 6,
    }
}

/// The bytes of one fetched instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Insn {
    bytes: [u8; MAX_INSN_LEN],
    len: usize,
}

impl Insn {
    /// `raw` must be exactly one instruction, length per [`ilen`].
    pub fn new(raw: &[u8]) -> Self {
        debug_assert_eq!(raw.len(), ilen(raw[0]));
        let mut bytes = [0; MAX_INSN_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Self {
            bytes,
            len: raw.len(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The memory channel kept reading as empty even after a reopen.
    #[error("unreadable instruction memory at {addr:#x}")]
    UnexpectedEof { addr: u64 },
    #[error("incomplete instruction at {addr:#x}: wanted {need} bytes, got {got}")]
    Truncated { addr: u64, need: usize, got: usize },
    #[error(transparent)]
    Target(#[from] TargetError),
}

/// Read the instruction at `pswa` from the target.
///
/// Over-reads to the maximum length and trims to the decoded one. A
/// zero-byte read means exec replaced the address space and the channel
/// went stale with the old one, so it is reopened and the read retried,
/// once.
pub fn fetch<T: Target>(target: &mut T, pswa: u64) -> Result<Insn, FetchError> {
    let mut buf = [0; MAX_INSN_LEN];
    let mut reopened = false;
    loop {
        let got = target.read_mem(pswa, &mut buf)?;
        if got == 0 {
            if reopened {
                return Err(FetchError::UnexpectedEof { addr: pswa });
            }
            target.reopen_mem()?;
            reopened = true;
            continue;
        }
        let need = ilen(buf[0]);
        if got < need {
            return Err(FetchError::Truncated {
                addr: pswa,
                need,
                got,
            });
        }
        return Ok(Insn::new(&buf[..need]));
    }
}

#[cfg(test)]
mod tests {
    use super::{fetch, ilen, FetchError, Insn, MAX_INSN_LEN};
    use crate::state::S390Regs;
    use crate::target::{Target, TargetError};
    use nix::sys::wait::WaitStatus;

    #[test]
    fn length_classes() {
        // bcr, balr
        assert_eq!(ilen(0x07), 2);
        assert_eq!(ilen(0x05), 2);
        // lr and friends
        assert_eq!(ilen(0x18), 2);
        // a, st
        assert_eq!(ilen(0x5a), 4);
        assert_eq!(ilen(0x50), 4);
        // ahi (a7xx), stm
        assert_eq!(ilen(0xa7), 4);
        assert_eq!(ilen(0x90), 4);
        // larl, lg
        assert_eq!(ilen(0xc0), 6);
        assert_eq!(ilen(0xe3), 6);
        // class boundaries
        assert_eq!(ilen(0x00), 2);
        assert_eq!(ilen(0x3f), 2);
        assert_eq!(ilen(0x40), 4);
        assert_eq!(ilen(0xbf), 4);
        assert_eq!(ilen(0xc0), 6);
        assert_eq!(ilen(0xff), 6);
    }

    #[test]
    fn insn_keeps_only_decoded_bytes() {
        let insn = Insn::new(&[0xa7, 0x1a, 0x00, 0x01]);
        assert_eq!(insn.bytes(), &[0xa7, 0x1a, 0x00, 0x01]);
    }

    /// A target that is only memory: a little image plus a scriptable number
    /// of reads that pretend the channel went stale.
    struct MemOnly {
        base: u64,
        image: Vec<u8>,
        empty_reads: usize,
        reopens: usize,
    }

    impl MemOnly {
        fn new(base: u64, image: &[u8]) -> Self {
            Self {
                base,
                image: image.to_vec(),
                empty_reads: 0,
                reopens: 0,
            }
        }
    }

    impl Target for MemOnly {
        fn regs(&mut self) -> Result<S390Regs, TargetError> {
            unreachable!("fetch never asks for registers")
        }

        fn read_mem(&mut self, addr: u64, buf: &mut [u8]) -> Result<usize, TargetError> {
            if self.empty_reads > 0 {
                self.empty_reads -= 1;
                return Ok(0);
            }
            let off = (addr - self.base) as usize;
            let n = buf.len().min(self.image.len().saturating_sub(off));
            buf[..n].copy_from_slice(&self.image[off..off + n]);
            Ok(n)
        }

        fn reopen_mem(&mut self) -> Result<(), TargetError> {
            self.reopens += 1;
            Ok(())
        }

        fn step(&mut self) -> Result<(), TargetError> {
            unreachable!("fetch never steps")
        }

        fn wait(&mut self) -> Result<WaitStatus, TargetError> {
            unreachable!("fetch never waits")
        }
    }

    #[test]
    fn fetch_trims_to_decoded_length() {
        let mut target = MemOnly::new(0x1000, &[0xa7, 0x1a, 0x00, 0x01, 0x07, 0xfe]);
        let insn = fetch(&mut target, 0x1000).unwrap();
        assert_eq!(insn.bytes(), &[0xa7, 0x1a, 0x00, 0x01]);
        // 2-byte fetch right at the end of the image
        let insn = fetch(&mut target, 0x1004).unwrap();
        assert_eq!(insn.bytes(), &[0x07, 0xfe]);
        assert_eq!(target.reopens, 0);
    }

    #[test]
    fn stale_channel_is_reopened_once() {
        let mut target = MemOnly::new(0x1000, &[0x07, 0xfe]);
        target.empty_reads = 1;
        let insn = fetch(&mut target, 0x1000).unwrap();
        assert_eq!(insn.bytes(), &[0x07, 0xfe]);
        assert_eq!(target.reopens, 1);
    }

    #[test]
    fn empty_read_after_reopen_is_fatal() {
        let mut target = MemOnly::new(0x1000, &[0x07, 0xfe]);
        target.empty_reads = 2;
        match fetch(&mut target, 0x1000) {
            Err(FetchError::UnexpectedEof { addr }) => assert_eq!(addr, 0x1000),
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
        assert_eq!(target.reopens, 1);
    }

    #[test]
    fn short_read_is_fatal() {
        // first byte says 6-byte format, image ends after 2
        let mut target = MemOnly::new(0x1000, &[0xc0, 0x04]);
        match fetch(&mut target, 0x1000) {
            Err(FetchError::Truncated { addr, need, got }) => {
                assert_eq!(addr, 0x1000);
                assert_eq!(need, 6);
                assert_eq!(got, 2);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn max_covers_every_class() {
        for opcode in 0..=u8::MAX {
            assert!(ilen(opcode) <= MAX_INSN_LEN);
        }
    }
}
