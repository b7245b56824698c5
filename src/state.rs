//! The s390x register file as one fixed, indexable snapshot.

use std::ops::{Index, IndexMut};

use bitflags::bitflags;
use strum::{EnumCount, EnumIter};

/// The registers a record can describe, in encoding order.
///
/// The discriminants are the flag-bit positions in the record header, so the
/// order here is load-bearing: encoder and decoder both walk it front to
/// back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumCount, EnumIter)]
pub enum Reg {
    /// PSW instruction address.
    PswAddr,
    /// PSW mode/flags mask.
    PswMask,
    Gpr0,
    Gpr1,
    Gpr2,
    Gpr3,
    Gpr4,
    Gpr5,
    Gpr6,
    Gpr7,
    Gpr8,
    Gpr9,
    Gpr10,
    Gpr11,
    Gpr12,
    Gpr13,
    Gpr14,
    Gpr15,
}

impl Reg {
    pub fn name(self) -> &'static str {
        [
            "pswa", "pswm", "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10",
            "r11", "r12", "r13", "r14", "r15",
        ][self as usize]
    }
}

/// The program-status word as the kernel hands it out.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct Psw {
    pub mask: u64,
    pub addr: u64,
}

/// The NT_PRSTATUS regset blob for s390x: PSW, general purpose registers,
/// access registers and the saved syscall argument. Only the PSW and the
/// GPRs enter a [`Snapshot`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[repr(C)]
pub struct S390Regs {
    pub psw: Psw,
    pub gprs: [u64; 16],
    pub acrs: [u32; 16],
    pub orig_gpr2: u64,
}

bitflags! {
    /// Single-bit fields of the PSW mask (PSW bit 0 is the most significant
    /// bit of the word).
    #[derive(Clone, Copy, Debug, PartialEq)]
    pub struct PswFlags: u64 {
        const PER = 1 << 62;
        const DAT = 1 << 58;
        const IO = 1 << 57;
        const EXT = 1 << 56;
        // 8-11 is the key, 12 is zero in z/Architecture mode
        const MCHECK = 1 << 50;
        const WAIT = 1 << 49;
        const PSTATE = 1 << 48;
        // 16-17 address-space control, 18-19 condition code,
        // 20-23 program mask
        const RI = 1 << 39;
        const EA = 1 << 32;
        const BA = 1 << 31;
    }
}

/// One full capture of the architectural register state, indexed by [`Reg`].
///
/// A value type: the tracer keeps two of these and swaps their roles every
/// step instead of copying.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Snapshot {
    regs: [u64; Reg::COUNT],
}

impl From<&S390Regs> for Snapshot {
    fn from(raw: &S390Regs) -> Self {
        let mut regs = [0; Reg::COUNT];
        regs[Reg::PswAddr as usize] = raw.psw.addr;
        regs[Reg::PswMask as usize] = raw.psw.mask;
        for (slot, gpr) in regs[Reg::Gpr0 as usize..].iter_mut().zip(raw.gprs) {
            *slot = gpr;
        }
        Self { regs }
    }
}

impl Index<Reg> for Snapshot {
    type Output = u64;

    fn index(&self, reg: Reg) -> &u64 {
        &self.regs[reg as usize]
    }
}

impl IndexMut<Reg> for Snapshot {
    fn index_mut(&mut self, reg: Reg) -> &mut u64 {
        &mut self.regs[reg as usize]
    }
}

impl Snapshot {
    pub fn psw_flags(&self) -> PswFlags {
        PswFlags::from_bits_truncate(self[Reg::PswMask])
    }

    /// Condition code, PSW bits 18-19.
    pub fn cc(&self) -> u8 {
        ((self[Reg::PswMask] >> 44) & 0b11) as u8
    }
}
