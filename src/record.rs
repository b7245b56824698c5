//! The trace stream: one record per executed instruction.
//!
//! A record starts with an 8-byte header
//!
//! ```text
//!     b1 b2 b3 f1 f2 f3 f4 f5
//! ```
//!
//! followed by zero or more 8-byte values and, possibly, instruction bytes.
//! Flag bits 0-17 mean the new value of the corresponding register follows
//! as a trailing value, in ascending register order. Flag bits 18-35 mean
//! the signed difference to the old value is stored in byte b1, b2 or b3.
//! Bit 36 means instruction bytes trail the record. Everything is in the
//! byte order of the machine that wrote the trace.

use std::fmt;
use std::io::{self, Read, Write};

use strum::{EnumCount, IntoEnumIterator};

use crate::insn::{ilen, Insn, MAX_INSN_LEN};
use crate::state::{Reg, Snapshot};

/// Signed-byte difference slots in the header.
pub const DELTA_SLOTS: usize = 3;

/// Instruction bytes are present.
const FLAG_INSN: u64 = 1 << (2 * Reg::COUNT);

const fn full_bit(reg: Reg) -> u64 {
    1 << (reg as usize)
}

const fn delta_bit(reg: Reg) -> u64 {
    1 << (Reg::COUNT + reg as usize)
}

/// Slots fill from the top byte of the header down.
const fn delta_shift(slot: usize) -> u32 {
    56 - 8 * slot as u32
}

/// One encoded step: the header word, the full values it refers to and,
/// optionally, the instruction the target was about to execute.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    header: u64,
    values: Vec<u64>,
    insn: Option<Insn>,
}

/// How one register's change is carried in a record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Change {
    /// Signed difference to the previous value, from a header slot.
    Delta(i8),
    /// Replacement value from a trailing word.
    Value(u64),
}

/// Encode the registers that changed between `old` and `new`.
///
/// A changed register whose difference fits a signed byte takes a header
/// slot while one is free, every other change is stored as a full value.
/// Differences wrap, so a counter crossing 2^64 still counts as small.
pub fn diff(new: &Snapshot, old: &Snapshot, insn: Option<Insn>) -> Record {
    let mut header = 0;
    let mut values = Vec::new();
    if insn.is_some() {
        header |= FLAG_INSN;
    }

    let mut slot = 0;
    for reg in Reg::iter() {
        let delta = new[reg].wrapping_sub(old[reg]) as i64;
        if delta == 0 {
            continue;
        }
        if slot < DELTA_SLOTS && (-128..=127).contains(&delta) {
            header |= (delta as u64 & 0xff) << delta_shift(slot);
            header |= delta_bit(reg);
            slot += 1;
        } else {
            header |= full_bit(reg);
            values.push(new[reg]);
        }
    }

    Record {
        header,
        values,
        insn,
    }
}

impl Record {
    pub fn header(&self) -> u64 {
        self.header
    }

    pub fn insn(&self) -> Option<&Insn> {
        self.insn.as_ref()
    }

    /// The changes this record carries, in register order.
    pub fn changes(&self) -> impl Iterator<Item = (Reg, Change)> + '_ {
        let header = self.header;
        let mut values = self.values.iter();
        let mut slot = 0;
        Reg::iter().filter_map(move |reg| {
            if header & delta_bit(reg) != 0 {
                let delta = (header >> delta_shift(slot)) as u8 as i8;
                slot += 1;
                Some((reg, Change::Delta(delta)))
            } else if header & full_bit(reg) != 0 {
                let value = *values.next().expect("header flag without a value");
                Some((reg, Change::Value(value)))
            } else {
                None
            }
        })
    }

    /// Replay this record on top of `state`.
    pub fn apply(&self, state: &mut Snapshot) {
        for (reg, change) in self.changes() {
            state[reg] = match change {
                Change::Delta(delta) => state[reg].wrapping_add(delta as u64),
                Change::Value(value) => value,
            };
        }
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.header.to_ne_bytes())?;
        for value in &self.values {
            out.write_all(&value.to_ne_bytes())?;
        }
        if let Some(insn) = &self.insn {
            out.write_all(insn.bytes())?;
        }
        Ok(())
    }

    /// Read the next record. `Ok(None)` is a clean end of the stream, end of
    /// input inside a record is an error.
    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Option<Self>> {
        let mut word = [0; 8];
        match input.read_exact(&mut word[..1]) {
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            result => result?,
        }
        input.read_exact(&mut word[1..])?;
        let header = u64::from_ne_bytes(word);

        let mut values = Vec::new();
        for reg in Reg::iter() {
            if header & full_bit(reg) != 0 {
                input.read_exact(&mut word)?;
                values.push(u64::from_ne_bytes(word));
            }
        }

        let insn = if header & FLAG_INSN != 0 {
            let mut bytes = [0; MAX_INSN_LEN];
            input.read_exact(&mut bytes[..1])?;
            let len = ilen(bytes[0]);
            input.read_exact(&mut bytes[1..len])?;
            Some(Insn::new(&bytes[..len]))
        } else {
            None
        };

        Ok(Some(Self {
            header,
            values,
            insn,
        }))
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut any = false;
        for (reg, change) in self.changes() {
            if any {
                f.write_str(" ")?;
            }
            any = true;
            match change {
                Change::Delta(delta) => write!(f, "{}{:+}", reg.name(), delta)?,
                Change::Value(value) => write!(f, "{}={:x}", reg.name(), value)?,
            }
        }
        if !any {
            f.write_str("unchanged")?;
        }
        Ok(())
    }
}
