#![allow(clippy::derive_partial_eq_without_eq)]

pub mod insn;
pub mod record;
pub mod state;
pub mod target;
pub mod tracer;
