//! The decision layer of an ELF static linker's relocation handling. Given symbols and input
//! sections produced by an object reader, the scanner classifies every relocation, accumulates
//! per-symbol requirements, then a serial resolver materializes GOT/PLT/copy-relocation entries
//! and dynamic relocations, and a fixpoint pass inserts branch-range-extension thunks once
//! tentative addresses are known.

pub mod aarch64;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod flags;
pub(crate) mod hash;
pub mod input;
pub mod resolve;
pub mod scan;
pub mod sections;
pub mod symbol;
pub mod target;
pub(crate) mod tls;
pub mod thunks;
pub mod x86_64;

#[cfg(test)]
pub(crate) mod test_utils;
