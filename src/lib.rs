//! This library provides a lock-free, fixed-capacity, content-addressed set of
//! `(u64, u64)` pairs, the unique-node table of a decision-diagram engine.
//! Inserting a pair returns a stable 44-bit index that is used as a compact
//! handle in place of a pointer. Deletion is bulk only and driven by an
//! external mark-sweep collector through [`UniqueTable::clear`],
//! [`UniqueTable::mark`] and [`UniqueTable::rehash`].

mod bitvec;
mod gc;
mod hash;
/// The concurrent unique table and its per-worker lookup handles.
pub mod table;

pub use crate::table::{EqualsCallback, HashCallback, UniqueTable, Worker};
