//! Packet-processing concurrency primitives: a bounded MPMC ring (standard and
//! lock-free), quiescent-state-based reclamation, a lock-protected bounded
//! stack and a FIFO ticket lock, over a pluggable bulk allocator.

// Module naming follows project convention (CamelCase namespaces)
#[allow(non_snake_case)]
pub mod Core;
#[allow(non_snake_case)]
pub mod Debug;
#[allow(non_snake_case)]
pub mod Lock;
#[allow(non_snake_case)]
pub mod Rcu;
#[allow(non_snake_case)]
pub mod Ring;
#[allow(non_snake_case)]
pub mod Stack;

pub mod error;

pub use error::{Error, Result};
