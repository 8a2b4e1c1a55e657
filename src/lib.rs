//! Shadowfuzz instrumentation core.
//!
//! The crate is the observation layer of a greybox fuzzer for EVM targets: a set
//! of tracers that ride inside the `revm` interpreter and, per transaction,
//! simultaneously compute fitness signals (coverage maps, comparison/branch
//! distances, dataflow pairs, storage-write and token-flow fingerprints) and run
//! a catalog of bug oracles (reentrancy, integer overflow, ether leaking, block
//! dependency, self-destruct reachability, unsafe delegatecall).
//!
//! The outer driver (CLI, compilation, seed scheduling, corpus persistence) is an
//! external collaborator; it wires tracers to a [`chain::TestChain`] through
//! [`fuzzing::FuzzerWorker`] and folds per-transaction results into
//! [`fuzzing::metrics::FuzzerMetrics`].

pub mod bugs;
pub mod chain;
pub mod error;
pub mod fitness;
pub mod fuzzing;
pub mod utils;
