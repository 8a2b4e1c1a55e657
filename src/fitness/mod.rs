//! Fitness-signal tracers and their per-tx / cross-tx containers.
//!
//! Every tracer follows the same frame discipline: a pending container is pushed
//! on frame entry, filled during `on_step`, and on frame exit either merged into
//! the parent's pending container (or the tx-scoped container at the top level)
//! or — when the frame reverted — cleared first so it contributes nothing.

pub mod branch_coverage;
pub mod branch_distance;
pub mod branch_map;
pub mod cmp_distance;
pub mod code_coverage;
pub mod dataflow;
pub mod storage_write;
pub mod token_flow;

use alloy::primitives::{Address, U256};
use std::collections::HashSet;
use std::fmt;

/// A unique instruction site: code address, init/runtime discriminator, pc.
/// Formats as `<addr>[c]:<hex pc>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramPosition {
    pub address: Address,
    /// Whether `pc` points into init bytecode.
    pub create: bool,
    pub pc: u64,
}

impl fmt::Display for ProgramPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{:x}",
            self.address,
            if self.create { "c" } else { "" },
            self.pc
        )
    }
}

/// A storage variable: owning contract plus slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageSlotKey {
    pub address: Address,
    pub slot: U256,
}

impl fmt::Display for StorageSlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.address, self.slot)
    }
}

/// Apply the optional initial-contracts filter to an address before it keys a
/// coverage or distance map. Addresses outside the set are zeroed so ephemeral
/// callees cannot blow the maps up.
pub(crate) fn address_for_coverage(
    initial_contracts: Option<&HashSet<Address>>,
    address: Address,
) -> Address {
    match initial_contracts {
        None => address,
        Some(set) if set.contains(&address) => address,
        Some(_) => Address::ZERO,
    }
}
