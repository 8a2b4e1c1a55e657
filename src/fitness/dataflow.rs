//! Storage def-use pairs.
//!
//! Every `SSTORE` registers a write site for its `(contract, slot)` variable;
//! every later `SLOAD` of the same variable produces one `(write, read, slot)`
//! pair per known writer. The set is transaction-scoped: unlike the coverage
//! maps there is no per-frame pending container, and only a top-level revert
//! discards it wholesale.

use alloy::primitives::{Address, U256};
use revm::interpreter::opcode;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::{ProgramPosition, StorageSlotKey};

pub const DATAFLOW_TRACER_RESULTS_KEY: &str = "DataflowTracerResults";

/// Obtain the dataflow set a [`DataflowTracer`] stored on message results, if
/// the tracer was attached.
pub fn get_dataflow_results(results: &MessageResults) -> Option<&DataflowSet> {
    results.get::<DataflowSet>(DATAFLOW_TRACER_RESULTS_KEY)
}

pub fn remove_dataflow_results(results: &mut MessageResults) -> bool {
    results.remove(DATAFLOW_TRACER_RESULTS_KEY)
}

/// One def-use pair over a storage variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dataflow {
    pub write: ProgramPosition,
    pub read: ProgramPosition,
    pub slot: StorageSlotKey,
}

impl fmt::Display for Dataflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.write, self.slot, self.read)
    }
}

/// The tx-scoped (and, merged, process-global) dataflow structure.
#[derive(Clone, Debug, Default)]
pub struct DataflowSet {
    pairs: HashSet<Dataflow>,
    write_sites: HashMap<StorageSlotKey, HashSet<ProgramPosition>>,
}

impl DataflowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.pairs.clear();
        self.write_sites.clear();
    }

    pub fn total_dataflow_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn contains(&self, pair: &Dataflow) -> bool {
        self.pairs.contains(pair)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &Dataflow> {
        self.pairs.iter()
    }

    /// Register a write site. Returns whether the site is new.
    pub fn set_write(
        &mut self,
        storage_address: Address,
        slot: U256,
        position: ProgramPosition,
    ) -> bool {
        let variable = StorageSlotKey {
            address: storage_address,
            slot,
        };
        self.write_sites.entry(variable).or_default().insert(position)
    }

    /// Register a read site, pairing it with every known writer of the
    /// variable. Returns whether any new pair appeared.
    pub fn set_read(
        &mut self,
        storage_address: Address,
        slot: U256,
        position: ProgramPosition,
    ) -> bool {
        let variable = StorageSlotKey {
            address: storage_address,
            slot,
        };
        let Some(writers) = self.write_sites.get(&variable) else {
            return false;
        };
        let mut updated = false;
        for write in writers {
            updated |= self.pairs.insert(Dataflow {
                write: *write,
                read: position,
                slot: variable,
            });
        }
        updated
    }

    /// Pair-set union. Write-site indices stay tx-local and are not merged.
    pub fn update(&mut self, other: &DataflowSet) -> bool {
        let mut updated = false;
        for pair in &other.pairs {
            updated |= self.pairs.insert(*pair);
        }
        updated
    }

    pub fn revert_all(&mut self) {
        self.reset();
    }
}

struct CallFrameState {
    create: bool,
    address: Address,
    resolved: bool,
}

/// Records def-use pairs into the tx-global set. A top-level revert clears the
/// set; sub-frame reverts keep already-recorded pairs (the writes propagated at
/// record time).
#[derive(Default)]
pub struct DataflowTracer {
    dataflow: DataflowSet,
    frames: Vec<CallFrameState>,
}

impl DataflowTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for DataflowTracer {
    fn on_tx_start(&mut self) {
        self.dataflow = DataflowSet::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            address: frame.code_address,
            resolved: !frame.create,
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("dataflow tracer stepped outside any call frame");
        if !frame.resolved {
            frame.resolved = true;
            frame.address = step.code_address;
        }
        if step.opcode != opcode::SLOAD && step.opcode != opcode::SSTORE {
            return;
        }
        let Some(slot) = step.stack_back(0) else {
            return;
        };
        let position = ProgramPosition {
            address: frame.address,
            create: frame.create,
            pc: step.pc,
        };
        if step.opcode == opcode::SLOAD {
            self.dataflow.set_read(step.storage_address, slot, position);
        } else {
            self.dataflow.set_write(step.storage_address, slot, position);
        }
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        self.frames
            .pop()
            .expect("dataflow tracer frame stack underflow");
        // Only a top-level revert throws the tx's dataflow away; sub-frame
        // writes have already propagated into the tx-global set by design.
        if exit.reverted && exit.depth == 0 {
            self.dataflow.revert_all();
        }
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(DATAFLOW_TRACER_RESULTS_KEY, mem::take(&mut self.dataflow));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(pc: u64) -> ProgramPosition {
        ProgramPosition {
            address: Address::repeat_byte(0x11),
            create: false,
            pc,
        }
    }

    #[test]
    fn test_read_pairs_with_every_writer() {
        let mut set = DataflowSet::new();
        let contract = Address::repeat_byte(0x22);
        let slot = U256::from(0);
        assert!(set.set_write(contract, slot, position(10)));
        assert!(set.set_write(contract, slot, position(20)));
        // Duplicate write site is not new.
        assert!(!set.set_write(contract, slot, position(10)));

        assert!(set.set_read(contract, slot, position(30)));
        assert_eq!(set.total_dataflow_count(), 2);

        // A read of an unwritten variable pairs with nothing.
        assert!(!set.set_read(contract, U256::from(7), position(40)));
        assert_eq!(set.total_dataflow_count(), 2);
    }

    #[test]
    fn test_update_is_union_and_idempotent() {
        let contract = Address::repeat_byte(0x22);
        let slot = U256::from(1);
        let mut a = DataflowSet::new();
        a.set_write(contract, slot, position(1));
        a.set_read(contract, slot, position(2));

        let mut b = DataflowSet::new();
        b.set_write(contract, slot, position(3));
        b.set_read(contract, slot, position(4));

        let mut merged = a.clone();
        assert!(merged.update(&b));
        assert_eq!(merged.total_dataflow_count(), 2);
        // Merging a set into itself changes nothing.
        let snapshot = merged.clone();
        assert!(!merged.update(&snapshot));
    }

    #[test]
    fn test_revert_all_clears() {
        let contract = Address::repeat_byte(0x22);
        let mut set = DataflowSet::new();
        set.set_write(contract, U256::from(0), position(1));
        set.set_read(contract, U256::from(0), position(2));
        set.revert_all();
        assert_eq!(set.total_dataflow_count(), 0);
    }

    #[test]
    fn test_pair_formatting() {
        let pair = Dataflow {
            write: position(0x10),
            read: position(0x2f),
            slot: StorageSlotKey {
                address: Address::repeat_byte(0x22),
                slot: U256::from(5),
            },
        };
        let formatted = pair.to_string();
        assert!(formatted.contains(":10-"));
        assert!(formatted.ends_with(":2f"));
        assert!(formatted.contains("0x5"));
    }
}
