//! Storage-write fingerprints.
//!
//! Every `SSTORE` yields a `(position, slot, value-bucket)` tuple. Values are
//! bucketed into four coarse exponent ranges so monotonically growing counters
//! do not explode the fingerprint set.

use alloy::primitives::{Address, U256};
use revm::interpreter::opcode;
use std::collections::HashMap;
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::{ProgramPosition, StorageSlotKey};

pub const STORAGE_WRITE_TRACER_RESULTS_KEY: &str = "StorageWriteTracerResults";

/// Obtain the storage-write set a [`StorageWriteTracer`] stored on message
/// results, if the tracer was attached.
pub fn get_storage_write_results(results: &MessageResults) -> Option<&StorageWriteSet> {
    results.get::<StorageWriteSet>(STORAGE_WRITE_TRACER_RESULTS_KEY)
}

pub fn remove_storage_write_results(results: &mut MessageResults) -> bool {
    results.remove(STORAGE_WRITE_TRACER_RESULTS_KEY)
}

/// Coarse exponent bucket of a 256-bit value.
pub fn value_bucket(value: &U256) -> &'static str {
    if *value < U256::from(1u64 << 4) {
        "0-2^4"
    } else if *value < U256::from(1u64 << 16) {
        "2^4-2^16"
    } else if *value < (U256::from(1) << 64) {
        "2^16-2^64"
    } else {
        "2^64-2^256"
    }
}

/// One observed storage write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StorageWrite {
    pub position: ProgramPosition,
    pub slot: StorageSlotKey,
    pub value: U256,
}

impl StorageWrite {
    /// Fingerprint key: position, slot, and the value's bucket.
    pub fn bucket_key(&self) -> String {
        format!("{}-{}-{}", self.position, self.slot, value_bucket(&self.value))
    }
}

/// Set of storage-write fingerprints; per-frame pending, per-tx, and global.
#[derive(Clone, Debug, Default)]
pub struct StorageWriteSet {
    success_set: HashMap<String, StorageWrite>,
}

impl StorageWriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.success_set.clear();
    }

    pub fn total_storage_write_count(&self) -> usize {
        self.success_set.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.success_set.contains_key(key)
    }

    /// Record one write. Returns whether the fingerprint is new.
    pub fn set_write(
        &mut self,
        storage_address: Address,
        slot: U256,
        value: U256,
        position: ProgramPosition,
    ) -> bool {
        let write = StorageWrite {
            position,
            slot: StorageSlotKey {
                address: storage_address,
                slot,
            },
            value,
        };
        let key = write.bucket_key();
        if self.success_set.contains_key(&key) {
            return false;
        }
        self.success_set.insert(key, write);
        true
    }

    /// Set-union merge. Returns whether the set grew.
    pub fn update(&mut self, other: &StorageWriteSet) -> bool {
        let mut updated = false;
        for (key, write) in &other.success_set {
            if !self.success_set.contains_key(key) {
                self.success_set.insert(key.clone(), *write);
                updated = true;
            }
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
    pending: StorageWriteSet,
}

/// Collects storage-write fingerprints per frame; reverted frames drop theirs.
#[derive(Default)]
pub struct StorageWriteTracer {
    storage_writes: StorageWriteSet,
    frames: Vec<CallFrameState>,
}

impl StorageWriteTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for StorageWriteTracer {
    fn on_tx_start(&mut self) {
        self.storage_writes = StorageWriteSet::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            address: frame.code_address,
            resolved: !frame.create,
            pending: StorageWriteSet::new(),
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("storage write tracer stepped outside any call frame");
        if !frame.resolved {
            frame.resolved = true;
            frame.address = step.code_address;
        }
        if step.opcode != opcode::SSTORE {
            return;
        }
        let (Some(slot), Some(value)) = (step.stack_back(0), step.stack_back(1)) else {
            return;
        };
        let position = ProgramPosition {
            address: frame.address,
            create: frame.create,
            pc: step.pc,
        };
        frame
            .pending
            .set_write(step.storage_address, slot, value, position);
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("storage write tracer frame stack underflow");
        let mut pending = frame.pending;
        if exit.reverted {
            pending.revert_all();
        }
        match self.frames.last_mut() {
            Some(parent) => parent.pending.update(&pending),
            None => self.storage_writes.update(&pending),
        };
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(
            STORAGE_WRITE_TRACER_RESULTS_KEY,
            mem::take(&mut self.storage_writes),
        );
    }
}
