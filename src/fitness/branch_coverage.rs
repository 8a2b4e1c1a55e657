//! Per-branch execution coverage.
//!
//! Shares the [`CoverageMaps`] container with code coverage; here the flag
//! vector is sized to `2 × |JUMPI|` and indexed by branch id. Only contracts
//! with a registered branch map are traced.

use alloy::primitives::{Address, B256};
use revm::interpreter::opcode;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::address_for_coverage;
use crate::fitness::branch_map::BranchMapRegistry;
use crate::fitness::code_coverage::CoverageMaps;
use crate::utils::metadata::code_lookup_hash;

pub const BRANCH_COVERAGE_TRACER_RESULTS_KEY: &str = "BranchCoverageTracerResults";

/// Obtain the branch coverage maps a [`BranchCoverageTracer`] stored on message
/// results, if the tracer was attached.
pub fn get_branch_coverage_results(results: &MessageResults) -> Option<&CoverageMaps> {
    results.get::<CoverageMaps>(BRANCH_COVERAGE_TRACER_RESULTS_KEY)
}

pub fn remove_branch_coverage_results(results: &mut MessageResults) -> bool {
    results.remove(BRANCH_COVERAGE_TRACER_RESULTS_KEY)
}

struct CallFrameState {
    create: bool,
    pending: CoverageMaps,
    lookup_hash: Option<B256>,
    address: Option<Address>,
}

/// Marks the executed side of every `JUMPI` in the per-frame pending map.
pub struct BranchCoverageTracer {
    coverage: CoverageMaps,
    frames: Vec<CallFrameState>,
    registry: Arc<BranchMapRegistry>,
    /// Hashes with no registered branch map, remembered to skip re-lookups.
    unknown_hashes: HashSet<B256>,
    initial_contracts: Option<HashSet<Address>>,
}

impl BranchCoverageTracer {
    pub fn new(registry: Arc<BranchMapRegistry>) -> Self {
        Self {
            coverage: CoverageMaps::new(),
            frames: Vec::new(),
            registry,
            unknown_hashes: HashSet::new(),
            initial_contracts: None,
        }
    }

    pub fn with_initial_contracts(mut self, initial_contracts: Option<HashSet<Address>>) -> Self {
        self.initial_contracts = initial_contracts;
        self
    }
}

impl Tracer for BranchCoverageTracer {
    fn on_tx_start(&mut self) {
        self.coverage = CoverageMaps::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            pending: CoverageMaps::new(),
            lookup_hash: None,
            address: None,
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("branch coverage tracer stepped outside any call frame");
        if frame.address.is_none() {
            frame.address = Some(step.storage_address);
        }
        if step.code.is_empty() || step.opcode != opcode::JUMPI {
            return;
        }

        let hash = *frame
            .lookup_hash
            .get_or_insert_with(|| code_lookup_hash(step.code, step.create));
        if self.unknown_hashes.contains(&hash) {
            return;
        }
        let Some(branch_map) = self.registry.get(&hash) else {
            // This contract is not in the set being traced.
            self.unknown_hashes.insert(hash);
            return;
        };
        let Some(cond) = step.stack_back(1) else {
            return;
        };
        let branch_id = branch_map.branch_id(step.pc, !cond.is_zero());
        let branch_size = branch_map.size();
        let address = address_for_coverage(
            self.initial_contracts.as_ref(),
            frame.address.expect("frame address resolved above"),
        );
        frame
            .pending
            .set_at(address, hash, branch_size, branch_size, branch_id as u64);
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("branch coverage tracer frame stack underflow");
        let mut pending = frame.pending;
        if exit.reverted {
            pending.revert_all();
        }
        match self.frames.last_mut() {
            Some(parent) => parent.pending.update(&pending),
            None => self.coverage.update(&pending),
        };
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(
            BRANCH_COVERAGE_TRACER_RESULTS_KEY,
            mem::take(&mut self.coverage),
        );
    }
}
