//! Bug oracles.
//!
//! The [`BugDetectorTracer`] owns one [`taint::TaintAnalyzer`] per call frame
//! and drives six oracles from the opcode stream. Oracles run *before* taint
//! propagation each step, so they see the pre-execution shadow stack the same
//! way they see the pre-execution operand stack.
//!
//! Commit discipline: overflow, self-destruct and ether-leak findings are
//! *proposed* into per-frame pending sets, OR-merged into the parent on
//! non-reverted exit, and confirmed into the bug map only at the top-level
//! non-reverted exit. Reentrancy, block-dependency and unsafe-delegatecall
//! findings are covered immediately at detection time. Reverted frames drop
//! everything.

pub mod bug_map;
pub mod taint;

mod block_dependency;
mod ether_leak;
mod overflow;
mod reentrancy;
mod suicidal;
mod unsafe_delegatecall;

use alloy::primitives::{Address, U256};
use revm::interpreter::OpCode;
use std::collections::{HashMap, HashSet};
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::utils::config::BugDetectionConfig;

pub use bug_map::{init_detection_clock, BugMap};
pub use taint::{TaintAnalyzer, TaintLabel};

pub const BUG_DETECTOR_TRACER_RESULTS_KEY: &str = "BugDetectorTracerResults";

/// Obtain the bug map a [`BugDetectorTracer`] stored on message results, if the
/// tracer was attached.
pub fn get_bug_detector_results(results: &MessageResults) -> Option<&BugMap> {
    results.get::<BugMap>(BUG_DETECTOR_TRACER_RESULTS_KEY)
}

pub fn remove_bug_detector_results(results: &mut MessageResults) -> bool {
    results.remove(BUG_DETECTOR_TRACER_RESULTS_KEY)
}

/// Mnemonic for a raw opcode byte, used in bug id strings.
pub(crate) fn opcode_name(op: u8) -> &'static str {
    OpCode::new(op).map_or("INVALID", |opcode| opcode.as_str())
}

/// A storage read observed by the reentrancy oracle.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SloadPoint {
    pub pc: u64,
    pub slot: U256,
    #[allow(dead_code)]
    pub value: U256,
}

/// Per-frame oracle state.
pub(crate) struct CallFrameState {
    pub create: bool,
    pub from: Address,
    /// Storage address of the frame (the proxy under delegatecall).
    pub to: Address,
    pub code_address: Address,
    resolved: bool,

    pub taint: TaintAnalyzer,

    pub overflow_points: HashSet<String>,
    pub etherleaking_points: HashSet<String>,
    pub selfdestruct_points: HashSet<String>,

    /// sload pc → snapshot, feeding the reentrancy oracle.
    pub sload_points: HashMap<u64, SloadPoint>,
    /// call pc → sload pcs influencing the call's target/value/calldata.
    pub tainted_call_points: HashMap<u64, Vec<u64>>,
    /// jumpi pc → sload pcs influencing the branch condition.
    pub tainted_jumpi_points: HashMap<u64, Vec<u64>>,
    pub touched_adversarial_address: bool,
}

impl CallFrameState {
    fn new(frame: &FrameStart) -> Self {
        Self {
            create: frame.create,
            from: frame.from,
            to: frame.to,
            code_address: frame.code_address,
            resolved: !frame.create,
            taint: TaintAnalyzer::new(),
            overflow_points: HashSet::new(),
            etherleaking_points: HashSet::new(),
            selfdestruct_points: HashSet::new(),
            sload_points: HashMap::new(),
            tainted_call_points: HashMap::new(),
            tainted_jumpi_points: HashMap::new(),
            touched_adversarial_address: false,
        }
    }
}

/// Orchestrates the oracle catalog over the hook stream.
pub struct BugDetectorTracer {
    bug_map: BugMap,
    frames: Vec<CallFrameState>,
    config: BugDetectionConfig,
    /// The fuzzer's helper contract; frames executing it are exempt from the
    /// oracles so instrumentation scaffolding never reports on itself.
    helper_contract: Address,
    adversarial_addresses: Vec<Address>,
    /// Sum of the configured sender balances at campaign start.
    original_ether: U256,
}

impl BugDetectorTracer {
    pub fn new(helper_contract: Address, config: BugDetectionConfig) -> Self {
        init_detection_clock();
        Self {
            bug_map: BugMap::new(),
            frames: Vec::new(),
            config,
            helper_contract,
            adversarial_addresses: Vec::new(),
            original_ether: U256::ZERO,
        }
    }

    /// Snapshot the total starting ether of the adversarial senders.
    pub fn set_original_ether(&mut self, balances: &[U256]) {
        self.original_ether = balances
            .iter()
            .fold(U256::ZERO, |acc, b| acc.saturating_add(*b));
    }

    pub fn set_adversarial_addresses(&mut self, addresses: &[Address]) {
        self.adversarial_addresses.extend_from_slice(addresses);
    }
}

impl Tracer for BugDetectorTracer {
    fn on_tx_start(&mut self) {
        self.bug_map = BugMap::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState::new(frame));
    }

    fn on_step(&mut self, step: &StepScope<'_>, state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("bug detector stepped outside any call frame");
        if !frame.resolved {
            frame.resolved = true;
            frame.to = step.storage_address;
            frame.code_address = step.storage_address;
        }

        if self.config.integer_overflow {
            overflow::detect(frame, self.helper_contract, step);
        }
        if self.config.suicidal {
            suicidal::detect(frame, step);
        }
        if self.config.block_dependency {
            block_dependency::detect(frame, &self.bug_map, self.helper_contract, step);
        }
        if self.config.reentrancy {
            reentrancy::detect(frame, &self.bug_map, self.helper_contract, step, state);
        }
        if self.config.unsafe_delegatecall {
            unsafe_delegatecall::detect(
                frame,
                &self.bug_map,
                &self.adversarial_addresses,
                self.helper_contract,
                step,
            );
        }

        frame.taint.propagate(step.opcode, step);
    }

    fn on_exit(&mut self, exit: &FrameExit, state: &mut dyn StateView) {
        let mut frame = self
            .frames
            .pop()
            .expect("bug detector frame stack underflow");

        if !exit.reverted {
            if self.config.ether_leaking {
                ether_leak::detect(
                    &mut frame,
                    &self.adversarial_addresses,
                    self.original_ether,
                    state,
                );
            }
            if self.adversarial_addresses.contains(&frame.to) {
                frame.touched_adversarial_address = true;
            }

            match self.frames.last_mut() {
                Some(parent) => {
                    // Propose the frame's findings one level up.
                    parent.etherleaking_points.extend(frame.etherleaking_points);
                    parent.overflow_points.extend(frame.overflow_points);
                    parent.selfdestruct_points.extend(frame.selfdestruct_points);
                    parent.touched_adversarial_address |= frame.touched_adversarial_address;
                }
                None => {
                    // Top-level success: confirm everything proposed.
                    for id in frame
                        .selfdestruct_points
                        .iter()
                        .chain(frame.etherleaking_points.iter())
                        .chain(frame.overflow_points.iter())
                    {
                        self.bug_map.cover_bug(id);
                    }
                }
            }
        }
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(BUG_DETECTOR_TRACER_RESULTS_KEY, mem::take(&mut self.bug_map));
    }
}
