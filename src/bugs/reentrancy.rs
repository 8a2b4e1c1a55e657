//! Reentrancy oracle.
//!
//! The classic check-effect-interaction violation: a storage slot is read, the
//! read value influences an external `CALL` carrying enough gas to re-enter,
//! and the *same slot* is only written back after the call — while the frame
//! has touched an attacker-controlled address. Each `SLOAD` is both snapshotted
//! and planted as a taint source so its influence on later call operands (and
//! on branch conditions guarding them) is visible in the shadow stack.

use alloy::primitives::{Address, U256};
use revm::interpreter::opcode;

use super::{BugMap, CallFrameState, SloadPoint, TaintAnalyzer};
use crate::chain::tracing::{StateView, StepScope};

/// Calls forwarding more than the 2300 gas stipend can run attacker code.
const REENTRANCY_GAS_STIPEND: u64 = 2300;

/// Did the sload at `sload_pc` taint this sink's relevant operands?
fn is_reentrancy_sunk(sload_pc: u64, op: u8, taint: &TaintAnalyzer) -> bool {
    match op {
        // to / value / args-offset operands of CALL.
        opcode::CALL => {
            taint.is_tainted_by_site(opcode::SLOAD, sload_pc, 2)
                || taint.is_tainted_by_site(opcode::SLOAD, sload_pc, 3)
                || taint.is_tainted_by_site(opcode::SLOAD, sload_pc, 4)
        }
        // The branch condition.
        opcode::JUMPI => taint.is_tainted_by_site(opcode::SLOAD, sload_pc, 1),
        _ => false,
    }
}

pub(crate) fn detect(
    frame: &mut CallFrameState,
    bug_map: &BugMap,
    helper_contract: Address,
    step: &StepScope<'_>,
    state: &mut dyn StateView,
) {
    if helper_contract == frame.to {
        return;
    }

    match step.opcode {
        opcode::SLOAD => {
            let Some(slot) = step.stack_back(0) else {
                return;
            };
            let value = state.storage(frame.to, slot);
            frame.taint.add_source(opcode::SLOAD, step.pc);
            frame.sload_points.insert(
                step.pc,
                SloadPoint {
                    pc: step.pc,
                    slot,
                    value,
                },
            );
        }
        opcode::JUMPI => {
            // The loaded value may only ever gate a branch; remember those
            // sloads so a guarded call still links back to them.
            for &sload_pc in frame.sload_points.keys() {
                if is_reentrancy_sunk(sload_pc, step.opcode, &frame.taint) {
                    frame
                        .tainted_jumpi_points
                        .entry(step.pc)
                        .or_default()
                        .push(sload_pc);
                }
            }
        }
        opcode::CALL => {
            let Some(gas) = step.stack_back(0) else {
                return;
            };
            if gas <= U256::from(REENTRANCY_GAS_STIPEND) {
                return;
            }
            let mut linked: Vec<u64> = Vec::new();
            for &sload_pc in frame.sload_points.keys() {
                if is_reentrancy_sunk(sload_pc, step.opcode, &frame.taint) {
                    linked.push(sload_pc);
                }
            }
            // Calls inside sload-dependent branches count as influenced too.
            for sload_pcs in frame.tainted_jumpi_points.values() {
                linked.extend_from_slice(sload_pcs);
            }
            if !linked.is_empty() {
                frame
                    .tainted_call_points
                    .entry(step.pc)
                    .or_default()
                    .extend(linked);
            }
        }
        opcode::SSTORE => {
            if !frame.touched_adversarial_address {
                return;
            }
            let Some(slot) = step.stack_back(0) else {
                return;
            };
            for (call_pc, sload_pcs) in &frame.tainted_call_points {
                for sload_pc in sload_pcs {
                    let Some(point) = frame.sload_points.get(sload_pc) else {
                        continue;
                    };
                    if point.slot == slot {
                        bug_map.cover_bug(&format!(
                            "REENTRANCY-{}-{}-CALL",
                            frame.code_address, call_pc
                        ));
                    }
                }
            }
        }
        _ => {}
    }
}
