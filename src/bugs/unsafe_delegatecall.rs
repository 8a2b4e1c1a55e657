//! Unsafe-delegatecall oracle.
//!
//! When the frame was entered from an adversarial sender, everything the
//! sender controls (calldata reads, call value, gas price, origin, caller, and
//! memory written by `CALLDATACOPY`) is a taint source. A `DELEGATECALL` is
//! unsafe when its target is adversarial, when any of its top four operands is
//! tainted by such a source, or when the calldata region it forwards overlaps
//! attacker-copied memory.

use alloy::primitives::{Address, B256};
use revm::interpreter::opcode;

use super::{opcode_name, BugMap, CallFrameState, TaintAnalyzer};
use crate::chain::tracing::StepScope;

fn is_stack_source(op: u8) -> bool {
    matches!(
        op,
        opcode::CALLDATALOAD
            | opcode::CALLDATASIZE
            | opcode::CALLVALUE
            | opcode::GASPRICE
            | opcode::ORIGIN
            | opcode::CALLER
    )
}

/// `CALLDATACOPY(destOffset, offset, size)` taints `[dest, dest + size)`.
fn memory_source_range(step: &StepScope<'_>) -> Option<(u64, u64)> {
    if step.opcode != opcode::CALLDATACOPY {
        return None;
    }
    let dest = step.stack_back(0)?;
    let size = step.stack_back(2)?;
    let start = u64::try_from(dest).ok()?;
    let len = u64::try_from(size).ok()?;
    Some((start, start.saturating_add(len)))
}

fn is_tainted_by_unsafe_source(taint: &TaintAnalyzer, index: usize) -> bool {
    taint.is_tainted_by_opcode(opcode::CALLDATALOAD, index)
        || taint.is_tainted_by_opcode(opcode::CALLDATASIZE, index)
        || taint.is_tainted_by_opcode(opcode::CALLVALUE, index)
        || taint.is_tainted_by_opcode(opcode::GASPRICE, index)
        || taint.is_tainted_by_opcode(opcode::ORIGIN, index)
        || taint.is_tainted_by_opcode(opcode::CALLDATACOPY, index)
}

/// gas / to / argsOffset / argsSize operands of the delegatecall.
fn is_stack_sunk(taint: &TaintAnalyzer) -> bool {
    (0..=3).any(|index| is_tainted_by_unsafe_source(taint, index))
}

fn is_memory_sunk(taint: &TaintAnalyzer, step: &StepScope<'_>) -> bool {
    let (Some(args_offset), Some(args_size)) = (step.stack_back(2), step.stack_back(3)) else {
        return false;
    };
    let (Ok(start), Ok(len)) = (u64::try_from(args_offset), u64::try_from(args_size)) else {
        return false;
    };
    taint.is_memory_tainted_by_opcode(opcode::CALLDATACOPY, start, start.saturating_add(len))
}

pub(crate) fn detect(
    frame: &mut CallFrameState,
    bug_map: &BugMap,
    adversarial_addresses: &[Address],
    helper_contract: Address,
    step: &StepScope<'_>,
) {
    if helper_contract == frame.to {
        return;
    }

    if adversarial_addresses.contains(&frame.from) {
        if is_stack_source(step.opcode) {
            frame.taint.add_source_opcode(step.opcode);
        }
        if let Some((start, end)) = memory_source_range(step) {
            frame
                .taint
                .add_memory_source_opcode(opcode::CALLDATACOPY, start, end);
        }
    }

    if step.opcode == opcode::DELEGATECALL {
        let to_adversarial = step
            .stack_back(1)
            .map(|word| Address::from_word(B256::from(word)))
            .is_some_and(|target| adversarial_addresses.contains(&target));

        let unsafe_call = to_adversarial
            || is_stack_sunk(&frame.taint)
            || is_memory_sunk(&frame.taint, step);

        if unsafe_call {
            bug_map.cover_bug(&format!(
                "UNSAFEDELEGATECALL-{}-{}-{}",
                frame.code_address,
                step.pc,
                opcode_name(step.opcode)
            ));
        }
    }
}
