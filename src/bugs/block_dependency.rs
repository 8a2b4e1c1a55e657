//! Block-dependency (bad randomness) oracle.
//!
//! Source: block-environment opcodes plant the `"BLOCK_DEPENDENCY"` tag.
//! Sink: a tagged value reaching a comparison, any call variant, or a create.
//! Findings are covered immediately; a contract that merely *reads* the block
//! environment without branching or paying on it stays silent.

use alloy::primitives::Address;
use revm::interpreter::opcode;

use super::{opcode_name, BugMap, CallFrameState, TaintAnalyzer};
use crate::chain::tracing::StepScope;

pub const BLOCK_DEPENDENCY_TAG: &str = "BLOCK_DEPENDENCY";

fn is_block_dependency_source(op: u8) -> bool {
    matches!(
        op,
        opcode::BLOCKHASH
            | opcode::COINBASE
            | opcode::TIMESTAMP
            | opcode::NUMBER
            | 0x44 // DIFFICULTY / PREVRANDAO
            | opcode::GASLIMIT
    )
}

fn tagged(taint: &TaintAnalyzer, indices: std::ops::RangeInclusive<usize>) -> bool {
    indices.into_iter().any(|index| taint.is_tainted_by_tag(BLOCK_DEPENDENCY_TAG, index))
}

fn is_block_dependency_sunk(op: u8, taint: &TaintAnalyzer) -> bool {
    match op {
        opcode::LT | opcode::GT | opcode::SLT | opcode::SGT | opcode::EQ => tagged(taint, 0..=1),
        opcode::ISZERO => tagged(taint, 0..=0),
        opcode::CALL | opcode::CALLCODE => tagged(taint, 0..=4),
        opcode::DELEGATECALL | opcode::STATICCALL => tagged(taint, 0..=3),
        opcode::CREATE => tagged(taint, 0..=2),
        opcode::CREATE2 => tagged(taint, 0..=3),
        _ => false,
    }
}

pub(crate) fn detect(
    frame: &mut CallFrameState,
    bug_map: &BugMap,
    helper_contract: Address,
    step: &StepScope<'_>,
) {
    if helper_contract == frame.to {
        return;
    }
    if is_block_dependency_source(step.opcode) {
        frame.taint.add_source_tag(BLOCK_DEPENDENCY_TAG);
    } else if is_block_dependency_sunk(step.opcode, &frame.taint) {
        bug_map.cover_bug(&format!(
            "BLOCKDEPENDENCY-{}-{}-{}",
            frame.code_address,
            step.pc,
            opcode_name(step.opcode)
        ));
    }
}
