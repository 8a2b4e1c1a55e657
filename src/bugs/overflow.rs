//! Integer-overflow oracle.
//!
//! Source: a pre-execution check on the operands of `ADD`/`SUB`/`MUL`. When the
//! concrete result would wrap, the `"OVERFLOW"` tag is planted so that, after
//! taint propagation mirrors the instruction, the result slot carries it.
//! Sink: a wrapped value reaching a comparison, a `CALL`'s gas/value operands,
//! or the value stored by `SSTORE`.

use alloy::primitives::Address;
use revm::interpreter::opcode;

use super::{opcode_name, CallFrameState, TaintAnalyzer};
use crate::chain::tracing::StepScope;

pub const OVERFLOW_TAG: &str = "OVERFLOW";

fn is_overflow_source(step: &StepScope<'_>) -> bool {
    let (Some(a), Some(b)) = (step.stack_back(0), step.stack_back(1)) else {
        return false;
    };
    match step.opcode {
        opcode::ADD => a.overflowing_add(b).1,
        opcode::SUB => a < b,
        opcode::MUL => {
            if a.is_zero() || b.is_zero() {
                false
            } else {
                a.overflowing_mul(b).1
            }
        }
        _ => false,
    }
}

fn is_overflow_sunk(op: u8, taint: &TaintAnalyzer) -> bool {
    match op {
        opcode::LT | opcode::GT | opcode::SLT | opcode::SGT | opcode::EQ => {
            taint.is_tainted_by_tag(OVERFLOW_TAG, 0) || taint.is_tainted_by_tag(OVERFLOW_TAG, 1)
        }
        opcode::ISZERO => taint.is_tainted_by_tag(OVERFLOW_TAG, 0),
        // Gas and value operands of an outgoing call.
        opcode::CALL => {
            taint.is_tainted_by_tag(OVERFLOW_TAG, 0) || taint.is_tainted_by_tag(OVERFLOW_TAG, 2)
        }
        // The value being stored.
        opcode::SSTORE => taint.is_tainted_by_tag(OVERFLOW_TAG, 1),
        _ => false,
    }
}

pub(crate) fn detect(frame: &mut CallFrameState, helper_contract: Address, step: &StepScope<'_>) {
    if helper_contract == frame.to {
        return;
    }
    if is_overflow_source(step) {
        frame.taint.add_source_tag(OVERFLOW_TAG);
    } else if is_overflow_sunk(step.opcode, &frame.taint) {
        frame.overflow_points.insert(format!(
            "OVERFLOW-{}-{}-{}",
            frame.code_address,
            step.pc,
            opcode_name(step.opcode)
        ));
    }
}
