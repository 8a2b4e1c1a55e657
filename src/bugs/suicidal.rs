//! Self-destruct reachability oracle: any executed `SELFDESTRUCT` is proposed
//! and confirmed if the transaction commits.

use revm::interpreter::opcode;

use super::{opcode_name, CallFrameState};
use crate::chain::tracing::StepScope;

pub(crate) fn detect(frame: &mut CallFrameState, step: &StepScope<'_>) {
    if step.opcode == opcode::SELFDESTRUCT {
        frame.selfdestruct_points.insert(format!(
            "SUICIDAL-{}-{}-{}",
            frame.code_address,
            step.pc,
            opcode_name(step.opcode)
        ));
    }
}
