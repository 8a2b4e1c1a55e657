//! Ether-leak oracle.
//!
//! Runs at every non-reverted frame exit: if the combined balance of the
//! adversarial addresses exceeds the snapshot taken at campaign start, ether
//! flowed to the attacker. Frames entered *from* an adversarial address are
//! exempt, otherwise the attacker moving their own funds would self-report.

use alloy::primitives::{Address, U256};

use super::CallFrameState;
use crate::chain::tracing::StateView;

pub(crate) fn detect(
    frame: &mut CallFrameState,
    adversarial_addresses: &[Address],
    original_ether: U256,
    state: &mut dyn StateView,
) {
    if adversarial_addresses.contains(&frame.from) {
        return;
    }
    let mut current_ether = U256::ZERO;
    for address in adversarial_addresses {
        current_ether = current_ether.saturating_add(state.balance(*address));
    }
    if current_ether > original_ether {
        frame
            .etherleaking_points
            .insert(format!("ETHERLEAKING-{}", frame.from));
    }
}
