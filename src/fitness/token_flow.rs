//! Token-flow fingerprints.
//!
//! `CALL`s carrying value are native ether flows (token = zero address), and
//! `CALL`s whose calldata matches the ERC-20 `transfer(address,uint256)` or
//! `transferFrom(address,address,uint256)` shape are token flows against the
//! callee. Amounts are bucketed the same way storage writes are.

use alloy::primitives::{Address, B256, U256};
use revm::interpreter::opcode;
use std::collections::HashMap;
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::storage_write::value_bucket;
use crate::fitness::ProgramPosition;

pub const TOKENFLOW_TRACER_RESULTS_KEY: &str = "TokenflowTracerResults";

/// `transfer(address,uint256)`
const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
/// `transferFrom(address,address,uint256)`
const TRANSFER_FROM_SELECTOR: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];

/// Obtain the token-flow set a [`TokenflowTracer`] stored on message results,
/// if the tracer was attached.
pub fn get_tokenflow_results(results: &MessageResults) -> Option<&TokenflowSet> {
    results.get::<TokenflowSet>(TOKENFLOW_TRACER_RESULTS_KEY)
}

pub fn remove_tokenflow_results(results: &mut MessageResults) -> bool {
    results.remove(TOKENFLOW_TRACER_RESULTS_KEY)
}

/// One observed transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TokenFlow {
    pub position: ProgramPosition,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    /// Zero address for native ether.
    pub token: Address,
}

impl TokenFlow {
    /// Fingerprint key: position, endpoints, token, and the amount's bucket.
    pub fn bucket_key(&self) -> String {
        format!(
            "{}-{}-{}-{}-{}",
            self.position,
            self.from,
            self.to,
            self.token,
            value_bucket(&self.amount)
        )
    }
}

/// Set of token-flow fingerprints; per-frame pending, per-tx, and global.
#[derive(Clone, Debug, Default)]
pub struct TokenflowSet {
    success_set: HashMap<String, TokenFlow>,
}

impl TokenflowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.success_set.clear();
    }

    pub fn total_tokenflow_count(&self) -> usize {
        self.success_set.len()
    }

    pub fn flows(&self) -> impl Iterator<Item = &TokenFlow> {
        self.success_set.values()
    }

    /// Record one flow. Returns whether the fingerprint is new.
    pub fn set_token_flow(&mut self, flow: TokenFlow) -> bool {
        let key = flow.bucket_key();
        if self.success_set.contains_key(&key) {
            return false;
        }
        self.success_set.insert(key, flow);
        true
    }

    /// Set-union merge. Returns whether the set grew.
    pub fn update(&mut self, other: &TokenflowSet) -> bool {
        let mut updated = false;
        for (key, flow) in &other.success_set {
            if !self.success_set.contains_key(key) {
                self.success_set.insert(key.clone(), *flow);
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
    pending: TokenflowSet,
}

/// Intercepts value transfers and ERC-20 transfer calls per frame.
#[derive(Default)]
pub struct TokenflowTracer {
    token_flows: TokenflowSet,
    frames: Vec<CallFrameState>,
}

impl TokenflowTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for TokenflowTracer {
    fn on_tx_start(&mut self) {
        self.token_flows = TokenflowSet::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            address: frame.code_address,
            resolved: !frame.create,
            pending: TokenflowSet::new(),
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("tokenflow tracer stepped outside any call frame");
        if !frame.resolved {
            frame.resolved = true;
            frame.address = step.code_address;
        }
        if step.opcode != opcode::CALL {
            return;
        }
        let (Some(to_word), Some(value), Some(in_offset), Some(in_size)) = (
            step.stack_back(1),
            step.stack_back(2),
            step.stack_back(3),
            step.stack_back(4),
        ) else {
            return;
        };
        let to_address = Address::from_word(B256::from(to_word));
        let position = ProgramPosition {
            address: frame.address,
            create: frame.create,
            pc: step.pc,
        };

        if value > U256::ZERO {
            frame.pending.set_token_flow(TokenFlow {
                position,
                from: step.storage_address,
                to: to_address,
                amount: value,
                token: Address::ZERO,
            });
        }

        let (Ok(offset), Ok(size)) = (u64::try_from(in_offset), u64::try_from(in_size)) else {
            return;
        };
        let Some(args) = step.memory_slice(offset, size) else {
            if size > 0 {
                log::warn!(
                    "tokenflow: call args out of memory range (offset={offset}, size={size})"
                );
            }
            return;
        };
        if args.len() >= 4 {
            if args[..4] == TRANSFER_SELECTOR && args.len() == 68 {
                frame.pending.set_token_flow(TokenFlow {
                    position,
                    from: step.storage_address,
                    to: Address::from_slice(&args[16..36]),
                    amount: U256::from_be_slice(&args[36..68]),
                    token: to_address,
                });
            } else if args[..4] == TRANSFER_FROM_SELECTOR && args.len() == 100 {
                frame.pending.set_token_flow(TokenFlow {
                    position,
                    from: Address::from_slice(&args[16..36]),
                    to: Address::from_slice(&args[48..68]),
                    amount: U256::from_be_slice(&args[68..100]),
                    token: to_address,
                });
            }
        }
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("tokenflow tracer frame stack underflow");
        let mut pending = frame.pending;
        if exit.reverted {
            pending.revert_all();
        }
        match self.frames.last_mut() {
            Some(parent) => parent.pending.update(&pending),
            None => self.token_flows.update(&pending),
        };
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(
            TOKENFLOW_TRACER_RESULTS_KEY,
            mem::take(&mut self.token_flows),
        );
    }
}
