//! Per-frame taint analysis.
//!
//! A shadow stack maps stack indices (0 = top) to label sets; a shadow memory
//! maps labels to byte ranges; an optional shadow storage maps slots to label
//! sets. `propagate` mirrors every opcode's stack effect so that after each
//! instruction the shadow stack indices line up with the real stack again.
//!
//! Cross-call taint is deliberately dropped: labels never survive a call
//! boundary in either direction. The oracles that need cross-frame knowledge
//! (ether leaking, reentrancy) work on balances and storage instead.

use alloy::primitives::U256;
use revm::interpreter::opcode;
use std::collections::{HashMap, HashSet};

use crate::chain::tracing::StepScope;

/// A taint source: either a concrete instruction site or a named tag such as
/// `"OVERFLOW"`. The tags in use are short static strings, keeping label
/// hashing and comparison cheap on the opcode hot path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaintLabel {
    Site { opcode: u8, pc: u64 },
    Tag(&'static str),
}

type LabelSet = HashSet<TaintLabel>;

/// Shadow state for one call frame.
#[derive(Debug, Default)]
pub struct TaintAnalyzer {
    /// Stack index (0 = top) → labels. Untainted indices are absent.
    stacks: HashMap<usize, LabelSet>,
    /// Label → tainted `[start, end)` byte range.
    memory: HashMap<TaintLabel, (u64, u64)>,
    /// Slot → labels. Populated only through the storage helpers.
    storage: HashMap<U256, LabelSet>,
}

impl TaintAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag the current top-of-stack slot with an instruction site.
    pub fn add_source(&mut self, opcode: u8, pc: u64) {
        self.stacks
            .entry(0)
            .or_default()
            .insert(TaintLabel::Site { opcode, pc });
    }

    /// Tag the current top-of-stack slot with a site whose pc is irrelevant.
    pub fn add_source_opcode(&mut self, opcode: u8) {
        self.add_source(opcode, 0);
    }

    /// Tag the current top-of-stack slot with a named tag.
    pub fn add_source_tag(&mut self, tag: &'static str) {
        self.stacks.entry(0).or_default().insert(TaintLabel::Tag(tag));
    }

    /// Mark `[start, end)` of memory as flowing from an instruction site.
    pub fn add_memory_source(&mut self, opcode: u8, pc: u64, start: u64, end: u64) {
        self.memory
            .insert(TaintLabel::Site { opcode, pc }, (start, end));
    }

    pub fn add_memory_source_opcode(&mut self, opcode: u8, start: u64, end: u64) {
        self.add_memory_source(opcode, 0, start, end);
    }

    /// Mark a storage slot as flowing from an instruction site.
    pub fn add_storage_source(&mut self, slot: U256, opcode: u8, pc: u64) {
        self.storage
            .entry(slot)
            .or_default()
            .insert(TaintLabel::Site { opcode, pc });
    }

    /// Exact-site query: is stack slot `index` tainted by `(opcode, pc)`?
    pub fn is_tainted_by_site(&self, opcode: u8, pc: u64, index: usize) -> bool {
        self.stacks
            .get(&index)
            .is_some_and(|labels| labels.contains(&TaintLabel::Site { opcode, pc }))
    }

    /// Site query with pc 0 (sources added via [`Self::add_source_opcode`]).
    pub fn is_tainted_by_opcode(&self, opcode: u8, index: usize) -> bool {
        self.is_tainted_by_site(opcode, 0, index)
    }

    /// Any-site query: is slot `index` tainted by `opcode` at any pc?
    pub fn is_tainted_by(&self, opcode: u8, index: usize) -> bool {
        self.stacks.get(&index).is_some_and(|labels| {
            labels
                .iter()
                .any(|label| matches!(label, TaintLabel::Site { opcode: op, .. } if *op == opcode))
        })
    }

    pub fn is_tainted_by_tag(&self, tag: &str, index: usize) -> bool {
        self.stacks.get(&index).is_some_and(|labels| {
            labels
                .iter()
                .any(|label| matches!(label, TaintLabel::Tag(t) if *t == tag))
        })
    }

    /// Does any memory taint from `opcode` overlap `[start, end)`?
    pub fn is_memory_tainted_by_opcode(&self, opcode: u8, start: u64, end: u64) -> bool {
        self.memory.iter().any(|(label, (taint_start, taint_end))| {
            matches!(label, TaintLabel::Site { opcode: op, .. } if *op == opcode)
                && end > *taint_start
                && start < *taint_end
        })
    }

    pub fn is_storage_tainted(&self, slot: &U256) -> bool {
        self.storage.get(slot).is_some_and(|labels| !labels.is_empty())
    }

    /// Mirror one opcode's stack effect onto the shadow state. Must run after
    /// the oracles inspected the pre-execution state.
    pub fn propagate(&mut self, op: u8, step: &StepScope<'_>) {
        if self.stacks.is_empty() && self.memory.is_empty() {
            return;
        }

        // PUSH0..PUSH32
        if (0x5f..=0x7f).contains(&op) {
            self.shift_down();
            return;
        }

        match op {
            // Opcodes pushing a value without consuming taintable operands.
            // The pushed value starts untainted; oracles add sources on top.
            opcode::ADDRESS
            | opcode::ORIGIN
            | opcode::CALLER
            | opcode::CALLVALUE
            | opcode::CALLDATASIZE
            | opcode::CODESIZE
            | opcode::GASPRICE
            | opcode::COINBASE
            | opcode::TIMESTAMP
            | opcode::NUMBER
            | 0x44 // DIFFICULTY / PREVRANDAO
            | opcode::GASLIMIT
            | opcode::BLOCKHASH
            | opcode::MSIZE
            | opcode::PC
            | opcode::GAS
            | opcode::RETURNDATASIZE
            | opcode::CHAINID
            | opcode::SELFBALANCE
            | opcode::BASEFEE => self.shift_down(),

            // 1 pop, 1 push: the loaded word inherits overlapping memory taint;
            // the offset operand's labels are replaced.
            opcode::MLOAD => {
                let offset = step.stack_back(0).map_or(0u64, truncate_u64);
                self.stacks.remove(&0);
                self.memory_to_stack(offset, offset.saturating_add(32));
            }

            // 1 pop, 1 push with output labels identical to the input slot's.
            // Correct for ISZERO/NOT; kept as-is for the rest.
            opcode::SLOAD
            | opcode::ISZERO
            | opcode::NOT
            | opcode::BYTE
            | opcode::BALANCE
            | opcode::EXTCODESIZE
            | opcode::EXTCODEHASH
            | opcode::CALLDATALOAD => {}

            // 2 pops, 1 push.
            opcode::ADD
            | opcode::SUB
            | opcode::MUL
            | opcode::DIV
            | opcode::SDIV
            | opcode::MOD
            | opcode::SMOD
            | opcode::EXP
            | opcode::SIGNEXTEND
            | opcode::LT
            | opcode::GT
            | opcode::SLT
            | opcode::SGT
            | opcode::EQ
            | opcode::AND
            | opcode::OR
            | opcode::XOR
            | opcode::SHL
            | opcode::SHR
            | opcode::SAR
            | opcode::KECCAK256 => {
                self.merge(1, 0);
                self.shift_up();
            }

            // 3 pops, 1 push.
            opcode::ADDMOD | opcode::MULMOD => {
                self.merge(2, 0);
                self.merge(2, 1);
                self.shift_up();
                self.shift_up();
            }

            // 1 pop, 0 push.
            opcode::POP | opcode::JUMP => self.shift_up(),

            // 2 pops, 0 push: the stored word's labels flow into memory.
            opcode::MSTORE => {
                let offset = step.stack_back(0).map_or(0u64, truncate_u64);
                self.stack_to_memory(1, offset, offset.saturating_add(32));
                self.shift_up();
                self.shift_up();
            }
            opcode::MSTORE8 => {
                let offset = step.stack_back(0).map_or(0u64, truncate_u64);
                self.stack_to_memory(1, offset, offset.saturating_add(1));
                self.shift_up();
                self.shift_up();
            }

            opcode::SSTORE | opcode::JUMPI | opcode::RETURN | opcode::REVERT => {
                self.shift_up();
                self.shift_up();
            }

            // 3 pops, 0 push.
            opcode::CODECOPY | opcode::CALLDATACOPY | opcode::RETURNDATACOPY => {
                self.shift_up();
                self.shift_up();
                self.shift_up();
            }

            // 4 pops, 0 push.
            opcode::EXTCODECOPY => {
                for _ in 0..4 {
                    self.shift_up();
                }
            }

            opcode::DUP1..=opcode::DUP16 => {
                let n = (op - opcode::DUP1 + 1) as usize;
                self.shift_down();
                // After the shift the duplicated operand sits at index n.
                self.copy(n, 0);
            }

            opcode::SWAP1..=opcode::SWAP16 => {
                let n = (op - opcode::SWAP1 + 1) as usize;
                self.swap(0, n);
            }

            opcode::LOG0..=opcode::LOG4 => {
                let n = (op - opcode::LOG0) as usize;
                for _ in 0..n + 2 {
                    self.shift_up();
                }
            }

            // Calls and creates: cross-contract taint is intentionally
            // ignored; only the net stack effect is applied.
            opcode::CREATE => {
                for _ in 0..3 {
                    self.shift_up();
                }
                self.shift_down();
            }
            opcode::CREATE2 => {
                for _ in 0..4 {
                    self.shift_up();
                }
                self.shift_down();
            }
            opcode::CALL | opcode::CALLCODE => {
                for _ in 0..7 {
                    self.shift_up();
                }
                self.shift_down();
            }
            opcode::DELEGATECALL | opcode::STATICCALL => {
                for _ in 0..6 {
                    self.shift_up();
                }
                self.shift_down();
            }

            // Everything else leaves the shadow stack untouched.
            _ => {}
        }
    }

    /// A value was pushed: every label set moves one index deeper.
    fn shift_down(&mut self) {
        let mut shifted = HashMap::with_capacity(self.stacks.len());
        for (index, labels) in self.stacks.drain() {
            shifted.insert(index + 1, labels);
        }
        self.stacks = shifted;
    }

    /// A value was popped: labels at index 0 are dropped, the rest move up.
    fn shift_up(&mut self) {
        let mut shifted = HashMap::with_capacity(self.stacks.len());
        for (index, labels) in self.stacks.drain() {
            if index > 0 {
                shifted.insert(index - 1, labels);
            }
        }
        self.stacks = shifted;
    }

    /// Union `src`'s labels into `dest`, emptying `src`.
    fn merge(&mut self, dest: usize, src: usize) {
        let Some(source_labels) = self.stacks.remove(&src) else {
            return;
        };
        self.stacks.entry(dest).or_default().extend(source_labels);
    }

    /// Copy `src`'s labels over `dest` (clearing `dest` when `src` is clean).
    fn copy(&mut self, src: usize, dest: usize) {
        match self.stacks.get(&src).cloned() {
            Some(labels) => {
                self.stacks.insert(dest, labels);
            }
            None => {
                self.stacks.remove(&dest);
            }
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        let labels_a = self.stacks.remove(&a);
        let labels_b = self.stacks.remove(&b);
        if let Some(labels) = labels_b {
            self.stacks.insert(a, labels);
        }
        if let Some(labels) = labels_a {
            self.stacks.insert(b, labels);
        }
    }

    /// Memory taint overlapping `[start, end)` becomes top-of-stack taint.
    fn memory_to_stack(&mut self, start: u64, end: u64) {
        let overlapping: Vec<TaintLabel> = self
            .memory
            .iter()
            .filter(|(_, (taint_start, taint_end))| end > *taint_start && start < *taint_end)
            .map(|(label, _)| *label)
            .collect();
        if !overlapping.is_empty() {
            self.stacks.entry(0).or_default().extend(overlapping);
        }
    }

    /// Stack slot labels become memory taint over `[start, end)`.
    fn stack_to_memory(&mut self, index: usize, start: u64, end: u64) {
        let Some(labels) = self.stacks.get(&index) else {
            return;
        };
        for label in labels {
            self.memory.insert(*label, (start, end));
        }
    }

    /// Stack slot labels become storage taint on `slot`.
    pub fn stack_to_storage(&mut self, index: usize, slot: U256) {
        let Some(labels) = self.stacks.get(&index).cloned() else {
            return;
        };
        self.storage.entry(slot).or_default().extend(labels);
    }

    /// Storage taint on `slot` becomes top-of-stack taint.
    pub fn storage_to_stack(&mut self, slot: &U256) {
        let Some(labels) = self.storage.get(slot).cloned() else {
            return;
        };
        self.stacks.entry(0).or_default().extend(labels);
    }
}

/// Low 64 bits of a 256-bit word, saturating on overflow. Memory offsets past
/// `u64::MAX` cannot address real memory anyway.
fn truncate_u64(value: U256) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
