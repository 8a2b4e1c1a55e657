//! Static branch enumeration.
//!
//! Bytecode is disassembled once per distinct code hash; every `JUMPI` site gets
//! an even base id. The fall-through side of a branch is `base`, the taken side
//! `base + 1`, so a map with `n` `JUMPI`s covers `2n` branch slots.

use alloy::primitives::B256;
use dashmap::DashMap;
use revm::interpreter::opcode;
use std::collections::HashMap;
use std::sync::Arc;

/// Iterator over instructions, honoring `PUSH1..PUSH32` operand lengths. An
/// incomplete trailing push terminates iteration without yielding the truncated
/// instruction; malformed bytecode is never an error.
pub struct InstructionIterator<'a> {
    code: &'a [u8],
    pc: usize,
    arg_len: usize,
    started: bool,
    truncated: bool,
}

impl<'a> InstructionIterator<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            pc: 0,
            arg_len: 0,
            started: false,
            truncated: false,
        }
    }

    /// Whether iteration stopped on an incomplete push instruction.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

impl Iterator for InstructionIterator<'_> {
    /// `(pc, opcode)`
    type Item = (u64, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated {
            return None;
        }
        if self.started {
            self.pc += 1 + self.arg_len;
        } else {
            self.started = true;
        }
        if self.pc >= self.code.len() {
            return None;
        }

        let op = self.code[self.pc];
        if (opcode::PUSH1..=opcode::PUSH32).contains(&op) {
            let operand_len = (op - opcode::PUSH1 + 1) as usize;
            if self.pc + 1 + operand_len > self.code.len() {
                self.truncated = true;
                return None;
            }
            self.arg_len = operand_len;
        } else {
            self.arg_len = 0;
        }
        Some((self.pc as u64, op))
    }
}

/// Number of instructions in `code` (push operands excluded).
pub fn instruction_count(code: &[u8]) -> usize {
    InstructionIterator::new(code).count()
}

/// `JUMPI` pc → even base branch id for one contract's code.
#[derive(Clone, Debug, Default)]
pub struct BranchMap {
    branch_ids: HashMap<u64, usize>,
}

impl BranchMap {
    pub fn from_bytecode(code: &[u8]) -> Self {
        let mut branch_ids = HashMap::new();
        let mut id = 0usize;
        for (pc, op) in InstructionIterator::new(code) {
            if op == opcode::JUMPI {
                branch_ids.insert(pc, id);
                id += 2;
            }
        }
        Self { branch_ids }
    }

    /// Total branch slots: two per `JUMPI`.
    pub fn size(&self) -> usize {
        self.branch_ids.len() * 2
    }

    pub fn contains(&self, pc: u64) -> bool {
        self.branch_ids.contains_key(&pc)
    }

    /// Branch slot for one side of the `JUMPI` at `pc`: base for fall-through,
    /// base + 1 for taken.
    pub fn branch_id(&self, pc: u64, taken: bool) -> usize {
        self.branch_ids.get(&pc).copied().unwrap_or(0) + usize::from(taken)
    }
}

/// Branch maps shared between the branch-coverage and branch-distance tracers
/// of a worker, keyed by code lookup hash. Reads vastly outnumber inserts.
#[derive(Debug, Default)]
pub struct BranchMapRegistry {
    maps: DashMap<B256, Arc<BranchMap>>,
}

impl BranchMapRegistry {
    pub fn insert(&self, hash: B256, map: BranchMap) {
        self.maps.insert(hash, Arc::new(map));
    }

    pub fn get(&self, hash: &B256) -> Option<Arc<BranchMap>> {
        self.maps.get(hash).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revm::interpreter::opcode::{ADD, JUMPDEST, JUMPI, PUSH1, PUSH2, STOP};

    #[test]
    fn test_push_operands_are_skipped() {
        // PUSH2 0x5757 would contain the JUMPI byte as operand data.
        let code = [PUSH2, 0x57, 0x57, ADD, STOP];
        let ops: Vec<_> = InstructionIterator::new(&code).collect();
        assert_eq!(ops, vec![(0, PUSH2), (3, ADD), (4, STOP)]);
    }

    #[test]
    fn test_truncated_push_ends_stream() {
        let code = [ADD, PUSH2, 0x01];
        let mut iterator = InstructionIterator::new(&code);
        assert_eq!(iterator.next(), Some((0, ADD)));
        assert_eq!(iterator.next(), None);
        assert!(iterator.truncated());
    }

    #[test]
    fn test_branch_ids_are_even_and_sequential() {
        // Two JUMPIs at pcs 4 and 9.
        let code = [
            PUSH1, 0x01, PUSH1, 0x08, JUMPI, PUSH1, 0x00, PUSH1, 0x08, JUMPI, JUMPDEST, STOP,
        ];
        let map = BranchMap::from_bytecode(&code);
        assert_eq!(map.size(), 4);
        assert!(map.contains(4) && map.contains(9));
        assert_eq!(map.branch_id(4, false) % 2, 0);
        assert_eq!(map.branch_id(4, true), map.branch_id(4, false) + 1);
        assert_ne!(map.branch_id(4, false), map.branch_id(9, false));
    }

    #[test]
    fn test_jumpi_as_last_instruction() {
        let code = [PUSH1, 0x01, PUSH1, 0xFF, JUMPI];
        let map = BranchMap::from_bytecode(&code);
        assert_eq!(map.size(), 2);
        assert!(map.contains(4));
    }

    #[test]
    fn test_empty_and_malformed_bytecode() {
        assert_eq!(BranchMap::from_bytecode(&[]).size(), 0);
        // A lone truncated push yields an empty map, not an error.
        assert_eq!(BranchMap::from_bytecode(&[PUSH2, 0x00]).size(), 0);
    }

    #[test]
    fn test_identical_instruction_streams_agree() {
        let a = [PUSH1, 0x01, PUSH1, 0x08, JUMPI, STOP];
        let b = a;
        let map_a = BranchMap::from_bytecode(&a);
        let map_b = BranchMap::from_bytecode(&b);
        assert_eq!(map_a.size(), map_b.size());
        assert_eq!(map_a.branch_id(4, true), map_b.branch_id(4, true));
    }

    #[test]
    fn test_instruction_count() {
        let code = [PUSH2, 0xAA, 0xBB, ADD, STOP];
        assert_eq!(instruction_count(&code), 3);
        assert_eq!(instruction_count(&[]), 0);
    }
}
