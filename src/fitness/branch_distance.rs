//! Branch-distance fitness signal.
//!
//! At every `JUMPI` the distance to flipping the branch is estimated: the taken
//! side gets distance 0, the not-taken side gets a value recovered by walking
//! backwards through a bounded window of operand-stack snapshots until the
//! instruction that produced the condition is found. The walk is a cheap local
//! symbolic trace, not a solver: it only needs to find *one* producing
//! comparison/arithmetic site to yield a continuous signal.

use alloy::primitives::{Address, B256, U256};
use revm::interpreter::opcode;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::branch_map::BranchMapRegistry;
use crate::utils::metadata::code_lookup_hash;

pub const BRANCH_DISTANCE_TRACER_RESULTS_KEY: &str = "BranchDistanceTracerResults";

/// Snapshots kept per frame for back-propagation.
const BACKPROP_WINDOW: usize = 40;

/// Additive constant keeping the active-side distance strictly positive.
fn distance_k() -> U256 {
    U256::from(1)
}

/// Obtain the distance maps a [`BranchDistanceTracer`] stored on message
/// results, if the tracer was attached.
pub fn get_branch_distance_results(results: &MessageResults) -> Option<&BranchDistanceMaps> {
    results.get::<BranchDistanceMaps>(BRANCH_DISTANCE_TRACER_RESULTS_KEY)
}

pub fn remove_branch_distance_results(results: &mut MessageResults) -> bool {
    results.remove(BRANCH_DISTANCE_TRACER_RESULTS_KEY)
}

/// Outcome of one back-propagation walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchDistanceStatus {
    Found,
    NotFound,
    NotJumpi,
    StackOutOfScope,
    EndWithCall,
}

impl BranchDistanceStatus {
    pub fn is_found(self) -> bool {
        matches!(self, Self::Found | Self::EndWithCall)
    }
}

/// One recorded instruction: opcode plus a copy of the operand stack (bottom to
/// top) as it looked before execution.
#[derive(Clone, Debug)]
struct Operation {
    opcode: u8,
    stack: Vec<U256>,
}

/// Per-branch-id minimum distances for one contract, with hit flags sized to
/// the contract's branch count.
#[derive(Clone, Debug, Default)]
pub struct ContractBranchDistanceMap {
    executed_flags: Vec<u8>,
    distance: HashMap<usize, U256>,
}

impl ContractBranchDistanceMap {
    /// Record `distance` for branch slot `id`, keeping the minimum. Out-of-range
    /// ids are tolerated and return `false`.
    fn set_distance_at(&mut self, branch_size: usize, id: usize, distance: U256) -> bool {
        if self.executed_flags.is_empty() {
            self.executed_flags = vec![0u8; branch_size];
        }
        if id >= self.executed_flags.len() {
            return false;
        }
        if self.executed_flags[id] == 0 {
            self.executed_flags[id] = 1;
            self.distance.insert(id, distance);
            return true;
        }
        match self.distance.get_mut(&id) {
            Some(existing) if *existing > distance => {
                *existing = distance;
                true
            }
            _ => false,
        }
    }

    fn update(&mut self, other: &ContractBranchDistanceMap) -> bool {
        if other.executed_flags.is_empty() {
            return false;
        }
        if self.executed_flags.is_empty() {
            self.executed_flags = other.executed_flags.clone();
            self.distance = other.distance.clone();
            return true;
        }
        let mut changed = false;
        let len = self.executed_flags.len().min(other.executed_flags.len());
        for id in 0..len {
            if other.executed_flags[id] == 0 {
                continue;
            }
            let Some(theirs) = other.distance.get(&id) else {
                continue;
            };
            if self.executed_flags[id] == 0 {
                self.executed_flags[id] = 1;
                self.distance.insert(id, *theirs);
                changed = true;
            } else if self.distance.get(&id).is_some_and(|ours| ours > theirs) {
                self.distance.insert(id, *theirs);
                changed = true;
            }
        }
        changed
    }

    fn reset(&mut self) {
        self.executed_flags.clear();
        self.distance.clear();
    }

    pub fn distance(&self, id: usize) -> Option<U256> {
        self.distance.get(&id).copied()
    }

    /// `(covered, total)` branch slots.
    pub fn coverage_rate(&self) -> (usize, usize) {
        let covered = self.executed_flags.iter().filter(|flag| **flag != 0).count();
        (covered, self.executed_flags.len())
    }
}

/// Two-level distance container: code lookup hash → deployed address → map.
#[derive(Clone, Debug, Default)]
pub struct BranchDistanceMaps {
    maps: HashMap<B256, HashMap<Address, ContractBranchDistanceMap>>,
}

impl BranchDistanceMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.maps.clear();
    }

    pub fn set_at(
        &mut self,
        code_address: Address,
        lookup_hash: B256,
        branch_size: usize,
        id: usize,
        distance: U256,
    ) -> bool {
        if branch_size == 0 {
            return false;
        }
        self.maps
            .entry(lookup_hash)
            .or_default()
            .entry(code_address)
            .or_default()
            .set_distance_at(branch_size, id, distance)
    }

    pub fn update(&mut self, other: &BranchDistanceMaps) -> bool {
        let mut changed = false;
        for (hash, by_address) in &other.maps {
            let own = self.maps.entry(*hash).or_default();
            for (address, map) in by_address {
                changed |= own.entry(*address).or_default().update(map);
            }
        }
        changed
    }

    pub fn revert_all(&mut self) {
        for by_address in self.maps.values_mut() {
            for map in by_address.values_mut() {
                map.reset();
            }
        }
    }

    /// Aggregate distances for one bytecode across all its deployments.
    pub fn contract_map(&self, bytecode: &[u8], init: bool) -> Option<ContractBranchDistanceMap> {
        let hash = code_lookup_hash(bytecode, init);
        let by_address = self.maps.get(&hash)?;
        let mut total = ContractBranchDistanceMap::default();
        for map in by_address.values() {
            total.update(map);
        }
        Some(total)
    }

    /// `(covered, total)` branch slots over all maps, optionally restricted to
    /// the given deployed addresses.
    pub fn total_branch_distance(&self, target_addresses: &[Address]) -> (usize, usize) {
        let mut covered = 0;
        let mut total = 0;
        for by_address in self.maps.values() {
            if target_addresses.is_empty() {
                for map in by_address.values() {
                    let (c, t) = map.coverage_rate();
                    covered += c;
                    total += t;
                }
            } else {
                for address in target_addresses {
                    if let Some(map) = by_address.get(address) {
                        let (c, t) = map.coverage_rate();
                        covered += c;
                        total += t;
                    }
                }
            }
        }
        (covered, total)
    }
}

/// Signed greater-than over two's-complement 256-bit words.
fn sgt(x: &U256, y: &U256) -> bool {
    match (x.bit(255), y.bit(255)) {
        (false, true) => true,
        (true, false) => false,
        _ => x > y,
    }
}

/// Walk backwards from the `JUMPI` snapshot (the last recorded operation)
/// tracking the stack slot holding the condition until a producing instruction
/// is found. `source_index` is an absolute index into each snapshot (0 =
/// bottom); it is retargeted through `DUP`/`SWAP` and invalidated when it runs
/// out of the snapshot's scope.
fn back_propagate(operations: &VecDeque<Operation>) -> (U256, BranchDistanceStatus) {
    let Some(last) = operations.back() else {
        return (U256::ZERO, BranchDistanceStatus::NotJumpi);
    };
    if last.opcode != opcode::JUMPI {
        return (U256::ZERO, BranchDistanceStatus::NotJumpi);
    }
    if last.stack.len() < 2 {
        return (U256::ZERO, BranchDistanceStatus::StackOutOfScope);
    }

    let len = operations.len();
    let mut source_index = last.stack.len() as isize - 2;
    let mut base_value = last.stack[source_index as usize];
    let mut status = BranchDistanceStatus::NotFound;
    let mut diff = U256::ZERO;

    for i in (len.saturating_sub(BACKPROP_WINDOW - 1)..len).rev() {
        let operation = &operations[i];
        let op = operation.opcode;
        let stack = &operation.stack;
        let stack_len = stack.len() as isize;

        match op {
            opcode::LT | opcode::GT | opcode::EQ if source_index == stack_len - 2 => {
                let x = stack[stack_len as usize - 1];
                let y = stack[stack_len as usize - 2];
                diff = if x > y { x - y } else { y - x };
                status = BranchDistanceStatus::Found;
            }
            opcode::SLT | opcode::SGT if source_index == stack_len - 2 => {
                let x = stack[stack_len as usize - 1];
                let y = stack[stack_len as usize - 2];
                diff = if sgt(&x, &y) {
                    x.wrapping_sub(y)
                } else {
                    y.wrapping_sub(x)
                };
                status = BranchDistanceStatus::Found;
            }
            opcode::AND if source_index == stack_len - 2 => {
                let x = stack[stack_len as usize - 1];
                let y = stack[stack_len as usize - 2];
                diff = x.min(y);
                status = BranchDistanceStatus::Found;
            }
            opcode::OR if source_index == stack_len - 2 => {
                let x = stack[stack_len as usize - 1];
                let y = stack[stack_len as usize - 2];
                diff = x.max(y);
                status = BranchDistanceStatus::Found;
            }
            opcode::NOT if source_index == stack_len - 1 => {
                // Flip the base truth value and keep walking.
                base_value = if base_value.is_zero() {
                    U256::from(1)
                } else {
                    U256::ZERO
                };
            }
            opcode::ADD..=opcode::MULMOD if source_index == stack_len - 2 => {
                diff = base_value;
                status = BranchDistanceStatus::Found;
            }
            opcode::ISZERO if source_index == stack_len - 1 => {
                diff = base_value;
                status = BranchDistanceStatus::Found;
            }
            opcode::SELFBALANCE if source_index == stack_len => {
                diff = base_value;
                status = BranchDistanceStatus::Found;
            }
            // DUP expands the stack, so a source produced by it sits one past
            // the snapshot's depth; retarget to the duplicated operand.
            opcode::DUP1..=opcode::DUP16 if source_index == stack_len => {
                source_index = stack_len - 1 - (op - opcode::DUP1) as isize;
            }
            opcode::SWAP1..=opcode::SWAP16 => {
                let n = (op - opcode::SWAP1 + 1) as isize;
                if source_index == stack_len - 1 {
                    source_index = stack_len - 1 - n;
                } else if source_index == stack_len - 1 - n {
                    source_index = stack_len - 1;
                }
            }
            opcode::PUSH1..=opcode::PUSH32 if source_index == stack_len => {
                diff = base_value;
                status = BranchDistanceStatus::Found;
            }
            opcode::CALL if source_index == stack_len - 7 => {
                diff = last.stack[last.stack.len() - 2];
                status = BranchDistanceStatus::EndWithCall;
            }
            opcode::STATICCALL | opcode::DELEGATECALL if source_index == stack_len - 6 => {
                diff = last.stack[last.stack.len() - 2];
                status = BranchDistanceStatus::EndWithCall;
            }
            opcode::CALLVALUE if source_index == stack_len => {
                // The pushed value is visible in the next snapshot.
                match operations
                    .get(i + 1)
                    .and_then(|next| next.stack.get(source_index as usize))
                {
                    Some(value) => {
                        diff = *value;
                        status = BranchDistanceStatus::Found;
                    }
                    None => return (diff, BranchDistanceStatus::StackOutOfScope),
                }
            }
            _ => {}
        }

        if source_index > stack_len {
            return (diff, BranchDistanceStatus::StackOutOfScope);
        }
        if status.is_found() {
            return (diff, status);
        }
    }
    (diff, BranchDistanceStatus::NotFound)
}

struct CallFrameState {
    create: bool,
    pending: BranchDistanceMaps,
    lookup_hash: Option<B256>,
    operations: VecDeque<Operation>,
}

/// Computes both branch-side distances at every `JUMPI` of registered
/// contracts.
pub struct BranchDistanceTracer {
    distances: BranchDistanceMaps,
    frames: Vec<CallFrameState>,
    registry: Arc<BranchMapRegistry>,
}

impl BranchDistanceTracer {
    pub fn new(registry: Arc<BranchMapRegistry>) -> Self {
        Self {
            distances: BranchDistanceMaps::new(),
            frames: Vec::new(),
            registry,
        }
    }
}

impl Tracer for BranchDistanceTracer {
    fn on_tx_start(&mut self) {
        self.distances = BranchDistanceMaps::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            pending: BranchDistanceMaps::new(),
            lookup_hash: None,
            operations: VecDeque::with_capacity(BACKPROP_WINDOW),
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("branch distance tracer stepped outside any call frame");
        if step.code.is_empty() {
            return;
        }

        if frame.operations.len() == BACKPROP_WINDOW {
            frame.operations.pop_front();
        }
        frame.operations.push_back(Operation {
            opcode: step.opcode,
            stack: step.stack.to_vec(),
        });

        if step.opcode != opcode::JUMPI {
            return;
        }
        let hash = *frame
            .lookup_hash
            .get_or_insert_with(|| code_lookup_hash(step.code, step.create));
        let Some(branch_map) = self.registry.get(&hash) else {
            // This contract is not in the set being traced.
            return;
        };
        let Some(cond) = step.stack_back(1) else {
            return;
        };
        let branch_size = branch_map.size();

        let (distance_to_zero, distance_to_nonzero) = if !cond.is_zero() {
            // Branch taken: flipping means driving the condition to zero.
            let to_zero = if cond > U256::from(1) {
                cond
            } else {
                back_propagate(&frame.operations).0
            };
            (to_zero.wrapping_add(distance_k()), U256::ZERO)
        } else {
            // Fall-through: flipping means making the condition non-zero.
            let to_nonzero = back_propagate(&frame.operations).0;
            (U256::ZERO, to_nonzero.wrapping_add(distance_k()))
        };

        frame.pending.set_at(
            step.storage_address,
            hash,
            branch_size,
            branch_map.branch_id(step.pc, false),
            distance_to_zero,
        );
        frame.pending.set_at(
            step.storage_address,
            hash,
            branch_size,
            branch_map.branch_id(step.pc, true),
            distance_to_nonzero,
        );
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("branch distance tracer frame stack underflow");
        let mut pending = frame.pending;
        if exit.reverted {
            pending.revert_all();
        }
        match self.frames.last_mut() {
            Some(parent) => parent.pending.update(&pending),
            None => self.distances.update(&pending),
        };
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(
            BRANCH_DISTANCE_TRACER_RESULTS_KEY,
            mem::take(&mut self.distances),
        );
    }
}
