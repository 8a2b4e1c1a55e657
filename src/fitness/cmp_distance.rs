//! Comparison-distance fitness signal.
//!
//! At every `LT/GT/SLT/SGT/EQ` the absolute (unsigned) difference of the two
//! operands is recorded per pc; smaller is better, so maps retain the minimum
//! ever observed. A distance of zero at a comparison means the fuzzer has found
//! inputs making both sides equal.

use alloy::primitives::{Address, B256, U256};
use revm::interpreter::opcode;
use std::collections::{HashMap, HashSet};
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::address_for_coverage;
use crate::utils::metadata::code_lookup_hash;

pub const CMP_DISTANCE_TRACER_RESULTS_KEY: &str = "CmpDistanceTracerResults";

/// Obtain the distance maps a [`CmpDistanceTracer`] stored on message results,
/// if the tracer was attached.
pub fn get_cmp_distance_results(results: &MessageResults) -> Option<&CmpDistanceMaps> {
    results.get::<CmpDistanceMaps>(CMP_DISTANCE_TRACER_RESULTS_KEY)
}

pub fn remove_cmp_distance_results(results: &mut MessageResults) -> bool {
    results.remove(CMP_DISTANCE_TRACER_RESULTS_KEY)
}

/// Minimum observed comparison distance per pc for one contract.
#[derive(Clone, Debug, Default)]
pub struct ContractCmpDistanceMap {
    distance: HashMap<u64, U256>,
}

impl ContractCmpDistanceMap {
    /// Record `diff` at `pc`, keeping the minimum. Returns whether the stored
    /// value changed.
    fn set_at(&mut self, pc: u64, diff: U256) -> bool {
        match self.distance.get_mut(&pc) {
            None => {
                self.distance.insert(pc, diff);
                true
            }
            Some(existing) if *existing > diff => {
                *existing = diff;
                true
            }
            Some(_) => false,
        }
    }

    fn update(&mut self, other: &ContractCmpDistanceMap) -> bool {
        let mut changed = false;
        for (pc, diff) in &other.distance {
            changed |= self.set_at(*pc, *diff);
        }
        changed
    }

    pub fn distance(&self, pc: u64) -> Option<U256> {
        self.distance.get(&pc).copied()
    }

    /// Number of comparison sites observed.
    pub fn covered_count(&self) -> usize {
        self.distance.len()
    }
}

/// Two-level distance container: code lookup hash → deployed address → map.
#[derive(Clone, Debug, Default)]
pub struct CmpDistanceMaps {
    maps: HashMap<B256, HashMap<Address, ContractCmpDistanceMap>>,
}

impl CmpDistanceMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.maps.clear();
    }

    pub fn set_at(&mut self, code_address: Address, lookup_hash: B256, pc: u64, diff: U256) -> bool {
        self.maps
            .entry(lookup_hash)
            .or_default()
            .entry(code_address)
            .or_default()
            .set_at(pc, diff)
    }

    /// Min-retaining merge. Returns whether any distance improved or appeared.
    pub fn update(&mut self, other: &CmpDistanceMaps) -> bool {
        let mut changed = false;
        for (hash, by_address) in &other.maps {
            let own = self.maps.entry(*hash).or_default();
            for (address, map) in by_address {
                changed |= own.entry(*address).or_default().update(map);
            }
        }
        changed
    }

    /// Drop everything recorded by the owning (reverted) frame.
    pub fn revert_all(&mut self) {
        self.maps.clear();
    }

    /// Aggregate distances for one bytecode across all its deployments.
    pub fn contract_map(&self, bytecode: &[u8], init: bool) -> Option<ContractCmpDistanceMap> {
        let hash = code_lookup_hash(bytecode, init);
        let by_address = self.maps.get(&hash)?;
        let mut total = ContractCmpDistanceMap::default();
        for map in by_address.values() {
            total.update(map);
        }
        Some(total)
    }

    /// Number of comparison sites observed, optionally restricted to targets.
    pub fn total_covered_cmp(&self, target_addresses: &[Address]) -> usize {
        let mut covered = 0;
        for by_address in self.maps.values() {
            if target_addresses.is_empty() {
                covered += by_address.values().map(|m| m.covered_count()).sum::<usize>();
            } else {
                for address in target_addresses {
                    if let Some(map) = by_address.get(address) {
                        covered += map.covered_count();
                    }
                }
            }
        }
        covered
    }
}

fn is_comparison(op: u8) -> bool {
    matches!(
        op,
        opcode::LT | opcode::GT | opcode::SLT | opcode::SGT | opcode::EQ
    )
}

struct CallFrameState {
    create: bool,
    pending: CmpDistanceMaps,
    lookup_hash: Option<B256>,
    address: Option<Address>,
}

/// Records `|x − y|` at every comparison opcode in the per-frame pending map.
#[derive(Default)]
pub struct CmpDistanceTracer {
    distances: CmpDistanceMaps,
    frames: Vec<CallFrameState>,
    initial_contracts: Option<HashSet<Address>>,
}

impl CmpDistanceTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_contracts(mut self, initial_contracts: Option<HashSet<Address>>) -> Self {
        self.initial_contracts = initial_contracts;
        self
    }
}

impl Tracer for CmpDistanceTracer {
    fn on_tx_start(&mut self) {
        self.distances = CmpDistanceMaps::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            pending: CmpDistanceMaps::new(),
            lookup_hash: None,
            address: None,
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("cmp distance tracer stepped outside any call frame");
        if frame.address.is_none() {
            frame.address = Some(step.storage_address);
        }
        if !is_comparison(step.opcode) || step.code.is_empty() {
            return;
        }
        let (Some(x), Some(y)) = (step.stack_back(0), step.stack_back(1)) else {
            return;
        };
        // Unsigned distance for every comparison flavor, signed ones included.
        let diff = if x > y { x - y } else { y - x };

        let hash = *frame
            .lookup_hash
            .get_or_insert_with(|| code_lookup_hash(step.code, step.create));
        let address = address_for_coverage(
            self.initial_contracts.as_ref(),
            frame.address.expect("frame address resolved above"),
        );
        frame.pending.set_at(address, hash, step.pc, diff);
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("cmp distance tracer frame stack underflow");
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
            CMP_DISTANCE_TRACER_RESULTS_KEY,
            mem::take(&mut self.distances),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> B256 {
        B256::repeat_byte(n)
    }

    fn address(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    #[test]
    fn test_minimum_is_retained() {
        let mut maps = CmpDistanceMaps::new();
        assert!(maps.set_at(address(1), hash(1), 7, U256::from(100)));
        assert!(!maps.set_at(address(1), hash(1), 7, U256::from(100)));
        assert!(maps.set_at(address(1), hash(1), 7, U256::from(3)));
        assert!(!maps.set_at(address(1), hash(1), 7, U256::from(50)));

        let map = &maps.maps[&hash(1)][&address(1)];
        assert_eq!(map.distance(7), Some(U256::from(3)));
    }

    #[test]
    fn test_merge_keeps_minimum_either_direction() {
        let mut a = CmpDistanceMaps::new();
        a.set_at(address(1), hash(1), 7, U256::from(10));
        let mut b = CmpDistanceMaps::new();
        b.set_at(address(1), hash(1), 7, U256::from(4));
        b.set_at(address(1), hash(1), 9, U256::from(1));

        let mut ab = a.clone();
        ab.update(&b);
        let mut ba = b.clone();
        ba.update(&a);

        for maps in [&ab, &ba] {
            let map = &maps.maps[&hash(1)][&address(1)];
            assert_eq!(map.distance(7), Some(U256::from(4)));
            assert_eq!(map.distance(9), Some(U256::from(1)));
        }
    }

    #[test]
    fn test_self_merge_is_identity() {
        let mut maps = CmpDistanceMaps::new();
        maps.set_at(address(1), hash(1), 7, U256::from(4));
        let snapshot = maps.clone();
        assert!(!maps.update(&snapshot));
        assert_eq!(maps.total_covered_cmp(&[]), 1);
    }
}
