//! Per-instruction execution coverage.
//!
//! Coverage is keyed twice: by code lookup hash (so identical code deployed at
//! many addresses shares one map) and by deployed address under that hash. Each
//! map is a byte vector of hit flags sized to the bytecode; flags are monotonic
//! within a process and merge with byte-wise OR. The same container also backs
//! branch coverage, where the vector is sized to `2 × |JUMPI|` and indexed by
//! branch id instead of pc.

use alloy::primitives::{Address, B256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::mem;

use crate::chain::results::MessageResults;
use crate::chain::tracing::{FrameExit, FrameStart, StateView, StepScope, Tracer};
use crate::fitness::address_for_coverage;
use crate::fitness::branch_map::instruction_count;
use crate::utils::metadata::code_lookup_hash;

pub const CODE_COVERAGE_TRACER_RESULTS_KEY: &str = "CoverageTracerResults";

/// Obtain the coverage maps a [`CodeCoverageTracer`] stored on message results,
/// if the tracer was attached.
pub fn get_code_coverage_results(results: &MessageResults) -> Option<&CoverageMaps> {
    results.get::<CoverageMaps>(CODE_COVERAGE_TRACER_RESULTS_KEY)
}

pub fn remove_code_coverage_results(results: &mut MessageResults) -> bool {
    results.remove(CODE_COVERAGE_TRACER_RESULTS_KEY)
}

/// Hit flags for one bytecode. An empty vector means "no data yet"; flags are
/// allocated lazily on the first covered location.
#[derive(Clone, Debug, Default)]
pub struct CoverageBytes {
    executed_flags: Vec<u8>,
    covered_len: usize,
}

impl CoverageBytes {
    /// Mark `index` covered, allocating the flag vector for `size` entries of
    /// which `covered_len` are real instruction (or branch) slots. Returns
    /// whether new coverage was achieved; out-of-range indices are tolerated
    /// and return `false`.
    fn set_covered_at(&mut self, size: usize, covered_len: usize, index: u64) -> bool {
        if self.executed_flags.is_empty() {
            self.executed_flags = vec![0u8; size];
            self.covered_len = covered_len;
        }
        match self.executed_flags.get_mut(index as usize) {
            Some(flag) if *flag == 0 => {
                *flag = 1;
                true
            }
            _ => false,
        }
    }

    pub fn is_covered(&self, index: usize) -> bool {
        self.executed_flags.get(index).is_some_and(|flag| *flag != 0)
    }

    /// Byte-wise OR merge. Returns whether any flag flipped.
    fn update(&mut self, other: &CoverageBytes) -> bool {
        if other.executed_flags.is_empty() {
            return false;
        }
        if self.executed_flags.is_empty() {
            self.executed_flags = other.executed_flags.clone();
            self.covered_len = other.covered_len;
            return true;
        }
        let mut changed = false;
        let len = self.executed_flags.len().min(other.executed_flags.len());
        for i in 0..len {
            if self.executed_flags[i] == 0 && other.executed_flags[i] != 0 {
                self.executed_flags[i] = 1;
                changed = true;
            }
        }
        changed
    }

    fn reset(&mut self) {
        self.executed_flags.clear();
    }

    /// `(covered, total)` where total counts real instruction slots.
    fn coverage_rate(&self) -> (usize, usize) {
        let covered = self.executed_flags.iter().filter(|flag| **flag != 0).count();
        (covered, self.covered_len)
    }

    /// Equality up to the shorter vector, so init bytecode with differing
    /// constructor-argument lengths still compares equal.
    fn equivalent(&self, other: &CoverageBytes) -> bool {
        let len = self.executed_flags.len().min(other.executed_flags.len());
        self.executed_flags[..len] == other.executed_flags[..len]
    }
}

/// Coverage for one `(code hash, address)` pair. Only successful (non-reverted)
/// execution contributes.
#[derive(Clone, Debug, Default)]
pub struct ContractCoverageMap {
    successful: CoverageBytes,
}

impl ContractCoverageMap {
    fn set_covered_at(&mut self, size: usize, covered_len: usize, index: u64) -> bool {
        self.successful.set_covered_at(size, covered_len, index)
    }

    fn update(&mut self, other: &ContractCoverageMap) -> bool {
        self.successful.update(&other.successful)
    }

    pub fn is_covered(&self, index: usize) -> bool {
        self.successful.is_covered(index)
    }

    pub fn coverage_rate(&self) -> (usize, usize) {
        self.successful.coverage_rate()
    }

    pub fn byte_map(&self) -> &[u8] {
        &self.successful.executed_flags
    }

    pub fn equivalent(&self, other: &ContractCoverageMap) -> bool {
        self.successful.equivalent(&other.successful)
    }
}

/// Two-level coverage container: code lookup hash → deployed address → map.
/// Used both per call frame (pending), per tx, and as the process-global
/// accumulator; merges are associative and commutative.
#[derive(Clone, Debug, Default)]
pub struct CoverageMaps {
    maps: HashMap<B256, HashMap<Address, ContractCoverageMap>>,
}

impl CoverageMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.maps.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Mark one location covered. `size` and `covered_len` size the flag vector
    /// on first touch; zero-sized code is a no-op.
    pub fn set_at(
        &mut self,
        code_address: Address,
        lookup_hash: B256,
        size: usize,
        covered_len: usize,
        index: u64,
    ) -> bool {
        if size == 0 {
            return false;
        }
        self.maps
            .entry(lookup_hash)
            .or_default()
            .entry(code_address)
            .or_default()
            .set_covered_at(size, covered_len, index)
    }

    /// Merge `other` in. Returns whether coverage grew.
    pub fn update(&mut self, other: &CoverageMaps) -> bool {
        let mut changed = false;
        for (hash, by_address) in &other.maps {
            let own = self.maps.entry(*hash).or_default();
            for (address, map) in by_address {
                changed |= own.entry(*address).or_default().update(map);
            }
        }
        changed
    }

    /// Clear all successful coverage; used when the owning frame reverted.
    pub fn revert_all(&mut self) {
        for by_address in self.maps.values_mut() {
            for map in by_address.values_mut() {
                map.successful.reset();
            }
        }
    }

    /// Aggregate coverage for one bytecode across every address it was
    /// deployed at. `None` when the code was never traced.
    pub fn contract_map(&self, bytecode: &[u8], init: bool) -> Option<ContractCoverageMap> {
        let hash = code_lookup_hash(bytecode, init);
        let by_address = self.maps.get(&hash)?;
        let mut total = ContractCoverageMap::default();
        for map in by_address.values() {
            total.update(map);
        }
        Some(total)
    }

    /// `(covered, total)` over all maps, optionally restricted to the given
    /// deployed addresses.
    pub fn total_coverage(&self, target_addresses: &[Address]) -> (usize, usize) {
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

    /// Serializable dump of every byte map, keyed by hash and address strings.
    pub fn dump(&self) -> BTreeMap<String, BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for (hash, by_address) in &self.maps {
            let inner: &mut BTreeMap<String, Vec<u8>> = out.entry(hash.to_string()).or_default();
            for (address, map) in by_address {
                inner.insert(address.to_string(), map.byte_map().to_vec());
            }
        }
        out
    }

    /// Whether every map in `self` is present and equivalent in `other`.
    pub fn equivalent(&self, other: &CoverageMaps) -> bool {
        for (hash, by_address) in &self.maps {
            let Some(other_by_address) = other.maps.get(hash) else {
                return false;
            };
            for (address, map) in by_address {
                match other_by_address.get(address) {
                    Some(other_map) if map.equivalent(other_map) => {}
                    _ => return false,
                }
            }
        }
        true
    }
}

struct CallFrameState {
    create: bool,
    pending: CoverageMaps,
    lookup_hash: Option<B256>,
    address: Option<Address>,
}

/// Marks every executed pc in the per-frame pending map; merges into the parent
/// (or the tx map) on non-reverted exit, discards on revert.
#[derive(Default)]
pub struct CodeCoverageTracer {
    coverage: CoverageMaps,
    frames: Vec<CallFrameState>,
    instruction_len_cache: HashMap<B256, usize>,
    initial_contracts: Option<HashSet<Address>>,
}

impl CodeCoverageTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_contracts(mut self, initial_contracts: Option<HashSet<Address>>) -> Self {
        self.initial_contracts = initial_contracts;
        self
    }
}

impl Tracer for CodeCoverageTracer {
    fn on_tx_start(&mut self) {
        self.coverage = CoverageMaps::new();
        self.frames.clear();
    }

    fn on_enter(&mut self, frame: &FrameStart) {
        self.frames.push(CallFrameState {
            create: frame.create,
            pending: CoverageMaps::new(),
            lookup_hash: None,
            address: None,
        });
    }

    fn on_step(&mut self, step: &StepScope<'_>, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .last_mut()
            .expect("code coverage tracer stepped outside any call frame");
        if step.code.is_empty() {
            return;
        }
        if frame.address.is_none() {
            frame.address = Some(step.storage_address);
        }
        let hash = *frame
            .lookup_hash
            .get_or_insert_with(|| code_lookup_hash(step.code, step.create));
        let instruction_len = *self
            .instruction_len_cache
            .entry(hash)
            .or_insert_with(|| instruction_count(step.code));
        let address = address_for_coverage(
            self.initial_contracts.as_ref(),
            frame.address.expect("frame address resolved above"),
        );
        frame
            .pending
            .set_at(address, hash, step.code.len(), instruction_len, step.pc);
    }

    fn on_exit(&mut self, exit: &FrameExit, _state: &mut dyn StateView) {
        let frame = self
            .frames
            .pop()
            .expect("code coverage tracer frame stack underflow");
        let mut pending = frame.pending;
        if exit.reverted {
            pending.revert_all();
        }
        match self.frames.last_mut() {
            Some(parent) => parent.pending.update(&pending),
            None => self.coverage.update(&pending),
        };
    }

    fn on_tx_end(&mut self, results: &mut MessageResults) {
        results.insert(CODE_COVERAGE_TRACER_RESULTS_KEY, mem::take(&mut self.coverage));
    }
}
