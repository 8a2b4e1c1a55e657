//! Worker-side wiring: contract definitions, tracer attachment, execution.

pub mod metrics;
pub mod onchain;

use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes, U256};
use std::collections::HashSet;
use std::sync::Arc;

use crate::bugs::BugDetectorTracer;
use crate::chain::results::MessageResults;
use crate::chain::tracing::TracerStack;
use crate::chain::TestChain;
use crate::error::Result;
use crate::fitness::branch_coverage::BranchCoverageTracer;
use crate::fitness::branch_distance::BranchDistanceTracer;
use crate::fitness::branch_map::{BranchMap, BranchMapRegistry};
use crate::fitness::cmp_distance::CmpDistanceTracer;
use crate::fitness::code_coverage::CodeCoverageTracer;
use crate::fitness::dataflow::DataflowTracer;
use crate::fitness::storage_write::StorageWriteTracer;
use crate::fitness::token_flow::TokenflowTracer;
use crate::utils::config::FuzzingConfig;
use crate::utils::metadata::{code_lookup_hash, strip_metadata};

/// One fuzzing target: compiled bytecode plus (optionally) its ABI. In
/// on-chain mode `name` is the target's address string and the runtime
/// bytecode is adopted from chain state.
#[derive(Clone, Debug)]
pub struct ContractDefinition {
    pub name: String,
    pub init_bytecode: Option<Bytes>,
    pub runtime_bytecode: Bytes,
    pub abi: Option<JsonAbi>,
}

/// Last match of `needle` in `haystack`.
fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

/// Register the branch maps for one contract definition.
///
/// The runtime bytecode (metadata included) is cut off the tail of the init
/// bytecode before disassembly so constructor branch ids stay stable across
/// differing constructor arguments; the runtime map is built from
/// metadata-stripped code (branch pcs are unaffected by stripping the tail).
pub fn register_branch_maps(registry: &BranchMapRegistry, definition: &ContractDefinition) {
    if let Some(init_bytecode) = &definition.init_bytecode {
        let hash = code_lookup_hash(init_bytecode, true);
        let mut constructor_code: &[u8] = init_bytecode;
        if let Some(offset) = find_last(init_bytecode, &definition.runtime_bytecode) {
            constructor_code = &init_bytecode[..offset];
        }
        registry.insert(hash, BranchMap::from_bytecode(constructor_code));
    }
    if !definition.runtime_bytecode.is_empty() {
        let hash = code_lookup_hash(&definition.runtime_bytecode, false);
        let runtime_code = strip_metadata(&definition.runtime_bytecode);
        registry.insert(hash, BranchMap::from_bytecode(runtime_code));
    }
}

/// One fuzzer worker: its own chain, its own tracer stack, no state shared
/// with other workers during a transaction.
pub struct FuzzerWorker {
    pub chain: TestChain,
    pub stack: TracerStack,
    pub worker_index: usize,
}

impl FuzzerWorker {
    pub fn new(
        worker_index: usize,
        config: &FuzzingConfig,
        contracts: &[ContractDefinition],
        helper_contract: Address,
    ) -> Self {
        let registry = Arc::new(BranchMapRegistry::default());
        for definition in contracts {
            register_branch_maps(&registry, definition);
        }

        let mut stack = TracerStack::new();
        attach_tracers(&mut stack, config, &registry, helper_contract);

        Self {
            chain: TestChain::new(),
            stack,
            worker_index,
        }
    }

    pub fn deploy(
        &mut self,
        deployer: Address,
        init_code: Bytes,
        value: U256,
    ) -> Result<(Address, MessageResults)> {
        self.chain.deploy(&mut self.stack, deployer, init_code, value)
    }

    pub fn call(
        &mut self,
        from: Address,
        to: Address,
        input: Bytes,
        value: U256,
    ) -> Result<MessageResults> {
        self.chain.call(&mut self.stack, from, to, input, value)
    }
}

/// Wire every enabled tracer onto the stack.
pub fn attach_tracers(
    stack: &mut TracerStack,
    config: &FuzzingConfig,
    registry: &Arc<BranchMapRegistry>,
    helper_contract: Address,
) {
    let initial_contracts: Option<HashSet<Address>> = config
        .initial_contracts
        .as_ref()
        .map(|addresses| addresses.iter().copied().collect());

    if config.code_coverage_tracing {
        stack.add_tracer(Box::new(
            CodeCoverageTracer::new().with_initial_contracts(initial_contracts.clone()),
        ));
    }
    if config.branch_coverage_tracing {
        stack.add_tracer(Box::new(
            BranchCoverageTracer::new(Arc::clone(registry))
                .with_initial_contracts(initial_contracts.clone()),
        ));
    }
    if config.cmp_distance_tracing {
        stack.add_tracer(Box::new(
            CmpDistanceTracer::new().with_initial_contracts(initial_contracts),
        ));
    }
    if config.branch_distance_tracing {
        stack.add_tracer(Box::new(BranchDistanceTracer::new(Arc::clone(registry))));
    }
    if config.dataflow_tracing {
        stack.add_tracer(Box::new(DataflowTracer::new()));
    }
    if config.storage_write_tracing {
        stack.add_tracer(Box::new(StorageWriteTracer::new()));
    }
    if config.tokenflow_tracing {
        stack.add_tracer(Box::new(TokenflowTracer::new()));
    }

    if config.bug_detection_enabled {
        let mut detector = BugDetectorTracer::new(helper_contract, config.bug_detection.clone());

        if config.bug_detection.ether_leaking {
            detector.set_original_ether(&config.sender_address_balances);
        }
        if config.bug_detection.ether_leaking || config.bug_detection.unsafe_delegatecall {
            let mut adversarial: Vec<Address> = config.sender_addresses.clone();
            if helper_contract != Address::ZERO {
                adversarial.push(helper_contract);
            }
            detector.set_adversarial_addresses(&adversarial);
        }
        stack.add_tracer(Box::new(detector));
    }
}
