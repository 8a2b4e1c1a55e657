//! Fitness-signal properties exercised end-to-end: revert no-ops, dataflow
//! pairing, branch-distance signs, min retention, merge commutativity.

mod common;

use alloy::primitives::{Address, Bytes, B256, U256};
use anyhow::Result;
use revm::interpreter::opcode::{
    CALL, CALLDATALOAD, JUMPDEST, JUMPI, LT, MSTORE, POP, REVERT, SLOAD, SSTORE, STOP,
};
use shadowfuzz::fitness::branch_coverage::get_branch_coverage_results;
use shadowfuzz::fitness::branch_distance::get_branch_distance_results;
use shadowfuzz::fitness::branch_map::BranchMap;
use shadowfuzz::fitness::cmp_distance::get_cmp_distance_results;
use shadowfuzz::fitness::code_coverage::{get_code_coverage_results, CoverageMaps};
use shadowfuzz::fitness::dataflow::{get_dataflow_results, Dataflow};
use shadowfuzz::fitness::storage_write::{get_storage_write_results, StorageWrite};
use shadowfuzz::fitness::token_flow::get_tokenflow_results;
use shadowfuzz::fitness::{ProgramPosition, StorageSlotKey};
use shadowfuzz::fuzzing::metrics::FuzzerMetrics;
use shadowfuzz::utils::config::MetricRecordConfig;

use common::{attacker, default_config, definition_for, deployer, init_code_for, word, Asm};

/// Deterministic generator for permutation-style properties (no external
/// prop-testing dependency needed).
#[derive(Clone, Copy)]
struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1);
        self.state
    }
}

#[test]
fn test_reverted_subframe_contributes_nothing() -> Result<()> {
    // Callee: write storage, then revert.
    let mut callee = Asm::new();
    callee.push1(0x01).push1(0x05);
    let callee_sstore_pc = callee.pc();
    callee.op(SSTORE);
    callee.push1(0x00).push1(0x00).op(REVERT);
    let callee_runtime = callee.build();
    let callee_init = init_code_for(&callee_runtime);

    let config = default_config();
    let mut worker = common::worker_for(
        &config,
        &[definition_for("Reverter", &callee_init, &callee_runtime)],
    );
    let (callee_address, _) = worker.deploy(deployer(), Bytes::from(callee_init), U256::ZERO)?;

    // Caller: call the reverter (ignoring failure), then do its own write.
    let mut caller = Asm::new();
    caller.push1(0x00); // retSize
    caller.push1(0x00); // retOffset
    caller.push1(0x00); // argsSize
    caller.push1(0x00); // argsOffset
    caller.push1(0x00); // value
    caller.push20(callee_address);
    caller.push2(0xFFFF);
    caller.op(CALL);
    caller.op(POP);
    caller.push1(0x07).push1(0x01);
    let caller_sstore_pc = caller.pc();
    caller.op(SSTORE);
    caller.op(STOP);
    let caller_runtime = caller.build();
    let caller_init = init_code_for(&caller_runtime);

    let (caller_address, _) = worker.deploy(deployer(), Bytes::from(caller_init), U256::ZERO)?;
    let results = worker.call(attacker(), caller_address, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    // The reverted callee frame contributed no storage-write fingerprint; the
    // caller's own write survived.
    let writes = get_storage_write_results(&results).expect("storage write attached");
    assert_eq!(writes.total_storage_write_count(), 1);
    let expected = StorageWrite {
        position: ProgramPosition {
            address: caller_address,
            create: false,
            pc: caller_sstore_pc,
        },
        slot: StorageSlotKey {
            address: caller_address,
            slot: U256::from(1),
        },
        value: U256::from(7),
    };
    assert!(writes.contains_key(&expected.bucket_key()));

    // The callee's coverage was cleared by the revert.
    let coverage = get_code_coverage_results(&results).expect("code coverage attached");
    if let Some(callee_map) = coverage.contract_map(&callee_runtime, false) {
        assert!(!callee_map.is_covered(callee_sstore_pc as usize));
        assert!(!callee_map.is_covered(0));
    }
    let caller_map = coverage
        .contract_map(&caller_runtime, false)
        .expect("caller coverage present");
    assert!(caller_map.is_covered(caller_sstore_pc as usize));
    Ok(())
}

#[test]
fn test_dataflow_pairs_write_with_later_read() -> Result<()> {
    // SSTORE slot 3, then SLOAD it back in the same transaction.
    let mut asm = Asm::new();
    asm.push1(0x09).push1(0x03);
    let write_pc = asm.pc();
    asm.op(SSTORE);
    asm.push1(0x03);
    let read_pc = asm.pc();
    asm.op(SLOAD);
    asm.op(POP);
    asm.op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Store", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;
    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let dataflow = get_dataflow_results(&results).expect("dataflow attached");
    let expected = Dataflow {
        write: ProgramPosition {
            address: contract,
            create: false,
            pc: write_pc,
        },
        read: ProgramPosition {
            address: contract,
            create: false,
            pc: read_pc,
        },
        slot: StorageSlotKey {
            address: contract,
            slot: U256::from(3),
        },
    };
    assert!(
        dataflow.contains(&expected),
        "missing def-use pair; set has {} pairs",
        dataflow.total_dataflow_count()
    );
    Ok(())
}

/// Branchy target: jump when calldata word > 10.
fn branchy_runtime() -> (Vec<u8>, u64, u64) {
    let mut asm = Asm::new();
    asm.push1(0x00);
    asm.op(CALLDATALOAD);
    asm.push1(0x0A);
    let lt_pc = asm.pc();
    asm.op(LT); // 10 < input
    asm.push1(0x0A); // destination: the JUMPDEST below
    let jumpi_pc = asm.pc();
    asm.op(JUMPI);
    asm.op(STOP);
    asm.op(JUMPDEST);
    asm.op(STOP);
    let runtime = asm.build();
    assert_eq!(runtime[10], JUMPDEST, "jump destination drifted");
    (runtime, lt_pc, jumpi_pc)
}

#[test]
fn test_branch_distance_signs_and_cmp_minimum() -> Result<()> {
    let (runtime, lt_pc, jumpi_pc) = branchy_runtime();
    let init = init_code_for(&runtime);
    let branch_map = BranchMap::from_bytecode(&runtime);
    let fallthrough_id = branch_map.branch_id(jumpi_pc, false);
    let taken_id = branch_map.branch_id(jumpi_pc, true);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Branchy", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    // Run 1: input 100 → branch taken.
    let taken = worker.call(attacker(), contract, Bytes::from(word(U256::from(100))), U256::ZERO)?;
    assert!(!taken.reverted());
    let distances = get_branch_distance_results(&taken).expect("branch distance attached");
    let map = distances.contract_map(&runtime, false).expect("traced");
    assert_eq!(map.distance(taken_id), Some(U256::ZERO));
    // |10 - 100| + K
    assert_eq!(map.distance(fallthrough_id), Some(U256::from(91)));
    let cmp = get_cmp_distance_results(&taken).expect("cmp distance attached");
    assert_eq!(
        cmp.contract_map(&runtime, false).unwrap().distance(lt_pc),
        Some(U256::from(90))
    );

    // Run 2: input 3 → fall-through.
    let fell = worker.call(attacker(), contract, Bytes::from(word(U256::from(3))), U256::ZERO)?;
    assert!(!fell.reverted());
    let distances = get_branch_distance_results(&fell).expect("branch distance attached");
    let map = distances.contract_map(&runtime, false).expect("traced");
    assert_eq!(map.distance(fallthrough_id), Some(U256::ZERO));
    // |10 - 3| + K
    assert_eq!(map.distance(taken_id), Some(U256::from(8)));

    // Per-branch flags: the fall-through side was hit in this run.
    let branch_coverage = get_branch_coverage_results(&fell).expect("branch coverage attached");
    let per_tx = branch_coverage.contract_map(&runtime, false).expect("traced");
    assert!(per_tx.is_covered(fallthrough_id));

    // Min-merging the two per-tx cmp maps keeps the closer observation.
    let mut merged = get_cmp_distance_results(&taken).unwrap().clone();
    merged.update(get_cmp_distance_results(&fell).unwrap());
    assert_eq!(
        merged.contract_map(&runtime, false).unwrap().distance(lt_pc),
        Some(U256::from(7))
    );
    Ok(())
}

#[test]
fn test_branch_coverage_accumulates_both_sides() -> Result<()> {
    let (runtime, _, jumpi_pc) = branchy_runtime();
    let init = init_code_for(&runtime);
    let branch_map = BranchMap::from_bytecode(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Branchy", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    let metrics = FuzzerMetrics::new(1, None, MetricRecordConfig::default());
    for input in [100u64, 3] {
        let results = worker.call(
            attacker(),
            contract,
            Bytes::from(word(U256::from(input))),
            U256::ZERO,
        )?;
        metrics.update_indicators(&results);
    }

    let global = metrics.branch_coverage();
    let map = global.contract_map(&runtime, false).expect("traced");
    assert!(map.is_covered(branch_map.branch_id(jumpi_pc, true)));
    assert!(map.is_covered(branch_map.branch_id(jumpi_pc, false)));
    Ok(())
}

#[test]
fn test_erc20_transfer_token_flow() -> Result<()> {
    let token = Address::repeat_byte(0x70);

    // Build transfer(attacker, 5) calldata in memory, then call the token.
    let mut selector_word = [0u8; 32];
    selector_word[..4].copy_from_slice(&[0xa9, 0x05, 0x9c, 0xbb]);

    let mut asm = Asm::new();
    asm.push32(selector_word);
    asm.push1(0x00);
    asm.op(MSTORE); // mem[0..32] = selector ++ zeroes
    asm.push20(attacker());
    asm.push1(0x04);
    asm.op(MSTORE); // mem[4..36] = to word
    asm.push1(0x05);
    asm.push1(0x24);
    asm.op(MSTORE); // mem[36..68] = amount word
    asm.push1(0x00); // retSize
    asm.push1(0x00); // retOffset
    asm.push1(0x44); // argsSize = 68
    asm.push1(0x00); // argsOffset
    asm.push1(0x00); // value
    asm.push20(token);
    asm.push2(0xFFFF);
    let call_pc = asm.pc();
    asm.op(CALL);
    asm.op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Spender", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;
    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let flows = get_tokenflow_results(&results).expect("tokenflow attached");
    assert!(
        flows.flows().any(|flow| {
            flow.position.pc == call_pc
                && flow.token == token
                && flow.from == contract
                && flow.to == attacker()
                && flow.amount == U256::from(5)
        }),
        "expected an ERC-20 transfer flow; set has {} flows",
        flows.total_tokenflow_count()
    );
    Ok(())
}

#[test]
fn test_all_tracer_result_keys_present() -> Result<()> {
    let mut asm = Asm::new();
    asm.op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Nop", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;
    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;

    assert!(get_code_coverage_results(&results).is_some());
    assert!(get_branch_coverage_results(&results).is_some());
    assert!(get_cmp_distance_results(&results).is_some());
    assert!(get_branch_distance_results(&results).is_some());
    assert!(get_dataflow_results(&results).is_some());
    assert!(get_storage_write_results(&results).is_some());
    assert!(get_tokenflow_results(&results).is_some());
    assert!(shadowfuzz::bugs::get_bug_detector_results(&results).is_some());
    Ok(())
}

#[test]
fn test_coverage_merge_is_permutation_invariant() {
    let mut lcg = Lcg::new(0x5eed);
    let updates: Vec<(B256, Address, u64)> = (0..64)
        .map(|_| {
            (
                B256::repeat_byte((lcg.next_u64() % 4) as u8),
                Address::repeat_byte((lcg.next_u64() % 3) as u8),
                lcg.next_u64() % 32,
            )
        })
        .collect();

    let mut forward = CoverageMaps::new();
    for (hash, address, pc) in &updates {
        forward.set_at(*address, *hash, 32, 32, *pc);
    }
    let mut backward = CoverageMaps::new();
    for (hash, address, pc) in updates.iter().rev() {
        backward.set_at(*address, *hash, 32, 32, *pc);
    }
    assert_eq!(forward.dump(), backward.dump());

    // Split-and-merge equals sequential application.
    let (left_half, right_half) = updates.split_at(updates.len() / 2);
    let mut left = CoverageMaps::new();
    for (hash, address, pc) in left_half {
        left.set_at(*address, *hash, 32, 32, *pc);
    }
    let mut right = CoverageMaps::new();
    for (hash, address, pc) in right_half {
        right.set_at(*address, *hash, 32, 32, *pc);
    }
    left.update(&right);
    assert_eq!(left.dump(), forward.dump());
}
