//! End-to-end oracle scenarios: hand-assembled contracts executed on a real
//! test chain with the full tracer stack attached.

mod common;

use alloy::primitives::{Bytes, U256};
use anyhow::Result;
use revm::interpreter::opcode::{
    ADD, CALL, CALLDATALOAD, CALLER, DELEGATECALL, LT, NUMBER, POP, SELFBALANCE, SELFDESTRUCT,
    SLOAD, SSTORE, STOP, TIMESTAMP,
};
use shadowfuzz::bugs::get_bug_detector_results;
use shadowfuzz::fitness::code_coverage::get_code_coverage_results;
use shadowfuzz::fitness::token_flow::get_tokenflow_results;

use common::{attacker, default_config, definition_for, deployer, init_code_for, word, Asm};

#[test]
fn test_block_dependency_oracle() -> Result<()> {
    // play(): branch-free distillation — compare two block-environment reads.
    let mut asm = Asm::new();
    asm.op(NUMBER);
    let timestamp_pc = asm.pc();
    asm.op(TIMESTAMP);
    let lt_pc = asm.pc();
    asm.op(LT).op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Lottery", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init.clone()), U256::ZERO)?;

    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(
        bugs.contains(&format!("BLOCKDEPENDENCY-{contract}-{lt_pc}-LT")),
        "expected a block-dependency finding at the comparison, got {:?}",
        bugs.results()
    );

    // The TIMESTAMP instruction itself must show up in code coverage.
    let coverage = get_code_coverage_results(&results).expect("code coverage attached");
    let map = coverage
        .contract_map(&runtime, false)
        .expect("runtime code was traced");
    assert!(map.is_covered(timestamp_pc as usize));
    Ok(())
}

#[test]
fn test_reentrancy_oracle() -> Result<()> {
    // withdrawBalance(): SLOAD the balance, CALL msg.sender with it (gas well
    // above the stipend), then zero the slot.
    let mut asm = Asm::new();
    asm.push1(0x00);
    asm.op(SLOAD); // balance
    asm.push1(0x00); // retSize
    asm.push1(0x00); // retOffset
    asm.push1(0x00); // argsSize
    asm.push1(0x00); // argsOffset
    asm.op(0x84); // DUP5: balance as call value
    asm.op(CALLER);
    asm.push2(0xFFFF); // gas
    let call_pc = asm.pc();
    asm.op(CALL);
    asm.op(POP);
    asm.push1(0x00);
    asm.push1(0x00);
    asm.op(SSTORE); // balances[msg.sender] = 0, after the interaction
    asm.op(STOP);
    let runtime = asm.build();

    // Constructor seeds balances[attacker] = 10 at slot 0.
    let mut prologue = Asm::new();
    prologue.push1(0x0A).push1(0x00).op(SSTORE);
    let init = common::init_code_with_prologue(&prologue.build(), &runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Bank", &init, &runtime)]);
    // The contract holds the ether it later pays out.
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::from(10))?;

    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(
        bugs.contains(&format!("REENTRANCY-{contract}-{call_pc}-CALL")),
        "expected a reentrancy finding at the call site, got {:?}",
        bugs.results()
    );
    Ok(())
}

#[test]
fn test_suicidal_oracle() -> Result<()> {
    let mut asm = Asm::new();
    asm.op(CALLER);
    let selfdestruct_pc = asm.pc();
    asm.op(SELFDESTRUCT);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Mortal", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(bugs.contains(&format!(
        "SUICIDAL-{contract}-{selfdestruct_pc}-SELFDESTRUCT"
    )));
    Ok(())
}

#[test]
fn test_integer_overflow_oracle() -> Result<()> {
    // count += input, where count starts at 1 and input = 2^256 - 1.
    let mut asm = Asm::new();
    asm.push1(0x00);
    asm.op(SLOAD); // count
    asm.push1(0x04);
    asm.op(CALLDATALOAD); // input (calldata offset 4, after a selector)
    asm.op(ADD);
    asm.push1(0x00);
    let sstore_pc = asm.pc();
    asm.op(SSTORE);
    asm.op(STOP);
    let runtime = asm.build();

    // Constructor: count = 1.
    let mut prologue = Asm::new();
    prologue.push1(0x01).push1(0x00).op(SSTORE);
    let init = common::init_code_with_prologue(&prologue.build(), &runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Counter", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    let mut calldata = vec![0xDE, 0xAD, 0xBE, 0xEF]; // selector
    calldata.extend_from_slice(&word(U256::MAX));
    let results = worker.call(attacker(), contract, Bytes::from(calldata), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(
        bugs.contains(&format!("OVERFLOW-{contract}-{sstore_pc}-SSTORE")),
        "expected the wrapped sum to be flagged at its store, got {:?}",
        bugs.results()
    );
    Ok(())
}

#[test]
fn test_reverted_execution_drops_proposed_findings() -> Result<()> {
    // Same wrap-and-store shape as the overflow scenario, but the transaction
    // ends in REVERT: the proposed finding must never be confirmed.
    let mut asm = Asm::new();
    asm.push1(0x00);
    asm.op(SLOAD);
    asm.push1(0x04);
    asm.op(CALLDATALOAD);
    asm.op(ADD);
    asm.push1(0x00);
    asm.op(SSTORE);
    asm.push1(0x00).push1(0x00).op(0xFD); // REVERT
    let runtime = asm.build();

    let mut prologue = Asm::new();
    prologue.push1(0x01).push1(0x00).op(SSTORE);
    let init = common::init_code_with_prologue(&prologue.build(), &runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Wrapper", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    let mut calldata = vec![0xDE, 0xAD, 0xBE, 0xEF];
    calldata.extend_from_slice(&word(U256::MAX));
    let results = worker.call(attacker(), contract, Bytes::from(calldata), U256::ZERO)?;
    assert!(results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(bugs.is_empty(), "reverted tx leaked findings: {:?}", bugs.results());
    Ok(())
}

#[test]
fn test_ether_leaking_oracle() -> Result<()> {
    // drain(): send the whole contract balance to msg.sender.
    let mut asm = Asm::new();
    asm.push1(0x00); // retSize
    asm.push1(0x00); // retOffset
    asm.push1(0x00); // argsSize
    asm.push1(0x00); // argsOffset
    asm.op(SELFBALANCE); // value
    asm.op(CALLER); // to
    asm.push2(0xFFFF); // gas
    asm.op(CALL);
    asm.op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Vault", &init, &runtime)]);
    let one_ether = U256::from(1_000_000_000_000_000_000u128);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), one_ether)?;

    // The attacker's balance was snapshotted at zero; draining the vault makes
    // the adversarial sum exceed it.
    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    // The id names the `from` of the frame that observed the gain: the vault,
    // whose transfer frame paid the attacker.
    assert!(
        bugs.contains(&format!("ETHERLEAKING-{contract}")),
        "expected an ether-leak finding, got {:?}",
        bugs.results()
    );

    // The same transfer is a native token flow.
    let flows = get_tokenflow_results(&results).expect("tokenflow attached");
    assert!(flows
        .flows()
        .any(|flow| flow.to == attacker() && flow.amount == one_ether));
    Ok(())
}

#[test]
fn test_unsafe_delegatecall_oracle() -> Result<()> {
    // forward(data): delegatecall into a settable callee; here the callee has
    // been pointed at the attacker.
    let mut asm = Asm::new();
    asm.push1(0x00); // retSize
    asm.push1(0x00); // retOffset
    asm.push1(0x00); // argsSize
    asm.push1(0x00); // argsOffset
    asm.push20(attacker()); // callee
    asm.push2(0xFFFF); // gas
    let delegatecall_pc = asm.pc();
    asm.op(DELEGATECALL);
    asm.op(STOP);
    let runtime = asm.build();
    let init = init_code_for(&runtime);

    let config = default_config();
    let mut worker = common::worker_for(&config, &[definition_for("Proxy", &init, &runtime)]);
    let (contract, _) = worker.deploy(deployer(), Bytes::from(init), U256::ZERO)?;

    let results = worker.call(attacker(), contract, Bytes::new(), U256::ZERO)?;
    assert!(!results.reverted());

    let bugs = get_bug_detector_results(&results).expect("bug detector attached");
    assert!(bugs.contains(&format!(
        "UNSAFEDELEGATECALL-{contract}-{delegatecall_pc}-DELEGATECALL"
    )));
    Ok(())
}
