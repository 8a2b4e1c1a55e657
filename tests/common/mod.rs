//! Shared helpers: a tiny EVM assembler and worker/chain setup.

use alloy::primitives::{Address, Bytes, U256};
use shadowfuzz::fuzzing::{ContractDefinition, FuzzerWorker};
use shadowfuzz::utils::config::FuzzingConfig;

/// Hand assembler for test bytecode. Byte offsets are tracked so tests can
/// mark the pc of an instruction right before emitting it.
#[derive(Default)]
pub struct Asm {
    bytes: Vec<u8>,
}

#[allow(dead_code)]
impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset; the pc of the next emitted instruction.
    pub fn pc(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.bytes.push(opcode);
        self
    }

    pub fn push1(&mut self, value: u8) -> &mut Self {
        self.bytes.extend_from_slice(&[0x60, value]);
        self
    }

    pub fn push2(&mut self, value: u16) -> &mut Self {
        self.bytes.push(0x61);
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn push20(&mut self, address: Address) -> &mut Self {
        self.bytes.push(0x73);
        self.bytes.extend_from_slice(address.as_slice());
        self
    }

    pub fn push32(&mut self, word: [u8; 32]) -> &mut Self {
        self.bytes.push(0x7f);
        self.bytes.extend_from_slice(&word);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Wrap runtime code in standard init code that returns it.
#[allow(dead_code)]
pub fn init_code_for(runtime: &[u8]) -> Vec<u8> {
    init_code_with_prologue(&[], runtime)
}

/// Init code: run `prologue` (e.g. storage seeding), then CODECOPY + RETURN
/// the runtime code.
pub fn init_code_with_prologue(prologue: &[u8], runtime: &[u8]) -> Vec<u8> {
    let mut code = prologue.to_vec();
    let runtime_len = runtime.len() as u16;
    let runtime_offset = (code.len() + 15) as u16;

    // PUSH2 len; PUSH2 offset; PUSH1 0; CODECOPY; PUSH2 len; PUSH1 0; RETURN
    code.push(0x61);
    code.extend_from_slice(&runtime_len.to_be_bytes());
    code.push(0x61);
    code.extend_from_slice(&runtime_offset.to_be_bytes());
    code.extend_from_slice(&[0x60, 0x00, 0x39]);
    code.push(0x61);
    code.extend_from_slice(&runtime_len.to_be_bytes());
    code.extend_from_slice(&[0x60, 0x00, 0xf3]);

    code.extend_from_slice(runtime);
    code
}

pub fn attacker() -> Address {
    Address::repeat_byte(0xAA)
}

pub fn deployer() -> Address {
    Address::repeat_byte(0x01)
}

/// All tracers and oracles on, the attacker as the only (zero-balance) sender.
pub fn default_config() -> FuzzingConfig {
    FuzzingConfig {
        sender_addresses: vec![attacker()],
        sender_address_balances: vec![U256::ZERO],
        ..FuzzingConfig::default()
    }
}

pub fn definition_for(name: &str, init: &[u8], runtime: &[u8]) -> ContractDefinition {
    ContractDefinition {
        name: name.to_string(),
        init_bytecode: Some(Bytes::copy_from_slice(init)),
        runtime_bytecode: Bytes::copy_from_slice(runtime),
        abi: None,
    }
}

/// A worker with a funded deployer account.
pub fn worker_for(config: &FuzzingConfig, contracts: &[ContractDefinition]) -> FuzzerWorker {
    let mut worker = FuzzerWorker::new(0, config, contracts, Address::ZERO);
    worker
        .chain
        .fund(deployer(), U256::from(10_000_000_000_000_000_000u128));
    worker
}

/// 32-byte big-endian calldata word.
#[allow(dead_code)]
pub fn word(value: U256) -> Vec<u8> {
    value.to_be_bytes::<32>().to_vec()
}
