//! Isolated test chain and the tracer dispatch layer.
//!
//! Each fuzzer worker owns one [`TestChain`] and one [`tracing::TracerStack`];
//! every message is executed with the stack attached as the revm inspector, and
//! the per-message tracer outputs land on the returned
//! [`results::MessageResults`].

pub mod results;
pub mod tracing;

use crate::error::{ChainError, Result};
use alloy::primitives::{Address, U256};
use revm::{
    db::{CacheDB, EmptyDB},
    primitives::{AccountInfo, Bytes, ExecutionResult, Output, TransactTo},
    Evm,
};

use results::MessageResults;
use tracing::TracerStack;

/// An isolated in-memory chain for a single fuzzer worker.
///
/// Block number and timestamp advance by one block per executed message so
/// block-environment opcodes observe plausible values.
pub struct TestChain {
    db: CacheDB<EmptyDB>,
    block_number: u64,
    block_timestamp: u64,
    gas_limit: u64,
}

impl Default for TestChain {
    fn default() -> Self {
        Self::new()
    }
}

impl TestChain {
    pub fn new() -> Self {
        Self {
            db: CacheDB::new(EmptyDB::default()),
            block_number: 1,
            block_timestamp: 1_700_000_000,
            gas_limit: 30_000_000,
        }
    }

    /// Credit an externally-owned account.
    pub fn fund(&mut self, address: Address, balance: U256) {
        let info = AccountInfo {
            balance,
            ..Default::default()
        };
        self.db.insert_account_info(address, info);
    }

    /// Runtime bytecode of a deployed account, if any.
    pub fn code_at(&self, address: Address) -> Option<Bytes> {
        self.db
            .accounts
            .get(&address)
            .and_then(|account| account.info.code.as_ref())
            .map(|code| code.original_bytes())
    }

    /// Deploy a contract from `init_code`, returning its address and the traced
    /// message results.
    pub fn deploy(
        &mut self,
        stack: &mut TracerStack,
        deployer: Address,
        init_code: Bytes,
        value: U256,
    ) -> Result<(Address, MessageResults)> {
        let results = self.execute(stack, deployer, TransactTo::Create, init_code, value)?;
        let address = match &results.execution_result {
            ExecutionResult::Success {
                output: Output::Create(_, Some(address)),
                ..
            } => *address,
            _ => return Err(ChainError::DeploymentFailed.into()),
        };
        Ok((address, results))
    }

    /// Execute a message call against a deployed contract (or an EOA).
    pub fn call(
        &mut self,
        stack: &mut TracerStack,
        from: Address,
        to: Address,
        input: Bytes,
        value: U256,
    ) -> Result<MessageResults> {
        self.execute(stack, from, TransactTo::Call(to), input, value)
    }

    fn execute(
        &mut self,
        stack: &mut TracerStack,
        caller: Address,
        kind: TransactTo,
        data: Bytes,
        value: U256,
    ) -> Result<MessageResults> {
        stack.begin_tx();

        let block_number = self.block_number;
        let block_timestamp = self.block_timestamp;
        let gas_limit = self.gas_limit;
        let outcome = {
            let mut evm = Evm::builder()
                .with_db(&mut self.db)
                .with_external_context(&mut *stack)
                .append_handler_register(revm::inspector_handle_register)
                .modify_block_env(|block| {
                    block.number = U256::from(block_number);
                    block.timestamp = U256::from(block_timestamp);
                })
                .modify_tx_env(|tx| {
                    tx.caller = caller;
                    tx.transact_to = kind;
                    tx.data = data.clone();
                    tx.value = value;
                    tx.gas_limit = gas_limit;
                })
                .build();
            evm.transact_commit()
        };

        let execution_result = match outcome {
            Ok(result) => result,
            Err(err) => {
                // The interpreter never ran to completion; drop any partially
                // collected frame state so the next message starts clean.
                stack.abort_tx();
                return Err(ChainError::Execution(format!("{err:?}")).into());
            }
        };

        self.block_number += 1;
        self.block_timestamp += 12;

        let mut results = MessageResults::new(execution_result);
        stack.finish_tx(&mut results);
        Ok(results)
    }
}
