//! Per-message results hand-off.
//!
//! Each tracer publishes its transaction-scoped output under a unique textual
//! key at tx end; worker code pulls the outputs back out through the typed
//! getters each tracer module exposes and merges them into the process-global
//! accumulators.

use revm::primitives::ExecutionResult;
use std::any::Any;
use std::collections::HashMap;

pub struct MessageResults {
    pub execution_result: ExecutionResult,
    /// Tracer outputs keyed by the tracer's well-known results key.
    pub additional_results: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl MessageResults {
    pub fn new(execution_result: ExecutionResult) -> Self {
        Self {
            execution_result,
            additional_results: HashMap::new(),
        }
    }

    /// Whether the top-level message failed (revert or exceptional halt).
    pub fn reverted(&self) -> bool {
        !matches!(self.execution_result, ExecutionResult::Success { .. })
    }

    pub fn gas_used(&self) -> u64 {
        match &self.execution_result {
            ExecutionResult::Success { gas_used, .. } => *gas_used,
            ExecutionResult::Revert { gas_used, .. } => *gas_used,
            ExecutionResult::Halt { gas_used, .. } => *gas_used,
        }
    }

    pub fn insert<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.additional_results.insert(key, Box::new(value));
    }

    /// Typed lookup; absent or mistyped entries yield `None` and callers check.
    pub fn get<T: Any + Send>(&self, key: &str) -> Option<&T> {
        self.additional_results
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Drop a tracer's output, returning whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.additional_results.remove(key).is_some()
    }
}
