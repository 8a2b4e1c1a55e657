//! Fuzzing configuration surface.
//!
//! Loading from disk is the driver's job; this module only defines the shapes and
//! the defaults (every tracer and oracle enabled). Operational knobs can be
//! overridden from the environment.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FuzzingConfig {
    pub worker_count: usize,

    pub code_coverage_tracing: bool,
    pub branch_coverage_tracing: bool,
    pub cmp_distance_tracing: bool,
    pub branch_distance_tracing: bool,
    pub dataflow_tracing: bool,
    pub storage_write_tracing: bool,
    pub tokenflow_tracing: bool,
    pub bug_detection_enabled: bool,

    pub metric_record: MetricRecordConfig,
    pub bug_detection: BugDetectionConfig,

    /// Attacker-controlled transaction senders.
    pub sender_addresses: Vec<Address>,
    /// Starting balances of the senders, snapshotted for the ether-leak oracle.
    pub sender_address_balances: Vec<U256>,
    /// When set, coverage addresses outside this set are zeroed to keep maps
    /// from growing unboundedly on ephemeral callees.
    pub initial_contracts: Option<Vec<Address>>,

    pub fork: ForkConfig,
}

impl Default for FuzzingConfig {
    fn default() -> Self {
        Self {
            worker_count: workers_from_env(4),
            code_coverage_tracing: true,
            branch_coverage_tracing: true,
            cmp_distance_tracing: true,
            branch_distance_tracing: true,
            dataflow_tracing: true,
            storage_write_tracing: true,
            tokenflow_tracing: true,
            bug_detection_enabled: true,
            metric_record: MetricRecordConfig::default(),
            bug_detection: BugDetectionConfig::default(),
            sender_addresses: Vec::new(),
            sender_address_balances: Vec::new(),
            initial_contracts: None,
            fork: ForkConfig::default(),
        }
    }
}

/// Which per-tx tracer outputs are folded into the global fitness accumulators.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricRecordConfig {
    pub code_coverage_enabled: bool,
    pub branch_coverage_enabled: bool,
    pub dataflow_enabled: bool,
    pub storage_write_enabled: bool,
    pub tokenflow_enabled: bool,
}

impl Default for MetricRecordConfig {
    fn default() -> Self {
        Self {
            code_coverage_enabled: true,
            branch_coverage_enabled: true,
            dataflow_enabled: true,
            storage_write_enabled: true,
            tokenflow_enabled: true,
        }
    }
}

/// Per-oracle enable switches for the bug detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BugDetectionConfig {
    pub integer_overflow: bool,
    pub suicidal: bool,
    pub ether_leaking: bool,
    pub block_dependency: bool,
    pub reentrancy: bool,
    pub unsafe_delegatecall: bool,
}

impl Default for BugDetectionConfig {
    fn default() -> Self {
        Self {
            integer_overflow: true,
            suicidal: true,
            ether_leaking: true,
            block_dependency: true,
            reentrancy: true,
            unsafe_delegatecall: true,
        }
    }
}

/// On-chain mode parameters, honored by the driver when `fork_mode_enabled`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ForkConfig {
    pub fork_mode_enabled: bool,
    pub rpc_url: String,
    pub rpc_block: u64,
    pub pool_size: usize,
}

/// Worker-count override from the environment, clamped to something sane.
pub fn workers_from_env(default: usize) -> usize {
    env::var("SHADOWFUZZ_WORKERS")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|v| v.clamp(1, 256))
        .unwrap_or(default)
}
