//! Cross-transaction fitness accumulators and per-worker campaign metrics.
//!
//! Tracers never take locks: each per-tx output rides on the message results,
//! and workers merge it here under the matching accumulator's own lock. Within
//! a worker, tx N is merged before tx N+1 starts; across workers, merge order
//! is unspecified — every merge is an associative, commutative union/OR/min, so
//! the final aggregate is deterministic given the set of inputs.

use std::sync::mpsc::SyncSender;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bugs::{get_bug_detector_results, BugMap};
use crate::chain::results::MessageResults;
use crate::fitness::code_coverage::CoverageMaps;
use crate::fitness::dataflow::DataflowSet;
use crate::fitness::storage_write::StorageWriteSet;
use crate::fitness::token_flow::TokenflowSet;
use crate::fitness::{
    branch_coverage::get_branch_coverage_results, code_coverage::get_code_coverage_results,
    dataflow::get_dataflow_results, storage_write::get_storage_write_results,
    token_flow::get_tokenflow_results,
};
use crate::utils::config::MetricRecordConfig;

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn mutex_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One revert-rate sample for the external reporter.
#[derive(Clone, Debug)]
pub struct RevertMetricsUpdate {
    pub contract_name: String,
    pub function_name: String,
    pub reverted: bool,
}

/// Counters for a single worker slot.
#[derive(Clone, Debug, Default)]
pub struct WorkerMetrics {
    pub sequences_tested: u64,
    pub failed_sequences: u64,
    pub calls_tested: u64,
    pub gas_used: u64,
    pub worker_startup_count: u64,
    pub shrinking: bool,
}

/// Process-global campaign metrics.
pub struct FuzzerMetrics {
    worker_metrics: Vec<Mutex<WorkerMetrics>>,

    code_coverage: RwLock<CoverageMaps>,
    branch_coverage: RwLock<CoverageMaps>,
    dataflow: RwLock<DataflowSet>,
    storage_writes: RwLock<StorageWriteSet>,
    token_flows: RwLock<TokenflowSet>,
    bug_map: BugMap,

    config: MetricRecordConfig,
    revert_metrics_tx: Option<SyncSender<RevertMetricsUpdate>>,
}

impl FuzzerMetrics {
    pub fn new(
        worker_count: usize,
        revert_metrics_tx: Option<SyncSender<RevertMetricsUpdate>>,
        config: MetricRecordConfig,
    ) -> Self {
        Self {
            worker_metrics: (0..worker_count).map(|_| Mutex::default()).collect(),
            code_coverage: RwLock::new(CoverageMaps::new()),
            branch_coverage: RwLock::new(CoverageMaps::new()),
            dataflow: RwLock::new(DataflowSet::new()),
            storage_writes: RwLock::new(StorageWriteSet::new()),
            token_flows: RwLock::new(TokenflowSet::new()),
            bug_map: BugMap::new(),
            config,
            revert_metrics_tx,
        }
    }

    /// Fold one transaction's tracer outputs into the global accumulators.
    pub fn update_indicators(&self, results: &MessageResults) {
        if self.config.code_coverage_enabled {
            if let Some(maps) = get_code_coverage_results(results) {
                write_lock(&self.code_coverage).update(maps);
            }
        }
        if self.config.branch_coverage_enabled {
            if let Some(maps) = get_branch_coverage_results(results) {
                write_lock(&self.branch_coverage).update(maps);
            }
        }
        if self.config.dataflow_enabled {
            if let Some(set) = get_dataflow_results(results) {
                write_lock(&self.dataflow).update(set);
            }
        }
        if self.config.storage_write_enabled {
            if let Some(set) = get_storage_write_results(results) {
                write_lock(&self.storage_writes).update(set);
            }
        }
        if self.config.tokenflow_enabled {
            if let Some(set) = get_tokenflow_results(results) {
                write_lock(&self.token_flows).update(set);
            }
        }
        if let Some(bugs) = get_bug_detector_results(results) {
            self.bug_map.update(bugs);
        }
    }

    pub fn code_coverage(&self) -> RwLockReadGuard<'_, CoverageMaps> {
        read_lock(&self.code_coverage)
    }

    pub fn branch_coverage(&self) -> RwLockReadGuard<'_, CoverageMaps> {
        read_lock(&self.branch_coverage)
    }

    pub fn dataflow(&self) -> RwLockReadGuard<'_, DataflowSet> {
        read_lock(&self.dataflow)
    }

    pub fn storage_writes(&self) -> RwLockReadGuard<'_, StorageWriteSet> {
        read_lock(&self.storage_writes)
    }

    pub fn token_flows(&self) -> RwLockReadGuard<'_, TokenflowSet> {
        read_lock(&self.token_flows)
    }

    pub fn bug_map(&self) -> &BugMap {
        &self.bug_map
    }

    /// Record one executed call for a worker.
    pub fn record_call(&self, worker_index: usize, gas_used: u64) {
        if let Some(slot) = self.worker_metrics.get(worker_index) {
            let mut metrics = mutex_lock(slot);
            metrics.calls_tested += 1;
            metrics.gas_used += gas_used;
        }
    }

    /// Record one finished call sequence for a worker.
    pub fn record_sequence(&self, worker_index: usize, failed: bool) {
        if let Some(slot) = self.worker_metrics.get(worker_index) {
            let mut metrics = mutex_lock(slot);
            metrics.sequences_tested += 1;
            if failed {
                metrics.failed_sequences += 1;
            }
        }
    }

    pub fn record_worker_startup(&self, worker_index: usize) {
        if let Some(slot) = self.worker_metrics.get(worker_index) {
            mutex_lock(slot).worker_startup_count += 1;
        }
    }

    pub fn set_shrinking(&self, worker_index: usize, shrinking: bool) {
        if let Some(slot) = self.worker_metrics.get(worker_index) {
            mutex_lock(slot).shrinking = shrinking;
        }
    }

    pub fn sequences_tested(&self) -> u64 {
        self.sum_workers(|metrics| metrics.sequences_tested)
    }

    pub fn failed_sequences(&self) -> u64 {
        self.sum_workers(|metrics| metrics.failed_sequences)
    }

    pub fn calls_tested(&self) -> u64 {
        self.sum_workers(|metrics| metrics.calls_tested)
    }

    pub fn gas_used(&self) -> u64 {
        self.sum_workers(|metrics| metrics.gas_used)
    }

    pub fn worker_startup_count(&self) -> u64 {
        self.sum_workers(|metrics| metrics.worker_startup_count)
    }

    pub fn workers_shrinking_count(&self) -> u64 {
        self.sum_workers(|metrics| u64::from(metrics.shrinking))
    }

    fn sum_workers(&self, field: impl Fn(&WorkerMetrics) -> u64) -> u64 {
        self.worker_metrics
            .iter()
            .map(|slot| field(&mutex_lock(slot)))
            .sum()
    }

    /// Forward a revert sample to the reporter; skipped when no reporter is
    /// attached or it has gone away.
    pub fn send_revert_metrics(&self, update: RevertMetricsUpdate) {
        if let Some(tx) = &self.revert_metrics_tx {
            let _ = tx.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::sync_channel;

    #[test]
    fn test_worker_counters_aggregate() {
        let metrics = FuzzerMetrics::new(2, None, MetricRecordConfig::default());
        metrics.record_call(0, 21_000);
        metrics.record_call(1, 42_000);
        metrics.record_sequence(0, true);
        metrics.record_sequence(1, false);
        metrics.record_worker_startup(0);
        metrics.set_shrinking(1, true);

        assert_eq!(metrics.calls_tested(), 2);
        assert_eq!(metrics.gas_used(), 63_000);
        assert_eq!(metrics.sequences_tested(), 2);
        assert_eq!(metrics.failed_sequences(), 1);
        assert_eq!(metrics.worker_startup_count(), 1);
        assert_eq!(metrics.workers_shrinking_count(), 1);

        // Out-of-range worker indices are ignored, not fatal.
        metrics.record_call(9, 1);
        assert_eq!(metrics.calls_tested(), 2);
    }

    #[test]
    fn test_revert_metrics_channel() {
        let (tx, rx) = sync_channel(1);
        let metrics = FuzzerMetrics::new(1, Some(tx), MetricRecordConfig::default());
        metrics.send_revert_metrics(RevertMetricsUpdate {
            contract_name: "Bank".into(),
            function_name: "withdrawBalance".into(),
            reverted: true,
        });
        let update = rx.recv().unwrap();
        assert_eq!(update.function_name, "withdrawBalance");
        assert!(update.reverted);

        // No reporter attached: sends are skipped silently.
        let silent = FuzzerMetrics::new(1, None, MetricRecordConfig::default());
        silent.send_revert_metrics(RevertMetricsUpdate {
            contract_name: String::new(),
            function_name: String::new(),
            reverted: false,
        });
    }
}
