use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::{ConfigReload, DaemonConfig, ReloadableConfig};
use crate::error::{Error, Result};
use crate::stats::Stats;

/// a keyed failure hook for tests
///
/// production code calls `check` at interesting points; tests arm matching
/// keys to make those points fail. disabled injectors short-circuit to Ok.
#[derive(Default)]
pub struct FaultInjector {
    faults: RwLock<Vec<Fault>>,
}

struct Fault {
    key_prefix: String,
    message: String,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// consult the injector; `key` names the check point, `detail` the
    /// specific operand (key space, path, ...)
    pub fn check(&self, key: &str, detail: &str) -> Result<()> {
        let faults = self.faults.read();
        if faults.is_empty() {
            return Ok(());
        }
        for fault in faults.iter() {
            if key.starts_with(&fault.key_prefix) {
                warn!(key, detail, "fault injected");
                return Err(Error::Transport {
                    message: format!("injected fault at {key} ({detail}): {}", fault.message),
                });
            }
        }
        Ok(())
    }

    /// arm a fault for every check point whose key starts with `key_prefix`
    pub fn inject_error(&self, key_prefix: impl Into<String>, message: impl Into<String>) {
        self.faults.write().push(Fault {
            key_prefix: key_prefix.into(),
            message: message.into(),
        });
    }

    /// disarm all faults
    pub fn clear(&self) {
        self.faults.write().clear();
    }
}

/// state shared across every mount served by one daemon process
///
/// there is no hidden global mutable state; everything process-wide lives
/// here and is passed into each mount explicitly.
pub struct ServerState {
    config: ReloadableConfig,
    stats: Arc<Stats>,
    fault_injector: Arc<FaultInjector>,
    io_pool: Arc<rayon::ThreadPool>,
    task_pool: Arc<rayon::ThreadPool>,
}

impl ServerState {
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let io_threads = config.store_io_threads() as usize;
        let io_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(io_threads.max(1))
            .thread_name(|i| format!("store-io-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        // sized to the host so queued tasks always make progress; rayon
        // queues excess submissions without blocking the submitter
        let task_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_cpus::get())
            .thread_name(|i| format!("task-{i}"))
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;

        Ok(Self {
            config: ReloadableConfig::new(config),
            stats: Arc::new(Stats::default()),
            fault_injector: Arc::new(FaultInjector::new()),
            io_pool: Arc::new(io_pool),
            task_pool: Arc::new(task_pool),
        })
    }

    pub fn config(&self, reload: ConfigReload) -> Arc<DaemonConfig> {
        self.config.get(reload)
    }

    pub fn reloadable_config(&self) -> &ReloadableConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn fault_injector(&self) -> &Arc<FaultInjector> {
        &self.fault_injector
    }

    /// bounded pool for local-store io
    pub fn io_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.io_pool
    }

    /// unbounded-queue pool for composition work; spawning never blocks
    pub fn task_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.task_pool
    }

    /// queue work on the task pool
    pub fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.task_pool.spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injector_disabled_by_default() {
        let fault = FaultInjector::new();
        assert!(fault.check("local store get", "blob").is_ok());
    }

    #[test]
    fn test_fault_injector_matches_prefix() {
        let fault = FaultInjector::new();
        fault.inject_error("local store", "disk on fire");

        assert!(fault.check("local store get", "blob").is_err());
        assert!(fault.check("local store get batch", "tree").is_err());
        assert!(fault.check("backing fetch", "blob").is_ok());

        fault.clear();
        assert!(fault.check("local store get", "blob").is_ok());
    }

    #[test]
    fn test_server_state_spawn_runs() {
        let state = ServerState::new(DaemonConfig::default()).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        state.spawn(move || {
            tx.send(42u32).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }
}
