use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::warn;

use crate::config::DaemonConfig;

/// how a config read interacts with the files on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigReload {
    /// hand back the current snapshot without touching disk
    NoReload,
    /// check the files, but at most once per throttle interval
    AutoReload,
    /// check the files regardless of the throttle
    ForceReload,
}

/// read-copy-update configuration holder
///
/// readers get an immutable snapshot whose lifetime is theirs to manage;
/// a reload swaps in a fresh snapshot without disturbing existing
/// readers.
pub struct ReloadableConfig {
    state: RwLock<State>,
    throttle: Duration,
}

struct State {
    config: Arc<DaemonConfig>,
    last_check: Option<Instant>,
}

impl ReloadableConfig {
    pub fn new(config: DaemonConfig) -> Self {
        let throttle = config.reload_interval();
        Self::with_throttle(config, throttle)
    }

    /// throttle injectable so tests need not wait out the real interval
    pub fn with_throttle(config: DaemonConfig, throttle: Duration) -> Self {
        Self {
            state: RwLock::new(State {
                config: Arc::new(config),
                last_check: None,
            }),
            throttle,
        }
    }

    pub fn get(&self, reload: ConfigReload) -> Arc<DaemonConfig> {
        if reload == ConfigReload::NoReload {
            return self.state.read().config.clone();
        }

        let now = Instant::now();
        let mut state = self.state.write();

        if reload == ConfigReload::AutoReload {
            if let Some(last) = state.last_check {
                if now.duration_since(last) < self.throttle {
                    return state.config.clone();
                }
            }
        }
        state.last_check = Some(now);

        if state.config.has_config_changed() {
            let mut fresh = (*state.config).clone();
            match fresh.reload_changed_files() {
                Ok(()) => state.config = Arc::new(fresh),
                Err(e) => warn!(error = %e, "config reload failed; keeping previous snapshot"),
            }
        }
        state.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_io_threads(path: &Path, value: u64) {
        std::fs::write(path, format!("[store]\nio-threads = {value}\n")).unwrap();
    }

    fn loaded_config(path: &Path) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.load_user_file(path).unwrap();
        config
    }

    /// mtime granularity on some filesystems is one second; rewrite the
    /// file with a bumped mtime so change detection observes it
    fn touch_with_new_mtime(path: &Path, value: u64) {
        write_io_threads(path, value);
        let later = std::time::SystemTime::now() + Duration::from_secs(2);
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(later).unwrap();
    }

    #[test]
    fn test_no_reload_never_checks_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        write_io_threads(&path, 4);

        let reloadable = ReloadableConfig::with_throttle(loaded_config(&path), Duration::ZERO);
        touch_with_new_mtime(&path, 9);

        let snap = reloadable.get(ConfigReload::NoReload);
        assert_eq!(snap.store_io_threads(), 4);
    }

    #[test]
    fn test_auto_reload_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        write_io_threads(&path, 4);

        let throttle = Duration::from_millis(200);
        let reloadable = ReloadableConfig::with_throttle(loaded_config(&path), throttle);

        // first auto read establishes the check time
        assert_eq!(reloadable.get(ConfigReload::AutoReload).store_io_threads(), 4);

        touch_with_new_mtime(&path, 9);

        // within the throttle window the old snapshot is returned even
        // though the file changed
        assert_eq!(reloadable.get(ConfigReload::AutoReload).store_io_threads(), 4);

        std::thread::sleep(throttle + Duration::from_millis(50));
        assert_eq!(reloadable.get(ConfigReload::AutoReload).store_io_threads(), 9);
    }

    #[test]
    fn test_force_reload_bypasses_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        write_io_threads(&path, 4);

        let reloadable =
            ReloadableConfig::with_throttle(loaded_config(&path), Duration::from_secs(3600));
        assert_eq!(reloadable.get(ConfigReload::AutoReload).store_io_threads(), 4);

        touch_with_new_mtime(&path, 9);
        assert_eq!(reloadable.get(ConfigReload::ForceReload).store_io_threads(), 9);
    }

    #[test]
    fn test_readers_keep_old_snapshots_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        write_io_threads(&path, 4);

        let reloadable = ReloadableConfig::with_throttle(loaded_config(&path), Duration::ZERO);
        let old = reloadable.get(ConfigReload::NoReload);

        touch_with_new_mtime(&path, 9);
        let new = reloadable.get(ConfigReload::ForceReload);

        // rcu: the old snapshot is unchanged in the reader's hands
        assert_eq!(old.store_io_threads(), 4);
        assert_eq!(new.store_io_threads(), 9);
    }
}
