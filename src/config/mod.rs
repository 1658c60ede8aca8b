//! layered daemon configuration.
//!
//! every setting keeps one optional value per source and reads back the
//! highest-priority populated one. settings parse from and render to
//! strings, which is what the registry and the config files traffic in.

mod checkout;
mod reloadable;

pub use checkout::{BindMount, CheckoutConfig};
pub use reloadable::{ConfigReload, ReloadableConfig};

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::error::{Error, Result};

/// where a setting's value came from; later variants win
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default,
    SystemConfig,
    UserConfig,
    CommandLine,
}

impl ConfigSource {
    pub const ALL: [ConfigSource; 4] = [
        ConfigSource::Default,
        ConfigSource::SystemConfig,
        ConfigSource::UserConfig,
        ConfigSource::CommandLine,
    ];

    fn index(&self) -> usize {
        match self {
            ConfigSource::Default => 0,
            ConfigSource::SystemConfig => 1,
            ConfigSource::UserConfig => 2,
            ConfigSource::CommandLine => 3,
        }
    }
}

/// parse-from-string / render-to-string capability for setting values
pub trait FieldConverter: Sized {
    fn from_config_str(value: &str) -> std::result::Result<Self, String>;
    fn to_config_string(&self) -> String;
}

impl FieldConverter for String {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        Ok(value.to_string())
    }

    fn to_config_string(&self) -> String {
        self.clone()
    }
}

impl FieldConverter for PathBuf {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        let path = PathBuf::from(value);
        if !path.is_absolute() {
            return Err(format!("path is not absolute: {value}"));
        }
        Ok(path)
    }

    fn to_config_string(&self) -> String {
        self.display().to_string()
    }
}

impl FieldConverter for bool {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        match value {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(format!("expected true or false, got {other}")),
        }
    }

    fn to_config_string(&self) -> String {
        self.to_string()
    }
}

impl FieldConverter for u64 {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        value.parse().map_err(|e| format!("invalid integer: {e}"))
    }

    fn to_config_string(&self) -> String {
        self.to_string()
    }
}

impl FieldConverter for i64 {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        value.parse().map_err(|e| format!("invalid integer: {e}"))
    }

    fn to_config_string(&self) -> String {
        self.to_string()
    }
}

impl FieldConverter for f64 {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        value.parse().map_err(|e| format!("invalid float: {e}"))
    }

    fn to_config_string(&self) -> String {
        self.to_string()
    }
}

/// durations are an integer with a unit suffix: ns, us, ms, s, m, h
impl FieldConverter for Duration {
    fn from_config_str(value: &str) -> std::result::Result<Self, String> {
        let split = value
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration is missing a unit suffix: {value}"))?;
        let (digits, unit) = value.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|e| format!("invalid duration: {e}"))?;
        let nanos: u128 = match unit {
            "ns" => amount as u128,
            "us" => amount as u128 * 1_000,
            "ms" => amount as u128 * 1_000_000,
            "s" => amount as u128 * 1_000_000_000,
            "m" => amount as u128 * 60 * 1_000_000_000,
            "h" => amount as u128 * 3_600 * 1_000_000_000,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        Ok(Duration::new(
            (nanos / 1_000_000_000) as u64,
            (nanos % 1_000_000_000) as u32,
        ))
    }

    fn to_config_string(&self) -> String {
        let nanos = self.as_nanos();
        for (factor, unit) in [
            (3_600_000_000_000u128, "h"),
            (60_000_000_000, "m"),
            (1_000_000_000, "s"),
            (1_000_000, "ms"),
            (1_000, "us"),
        ] {
            if nanos > 0 && nanos % factor == 0 {
                return format!("{}{}", nanos / factor, unit);
            }
        }
        format!("{nanos}ns")
    }
}

/// one configuration setting with a slot per source
#[derive(Clone, Debug)]
pub struct ConfigSetting<T> {
    key: &'static str,
    slots: [Option<T>; 4],
}

impl<T: FieldConverter + Clone> ConfigSetting<T> {
    pub fn new(key: &'static str, default: T) -> Self {
        let mut slots = [None, None, None, None];
        slots[ConfigSource::Default.index()] = Some(default);
        Self { key, slots }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    /// highest-priority populated value
    pub fn value(&self) -> &T {
        for source in ConfigSource::ALL.iter().rev() {
            if let Some(value) = &self.slots[source.index()] {
                return value;
            }
        }
        unreachable!("default slot is always populated")
    }

    /// source of the value `value()` returns
    pub fn source(&self) -> ConfigSource {
        for source in ConfigSource::ALL.iter().rev() {
            if self.slots[source.index()].is_some() {
                return *source;
            }
        }
        ConfigSource::Default
    }

    pub fn set_value(&mut self, value: T, source: ConfigSource) {
        self.slots[source.index()] = Some(value);
    }

    /// parse and set; the compiled-in default cannot be overwritten
    /// from a string
    pub fn set_from_str(&mut self, value: &str, source: ConfigSource) -> Result<()> {
        if source == ConfigSource::Default {
            return Err(Error::InvalidConfigValue {
                key: self.key.to_string(),
                message: "default values are compiled in".to_string(),
            });
        }
        let parsed = T::from_config_str(value).map_err(|message| Error::InvalidConfigValue {
            key: self.key.to_string(),
            message,
        })?;
        self.slots[source.index()] = Some(parsed);
        Ok(())
    }

    /// clear a source's value; ignored for the default slot
    pub fn clear(&mut self, source: ConfigSource) {
        if source != ConfigSource::Default {
            self.slots[source.index()] = None;
        }
    }

    pub fn string_value(&self) -> String {
        self.value().to_config_string()
    }
}

/// the type-erased view the registry operates through
trait ConfigSettingBase {
    fn key(&self) -> &'static str;
    fn source(&self) -> ConfigSource;
    fn string_value(&self) -> String;
    fn set_string_value(&mut self, value: &str, source: ConfigSource) -> Result<()>;
    fn clear_value(&mut self, source: ConfigSource);
}

impl<T: FieldConverter + Clone> ConfigSettingBase for ConfigSetting<T> {
    fn key(&self) -> &'static str {
        self.key
    }

    fn source(&self) -> ConfigSource {
        ConfigSetting::source(self)
    }

    fn string_value(&self) -> String {
        ConfigSetting::string_value(self)
    }

    fn set_string_value(&mut self, value: &str, source: ConfigSource) -> Result<()> {
        self.set_from_str(value, source)
    }

    fn clear_value(&mut self, source: ConfigSource) {
        self.clear(source)
    }
}

#[derive(Clone, Debug)]
struct FileStamp {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl FileStamp {
    fn current_mtime(path: &PathBuf) -> Option<SystemTime> {
        std::fs::metadata(path).and_then(|m| m.modified()).ok()
    }

    fn changed(&self) -> bool {
        Self::current_mtime(&self.path) != self.mtime
    }
}

/// process-wide daemon settings
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// shared page cache for the local store
    store_cache_bytes: ConfigSetting<u64>,
    /// bounded pool serving local-store io
    store_io_threads: ConfigSetting<u64>,
    /// minimum interval between auto-reload file checks
    reload_interval: ConfigSetting<Duration>,
    system_file: Option<FileStamp>,
    user_file: Option<FileStamp>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_cache_bytes: ConfigSetting::new("store.cache-bytes", 72 * 1024 * 1024),
            store_io_threads: ConfigSetting::new("store.io-threads", 12),
            reload_interval: ConfigSetting::new("config.reload-interval", Duration::from_secs(5)),
            system_file: None,
            user_file: None,
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_cache_bytes(&self) -> u64 {
        *self.store_cache_bytes.value()
    }

    pub fn store_io_threads(&self) -> u64 {
        *self.store_io_threads.value()
    }

    pub fn reload_interval(&self) -> Duration {
        *self.reload_interval.value()
    }

    fn settings_mut(&mut self) -> [&mut dyn ConfigSettingBase; 3] {
        [
            &mut self.store_cache_bytes,
            &mut self.store_io_threads,
            &mut self.reload_interval,
        ]
    }

    fn settings(&self) -> [&dyn ConfigSettingBase; 3] {
        [
            &self.store_cache_bytes,
            &self.store_io_threads,
            &self.reload_interval,
        ]
    }

    /// set one setting by its `section.name` key
    pub fn set_string_value(
        &mut self,
        key: &str,
        value: &str,
        source: ConfigSource,
    ) -> Result<()> {
        for setting in self.settings_mut() {
            if setting.key() == key {
                return setting.set_string_value(value, source);
            }
        }
        Err(Error::UnknownConfigKey(key.to_string()))
    }

    pub fn string_value(&self, key: &str) -> Result<String> {
        for setting in self.settings() {
            if setting.key() == key {
                return Ok(setting.string_value());
            }
        }
        Err(Error::UnknownConfigKey(key.to_string()))
    }

    pub fn value_source(&self, key: &str) -> Result<ConfigSource> {
        for setting in self.settings() {
            if setting.key() == key {
                return Ok(setting.source());
            }
        }
        Err(Error::UnknownConfigKey(key.to_string()))
    }

    pub fn load_system_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.load_file(&path, ConfigSource::SystemConfig)?;
        self.system_file = Some(FileStamp {
            mtime: FileStamp::current_mtime(&path),
            path,
        });
        Ok(())
    }

    pub fn load_user_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.load_file(&path, ConfigSource::UserConfig)?;
        self.user_file = Some(FileStamp {
            mtime: FileStamp::current_mtime(&path),
            path,
        });
        Ok(())
    }

    pub fn apply_cli_overrides(&mut self, overrides: &[(String, String)]) -> Result<()> {
        for (key, value) in overrides {
            self.set_string_value(key, value, ConfigSource::CommandLine)?;
        }
        Ok(())
    }

    /// any tracked file has a different mtime than when it was loaded
    pub fn has_config_changed(&self) -> bool {
        self.system_file.as_ref().is_some_and(|f| f.changed())
            || self.user_file.as_ref().is_some_and(|f| f.changed())
    }

    /// re-read tracked files whose mtime changed
    pub fn reload_changed_files(&mut self) -> Result<()> {
        if let Some(stamp) = self.system_file.clone() {
            if stamp.changed() {
                self.load_system_file(stamp.path)?;
            }
        }
        if let Some(stamp) = self.user_file.clone() {
            if stamp.changed() {
                self.load_user_file(stamp.path)?;
            }
        }
        Ok(())
    }

    /// parse a `section.key = value` toml file into one source's slots
    ///
    /// the source's previous values are dropped first so deletions in
    /// the file take effect on reload.
    fn load_file(&mut self, path: &PathBuf, source: ConfigSource) -> Result<()> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                for setting in self.settings_mut() {
                    setting.clear_value(source);
                }
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Io {
                    path: path.clone(),
                    source: e,
                })
            }
        };
        let parsed: toml::Value = toml::from_str(&contents)?;

        for setting in self.settings_mut() {
            setting.clear_value(source);
        }

        let Some(table) = parsed.as_table() else {
            return Ok(());
        };
        for (section, entries) in table {
            let Some(entries) = entries.as_table() else {
                warn!(section, "config section is not a table; ignored");
                continue;
            };
            for (name, value) in entries {
                let key = format!("{section}.{name}");
                let value_str = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                match self.set_string_value(&key, &value_str, source) {
                    Ok(()) => {}
                    Err(Error::UnknownConfigKey(_)) => {
                        warn!(key, "unknown config setting; ignored");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_precedence() {
        let mut setting = ConfigSetting::new("test.value", 1u64);
        assert_eq!(*setting.value(), 1);
        assert_eq!(setting.source(), ConfigSource::Default);

        setting.set_from_str("2", ConfigSource::SystemConfig).unwrap();
        assert_eq!(*setting.value(), 2);
        assert_eq!(setting.source(), ConfigSource::SystemConfig);

        setting.set_from_str("3", ConfigSource::UserConfig).unwrap();
        assert_eq!(*setting.value(), 3);

        setting.set_from_str("4", ConfigSource::CommandLine).unwrap();
        assert_eq!(*setting.value(), 4);
        assert_eq!(setting.source(), ConfigSource::CommandLine);

        // clearing peels back to the next populated source
        setting.clear(ConfigSource::CommandLine);
        assert_eq!(*setting.value(), 3);
        setting.clear(ConfigSource::UserConfig);
        assert_eq!(*setting.value(), 2);
        setting.clear(ConfigSource::SystemConfig);
        assert_eq!(*setting.value(), 1);

        // the default slot cannot be cleared or string-set
        setting.clear(ConfigSource::Default);
        assert_eq!(*setting.value(), 1);
        assert!(setting.set_from_str("9", ConfigSource::Default).is_err());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut setting = ConfigSetting::new("test.count", 0u64);
        assert!(matches!(
            setting.set_from_str("not-a-number", ConfigSource::UserConfig),
            Err(Error::InvalidConfigValue { .. })
        ));
        // the failed set leaves the previous value in place
        assert_eq!(*setting.value(), 0);
    }

    #[test]
    fn test_duration_parsing() {
        for (input, expect) in [
            ("100ns", Duration::from_nanos(100)),
            ("250us", Duration::from_micros(250)),
            ("15ms", Duration::from_millis(15)),
            ("90s", Duration::from_secs(90)),
            ("5m", Duration::from_secs(300)),
            ("2h", Duration::from_secs(7200)),
        ] {
            assert_eq!(Duration::from_config_str(input).unwrap(), expect, "{input}");
        }
        assert!(Duration::from_config_str("5").is_err());
        assert!(Duration::from_config_str("5d").is_err());
        assert!(Duration::from_config_str("s").is_err());
    }

    #[test]
    fn test_duration_rendering() {
        assert_eq!(Duration::from_secs(300).to_config_string(), "5m");
        assert_eq!(Duration::from_secs(90).to_config_string(), "90s");
        assert_eq!(Duration::from_millis(15).to_config_string(), "15ms");
        assert_eq!(Duration::from_nanos(7).to_config_string(), "7ns");
    }

    #[test]
    fn test_absolute_path_required() {
        assert!(PathBuf::from_config_str("/abs/path").is_ok());
        assert!(PathBuf::from_config_str("relative/path").is_err());
    }

    #[test]
    fn test_daemon_config_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.store_io_threads(), 12);
        assert_eq!(config.reload_interval(), Duration::from_secs(5));
        assert_eq!(
            config.value_source("store.io-threads").unwrap(),
            ConfigSource::Default
        );
    }

    #[test]
    fn test_load_file_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("system.toml");
        std::fs::write(
            &path,
            "[store]\nio-threads = 4\n\n[config]\nreload-interval = \"30s\"\n",
        )
        .unwrap();

        let mut config = DaemonConfig::default();
        config.load_system_file(&path).unwrap();
        assert_eq!(config.store_io_threads(), 4);
        assert_eq!(config.reload_interval(), Duration::from_secs(30));
        assert_eq!(
            config.value_source("store.io-threads").unwrap(),
            ConfigSource::SystemConfig
        );

        // a key removed from the file reverts to the default on reload
        std::fs::write(&path, "[config]\nreload-interval = \"30s\"\n").unwrap();
        config.load_system_file(&path).unwrap();
        assert_eq!(config.store_io_threads(), 12);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        std::fs::write(&path, "[mystery]\nsetting = \"x\"\n[store]\nio-threads = 3\n").unwrap();

        let mut config = DaemonConfig::default();
        config.load_user_file(&path).unwrap();
        assert_eq!(config.store_io_threads(), 3);
    }

    #[test]
    fn test_cli_overrides_beat_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.toml");
        std::fs::write(&path, "[store]\nio-threads = 3\n").unwrap();

        let mut config = DaemonConfig::default();
        config.load_user_file(&path).unwrap();
        config
            .apply_cli_overrides(&[("store.io-threads".to_string(), "8".to_string())])
            .unwrap();
        assert_eq!(config.store_io_threads(), 8);
        assert_eq!(
            config.value_source("store.io-threads").unwrap(),
            ConfigSource::CommandLine
        );
    }

    #[test]
    fn test_registry_set_and_render() {
        let mut config = DaemonConfig::default();
        config
            .set_string_value("store.cache-bytes", "1024", ConfigSource::UserConfig)
            .unwrap();
        assert_eq!(config.store_cache_bytes(), 1024);
        assert_eq!(config.string_value("store.cache-bytes").unwrap(), "1024");
        assert!(matches!(
            config.set_string_value("no.such-key", "1", ConfigSource::UserConfig),
            Err(Error::UnknownConfigKey(_))
        ));
    }
}
