//! Configuration Vault – reads/writes `~/.kuro/config.toml`.

use kuro_memory::{
    DEFAULT_DECAY_INTERVAL, DEFAULT_DECAY_RATE, DEFAULT_MAX_ATOMS_PER_DIMENSION,
    DEFAULT_PRUNING_THRESHOLD,
};
use kuro_service::{DEFAULT_MAX_WORKERS, DEFAULT_PORT, ServiceConfig};
use kuro_types::KuroError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted daemon configuration stored in `~/.kuro/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// TCP port of the memory server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Seconds between two decay sweeps.
    #[serde(default = "default_decay_interval_secs")]
    pub decay_interval_secs: u64,

    /// Decay rate (per hour) given to new atoms.
    #[serde(default = "default_decay_rate")]
    pub default_decay_rate: f64,

    #[serde(default = "default_max_atoms_per_dimension")]
    pub max_atoms_per_dimension: usize,

    /// Startup pruning floor for `|magnitude|` and confidence.
    #[serde(default = "default_pruning_threshold")]
    pub pruning_threshold: f64,

    /// Requests served concurrently.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_path() -> PathBuf {
    kuro_dir_for_home(&home_dir()).join("kuro_memory.db")
}
fn default_decay_interval_secs() -> u64 {
    DEFAULT_DECAY_INTERVAL.as_secs()
}
fn default_decay_rate() -> f64 {
    DEFAULT_DECAY_RATE
}
fn default_max_atoms_per_dimension() -> usize {
    DEFAULT_MAX_ATOMS_PER_DIMENSION
}
fn default_pruning_threshold() -> f64 {
    DEFAULT_PRUNING_THRESHOLD
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            decay_interval_secs: default_decay_interval_secs(),
            default_decay_rate: default_decay_rate(),
            max_atoms_per_dimension: default_max_atoms_per_dimension(),
            pruning_threshold: default_pruning_threshold(),
            max_workers: default_max_workers(),
        }
    }
}

impl Config {
    /// Library-level settings for [`kuro_service::MemoryService::start`].
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            db_path: Some(self.db_path.clone()),
            decay_interval: Duration::from_secs(self.decay_interval_secs),
            default_decay_rate: self.default_decay_rate,
            max_atoms_per_dimension: self.max_atoms_per_dimension,
            pruning_threshold: self.pruning_threshold,
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn kuro_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".kuro")
}

/// Return the path to `~/.kuro/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    kuro_dir_for_home(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, KuroError> {
    load_from(&config_path())
}

/// The file as written, without `KURO_*` overrides. Used by the settings
/// editor so a save never persists temporary env values.
pub fn load_stored() -> Result<Option<Config>, KuroError> {
    read_from(&config_path())
}

/// Stored config, or defaults when there is none; env overrides apply to
/// both.
pub fn load_or_default() -> Result<Config, KuroError> {
    Ok(match load()? {
        Some(cfg) => cfg,
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            cfg
        }
    })
}

/// Load the config from a specific path.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, KuroError> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, KuroError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        KuroError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw)
        .map_err(|e| KuroError::Config(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `KURO_*` environment variable overrides to `cfg`. Values that do not
/// parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `KURO_PORT` | `port` |
/// | `KURO_DB_PATH` | `db_path` |
/// | `KURO_DECAY_INTERVAL_SECS` | `decay_interval_secs` |
/// | `KURO_MAX_ATOMS_PER_DIMENSION` | `max_atoms_per_dimension` |
/// | `KURO_MAX_WORKERS` | `max_workers` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("KURO_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.port = port;
    }
    if let Ok(v) = std::env::var("KURO_DB_PATH")
        && !v.trim().is_empty()
    {
        cfg.db_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KURO_DECAY_INTERVAL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.decay_interval_secs = secs;
    }
    if let Ok(v) = std::env::var("KURO_MAX_ATOMS_PER_DIMENSION")
        && let Ok(limit) = v.parse::<usize>()
    {
        cfg.max_atoms_per_dimension = limit;
    }
    if let Ok(v) = std::env::var("KURO_MAX_WORKERS")
        && let Ok(workers) = v.parse::<usize>()
    {
        cfg.max_workers = workers;
    }
}

/// Save the config to disk, creating `~/.kuro/` if necessary.
pub fn save(cfg: &Config) -> Result<(), KuroError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), KuroError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            KuroError::Config(format!("failed to create config directory: {e}"))
        })?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                KuroError::Config(format!("failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| KuroError::Config(format!("failed to serialize config: {e}")))?;
    let write_error =
        |e: std::io::Error| KuroError::Config(format!("failed to write config at {}: {e}", path.display()));
    // rw------- on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_error)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that touch process env run one at a time.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_daemon_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 50053);
        assert_eq!(cfg.decay_interval_secs, 3600);
        assert_eq!(cfg.default_decay_rate, 0.05);
        assert_eq!(cfg.max_atoms_per_dimension, 50);
        assert_eq!(cfg.pruning_threshold, 0.1);
        assert_eq!(cfg.max_workers, 10);
        assert!(cfg.db_path.ends_with(".kuro/kuro_memory.db"));
    }

    #[test]
    fn service_config_carries_every_tunable() {
        let cfg = Config {
            decay_interval_secs: 120,
            max_atoms_per_dimension: 7,
            pruning_threshold: 0.3,
            default_decay_rate: 0.2,
            ..Config::default()
        };
        let svc = cfg.service_config();
        assert_eq!(svc.db_path.as_deref(), Some(cfg.db_path.as_path()));
        assert_eq!(svc.decay_interval, Duration::from_secs(120));
        assert_eq!(svc.max_atoms_per_dimension, 7);
        assert_eq!(svc.pruning_threshold, 0.3);
        assert_eq!(svc.default_decay_rate, 0.2);
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_config() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            port: 6000,
            db_path: dir.path().join("memory.db"),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 7000\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.port, 7000);
        assert_eq!(loaded.max_workers, 10);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"\n").unwrap();

        assert!(matches!(load_from(&path), Err(KuroError::Config(_))));
    }

    #[test]
    fn config_path_points_to_kuro_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.kuro/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_port_and_db_path() {
        let _env = ENV_LOCK.lock().unwrap();
        // SAFETY: env access is serialized by ENV_LOCK.
        unsafe {
            std::env::set_var("KURO_PORT", "6100");
            std::env::set_var("KURO_DB_PATH", "/tmp/kuro-test.db");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.port, 6100);
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/kuro-test.db"));
        unsafe {
            std::env::remove_var("KURO_PORT");
            std::env::remove_var("KURO_DB_PATH");
        }
    }

    #[test]
    fn apply_env_overrides_changes_numeric_tunables() {
        let _env = ENV_LOCK.lock().unwrap();
        // SAFETY: env access is serialized by ENV_LOCK.
        unsafe {
            std::env::set_var("KURO_DECAY_INTERVAL_SECS", "60");
            std::env::set_var("KURO_MAX_ATOMS_PER_DIMENSION", "5");
            std::env::set_var("KURO_MAX_WORKERS", "3");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.decay_interval_secs, 60);
        assert_eq!(cfg.max_atoms_per_dimension, 5);
        assert_eq!(cfg.max_workers, 3);
        unsafe {
            std::env::remove_var("KURO_DECAY_INTERVAL_SECS");
            std::env::remove_var("KURO_MAX_ATOMS_PER_DIMENSION");
            std::env::remove_var("KURO_MAX_WORKERS");
        }
    }

    #[test]
    fn stored_config_ignores_env_overrides() {
        let _env = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        // SAFETY: env access is serialized by ENV_LOCK.
        unsafe { std::env::set_var("KURO_PORT", "6200") };
        let effective = load_from(&path).expect("load ok").expect("some");
        let stored = read_from(&path).expect("read ok").expect("some");
        unsafe { std::env::remove_var("KURO_PORT") };

        assert_eq!(effective.port, 6200);
        assert_eq!(stored.port, 50053);

        // Saving what the editor loaded leaves the file free of the override.
        save_to(&stored, &path).expect("save");
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("port = 50053"));
        assert!(!raw.contains("6200"));
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_values() {
        let _env = ENV_LOCK.lock().unwrap();
        // SAFETY: env access is serialized by ENV_LOCK.
        unsafe {
            std::env::set_var("KURO_PORT", "not-a-port");
            std::env::set_var("KURO_MAX_WORKERS", "-2");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.port, 50053);
        assert_eq!(cfg.max_workers, 10);
        unsafe {
            std::env::remove_var("KURO_PORT");
            std::env::remove_var("KURO_MAX_WORKERS");
        }
    }
}
