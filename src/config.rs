use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{driver::DriverKind, error::ConfigError, logger::LogConfig};

pub const DEFAULT_DRIVERS_TIMEOUT: u64 = 10;
pub const ENV_DRIVERS_DIR: &str = "DRIVERD_DRIVERS_DIR";
pub const ENV_LOG_LEVEL: &str = "DRIVERD_LOG_LEVEL";

/// One driver process to launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    /// Absolute, or relative to `drivers_dir`.
    pub executable: PathBuf,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub kind: DriverKind,
    /// Abort manager start if this driver cannot be spawned.
    #[serde(default)]
    pub required: bool,
}

impl DriverConfig {
    pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: vec![],
            env: BTreeMap::new(),
            kind: DriverKind::default(),
            required: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: DriverKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Seconds each driver gets to exit on shutdown before it is killed.
    #[serde(default = "default_drivers_timeout")]
    pub drivers_timeout: u64,
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            drivers_timeout: DEFAULT_DRIVERS_TIMEOUT,
            drivers: vec![],
        }
    }
}

impl ManagerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.drivers_timeout)
    }

    fn validate(&self, manager: &str) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for driver in &self.drivers {
            if driver.executable.as_os_str().is_empty() {
                return Err(ConfigError::MissingExecutable {
                    manager: manager.to_string(),
                    name: driver.name.clone(),
                });
            }
            if !seen.insert(driver.name.as_str()) {
                return Err(ConfigError::DuplicateDriver {
                    manager: manager.to_string(),
                    name: driver.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverdConfig {
    #[serde(default = "default_drivers_dir")]
    pub drivers_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub hook_manager: ManagerConfig,
    #[serde(default)]
    pub vm_manager: ManagerConfig,
}

impl Default for DriverdConfig {
    fn default() -> Self {
        Self {
            drivers_dir: default_drivers_dir(),
            log: LogConfig::default(),
            hook_manager: ManagerConfig::default(),
            vm_manager: ManagerConfig::default(),
        }
    }
}

impl DriverdConfig {
    /// Read a YAML file, pick up a `.env` next to it, apply environment
    /// overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&content, path)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let env_file = base.join(".env");
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not load {}: {err}", env_file.display()),
            }
        }
        config.apply_env(|key| env::var(key).ok());

        if config.drivers_dir.is_relative() {
            config.drivers_dir = base.join(&config.drivers_dir);
        }
        config.validate()?;
        debug!(?config, "configuration loaded");
        Ok(config)
    }

    pub fn from_yaml(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml_bw::from_str(content).map_err(|err| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: err.to_string(),
        })
    }

    /// Override file values from the environment. `lookup` is `env::var` in
    /// production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DRIVERS_DIR).filter(|v| !v.is_empty()) {
            self.drivers_dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.hook_manager.validate("hook_manager")?;
        self.vm_manager.validate("vm_manager")
    }
}

fn default_drivers_timeout() -> u64 {
    DEFAULT_DRIVERS_TIMEOUT
}

fn default_drivers_dir() -> PathBuf {
    PathBuf::from("./drivers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
drivers_dir: /opt/drivers
log:
  level: debug
hook_manager:
  drivers:
    - name: hook_exe
      executable: hook/exec.sh
      arguments: ["-t", "15"]
      required: true
vm_manager:
  drivers_timeout: 3
  drivers:
    - name: kvm
      executable: /usr/lib/vmm/kvm
      kind: libvirt
      env:
        LIBVIRT_URI: qemu:///system
"#;

    #[test]
    fn parses_full_document() {
        let config = DriverdConfig::from_yaml(SAMPLE, Path::new("driverd.yaml")).unwrap();
        assert_eq!(config.drivers_dir, PathBuf::from("/opt/drivers"));
        assert_eq!(config.log.level, "debug");

        let hook = &config.hook_manager;
        assert_eq!(hook.drivers_timeout, DEFAULT_DRIVERS_TIMEOUT);
        assert_eq!(hook.drivers[0].arguments, vec!["-t", "15"]);
        assert!(hook.drivers[0].required);
        assert_eq!(hook.drivers[0].kind, DriverKind::Generic);

        let vmm = &config.vm_manager;
        assert_eq!(vmm.timeout(), Duration::from_secs(3));
        assert_eq!(vmm.drivers[0].kind, DriverKind::Libvirt);
        assert_eq!(vmm.drivers[0].env["LIBVIRT_URI"], "qemu:///system");
        config.validate().unwrap();
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = DriverdConfig::from_yaml("{}", Path::new("empty.yaml")).unwrap();
        assert_eq!(config, DriverdConfig::default());
    }

    #[test]
    fn environment_overrides_file() {
        let mut config = DriverdConfig::from_yaml(SAMPLE, Path::new("driverd.yaml")).unwrap();
        let vars: HashMap<&str, &str> =
            HashMap::from([(ENV_DRIVERS_DIR, "/srv/drivers"), (ENV_LOG_LEVEL, "")]);
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.drivers_dir, PathBuf::from("/srv/drivers"));
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn duplicate_driver_names_are_rejected() {
        let mut config = DriverdConfig::default();
        config.hook_manager.drivers = vec![
            DriverConfig::new("hook_exe", "a.sh"),
            DriverConfig::new("hook_exe", "b.sh"),
        ];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateDriver { name, .. }) if name == "hook_exe"
        ));
    }

    #[test]
    fn empty_executable_is_rejected() {
        let mut config = DriverdConfig::default();
        config.vm_manager.drivers = vec![DriverConfig::new("kvm", "")];
        assert!(matches!(config.validate(), Err(ConfigError::MissingExecutable { .. })));
    }

    #[test]
    fn load_resolves_relative_drivers_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driverd.yaml");
        fs::write(&path, "drivers_dir: remotes\n").unwrap();

        let config = DriverdConfig::load(&path).unwrap();
        if std::env::var(ENV_DRIVERS_DIR).is_err() {
            assert_eq!(config.drivers_dir, dir.path().join("remotes"));
        }
    }

    #[test]
    fn unreadable_dotenv_does_not_fail_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("driverd.yaml");
        fs::write(&path, "log:\n  level: warn\n").unwrap();
        fs::write(dir.path().join(".env"), "this line is not an assignment\n").unwrap();

        let config = DriverdConfig::load(&path).unwrap();
        if std::env::var(ENV_LOG_LEVEL).is_err() {
            assert_eq!(config.log.level, "warn");
        }
    }

    #[test]
    fn bad_yaml_is_a_parse_error() {
        let err = DriverdConfig::from_yaml("hook_manager: [", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
