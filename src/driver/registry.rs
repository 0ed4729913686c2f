// src/driver/registry.rs

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use driver_protocol::Opcode;
use tracing::{error, info, warn};

use crate::{
    config::DriverConfig,
    driver::process::{DriverProcess, MessageSink, StopOutcome},
    error::DriverError,
};

/// Name → running driver table owned by one manager.
#[derive(Debug)]
pub struct DriverRegistry {
    drivers_dir: PathBuf,
    drivers: DashMap<String, Arc<DriverProcess>>,
}

impl DriverRegistry {
    pub fn new(drivers_dir: impl Into<PathBuf>) -> Self {
        Self {
            drivers_dir: drivers_dir.into(),
            drivers: DashMap::new(),
        }
    }

    pub fn drivers_dir(&self) -> &Path {
        &self.drivers_dir
    }

    /// Relative executables live under `drivers_dir`.
    pub fn resolve(&self, executable: &Path) -> PathBuf {
        if executable.is_absolute() {
            executable.to_path_buf()
        } else {
            self.drivers_dir.join(executable)
        }
    }

    /// Spawn the driver described by `config` and register it under its name.
    pub fn load<O: Opcode>(
        &self,
        config: &DriverConfig,
        sink: MessageSink<O>,
    ) -> Result<Arc<DriverProcess>, DriverError> {
        if self.drivers.contains_key(&config.name) {
            error!(driver = %config.name, "driver already loaded, ignoring duplicate entry");
            return Err(DriverError::Duplicate(config.name.clone()));
        }

        let executable = self.resolve(&config.executable);
        let driver = Arc::new(DriverProcess::spawn(config, &executable, sink)?);

        let inserted = match self.drivers.entry(config.name.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(driver.clone());
                true
            }
        };
        if !inserted {
            // lost a race with a concurrent load of the same name
            driver.stop(Duration::ZERO);
            return Err(DriverError::Duplicate(config.name.clone()));
        }
        Ok(driver)
    }

    /// Load every entry. A failing entry is logged and skipped unless it is
    /// marked `required`, in which case loading stops with its error.
    pub fn load_all<O: Opcode>(
        &self,
        entries: &[DriverConfig],
        sink: MessageSink<O>,
    ) -> Result<usize, DriverError> {
        let mut loaded = 0;
        for entry in entries {
            match self.load(entry, sink.clone()) {
                Ok(_) => loaded += 1,
                Err(err) if entry.required => {
                    error!(driver = %entry.name, "required driver failed to load: {err}");
                    return Err(err);
                }
                Err(err) => error!(driver = %entry.name, "driver not loaded: {err}"),
            }
        }
        info!("{loaded} of {} drivers loaded", entries.len());
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> Option<Arc<DriverProcess>> {
        self.drivers.get(name).map(|entry| entry.value().clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.iter().map(|kv| kv.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Stop every driver in parallel, each bounded by `timeout`, and empty
    /// the registry. Returns once all of them are accounted for.
    pub fn stop(&self, timeout: Duration) -> Vec<(String, StopOutcome)> {
        let names = self.names();
        let drivers: Vec<(String, Arc<DriverProcess>)> = names
            .into_iter()
            .filter_map(|name| self.drivers.remove(&name))
            .collect();

        thread::scope(|scope| {
            let stopping: Vec<_> = drivers
                .iter()
                .map(|(name, driver)| (name, scope.spawn(move || driver.stop(timeout))))
                .collect();

            stopping
                .into_iter()
                .map(|(name, handle)| {
                    let outcome = handle.join().unwrap_or_else(|_| {
                        warn!(driver = %name, "stop panicked");
                        StopOutcome::Killed
                    });
                    (name.clone(), outcome)
                })
                .collect()
        })
    }
}
