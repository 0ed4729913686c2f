// src/manager.rs

use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use driver_protocol::{Message, Opcode};
use tracing::{debug, error, info, warn};

use crate::{
    action::{ActionListener, ActionSender},
    config::DriverConfig,
    driver::{DriverProcess, DriverRegistry, MessageSink, StopOutcome},
    error::ListenerError,
};

/// A driver registry plus the action listener that serialises every
/// driver-facing operation of one manager.
///
/// Concrete managers register one handler per opcode, then call
/// [`start`](Self::start). Their `trigger_*` methods enqueue closures through
/// [`trigger`](Self::trigger) so that no two operations of the same manager
/// ever run at the same time.
pub struct DriverManager<O: Opcode> {
    name: String,
    registry: Arc<DriverRegistry>,
    listener: ActionListener<O>,
    drivers_timeout: Duration,
}

impl<O: Opcode> DriverManager<O> {
    pub fn new(name: impl Into<String>, drivers_dir: impl Into<PathBuf>, drivers_timeout: Duration) -> Self {
        let name = name.into();
        Self {
            listener: ActionListener::new(name.clone()),
            registry: Arc::new(DriverRegistry::new(drivers_dir)),
            name,
            drivers_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn listener(&self) -> &ActionListener<O> {
        &self.listener
    }

    pub fn sender(&self) -> ActionSender<O> {
        self.listener.sender()
    }

    pub fn drivers_timeout(&self) -> Duration {
        self.drivers_timeout
    }

    pub fn register_action<F>(&self, opcode: O, handler: F) -> Result<(), ListenerError>
    where
        F: Fn(Message<O>) -> Result<()> + Send + Sync + 'static,
    {
        self.listener.register_action(opcode, handler)
    }

    /// Start the listener and load `drivers`. Every loaded driver's output is
    /// dispatched onto this manager's queue.
    pub fn start(&self, drivers: &[DriverConfig]) -> Result<usize> {
        self.listener.start()?;

        let sender = self.listener.sender();
        let manager = self.name.clone();
        let sink: MessageSink<O> = Arc::new(move |msg: Message<O>| {
            if let Err(err) = sender.dispatch(msg) {
                debug!(%manager, "driver message discarded: {err}");
            }
        });

        match self.registry.load_all(drivers, sink) {
            Ok(loaded) => {
                info!(manager = %self.name, loaded, "manager started");
                Ok(loaded)
            }
            Err(err) => {
                self.finalize();
                Err(err.into())
            }
        }
    }

    /// Enqueue `action` on the listener. Rejections are logged, never returned.
    pub fn trigger<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.listener.trigger(action) {
            warn!(manager = %self.name, "action dropped: {err}");
        }
    }

    /// Enqueue a write of `msg` to the driver called `driver`.
    pub fn trigger_send(&self, driver: &str, msg: Message<O>) {
        let registry = self.registry.clone();
        let manager = self.name.clone();
        let driver = driver.to_string();
        self.trigger(move || {
            send_to_driver(&manager, &registry, &driver, &msg);
        });
    }

    /// Stop the listener (queued work first), then the drivers.
    ///
    /// The listener gets `drivers_timeout` to drain. If it is still busy,
    /// typically blocked writing to a driver that stopped reading, the drivers
    /// are stopped under it, which fails the pending write and lets it finish.
    pub fn finalize(&self) -> Vec<(String, StopOutcome)> {
        self.listener.finalize();
        if !self.listener.join_timeout(self.drivers_timeout) {
            warn!(
                manager = %self.name,
                "listener still busy after {:?}, stopping drivers first",
                self.drivers_timeout
            );
        }
        let outcomes = self.registry.stop(self.drivers_timeout);
        self.listener.join_thread();
        info!(manager = %self.name, drivers = outcomes.len(), "manager stopped");
        outcomes
    }
}

impl<O: Opcode> fmt::Debug for DriverManager<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverManager")
            .field("name", &self.name)
            .field("drivers", &self.registry.names())
            .field("listener", &self.listener)
            .field("drivers_timeout", &self.drivers_timeout)
            .finish()
    }
}

/// Look `driver` up and write `msg` to it. A missing or dead driver is
/// logged and the message dropped. Meant to run on the listener thread.
pub fn send_to_driver<O: Opcode>(
    manager: &str,
    registry: &DriverRegistry,
    driver: &str,
    msg: &Message<O>,
) -> Option<Arc<DriverProcess>> {
    let Some(handle) = registry.get(driver) else {
        warn!(%manager, %driver, "driver not loaded, {} for id {} dropped", msg.opcode.token(), msg.id);
        return None;
    };
    match handle.send(msg) {
        Ok(()) => Some(handle),
        Err(err) => {
            error!(%manager, %driver, "{} for id {} not sent: {err}", msg.opcode.token(), msg.id);
            None
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use driver_protocol::{HookOpcode, Status};
    use std::{
        sync::Mutex,
        thread,
        time::Instant,
    };

    fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn driver_replies_reach_the_handler() {
        let manager = DriverManager::<HookOpcode>::new("echo", "/tmp", Duration::from_secs(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            manager
                .register_action(HookOpcode::Execute, move |m| {
                    seen.lock().unwrap().push((m.id, m.payload));
                    Ok(())
                })
                .unwrap();
        }
        let echo = DriverConfig::new("echo", "/bin/sh").with_args(["-c", "cat"]);
        assert_eq!(manager.start(&[echo]).unwrap(), 1);

        manager.trigger_send("echo", Message::new(HookOpcode::Execute, Status::Success, 5, "a b"));
        assert!(wait_for(Duration::from_secs(5), || !seen.lock().unwrap().is_empty()));
        assert_eq!(seen.lock().unwrap()[0], (5, "a b".to_string()));

        let outcomes = manager.finalize();
        assert_eq!(outcomes, vec![("echo".to_string(), StopOutcome::Exited)]);
        assert!(!manager.listener().is_alive());
    }

    #[test]
    fn sending_to_a_missing_driver_is_a_noop() {
        let manager = DriverManager::<HookOpcode>::new("empty", "/tmp", Duration::from_secs(1));
        manager.start(&[]).unwrap();
        manager.trigger_send("hook_exe", Message::request(HookOpcode::Execute, -1, "x"));

        let done = Arc::new(Mutex::new(false));
        {
            let done = done.clone();
            manager.trigger(move || *done.lock().unwrap() = true);
        }
        assert!(wait_for(Duration::from_secs(5), || *done.lock().unwrap()));
        assert!(manager.listener().is_alive());
        manager.finalize();
    }

    #[test]
    fn finalize_is_bounded_when_a_driver_stops_reading() {
        let manager = Arc::new(DriverManager::<HookOpcode>::new("deaf", "/tmp", Duration::from_secs(1)));
        let deaf = DriverConfig::new("deaf", "/bin/sh").with_args(["-c", "trap '' TERM; exec sleep 20"]);
        manager.start(&[deaf]).unwrap();
        manager.trigger_send("deaf", Message::request(HookOpcode::Execute, 1, "x".repeat(200_000)));

        let (tx, rx) = std::sync::mpsc::channel();
        {
            let manager = manager.clone();
            thread::spawn(move || {
                let _ = tx.send(manager.finalize());
            });
        }
        let outcomes = rx
            .recv_timeout(Duration::from_secs(6))
            .expect("finalize should return within a few drivers_timeout");
        assert_eq!(outcomes, vec![("deaf".to_string(), StopOutcome::Killed)]);
        assert!(!manager.listener().is_alive());
    }

    #[test]
    fn required_driver_failure_aborts_start() {
        let manager = DriverManager::<HookOpcode>::new("strict", "/nonexistent", Duration::from_secs(1));
        let broken = DriverConfig::new("hook_exe", "missing.sh").required();
        assert!(manager.start(&[broken]).is_err());
        assert!(!manager.listener().is_alive());
    }
}
