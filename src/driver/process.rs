// src/driver/process.rs

use std::{
    fmt,
    io::{self, BufRead, BufReader, Write},
    path::Path,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        Arc, Mutex, MutexGuard, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use driver_protocol::{Message, Opcode};
use tracing::{debug, error, info, warn};

use crate::{config::DriverConfig, driver::DriverKind, error::DriverError};

/// Where a reader thread delivers every decoded message.
pub type MessageSink<O> = Arc<dyn Fn(Message<O>) + Send + Sync>;

/// How long a reader thread may outlive its process before it is detached.
const READER_GRACE: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The driver exited on its own or after SIGTERM.
    Exited,
    /// The driver outlived the timeout and was killed.
    Killed,
    AlreadyStopped,
}

/// One running driver process with its stdin/stdout pipes and reader thread.
pub struct DriverProcess {
    name: String,
    kind: DriverKind,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    alive: Arc<AtomicBool>,
    terminated: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl DriverProcess {
    /// Launch `executable` and start a reader thread that decodes its stdout
    /// into `sink`.
    pub fn spawn<O: Opcode>(
        config: &DriverConfig,
        executable: &Path,
        sink: MessageSink<O>,
    ) -> Result<Self, DriverError> {
        let mut child = Command::new(executable)
            .args(&config.arguments)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                name: config.name.clone(),
                path: executable.to_path_buf(),
                source,
            })?;

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DriverError::PipeClosed(config.name.clone()));
        };

        let alive = Arc::new(AtomicBool::new(true));
        let reader = {
            let name = config.name.clone();
            let alive = alive.clone();
            thread::Builder::new()
                .name(format!("{}-reader", config.name))
                .spawn(move || read_loop(name, stdout, alive, sink))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DriverError::Io { name: config.name.clone(), source });
            }
        };

        info!(driver = %config.name, pid, "driver started: {}", executable.display());
        Ok(Self {
            name: config.name.clone(),
            kind: config.kind,
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            alive,
            terminated: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::SeqCst) || self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        // stop() holds the child lock while it waits
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(TryLockError::Poisoned(poisoned)) => matches!(poisoned.into_inner().try_wait(), Ok(None)),
            Err(TryLockError::WouldBlock) => true,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Write one line (without its terminator) to the driver.
    pub fn write_line(&self, text: &str) -> Result<(), DriverError> {
        if text.contains(['\n', '\r']) {
            return Err(DriverError::InvalidPayload(self.name.clone()));
        }
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        self.write_raw(&line)
    }

    pub fn send<O: Opcode>(&self, msg: &Message<O>) -> Result<(), DriverError> {
        if msg.payload.contains(['\n', '\r']) {
            return Err(DriverError::InvalidPayload(self.name.clone()));
        }
        self.write_raw(&msg.encode())
    }

    fn write_raw(&self, line: &str) -> Result<(), DriverError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DriverError::PipeClosed(self.name.clone()));
        }
        let mut guard = lock(&self.stdin);
        let Some(stdin) = guard.as_mut() else {
            return Err(DriverError::PipeClosed(self.name.clone()));
        };

        match stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                *guard = None;
                self.alive.store(false, Ordering::SeqCst);
                Err(DriverError::PipeClosed(self.name.clone()))
            }
            Err(source) => Err(DriverError::Io { name: self.name.clone(), source }),
        }
    }

    /// Close stdin, give the driver half of `timeout` to exit, send SIGTERM,
    /// wait out the rest and kill it if it is still around.
    ///
    /// The reader thread is joined if it finishes within 500ms of the process
    /// exiting. A reader still blocked after that (a grandchild holding the
    /// output pipe open) is detached with a warning, so `stop` may return
    /// before the reader thread has exited.
    pub fn stop(&self, timeout: Duration) -> StopOutcome {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return StopOutcome::AlreadyStopped;
        }
        let started = Instant::now();
        // a writer blocked on a full pipe holds stdin; the kill below unblocks it
        match self.stdin.try_lock() {
            Ok(mut stdin) => drop(stdin.take()),
            Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
            Err(TryLockError::WouldBlock) => {
                debug!(driver = %self.name, "stdin busy with a pending write, not closing it");
            }
        }

        let outcome = {
            let mut child = lock(&self.child);
            if wait_until(&mut child, started + timeout / 2) {
                StopOutcome::Exited
            } else {
                terminate(self.pid);
                if wait_until(&mut child, started + timeout) {
                    StopOutcome::Exited
                } else {
                    warn!(driver = %self.name, pid = self.pid, "driver ignored termination, killing it");
                    if let Err(err) = child.kill() {
                        error!(driver = %self.name, "could not kill driver: {err}");
                    }
                    let _ = child.wait();
                    StopOutcome::Killed
                }
            }
        };
        self.alive.store(false, Ordering::SeqCst);

        if let Some(reader) = lock(&self.reader).take() {
            let deadline = Instant::now() + READER_GRACE;
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                warn!(driver = %self.name, "output pipe still held open, detaching reader thread");
            }
        }

        info!(driver = %self.name, ?outcome, elapsed_ms = started.elapsed().as_millis() as u64, "driver stopped");
        outcome
    }
}

impl Drop for DriverProcess {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::SeqCst) {
            let mut child = lock(&self.child);
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl fmt::Debug for DriverProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverProcess")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

fn read_loop<O: Opcode>(
    name: String,
    stdout: ChildStdout,
    alive: Arc<AtomicBool>,
    sink: MessageSink<O>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                match Message::<O>::decode(&line) {
                    Ok(Some(msg)) => sink(msg),
                    Ok(None) => {}
                    Err(err) => warn!(driver = %name, "dropping malformed message: {err}"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!(driver = %name, "error reading driver output: {err}");
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    debug!(driver = %name, "driver output closed");
}

/// Poll until the child exits or `deadline` passes. Returns true if it exited.
fn wait_until(child: &mut Child, deadline: Instant) -> bool {
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            Err(_) => return false,
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: plain signal delivery to a child we spawned and have not reaped.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
