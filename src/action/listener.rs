// src/action/listener.rs

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use driver_protocol::{Message, Opcode};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{debug, error, info, warn};

use crate::error::ListenerError;

/// A queued unit of work, run exactly once on the listener thread.
pub type Action = Box<dyn FnOnce() + Send + 'static>;

/// Handler registered for one opcode. Receives ownership of the decoded message.
pub type ActionHandler<O> = Arc<dyn Fn(Message<O>) -> anyhow::Result<()> + Send + Sync>;

enum Job<O: Opcode> {
    Run(Action),
    Dispatch(Message<O>),
    Finalize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Running,
    Finalizing,
    Stopped,
}

/// Producer side of the queue. Cheap to clone and safe to use from any thread.
pub struct ActionSender<O: Opcode> {
    name: Arc<str>,
    tx: UnboundedSender<Job<O>>,
    state: Arc<Mutex<ListenerState>>,
}

impl<O: Opcode> Clone for ActionSender<O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<O: Opcode> ActionSender<O> {
    fn push(&self, job: Job<O>) -> Result<(), ListenerError> {
        // the state lock orders every push against the finalize sentinel
        let state = lock(&self.state);
        match *state {
            ListenerState::Created | ListenerState::Running => self
                .tx
                .send(job)
                .map_err(|_| ListenerError::Finalized(self.name.to_string())),
            ListenerState::Finalizing | ListenerState::Stopped => {
                Err(ListenerError::Finalized(self.name.to_string()))
            }
        }
    }

    /// Enqueue an action behind everything already queued.
    pub fn trigger<F>(&self, action: F) -> Result<(), ListenerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Job::Run(Box::new(action)))
    }

    /// Enqueue a decoded driver message for the registered opcode handler.
    pub fn dispatch(&self, msg: Message<O>) -> Result<(), ListenerError> {
        self.push(Job::Dispatch(msg))
    }
}

/// Single consumer action queue drained by a dedicated thread.
///
/// Everything a manager does, outbound triggers and inbound message handlers
/// alike, runs here one at a time in arrival order.
pub struct ActionListener<O: Opcode> {
    sender: ActionSender<O>,
    rx: Mutex<Option<UnboundedReceiver<Job<O>>>>,
    handlers: Mutex<HashMap<O, ActionHandler<O>>>,
    processed: Arc<AtomicU64>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<O: Opcode> ActionListener<O> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = unbounded_channel();
        let name: String = name.into();
        Self {
            sender: ActionSender {
                name: Arc::from(name.as_str()),
                tx,
                state: Arc::new(Mutex::new(ListenerState::Created)),
            },
            rx: Mutex::new(Some(rx)),
            handlers: Mutex::new(HashMap::new()),
            processed: Arc::new(AtomicU64::new(0)),
            thread: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.sender.name
    }

    pub fn state(&self) -> ListenerState {
        *lock(&self.sender.state)
    }

    /// Number of jobs the listener thread has completed.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn sender(&self) -> ActionSender<O> {
        self.sender.clone()
    }

    /// Register the handler for `opcode`. Only allowed before [`start`](Self::start).
    pub fn register_action<F>(&self, opcode: O, handler: F) -> Result<(), ListenerError>
    where
        F: Fn(Message<O>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let state = lock(&self.sender.state);
        if *state != ListenerState::Created {
            return Err(ListenerError::Running(self.name().to_string()));
        }
        lock(&self.handlers).insert(opcode, Arc::new(handler));
        Ok(())
    }

    pub fn start(&self) -> Result<(), ListenerError> {
        let mut state = lock(&self.sender.state);
        if *state != ListenerState::Created {
            return Err(ListenerError::AlreadyStarted(self.name().to_string()));
        }
        let Some(rx) = lock(&self.rx).take() else {
            return Err(ListenerError::AlreadyStarted(self.name().to_string()));
        };
        let handlers = std::mem::take(&mut *lock(&self.handlers));

        let name = self.sender.name.clone();
        let shared_state = self.sender.state.clone();
        let processed = self.processed.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}-listener"))
            .spawn(move || drain(name, rx, handlers, shared_state, processed))
            .map_err(|err| {
                error!("could not spawn listener thread: {err}");
                ListenerError::Thread(self.name().to_string())
            })?;

        *lock(&self.thread) = Some(handle);
        *state = ListenerState::Running;
        info!(listener = %self.name(), "listener started");
        Ok(())
    }

    pub fn trigger<F>(&self, action: F) -> Result<(), ListenerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.trigger(action)
    }

    pub fn dispatch(&self, msg: Message<O>) -> Result<(), ListenerError> {
        self.sender.dispatch(msg)
    }

    /// Queue the stop sentinel. Actions already queued still run, later
    /// triggers are rejected.
    pub fn finalize(&self) {
        let mut state = lock(&self.sender.state);
        match *state {
            ListenerState::Running => {
                *state = ListenerState::Finalizing;
                if self.sender.tx.send(Job::Finalize).is_err() {
                    *state = ListenerState::Stopped;
                }
            }
            ListenerState::Created => {
                // never started: queued work is discarded with the receiver
                *state = ListenerState::Stopped;
                lock(&self.rx).take();
            }
            ListenerState::Finalizing | ListenerState::Stopped => {}
        }
    }

    /// Block until the listener thread has exited.
    pub fn join_thread(&self) {
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(listener = %self.name(), "listener thread panicked");
                *lock(&self.sender.state) = ListenerState::Stopped;
            }
        }
    }

    /// Wait up to `timeout` for the listener thread to exit and join it.
    /// Returns false if it is still running, e.g. stuck in a write to a
    /// driver that stopped reading.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_alive() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if self.is_alive() {
            return false;
        }
        self.join_thread();
        true
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.thread)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl<O: Opcode> Drop for ActionListener<O> {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl<O: Opcode> fmt::Debug for ActionListener<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionListener")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("processed", &self.processed())
            .finish()
    }
}

fn drain<O: Opcode>(
    name: Arc<str>,
    mut rx: UnboundedReceiver<Job<O>>,
    handlers: HashMap<O, ActionHandler<O>>,
    state: Arc<Mutex<ListenerState>>,
    processed: Arc<AtomicU64>,
) {
    while let Some(job) = rx.blocking_recv() {
        match job {
            Job::Finalize => break,
            Job::Run(action) => {
                if let Err(cause) = panic::catch_unwind(AssertUnwindSafe(action)) {
                    error!(listener = %name, "action panicked: {}", panic_message(&cause));
                }
            }
            Job::Dispatch(msg) => dispatch_message(&name, &handlers, msg),
        }
        processed.fetch_add(1, Ordering::SeqCst);
    }

    rx.close();
    drop(rx);
    *lock(&state) = ListenerState::Stopped;
    debug!(listener = %name, "listener stopped");
}

fn dispatch_message<O: Opcode>(
    name: &str,
    handlers: &HashMap<O, ActionHandler<O>>,
    msg: Message<O>,
) {
    let opcode = msg.opcode;
    let Some(handler) = handlers.get(&opcode).or_else(|| handlers.get(&O::UNDEFINED)) else {
        warn!(listener = %name, "no handler for {} message (id {}), discarded", opcode.token(), msg.id);
        return;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| handler(msg))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(listener = %name, "{} handler failed: {err:#}", opcode.token());
        }
        Err(cause) => {
            error!(listener = %name, "{} handler panicked: {}", opcode.token(), panic_message(&cause));
        }
    }
}

fn panic_message(cause: &Box<dyn Any + Send>) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic>".to_string()
    }
}

/// Lock ignoring poisoning; a panicking handler never holds these locks.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use driver_protocol::{HookOpcode, Status};
    use std::{
        sync::atomic::AtomicUsize,
        time::{Duration, Instant},
    };

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    fn msg(op: HookOpcode, id: i64) -> Message<HookOpcode> {
        Message::new(op, Status::Success, id, "")
    }

    #[test]
    fn runs_actions_in_enqueue_order() {
        let listener = ActionListener::<HookOpcode>::new("fifo");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..200 {
            let seen = seen.clone();
            listener.trigger(move || seen.lock().unwrap().push(i)).unwrap();
        }
        listener.start().unwrap();
        listener.finalize();
        listener.join_thread();

        assert_eq!(*seen.lock().unwrap(), (0..200).collect::<Vec<_>>());
        assert_eq!(listener.processed(), 200);
    }

    #[test]
    fn keeps_each_producer_order() {
        let listener = Arc::new(ActionListener::<HookOpcode>::new("producers"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let sender = listener.sender();
                let seen = seen.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        let seen = seen.clone();
                        sender.trigger(move || seen.lock().unwrap().push((t, i))).unwrap();
                    }
                })
            })
            .collect();
        listener.start().unwrap();
        for p in producers {
            p.join().unwrap();
        }
        listener.finalize();
        listener.join_thread();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 400);
        for t in 0..4 {
            let own: Vec<_> = seen.iter().filter(|(p, _)| *p == t).map(|(_, i)| *i).collect();
            assert_eq!(own, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn never_runs_two_actions_at_once() {
        let listener = ActionListener::<HookOpcode>::new("serial");
        let active = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let body = {
            let (active, max) = (active.clone(), max.clone());
            move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                active.fetch_sub(1, Ordering::SeqCst);
            }
        };
        {
            let body = body.clone();
            listener
                .register_action(HookOpcode::Execute, move |_| {
                    body();
                    Ok(())
                })
                .unwrap();
        }
        listener.start().unwrap();

        for i in 0..50 {
            listener.trigger(body.clone()).unwrap();
            listener.dispatch(msg(HookOpcode::Execute, i)).unwrap();
        }
        listener.finalize();
        listener.join_thread();

        assert_eq!(max.load(Ordering::SeqCst), 1);
        assert_eq!(listener.processed(), 100);
    }

    #[test]
    fn failing_handlers_do_not_stop_the_queue() {
        let listener = ActionListener::<HookOpcode>::new("faulty");
        let done = Arc::new(AtomicUsize::new(0));
        listener
            .register_action(HookOpcode::Execute, |_| bail!("collaborator unavailable"))
            .unwrap();
        listener
            .register_action(HookOpcode::Retry, |_| panic!("bug in handler"))
            .unwrap();
        listener.start().unwrap();

        listener.dispatch(msg(HookOpcode::Execute, 1)).unwrap();
        listener.dispatch(msg(HookOpcode::Retry, 2)).unwrap();
        listener.trigger(|| panic!("bug in action")).unwrap();
        {
            let done = done.clone();
            listener.trigger(move || { done.fetch_add(1, Ordering::SeqCst); }).unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));
        assert!(listener.is_alive());

        listener.finalize();
        listener.join_thread();
    }

    #[test]
    fn unknown_opcodes_fall_back_to_undefined() {
        let listener = ActionListener::<HookOpcode>::new("fallback");
        let undefined = Arc::new(Mutex::new(Vec::new()));
        {
            let undefined = undefined.clone();
            listener
                .register_action(HookOpcode::Undefined, move |m| {
                    undefined.lock().unwrap().push(m.opcode);
                    Ok(())
                })
                .unwrap();
        }
        listener.start().unwrap();
        listener.dispatch(msg(HookOpcode::Log, 3)).unwrap();
        listener.finalize();
        listener.join_thread();

        assert_eq!(*undefined.lock().unwrap(), vec![HookOpcode::Log]);
    }

    #[test]
    fn unhandled_without_undefined_handler_is_discarded() {
        let listener = ActionListener::<HookOpcode>::new("bare");
        listener.start().unwrap();
        listener.dispatch(msg(HookOpcode::Execute, 1)).unwrap();
        listener.finalize();
        listener.join_thread();
        assert_eq!(listener.processed(), 1);
        assert_eq!(listener.state(), ListenerState::Stopped);
    }

    #[test]
    fn registration_is_closed_once_running() {
        let listener = ActionListener::<HookOpcode>::new("closed");
        listener.start().unwrap();
        assert_eq!(
            listener.register_action(HookOpcode::Log, |_| Ok(())),
            Err(ListenerError::Running("closed".into()))
        );
        assert_eq!(listener.start(), Err(ListenerError::AlreadyStarted("closed".into())));
        listener.finalize();
        listener.join_thread();
    }

    #[test]
    fn nothing_runs_after_shutdown() {
        let listener = Arc::new(ActionListener::<HookOpcode>::new("shutdown"));
        let count = Arc::new(AtomicUsize::new(0));
        listener.start().unwrap();

        let racer = {
            let sender = listener.sender();
            let count = count.clone();
            thread::spawn(move || {
                let mut accepted = 0usize;
                for _ in 0..10_000 {
                    let count = count.clone();
                    if sender.trigger(move || { count.fetch_add(1, Ordering::SeqCst); }).is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            })
        };
        thread::sleep(Duration::from_millis(5));
        listener.finalize();
        listener.join_thread();
        let accepted = racer.join().unwrap();

        assert!(!listener.is_alive());
        assert_eq!(listener.state(), ListenerState::Stopped);
        let ran = count.load(Ordering::SeqCst);
        assert_eq!(ran, accepted);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), ran);
        assert!(listener.trigger(|| ()).is_err());
    }
}
