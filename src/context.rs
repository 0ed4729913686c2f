// src/context.rs

use std::sync::Arc;

use crate::{
    config::DriverdConfig,
    hook::{ExecutionLog, MemoryExecutionLog},
    vmm::{LoggingVmStateSink, VmStateSink},
};

/// Everything a manager needs from the rest of the daemon, handed over at
/// construction.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<DriverdConfig>,
    pub execution_log: Arc<dyn ExecutionLog>,
    pub vm_states: Arc<dyn VmStateSink>,
}

impl AppContext {
    /// In-memory execution log and a logging state sink.
    pub fn new(config: DriverdConfig) -> Self {
        Self {
            config: Arc::new(config),
            execution_log: Arc::new(MemoryExecutionLog::default()),
            vm_states: Arc::new(LoggingVmStateSink),
        }
    }

    pub fn with_execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.execution_log = log;
        self
    }

    pub fn with_vm_states(mut self, sink: Arc<dyn VmStateSink>) -> Self {
        self.vm_states = sink;
        self
    }
}
