// src/vmm/state.rs

use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use chrono::{DateTime, Utc};
use driver_protocol::VmmOpcode;
use tracing::{error, info};

/// Receives the outcome of every VM action reported by a driver.
pub trait VmStateSink: Send + Sync {
    fn action_success(&self, vm_id: i64, opcode: VmmOpcode, info: &str) -> Result<()>;
    fn action_failure(&self, vm_id: i64, opcode: VmmOpcode, reason: &str) -> Result<()>;
}

/// Writes outcomes to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingVmStateSink;

impl VmStateSink for LoggingVmStateSink {
    fn action_success(&self, vm_id: i64, opcode: VmmOpcode, info: &str) -> Result<()> {
        info!(vm_id, %opcode, "action succeeded: {info}");
        Ok(())
    }

    fn action_failure(&self, vm_id: i64, opcode: VmmOpcode, reason: &str) -> Result<()> {
        error!(vm_id, %opcode, "action failed: {reason}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEvent {
    pub vm_id: i64,
    pub opcode: VmmOpcode,
    pub success: bool,
    pub info: String,
    pub at: DateTime<Utc>,
}

/// Keeps every outcome in arrival order.
#[derive(Debug, Default)]
pub struct MemoryVmStateSink {
    events: Mutex<Vec<VmEvent>>,
}

impl MemoryVmStateSink {
    pub fn events(&self) -> Vec<VmEvent> {
        self.lock().clone()
    }

    pub fn events_for(&self, vm_id: i64) -> Vec<VmEvent> {
        self.lock().iter().filter(|e| e.vm_id == vm_id).cloned().collect()
    }

    fn record(&self, vm_id: i64, opcode: VmmOpcode, success: bool, info: &str) {
        self.lock().push(VmEvent {
            vm_id,
            opcode,
            success,
            info: info.to_string(),
            at: Utc::now(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<VmEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl VmStateSink for MemoryVmStateSink {
    fn action_success(&self, vm_id: i64, opcode: VmmOpcode, info: &str) -> Result<()> {
        self.record(vm_id, opcode, true, info);
        Ok(())
    }

    fn action_failure(&self, vm_id: i64, opcode: VmmOpcode, reason: &str) -> Result<()> {
        self.record(vm_id, opcode, false, reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_arrival_order() {
        let sink = MemoryVmStateSink::default();
        sink.action_success(1, VmmOpcode::Deploy, "one-1").unwrap();
        sink.action_failure(2, VmmOpcode::Shutdown, "timeout").unwrap();
        sink.action_success(1, VmmOpcode::Shutdown, "").unwrap();

        let ops: Vec<_> = sink.events().iter().map(|e| (e.vm_id, e.opcode, e.success)).collect();
        assert_eq!(
            ops,
            vec![
                (1, VmmOpcode::Deploy, true),
                (2, VmmOpcode::Shutdown, false),
                (1, VmmOpcode::Shutdown, true),
            ]
        );
        assert_eq!(sink.events_for(2)[0].info, "timeout");
    }
}
