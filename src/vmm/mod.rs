// src/vmm/mod.rs

pub mod state;
pub mod template;

use std::sync::Arc;

use anyhow::Result;
use driver_protocol::{Message, Status, VmmOpcode, encode_payload};
use strum::IntoEnumIterator;
use tracing::{debug, error, warn};

use crate::{
    config::DriverConfig,
    context::AppContext,
    driver::StopOutcome,
    logger,
    manager::DriverManager,
};

pub use state::{LoggingVmStateSink, MemoryVmStateSink, VmEvent, VmStateSink};
pub use template::VmTemplate;

pub const FACILITY: &str = "VMM";

/// Drives VM actions through hypervisor drivers and reports their outcome
/// to a [`VmStateSink`].
pub struct VirtualMachineManager {
    manager: DriverManager<VmmOpcode>,
    drivers: Vec<DriverConfig>,
}

impl VirtualMachineManager {
    pub fn new(ctx: &AppContext) -> Result<Self> {
        let config = &ctx.config.vm_manager;
        let manager = DriverManager::new("vm-manager", &ctx.config.drivers_dir, config.timeout());

        for opcode in VmmOpcode::iter().filter(|op| op.is_action()) {
            let sink = ctx.vm_states.clone();
            manager.register_action(opcode, move |msg| report_action(sink.as_ref(), msg))?;
        }
        manager.register_action(VmmOpcode::Log, |msg| {
            match msg.status {
                Status::Log(severity) => {
                    logger::log(FACILITY, severity, &format!("VM {}: {}", msg.id, msg.payload))
                }
                _ => debug!(facility = FACILITY, vm_id = msg.id, "{}", msg.payload),
            }
            Ok(())
        })?;
        manager.register_action(VmmOpcode::Undefined, |msg| {
            warn!(facility = FACILITY, vm_id = msg.id, "undefined message from driver: {}", msg.payload);
            Ok(())
        })?;

        Ok(Self {
            manager,
            drivers: config.drivers.clone(),
        })
    }

    pub fn manager(&self) -> &DriverManager<VmmOpcode> {
        &self.manager
    }

    pub fn start(&self) -> Result<usize> {
        self.manager.start(&self.drivers)
    }

    /// Send `<opcode> - <vm_id> <payload>` to `driver`.
    pub fn trigger_action(&self, opcode: VmmOpcode, vm_id: i64, driver: &str, payload: impl Into<String>) {
        self.manager.trigger_send(driver, Message::request(opcode, vm_id, payload));
    }

    /// Deploy `template` on `driver`, rendered for the driver's kind.
    pub fn trigger_deploy(&self, driver: &str, template: VmTemplate) {
        let registry = self.manager.registry().clone();
        let driver = driver.to_string();

        self.manager.trigger(move || {
            let Some(handle) = registry.get(&driver) else {
                warn!(facility = FACILITY, vm_id = template.id, %driver, "driver not loaded, deploy dropped");
                return;
            };
            let payload = encode_payload(&template.render(handle.kind()));
            let msg = Message::request(VmmOpcode::Deploy, template.id, payload);
            if let Err(err) = handle.send(&msg) {
                error!(facility = FACILITY, vm_id = template.id, %driver, "deploy not sent: {err}");
            }
        });
    }

    /// Ask `driver` to abandon whatever it is doing for `vm_id`.
    pub fn trigger_driver_cancel(&self, vm_id: i64, driver: &str) {
        self.trigger_action(VmmOpcode::DriverCancel, vm_id, driver, "");
    }

    pub fn finalize(&self) -> Vec<(String, StopOutcome)> {
        self.manager.finalize()
    }
}

fn report_action(sink: &dyn VmStateSink, msg: Message<VmmOpcode>) -> Result<()> {
    match msg.status {
        Status::Success => sink.action_success(msg.id, msg.opcode, &msg.payload),
        Status::Failure => sink.action_failure(msg.id, msg.opcode, &msg.payload),
        _ => {
            debug!(facility = FACILITY, vm_id = msg.id, "{} {}: {}", msg.opcode, msg.status, msg.payload);
            Ok(())
        }
    }
}
