// src/hook/mod.rs

pub mod log;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use driver_protocol::{
    HookOpcode, Message, Status,
    payload::{decode_payload, encode_payload, xml_escape},
};
use tracing::{debug, error, warn};

use crate::{
    config::DriverConfig,
    context::AppContext,
    driver::StopOutcome,
    logger,
    manager::{DriverManager, send_to_driver},
};

pub use log::{ExecutionLog, ExecutionRecord, MemoryExecutionLog};

/// Name of the driver that runs hooks.
pub const HOOK_DRIVER: &str = "hook_exe";
/// Facility used for `LOG` messages coming from hook drivers.
pub const FACILITY: &str = "HKM";
/// Return code recorded for a failure the driver reported without one.
pub const FAILED_RC: i32 = -1;

/// Build the base64 `HOOK_MESSAGE` payload for an `EXECUTE` or `RETRY` request.
pub fn format_message(arguments: &str, remote_host: Option<&str>, hook_id: i64) -> String {
    let mut xml = format!(
        "<HOOK_MESSAGE><ARGUMENTS>{}</ARGUMENTS><HOOK_ID>{hook_id}</HOOK_ID>",
        xml_escape(arguments)
    );
    if let Some(host) = remote_host {
        xml.push_str(&format!("<REMOTE_HOST>{}</REMOTE_HOST>", xml_escape(host)));
    }
    xml.push_str("</HOOK_MESSAGE>");
    encode_payload(&xml)
}

/// Sends hook executions to the hook driver and records what it reports back.
pub struct HookManager {
    manager: DriverManager<HookOpcode>,
    drivers: Vec<DriverConfig>,
    driver: String,
    log: Arc<dyn ExecutionLog>,
}

impl HookManager {
    pub fn new(ctx: &AppContext) -> Result<Self> {
        let config = &ctx.config.hook_manager;
        let manager = DriverManager::new("hook-manager", &ctx.config.drivers_dir, config.timeout());

        for opcode in [HookOpcode::Execute, HookOpcode::Retry] {
            let log = ctx.execution_log.clone();
            manager.register_action(opcode, move |msg| record_execution(log.as_ref(), msg))?;
        }
        manager.register_action(HookOpcode::Log, |msg| {
            log_message(&msg);
            Ok(())
        })?;
        manager.register_action(HookOpcode::Undefined, |msg| {
            warn!(facility = FACILITY, id = msg.id, "undefined message from hook driver: {}", msg.payload);
            Ok(())
        })?;

        Ok(Self {
            manager,
            drivers: config.drivers.clone(),
            driver: HOOK_DRIVER.to_string(),
            log: ctx.execution_log.clone(),
        })
    }

    /// Route hook requests to a driver other than [`HOOK_DRIVER`].
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn manager(&self) -> &DriverManager<HookOpcode> {
        &self.manager
    }

    pub fn start(&self) -> Result<usize> {
        self.manager.start(&self.drivers)
    }

    /// Ask the hook driver to run an event. `payload` is the output of
    /// [`format_message`].
    pub fn trigger_send_event(&self, payload: impl Into<String>) {
        self.manager
            .trigger_send(&self.driver, Message::request(HookOpcode::Execute, -1, payload));
    }

    /// Re-run a recorded execution of `hook_id` with its original arguments.
    pub fn trigger_retry(&self, hook_id: i64, execution_id: i64) {
        let log = self.log.clone();
        let registry = self.manager.registry().clone();
        let driver = self.driver.clone();
        let manager = self.manager.name().to_string();

        self.manager.trigger(move || match log.retry(hook_id, execution_id) {
            Ok(payload) => {
                let msg = Message::request(HookOpcode::Retry, hook_id, payload);
                send_to_driver(&manager, &registry, &driver, &msg);
            }
            Err(err) => {
                error!(facility = FACILITY, hook_id, execution_id, "cannot retry hook: {err:#}");
            }
        });
    }

    pub fn finalize(&self) -> Vec<(String, StopOutcome)> {
        self.manager.finalize()
    }
}

fn record_execution(log: &dyn ExecutionLog, msg: Message<HookOpcode>) -> Result<()> {
    match msg.status {
        Status::Success => {
            let (rc, record) = parse_result(&msg)?;
            log.add(msg.id, rc, &record)
        }
        Status::Failure => match parse_result(&msg) {
            Ok((rc, record)) => log.add(msg.id, rc, &record),
            // drivers that fail before running the hook report plain text
            Err(err) => {
                debug!(facility = FACILITY, id = msg.id, "failure without execution record: {err:#}");
                log.add(msg.id, FAILED_RC, &failure_record(msg.id, &msg.payload))
            }
        },
        _ => {
            debug!(facility = FACILITY, id = msg.id, "{} {} ignored", msg.opcode, msg.status);
            Ok(())
        }
    }
}

/// Decode `base64("<rc> <base64 record>")`.
fn parse_result(msg: &Message<HookOpcode>) -> Result<(i32, String)> {
    let info = decode_payload(&msg.payload)
        .with_context(|| format!("hook {} sent an undecodable result", msg.id))?;
    let (rc, record) = info
        .split_once(' ')
        .ok_or_else(|| anyhow!("hook {} result has no execution record", msg.id))?;
    let rc: i32 = rc
        .trim()
        .parse()
        .with_context(|| format!("hook {} result has a bad return code {rc:?}", msg.id))?;
    let record = decode_payload(record)
        .with_context(|| format!("hook {} execution record is not base64", msg.id))?;
    Ok((rc, record))
}

fn failure_record(hook_id: i64, reason: &str) -> String {
    format!(
        "<HOOK_EXECUTION_RECORD><HOOK_ID>{hook_id}</HOOK_ID><EXECUTION_RESULT>\
         <STDERR>{}</STDERR><CODE>{FAILED_RC}</CODE></EXECUTION_RESULT></HOOK_EXECUTION_RECORD>",
        xml_escape(reason)
    )
}

fn log_message(msg: &Message<HookOpcode>) {
    match msg.status {
        Status::Log(severity) => logger::log(FACILITY, severity, &msg.payload),
        _ => debug!(facility = FACILITY, id = msg.id, "{}", msg.payload),
    }
}
