// src/hook/log.rs

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use driver_protocol::payload::{xml_element, xml_unescape};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hook::format_message;

/// Where hook execution results end up.
///
/// Both calls run on the hook manager's listener thread and must return
/// quickly (a local store, not another round trip to a driver).
pub trait ExecutionLog: Send + Sync {
    /// Record one execution of `hook_id`. `record_xml` is the
    /// `<HOOK_EXECUTION_RECORD>` document reported by the driver.
    fn add(&self, hook_id: i64, rc: i32, record_xml: &str) -> Result<()>;

    /// Build the payload that re-runs execution `execution_id` of `hook_id`.
    fn retry(&self, hook_id: i64, execution_id: i64) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub hook_id: i64,
    pub execution_id: i64,
    pub rc: i32,
    pub timestamp: DateTime<Utc>,
    pub arguments: Option<String>,
    pub remote_host: Option<String>,
    pub xml: String,
}

/// In-memory execution log, keeping the newest `retention` records per hook.
#[derive(Debug)]
pub struct MemoryExecutionLog {
    records: DashMap<i64, Vec<ExecutionRecord>>,
    retention: usize,
}

impl Default for MemoryExecutionLog {
    fn default() -> Self {
        Self::new(20)
    }
}

impl MemoryExecutionLog {
    pub fn new(retention: usize) -> Self {
        Self {
            records: DashMap::new(),
            retention: retention.max(1),
        }
    }

    pub fn records(&self, hook_id: i64) -> Vec<ExecutionRecord> {
        self.records
            .get(&hook_id)
            .map(|r| r.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(|kv| kv.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExecutionLog for MemoryExecutionLog {
    fn add(&self, hook_id: i64, rc: i32, record_xml: &str) -> Result<()> {
        let mut entry = self.records.entry(hook_id).or_default();
        let execution_id = entry.last().map(|r| r.execution_id + 1).unwrap_or(0);

        entry.push(ExecutionRecord {
            hook_id,
            execution_id,
            rc,
            timestamp: Utc::now(),
            arguments: xml_element(record_xml, "ARGUMENTS").map(xml_unescape),
            remote_host: xml_element(record_xml, "REMOTE_HOST").map(xml_unescape),
            xml: record_xml.to_string(),
        });
        if entry.len() > self.retention {
            let excess = entry.len() - self.retention;
            entry.drain(..excess);
        }
        debug!(hook_id, execution_id, rc, "hook execution recorded");
        Ok(())
    }

    fn retry(&self, hook_id: i64, execution_id: i64) -> Result<String> {
        let records = self
            .records
            .get(&hook_id)
            .ok_or_else(|| anyhow!("hook {hook_id} has no executions"))?;
        let record = records
            .iter()
            .find(|r| r.execution_id == execution_id)
            .ok_or_else(|| anyhow!("hook {hook_id} has no execution {execution_id}"))?;

        Ok(format_message(
            record.arguments.as_deref().unwrap_or_default(),
            record.remote_host.as_deref(),
            hook_id,
        ))
    }
}
