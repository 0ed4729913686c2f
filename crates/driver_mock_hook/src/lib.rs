// A hook driver that pretends every hook ran successfully.
use anyhow::{Result, anyhow};
use chrono::Utc;
use driver_protocol::{
    HookOpcode, Message, Severity, Status,
    payload::{decode_payload, encode_payload, xml_element, xml_escape, xml_unescape},
    runtime::DriverHandler,
};

#[derive(Default)]
pub struct MockHookDriver {
    executions: i64,
}

impl MockHookDriver {
    fn execution_record(&mut self, hook_id: i64, arguments: &str) -> String {
        self.executions += 1;
        format!(
            "<HOOK_EXECUTION_RECORD><HOOK_ID>{hook_id}</HOOK_ID><EXECUTION_ID>{}</EXECUTION_ID>\
             <TIMESTAMP>{}</TIMESTAMP><ARGUMENTS>{}</ARGUMENTS>\
             <EXECUTION_RESULT><COMMAND>mock</COMMAND><STDOUT/><STDERR/><CODE>0</CODE></EXECUTION_RESULT>\
             </HOOK_EXECUTION_RECORD>",
            self.executions,
            Utc::now().timestamp(),
            xml_escape(arguments),
        )
    }
}

impl DriverHandler<HookOpcode> for MockHookDriver {
    fn handle(&mut self, request: Message<HookOpcode>) -> Result<Vec<Message<HookOpcode>>> {
        match request.opcode {
            HookOpcode::Execute | HookOpcode::Retry => {
                let xml = decode_payload(&request.payload)?;
                let hook_id = xml_element(&xml, "HOOK_ID")
                    .and_then(|v| v.parse::<i64>().ok())
                    .ok_or_else(|| anyhow!("HOOK_ID missing from hook message"))?;
                let arguments = xml_unescape(xml_element(&xml, "ARGUMENTS").unwrap_or_default());

                let record = self.execution_record(hook_id, &arguments);
                let result = encode_payload(&format!("0 {}", encode_payload(&record)));
                Ok(vec![
                    Message::new(
                        HookOpcode::Log,
                        Status::Log(Severity::Info),
                        hook_id,
                        format!("mock execution of hook {hook_id}"),
                    ),
                    Message::new(request.opcode, Status::Success, hook_id, result),
                ])
            }
            other => Ok(vec![Message::new(
                HookOpcode::Log,
                Status::Log(Severity::Warning),
                request.id,
                format!("unsupported request {}", other),
            )]),
        }
    }
}
