//! Blocking runtime for drivers written in Rust.
//!
//! Reads requests from stdin, hands each one to a [`DriverHandler`] and writes
//! the replies to stdout. The loop ends when the manager closes stdin.
//!
//! ```ignore
//! fn main() -> anyhow::Result<()> {
//!     driver_protocol::runtime::run_stdio(&mut MyDriver::default())
//! }
//! ```

use std::io::{self, BufRead, Write};

use anyhow::Result;
use tracing::{debug, warn};

use crate::message::{Message, Severity, Status};
use crate::opcode::Opcode;

pub trait DriverHandler<O: Opcode> {
    /// Handle one request and return the messages to send back.
    ///
    /// An `Err` is reported to the manager as `<OPCODE> FAILURE <ID> <error>`.
    fn handle(&mut self, request: Message<O>) -> Result<Vec<Message<O>>>;
}

pub fn run<O, H, R, W>(handler: &mut H, input: R, mut output: W) -> Result<()>
where
    O: Opcode,
    H: DriverHandler<O>,
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;
        let request = match Message::<O>::decode(&line) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(err) => {
                warn!("malformed request: {err}");
                let log = Message::new(O::UNDEFINED, Status::Log(Severity::Error), -1, err.to_string());
                write_message(&mut output, &log)?;
                continue;
            }
        };

        let (opcode, id) = (request.opcode, request.id);
        let replies = match handler.handle(request) {
            Ok(replies) => replies,
            Err(err) => {
                debug!(id, "{} failed: {err:#}", opcode.token());
                vec![Message::new(opcode, Status::Failure, id, one_line(&err.to_string()))]
            }
        };
        for reply in &replies {
            write_message(&mut output, reply)?;
        }
    }
    debug!("input closed, driver runtime done");
    Ok(())
}

/// Run against the process' own stdin/stdout.
pub fn run_stdio<O: Opcode, H: DriverHandler<O>>(handler: &mut H) -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run(handler, stdin.lock(), stdout.lock())
}

fn write_message<O: Opcode, W: Write>(output: &mut W, msg: &Message<O>) -> Result<()> {
    output.write_all(msg.encode().as_bytes())?;
    output.flush()?;
    Ok(())
}

fn one_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}
