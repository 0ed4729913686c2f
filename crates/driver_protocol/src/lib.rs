pub mod message;
pub mod opcode;
pub mod payload;
pub mod runtime;

pub use message::{DecodeError, Message, Severity, Status};
pub use opcode::{HookOpcode, Opcode, VmmOpcode};
pub use payload::{decode_payload, encode_payload, PayloadError};
