//! One protocol unit per line:
//!
//! ```text
//! <OPCODE> <STATUS> <ID> <PAYLOAD>\n
//! ```
//!
//! The payload is the remainder of the line after exactly one separator, so it
//! may contain spaces and is never escaped. Structured payloads are base64
//! encoded by the caller (see [`crate::payload`]).

use std::fmt;

use thiserror::Error;

use crate::opcode::Opcode;

/// Single character severities used by LOG messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
}

impl Severity {
    pub fn as_char(self) -> char {
        match self {
            Severity::Error => 'E',
            Severity::Warning => 'W',
            Severity::Info => 'I',
            Severity::Debug => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'E' => Some(Severity::Error),
            'W' => Some(Severity::Warning),
            'I' => Some(Severity::Info),
            'D' => Some(Severity::Debug),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Outbound requests carry no status; written as `-`.
    None,
    Success,
    Failure,
    Info,
    Log(Severity),
    /// Any other token, ASCII uppercase and never a single severity letter.
    /// Build it with [`Status::other`] so it survives an encode/decode round
    /// trip.
    Other(String),
}

impl Status {
    /// Normalise an arbitrary status token to what decoding it would yield.
    /// Whitespace, which would split the token on the wire, becomes `_`.
    pub fn other(token: &str) -> Self {
        let token: String = token
            .chars()
            .map(|c| if c.is_whitespace() { '_' } else { c })
            .collect();
        if token.is_empty() {
            return Status::None;
        }
        Status::from_token(&token)
    }

    pub fn from_token(token: &str) -> Self {
        if token == "-" {
            return Status::None;
        }
        if token.eq_ignore_ascii_case("SUCCESS") {
            return Status::Success;
        }
        if token.eq_ignore_ascii_case("FAILURE") {
            return Status::Failure;
        }
        if token.eq_ignore_ascii_case("INFO") {
            return Status::Info;
        }
        let mut chars = token.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if let Some(sev) = Severity::from_char(c) {
                return Status::Log(sev);
            }
        }
        Status::Other(token.to_ascii_uppercase())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failure)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::None => f.write_str("-"),
            Status::Success => f.write_str("SUCCESS"),
            Status::Failure => f.write_str("FAILURE"),
            Status::Info => f.write_str("INFO"),
            Status::Log(sev) => write!(f, "{}", sev.as_char()),
            Status::Other(token) => f.write_str(token),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated message, expected <OPCODE> <STATUS> <ID>: `{0}`")]
    Truncated(String),
    #[error("invalid message id `{0}`")]
    InvalidId(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<O: Opcode> {
    pub opcode: O,
    pub status: Status,
    /// Object the message refers to, `-1` when not applicable.
    pub id: i64,
    pub payload: String,
}

impl<O: Opcode> Message<O> {
    pub fn new(opcode: O, status: Status, id: i64, payload: impl Into<String>) -> Self {
        Self { opcode, status, id, payload: payload.into() }
    }

    /// Outbound request without a status.
    pub fn request(opcode: O, id: i64, payload: impl Into<String>) -> Self {
        Self::new(opcode, Status::None, id, payload)
    }

    /// Newline terminated wire form.
    pub fn encode(&self) -> String {
        format!("{} {} {} {}\n", self.opcode.token(), self.status, self.id, self.payload)
    }

    /// Decode one line of driver output.
    ///
    /// Blank lines yield `Ok(None)`. The trailing newline (and a CR before it)
    /// is stripped before parsing.
    pub fn decode(line: &str) -> Result<Option<Self>, DecodeError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.trim().is_empty() {
            return Ok(None);
        }

        let (opcode, rest) = next_token(line);
        let (status, rest) = next_token(rest);
        let (id, rest) = next_token(rest);

        let (Some(opcode), Some(status), Some(id)) = (opcode, status, id) else {
            return Err(DecodeError::Truncated(line.to_string()));
        };

        let id = id
            .parse::<i64>()
            .map_err(|_| DecodeError::InvalidId(id.to_string()))?;

        // exactly one separator between the id and the payload
        let payload = match rest.chars().next() {
            Some(sep) if sep.is_whitespace() => &rest[sep.len_utf8()..],
            _ => rest,
        };

        Ok(Some(Self {
            opcode: O::from_token(opcode),
            status: Status::from_token(status),
            id,
            payload: payload.to_string(),
        }))
    }
}

/// Split off the next whitespace delimited token. The remainder starts at the
/// separator that ended the token.
fn next_token(s: &str) -> (Option<&str>, &str) {
    let s = s.trim_start();
    if s.is_empty() {
        return (None, s);
    }
    match s.find(char::is_whitespace) {
        Some(end) => (Some(&s[..end]), &s[end..]),
        None => (Some(s), ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{HookOpcode, VmmOpcode};

    #[test]
    fn roundtrip_keeps_payload_spaces() {
        let msg = Message::new(HookOpcode::Execute, Status::Success, 7, "0  two  spaces trailing ");
        let line = msg.encode();
        assert!(line.ends_with('\n'));
        let back = Message::<HookOpcode>::decode(&line).unwrap().unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn roundtrip_leading_space_payload() {
        let msg = Message::new(VmmOpcode::Log, Status::Log(Severity::Warning), 3, " indented");
        let back = Message::<VmmOpcode>::decode(&msg.encode()).unwrap().unwrap();
        assert_eq!(back.payload, " indented");
        assert_eq!(back.status, Status::Log(Severity::Warning));
    }

    #[test]
    fn roundtrip_request_without_status() {
        let msg = Message::request(HookOpcode::Execute, -1, "PEhPT0tfTUVTU0FHRS8+");
        let line = msg.encode();
        assert_eq!(line, "EXECUTE - -1 PEhPT0tfTUVTU0FHRS8+\n");
        assert_eq!(Message::<HookOpcode>::decode(&line).unwrap().unwrap(), msg);
    }

    #[test]
    fn decode_normalises_case() {
        let msg = Message::<VmmOpcode>::decode("attachdisk success 12 ok\n").unwrap().unwrap();
        assert_eq!(msg.opcode, VmmOpcode::AttachDisk);
        assert_eq!(msg.status, Status::Success);
        assert_eq!(msg.id, 12);
        assert_eq!(msg.payload, "ok");
    }

    #[test]
    fn unknown_opcode_is_undefined_but_fields_parse() {
        let msg = Message::<HookOpcode>::decode("FROBNICATE FAILURE 42 some text").unwrap().unwrap();
        assert_eq!(msg.opcode, HookOpcode::Undefined);
        assert_eq!(msg.status, Status::Failure);
        assert_eq!(msg.id, 42);
        assert_eq!(msg.payload, "some text");
    }

    #[test]
    fn missing_payload_is_empty() {
        let msg = Message::<HookOpcode>::decode("LOG I 1").unwrap().unwrap();
        assert_eq!(msg.payload, "");
        assert_eq!(msg.status, Status::Log(Severity::Info));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(Message::<HookOpcode>::decode("\n").unwrap(), None);
        assert_eq!(Message::<HookOpcode>::decode("   \r\n").unwrap(), None);
    }

    #[test]
    fn truncated_lines_are_rejected() {
        assert!(matches!(
            Message::<HookOpcode>::decode("EXECUTE SUCCESS\n"),
            Err(DecodeError::Truncated(_))
        ));
        // the next well formed line still decodes
        let next = Message::<HookOpcode>::decode("EXECUTE SUCCESS 1 x\n").unwrap().unwrap();
        assert_eq!(next.id, 1);
    }

    #[test]
    fn non_numeric_id_is_rejected() {
        assert_eq!(
            Message::<HookOpcode>::decode("EXECUTE SUCCESS seven x"),
            Err(DecodeError::InvalidId("seven".into()))
        );
    }

    #[test]
    fn other_status_round_trips() {
        for (token, expected) in [
            ("pending", Status::Other("PENDING".into())),
            ("in progress", Status::Other("IN_PROGRESS".into())),
            ("e", Status::Log(Severity::Error)),
            ("success", Status::Success),
            ("", Status::None),
        ] {
            let status = Status::other(token);
            assert_eq!(status, expected, "token {token:?}");

            let msg = Message::new(HookOpcode::Execute, status, 1, "x");
            assert_eq!(Message::<HookOpcode>::decode(&msg.encode()).unwrap().unwrap(), msg);
        }
    }

    #[test]
    fn unknown_status_is_kept_uppercased() {
        let msg = Message::<VmmOpcode>::decode("DEPLOY pending 5 x").unwrap().unwrap();
        assert_eq!(msg.status, Status::Other("PENDING".into()));
        assert_eq!(msg.status.to_string(), "PENDING");
    }
}
