//! # Command and Reply Values
//!
//! Purpose: Typed command arguments and decoded replies.
//!
//! ## Design Principles
//! 1. **Closed Argument Set**: `Arg` lists exactly what the encoder supports.
//! 2. **Binary-Safe**: Bulk payloads stay raw bytes until a caller asks for text.

use std::fmt;

use crate::error::{KvError, KvResult};

/// RESP response value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// +OK or +PONG style responses.
    Simple(String),
    /// -ERR ... responses.
    Error(String),
    /// :123 responses.
    Integer(i64),
    /// $... bulk strings, with None for null.
    Bulk(Option<Vec<u8>>),
    /// *... arrays.
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::Simple(_) => "simple",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::Bulk(None) => "null",
            RespValue::Bulk(Some(_)) => "bulk",
            RespValue::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Bulk(None))
    }

    /// Converts an error frame into `KvError::Command`, passing anything else
    /// through.
    pub fn into_result(self) -> KvResult<RespValue> {
        match self {
            RespValue::Error(message) => Err(KvError::Command(message)),
            other => Ok(other),
        }
    }

    /// Borrows the payload of a simple or bulk string as UTF-8.
    pub fn as_str(&self) -> KvResult<&str> {
        match self {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => std::str::from_utf8(data)
                .map_err(|_| KvError::unexpected("utf-8 string", "binary bulk")),
            RespValue::Error(message) => Err(KvError::Command(message.clone())),
            other => Err(KvError::unexpected("string", other.type_name())),
        }
    }

    pub fn into_string(self) -> KvResult<String> {
        match self {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => String::from_utf8(data)
                .map_err(|_| KvError::unexpected("utf-8 string", "binary bulk")),
            RespValue::Integer(value) => Ok(value.to_string()),
            RespValue::Error(message) => Err(KvError::Command(message)),
            other => Err(KvError::unexpected("string", other.type_name())),
        }
    }

    /// Reads an integer reply. Bulk strings holding a decimal are accepted as
    /// well, matching how servers answer some numeric commands.
    pub fn as_int(&self) -> KvResult<i64> {
        match self {
            RespValue::Integer(value) => Ok(*value),
            RespValue::Bulk(Some(_)) | RespValue::Simple(_) => {
                let text = self.as_str()?;
                text.parse()
                    .map_err(|_| KvError::unexpected("integer", format!("string {text:?}")))
            }
            RespValue::Error(message) => Err(KvError::Command(message.clone())),
            other => Err(KvError::unexpected("integer", other.type_name())),
        }
    }

    pub fn into_array(self) -> KvResult<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Ok(items),
            RespValue::Error(message) => Err(KvError::Command(message)),
            other => Err(KvError::unexpected("array", other.type_name())),
        }
    }

    /// Flattens an array of strings, e.g. the key list of a SCAN page.
    pub fn into_string_list(self) -> KvResult<Vec<String>> {
        self.into_array()?
            .into_iter()
            .map(RespValue::into_string)
            .collect()
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::Simple(text) => write!(f, "{}", text),
            RespValue::Error(message) => write!(f, "(error) {}", message),
            RespValue::Integer(value) => write!(f, "(integer) {}", value),
            RespValue::Bulk(None) => write!(f, "(nil)"),
            RespValue::Bulk(Some(data)) => write!(f, "{:?}", String::from_utf8_lossy(data)),
            RespValue::Array(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// One command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Str(String),
    Int(i64),
    Bytes(Vec<u8>),
}

impl Arg {
    /// Wire bytes of the argument, borrowed where possible.
    pub fn to_bytes(&self) -> std::borrow::Cow<'_, [u8]> {
        match self {
            Arg::Str(text) => std::borrow::Cow::Borrowed(text.as_bytes()),
            Arg::Int(value) => std::borrow::Cow::Owned(value.to_string().into_bytes()),
            Arg::Bytes(data) => std::borrow::Cow::Borrowed(data),
        }
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Arg::Str(value.clone())
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Int(value as i64)
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(value) => Arg::Int(value),
            Err(_) => Arg::Str(value.to_string()),
        }
    }
}

impl From<usize> for Arg {
    fn from(value: usize) -> Self {
        Arg::from(value as u64)
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg::Bytes(value.to_vec())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(value)
    }
}

/// A single command to be run in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePart {
    pub command: String,
    pub args: Vec<Arg>,
}

impl PipePart {
    pub fn new<I, A>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        PipePart {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Short form of `PipePart::new`.
///
/// ```
/// use kvb_common::pp;
/// let parts = vec![pp("SET", ["foo", "bar"]), pp("GET", ["foo"])];
/// assert_eq!(parts[1].command, "GET");
/// ```
pub fn pp<I, A>(command: &str, args: I) -> PipePart
where
    I: IntoIterator<Item = A>,
    A: Into<Arg>,
{
    PipePart::new(command, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_becomes_command_error() {
        let err = RespValue::Error("ERR nope".into()).into_result().unwrap_err();
        assert!(matches!(err, KvError::Command(msg) if msg == "ERR nope"));
    }

    #[test]
    fn string_list_from_bulk_array() {
        let value = RespValue::Array(vec![
            RespValue::Bulk(Some(b"a".to_vec())),
            RespValue::Simple("b".into()),
        ]);
        assert_eq!(value.into_string_list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn int_from_bulk_decimal() {
        assert_eq!(RespValue::Bulk(Some(b"-12".to_vec())).as_int().unwrap(), -12);
        assert!(RespValue::Bulk(None).as_int().is_err());
    }

    #[test]
    fn args_keep_their_wire_form() {
        assert_eq!(Arg::from(42i64).to_bytes().as_ref(), b"42");
        assert_eq!(Arg::from("x").to_bytes().as_ref(), b"x");
        assert_eq!(Arg::from(&b"\x00\x01"[..]).to_bytes().as_ref(), b"\x00\x01");
        assert_eq!(Arg::from(u64::MAX), Arg::Str(u64::MAX.to_string()));
    }

    #[test]
    fn pipe_part_collects_mixed_args() {
        let part = PipePart::new("EXPIRE", [Arg::from("k"), Arg::from(10)]);
        assert_eq!(part.args, vec![Arg::Str("k".into()), Arg::Int(10)]);
    }
}
