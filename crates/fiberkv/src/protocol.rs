// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a blocked read wakes up to check for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024; // 512 MiB
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
pub const MAX_LINE_LEN: usize = 64 * 1024;
/// Deepest array nesting accepted in a reply.
pub const MAX_DEPTH: usize = 64;

/// A single RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Array(Vec<Value>),
    Nil,
}

impl Value {
    pub fn ok() -> Self {
        Value::Simple("OK".to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Simple(_) => "simple string",
            Value::Error(_) => "error",
            Value::Integer(_) => "integer",
            Value::Bulk(_) => "bulk string",
            Value::Array(_) => "array",
            Value::Nil => "nil",
        }
    }
}

/// Writes a command as an array of bulk strings.
pub fn write_command<W: Write>(writer: &mut W, args: &[&[u8]]) -> Result<()> {
    if args.is_empty() {
        return Err(Error::invalid_argument("command must have a name"));
    }
    write!(writer, "*{}\r\n", args.len())?;
    for arg in args {
        write!(writer, "${}\r\n", arg.len())?;
        writer.write_all(arg)?;
        writer.write_all(b"\r\n")?;
    }
    Ok(())
}

/// Writes a reply. Used by the loopback server.
pub fn write_value<W: Write>(writer: &mut W, value: &Value) -> Result<()> {
    match value {
        Value::Simple(s) => write!(writer, "+{s}\r\n")?,
        Value::Error(s) => write!(writer, "-{s}\r\n")?,
        Value::Integer(i) => write!(writer, ":{i}\r\n")?,
        Value::Bulk(bytes) => {
            write!(writer, "${}\r\n", bytes.len())?;
            writer.write_all(bytes)?;
            writer.write_all(b"\r\n")?;
        }
        Value::Array(items) => {
            write!(writer, "*{}\r\n", items.len())?;
            for item in items {
                write_value(writer, item)?;
            }
        }
        Value::Nil => writer.write_all(b"$-1\r\n")?,
    }
    Ok(())
}

/// Reads one complete reply.
pub fn read_value<R: BufRead>(reader: &mut R) -> Result<Value> {
    read_nested(reader, 0)
}

fn read_nested<R: BufRead>(reader: &mut R, depth: usize) -> Result<Value> {
    let line = read_line(reader)?;
    let (&tag, rest) = line
        .split_first()
        .ok_or_else(|| Error::invalid_response("empty frame header"))?;
    match tag {
        b'+' => Ok(Value::Simple(utf8(rest)?)),
        b'-' => Ok(Value::Error(utf8(rest)?)),
        b':' => Ok(Value::Integer(parse_int(rest)?)),
        b'$' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Value::Nil);
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(Error::invalid_response(format!(
                    "bulk size {len} exceeds maximum {MAX_BULK_SIZE}"
                )));
            }
            let mut payload = vec![0u8; len + 2];
            reader.read_exact(&mut payload).map_err(map_eof("bulk payload"))?;
            if &payload[len..] != b"\r\n" {
                return Err(Error::invalid_response("bulk payload not terminated by CRLF"));
            }
            payload.truncate(len);
            Ok(Value::Bulk(payload))
        }
        b'*' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Value::Nil);
            }
            if depth >= MAX_DEPTH {
                return Err(Error::invalid_response(format!(
                    "array nesting exceeds maximum depth {MAX_DEPTH}"
                )));
            }
            let len = len as usize;
            if len > MAX_ARRAY_LEN {
                return Err(Error::invalid_response(format!(
                    "array length {len} exceeds maximum {MAX_ARRAY_LEN}"
                )));
            }
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(read_nested(reader, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        other => Err(Error::invalid_response(format!(
            "unknown frame type byte 0x{other:02x}"
        ))),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let read = reader
        .by_ref()
        .take(MAX_LINE_LEN as u64 + 2)
        .read_until(b'\n', &mut line)
        .map_err(map_eof("frame header"))?;
    if read == 0 {
        return Err(Error::invalid_response("frame header truncated"));
    }
    if !line.ends_with(b"\r\n") {
        if line.len() > MAX_LINE_LEN {
            return Err(Error::invalid_response(format!(
                "line exceeds maximum {MAX_LINE_LEN}"
            )));
        }
        return Err(Error::invalid_response("frame header truncated"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn map_eof(what: &'static str) -> impl Fn(std::io::Error) -> Error {
    move |err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::invalid_response(format!("{what} truncated"))
        } else {
            Error::Io(err)
        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::invalid_response("line is not valid utf-8"))
}

fn parse_int(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::invalid_response(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(input: &[u8]) -> Result<Value> {
        read_value(&mut Cursor::new(input))
    }

    #[test]
    fn deeply_nested_arrays_are_rejected() {
        let mut nested = b"*1\r\n".repeat(MAX_DEPTH);
        nested.extend_from_slice(b":1\r\n");
        let mut value = parse(&nested).unwrap();
        for _ in 0..MAX_DEPTH {
            let Value::Array(mut items) = value else {
                panic!("expected array");
            };
            value = items.pop().unwrap();
        }
        assert_eq!(value, Value::Integer(1));

        let hostile = b"*1\r\n".repeat(100_000);
        let err = parse(&hostile).unwrap_err();
        assert!(err.to_string().contains("depth"), "{err}");
    }

    #[test]
    fn command_is_encoded_as_bulk_array() {
        let mut buf = Vec::new();
        write_command(&mut buf, &[b"SET", b"foo", &[0x01, 0x02]]).unwrap();
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$2\r\n\x01\x02\r\n".to_vec());
    }

    #[test]
    fn empty_command_is_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_command(&mut buf, &[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn parses_scalar_replies() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), Value::ok());
        assert_eq!(parse(b":-42\r\n").unwrap(), Value::Integer(-42));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Value::Nil);
        assert_eq!(parse(b"*-1\r\n").unwrap(), Value::Nil);
        assert_eq!(
            parse(b"-ERR value is not an integer or out of range\r\n").unwrap(),
            Value::Error("ERR value is not an integer or out of range".to_string())
        );
    }

    #[test]
    fn bulk_payload_may_contain_crlf() {
        assert_eq!(
            parse(b"$4\r\na\r\nb\r\n").unwrap(),
            Value::Bulk(b"a\r\nb".to_vec())
        );
    }

    #[test]
    fn parses_nested_array_with_nil_entries() {
        let value = parse(b"*3\r\n$3\r\nfoo\r\n$-1\r\n*1\r\n:1\r\n").unwrap();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Bulk(b"foo".to_vec()),
                Value::Nil,
                Value::Array(vec![Value::Integer(1)]),
            ])
        );
    }

    #[test]
    fn write_value_matches_reader() {
        let value = Value::Array(vec![Value::ok(), Value::Nil, Value::Bulk(vec![0xff; 3])]);
        let mut buf = Vec::new();
        write_value(&mut buf, &value).unwrap();
        assert_eq!(parse(&buf).unwrap(), value);
    }

    #[test]
    fn truncated_frames_are_invalid_responses() {
        for input in [&b""[..], b"+OK", b"$5\r\nab", b"*2\r\n:1\r\n"] {
            match parse(input) {
                Err(Error::InvalidResponse(msg)) => assert!(msg.contains("truncated"), "{msg}"),
                other => panic!("expected truncation for {input:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_oversized_and_malformed_headers() {
        let huge = format!("${}\r\n", MAX_BULK_SIZE + 1);
        assert!(matches!(parse(huge.as_bytes()), Err(Error::InvalidResponse(_))));
        assert!(matches!(parse(b"?x\r\n"), Err(Error::InvalidResponse(_))));
        assert!(matches!(parse(b":abc\r\n"), Err(Error::InvalidResponse(_))));
        assert!(matches!(parse(b"$3\r\nabcd\r\n"), Err(Error::InvalidResponse(_))));
    }
}
