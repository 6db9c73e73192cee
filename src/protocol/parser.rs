//! Incremental memcached ASCII header parser
//!
//! Two-phase parsing, driven by the connection:
//! 1. [`Parser::parse`] recognizes one command line (up to \r\n)
//! 2. [`Parser::build`] hands out the command and, for storage commands, the
//!    length of the data block the connection must collect before executing

use crate::ProtocolError;
use crate::protocol::command::{ArithOp, Command, MAX_KEY_LENGTH, StoreMode, is_valid_key};
use bytes::Bytes;

/// Longest accepted command line, excluding its \r\n
pub const MAX_LINE_LENGTH: usize = 2048;

/// Case-insensitive command comparison (avoids allocation from to_ascii_lowercase)
#[inline]
fn cmd_eq(cmd: &[u8], expected: &[u8]) -> bool {
    cmd.len() == expected.len()
        && cmd
            .iter()
            .zip(expected.iter())
            .all(|(a, b)| a.to_ascii_lowercase() == *b)
}

/// Stateful header parser; one command in flight at a time
#[derive(Debug)]
pub struct Parser {
    max_value_size: usize,
    parsed: Option<(Command, Option<usize>)>,
}

impl Parser {
    pub fn new(max_value_size: usize) -> Self {
        Self {
            max_value_size,
            parsed: None,
        }
    }

    /// Try to recognize a command line at the start of `buf`.
    ///
    /// Returns `Ok(Some(consumed))` once a whole line was parsed, `Ok(None)`
    /// when more bytes are needed.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let line_end = match find_crlf(buf) {
            Some(pos) => pos,
            // a trailing \r may still be the start of the terminator
            None if buf.len() > MAX_LINE_LENGTH + 1
                || (buf.len() == MAX_LINE_LENGTH + 1 && buf.last() != Some(&b'\r')) =>
            {
                return Err(ProtocolError::LineTooLong);
            }
            None => return Ok(None),
        };
        if line_end > MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong);
        }

        self.parsed = Some(parse_line(&buf[..line_end], self.max_value_size)?);
        Ok(Some(line_end + 2))
    }

    /// Take the last parsed command and the length of its data block, if any
    pub fn build(&mut self) -> Option<(Command, Option<usize>)> {
        self.parsed.take()
    }

    /// Forget any parsed but unbuilt command
    pub fn reset(&mut self) {
        self.parsed = None;
    }
}

/// Find \r\n in buffer
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n")
}

fn parse_line(line: &[u8], max_value_size: usize) -> Result<(Command, Option<usize>), ProtocolError> {
    let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let Some(name) = parts.next() else {
        return Err(ProtocolError::UnknownCommand(String::new()));
    };

    let store_mode = if cmd_eq(name, b"set") {
        Some(StoreMode::Set)
    } else if cmd_eq(name, b"add") {
        Some(StoreMode::Add)
    } else if cmd_eq(name, b"replace") {
        Some(StoreMode::Replace)
    } else if cmd_eq(name, b"append") {
        Some(StoreMode::Append)
    } else if cmd_eq(name, b"prepend") {
        Some(StoreMode::Prepend)
    } else {
        None
    };

    if let Some(mode) = store_mode {
        parse_store(mode, parts, max_value_size)
    } else if cmd_eq(name, b"get") || cmd_eq(name, b"gets") {
        parse_get(parts).map(|cmd| (cmd, None))
    } else if cmd_eq(name, b"delete") {
        parse_delete(parts).map(|cmd| (cmd, None))
    } else if cmd_eq(name, b"incr") {
        parse_arithmetic(ArithOp::Incr, parts).map(|cmd| (cmd, None))
    } else if cmd_eq(name, b"decr") {
        parse_arithmetic(ArithOp::Decr, parts).map(|cmd| (cmd, None))
    } else if cmd_eq(name, b"version") {
        Ok((Command::Version, None))
    } else if cmd_eq(name, b"quit") {
        Ok((Command::Quit, None))
    } else {
        Err(ProtocolError::UnknownCommand(
            String::from_utf8_lossy(name).to_string(),
        ))
    }
}

fn parse_key(part: Option<&[u8]>) -> Result<Bytes, ProtocolError> {
    let key = part.ok_or_else(|| ProtocolError::InvalidCommand("missing key".to_string()))?;
    if !is_valid_key(key) {
        if key.len() > MAX_KEY_LENGTH {
            return Err(ProtocolError::KeyTooLong);
        }
        return Err(ProtocolError::InvalidKey(
            String::from_utf8_lossy(key).to_string(),
        ));
    }
    Ok(Bytes::copy_from_slice(key))
}

/// Parse get command
fn parse_get<'a>(parts: impl Iterator<Item = &'a [u8]>) -> Result<Command, ProtocolError> {
    let keys = parts
        .map(|part| parse_key(Some(part)))
        .collect::<Result<Vec<_>, _>>()?;

    if keys.is_empty() {
        return Err(ProtocolError::InvalidCommand(
            "get requires at least one key".to_string(),
        ));
    }

    Ok(Command::Get { keys })
}

/// Parse a storage command line
/// Format: <cmd> <key> <flags> <exptime> <bytes> [noreply]
fn parse_store<'a>(
    mode: StoreMode,
    mut parts: impl Iterator<Item = &'a [u8]>,
    max_value_size: usize,
) -> Result<(Command, Option<usize>), ProtocolError> {
    let key = parse_key(parts.next())?;
    let flags = parts.next().and_then(parse_u32).ok_or(ProtocolError::InvalidFlags)?;
    let exptime = parts.next().and_then(parse_i64).ok_or(ProtocolError::InvalidExptime)?;
    let bytes = parts
        .next()
        .and_then(parse_usize)
        .ok_or(ProtocolError::InvalidBytesLength)?;
    let noreply = parts.next().is_some_and(|s| s == b"noreply");

    if bytes > max_value_size {
        return Err(ProtocolError::ValueTooLarge);
    }

    let cmd = Command::Store {
        mode,
        key,
        flags,
        exptime,
        noreply,
    };
    Ok((cmd, Some(bytes)))
}

/// Parse delete command
/// Format: delete <key> [exptime] [noreply]\r\n
/// exptime is parsed but ignored (for mcrouter compatibility)
fn parse_delete<'a>(mut parts: impl Iterator<Item = &'a [u8]>) -> Result<Command, ProtocolError> {
    let key = parse_key(parts.next())?;
    let noreply = parts.any(|part| part == b"noreply");
    Ok(Command::Delete { key, noreply })
}

/// Parse incr/decr command
/// Format: incr <key> <delta> [noreply]\r\n
fn parse_arithmetic<'a>(
    op: ArithOp,
    mut parts: impl Iterator<Item = &'a [u8]>,
) -> Result<Command, ProtocolError> {
    let key = parse_key(parts.next())?;
    let delta = parts
        .next()
        .and_then(parse_u64)
        .ok_or(ProtocolError::InvalidNumericValue)?;
    let noreply = parts.next().is_some_and(|s| s == b"noreply");
    Ok(Command::Arithmetic {
        op,
        key,
        delta,
        noreply,
    })
}

/// Parse bytes as u32
fn parse_u32(bytes: &[u8]) -> Option<u32> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as u64
fn parse_u64(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as i64
fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Parse bytes as usize
fn parse_usize(bytes: &[u8]) -> Option<usize> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}
