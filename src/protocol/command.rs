//! Memcached ASCII protocol command types and their execution against storage

use crate::error::StorageError;
use crate::protocol::ResponseWriter;
use crate::storage::Storage;
use bytes::Bytes;

/// Maximum key length (memcached protocol limit)
pub const MAX_KEY_LENGTH: usize = 250;

/// Version reported by the `version` command
pub const VERSION: &str = concat!("basalt ", env!("CARGO_PKG_VERSION"));

/// How a storage command treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally
    Set,
    /// Store only if absent
    Add,
    /// Store only if present
    Replace,
    /// Add data after the existing value
    Append,
    /// Add data before the existing value
    Prepend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Incr,
    Decr,
}

/// Parsed memcached command.
///
/// Storage commands carry no data: their data block is the argument handed
/// to [`Command::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// get <key>*
    Get { keys: Vec<Bytes> },

    /// set|add|replace|append|prepend <key> <flags> <exptime> <bytes> [noreply]
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        noreply: bool,
    },

    /// delete <key> [noreply]
    Delete { key: Bytes, noreply: bool },

    /// incr|decr <key> <delta> [noreply]
    Arithmetic {
        op: ArithOp,
        key: Bytes,
        delta: u64,
        noreply: bool,
    },

    /// version
    Version,

    /// quit
    Quit,
}

impl Command {
    /// Returns true if this command should not send a response
    pub fn is_noreply(&self) -> bool {
        match self {
            Command::Store { noreply, .. }
            | Command::Delete { noreply, .. }
            | Command::Arithmetic { noreply, .. } => *noreply,
            _ => false,
        }
    }

    /// Command name as written on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::Store { mode, .. } => match mode {
                StoreMode::Set => "set",
                StoreMode::Add => "add",
                StoreMode::Replace => "replace",
                StoreMode::Append => "append",
                StoreMode::Prepend => "prepend",
            },
            Command::Delete { .. } => "delete",
            Command::Arithmetic { op: ArithOp::Incr, .. } => "incr",
            Command::Arithmetic { op: ArithOp::Decr, .. } => "decr",
            Command::Version => "version",
            Command::Quit => "quit",
        }
    }

    /// Run the command, writing its response.
    ///
    /// `argument` is the data block of a storage command with the framing
    /// terminator already stripped; other commands ignore it.
    pub fn execute(
        &self,
        storage: &dyn Storage,
        argument: &[u8],
        response: &mut ResponseWriter,
    ) -> Result<(), StorageError> {
        match self {
            Command::Get { keys } => {
                for key in keys {
                    if let Some(value) = storage.get(key) {
                        response.value(key, 0, &value);
                    }
                }
                response.end();
            }
            Command::Store { mode, key, .. } => store(storage, *mode, key, argument, response),
            Command::Delete { key, .. } => {
                if storage.delete(key) {
                    response.deleted();
                } else {
                    response.not_found();
                }
            }
            Command::Arithmetic { op, key, delta, .. } => {
                arithmetic(storage, *op, key, *delta, response)?;
            }
            Command::Version => response.version(VERSION),
            Command::Quit => {}
        }
        Ok(())
    }
}

fn store(storage: &dyn Storage, mode: StoreMode, key: &[u8], data: &[u8], response: &mut ResponseWriter) {
    let stored = match mode {
        StoreMode::Set => {
            if !storage.put(key, data) {
                response.server_error("object too large for cache");
                return;
            }
            true
        }
        StoreMode::Add => storage.put_if_absent(key, data),
        StoreMode::Replace => storage.set(key, data),
        StoreMode::Append | StoreMode::Prepend => storage
            .update(key, &mut |existing| {
                let mut combined = Vec::with_capacity(existing.len() + data.len());
                if mode == StoreMode::Append {
                    combined.extend_from_slice(existing);
                    combined.extend_from_slice(data);
                } else {
                    combined.extend_from_slice(data);
                    combined.extend_from_slice(existing);
                }
                Some(combined)
            })
            .unwrap_or(false),
    };

    if stored {
        response.stored();
    } else {
        response.not_stored();
    }
}

fn arithmetic(
    storage: &dyn Storage,
    op: ArithOp,
    key: &[u8],
    delta: u64,
    response: &mut ResponseWriter,
) -> Result<(), StorageError> {
    let mut numeric = true;
    let mut updated = 0;
    let stored = storage.update(key, &mut |current| {
        let Some(current) = std::str::from_utf8(current)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            numeric = false;
            return None;
        };

        // memcached wraps on incr overflow and clamps decr at zero
        updated = match op {
            ArithOp::Incr => current.wrapping_add(delta),
            ArithOp::Decr => current.saturating_sub(delta),
        };
        Some(itoa::Buffer::new().format(updated).as_bytes().to_vec())
    });

    match stored {
        None => response.not_found(),
        Some(_) if !numeric => return Err(StorageError::NotNumeric),
        Some(true) => response.number(updated),
        Some(false) => response.not_found(),
    }
    Ok(())
}

/// Check if a key is valid
pub fn is_valid_key(key: &[u8]) -> bool {
    if key.is_empty() || key.len() > MAX_KEY_LENGTH {
        return false;
    }
    // Keys cannot contain control characters or whitespace
    key.iter().all(|&b| b > 32 && b < 127)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ThreadSafeLru;

    fn run(storage: &dyn Storage, cmd: &Command, argument: &[u8]) -> Result<Vec<u8>, StorageError> {
        let mut response = ResponseWriter::new(128);
        cmd.execute(storage, argument, &mut response)?;
        Ok(response.take().to_vec())
    }

    fn store_cmd(mode: StoreMode, key: &'static [u8]) -> Command {
        Command::Store {
            mode,
            key: Bytes::from_static(key),
            flags: 0,
            exptime: 0,
            noreply: false,
        }
    }

    fn arith_cmd(op: ArithOp, key: &'static [u8], delta: u64) -> Command {
        Command::Arithmetic {
            op,
            key: Bytes::from_static(key),
            delta,
            noreply: false,
        }
    }

    #[test]
    fn test_is_valid_key() {
        assert!(is_valid_key(b"valid_key"));
        assert!(is_valid_key(b"key-with-dashes"));
        assert!(is_valid_key(b"key:with:colons"));
        assert!(!is_valid_key(b""));
        assert!(!is_valid_key(b"key with space"));
        assert!(!is_valid_key(b"key\twith\ttab"));
        assert!(!is_valid_key(&[b'a'; 251])); // Too long
    }

    #[test]
    fn test_is_noreply() {
        let cmd = Command::Store {
            mode: StoreMode::Set,
            key: Bytes::from_static(b"key"),
            flags: 0,
            exptime: 0,
            noreply: true,
        };
        assert!(cmd.is_noreply());

        let cmd = Command::Get {
            keys: vec![Bytes::from_static(b"key")],
        };
        assert!(!cmd.is_noreply());
        assert_eq!(cmd.name(), "get");
    }

    #[test]
    fn test_set_then_get() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(run(&storage, &store_cmd(StoreMode::Set, b"a"), b"foo").unwrap(), b"STORED\r\n");

        let get = Command::Get {
            keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"missing")],
        };
        assert_eq!(run(&storage, &get, b"").unwrap(), b"VALUE a 0 3\r\nfoo\r\nEND\r\n");
    }

    #[test]
    fn test_set_too_large() {
        let storage = ThreadSafeLru::new(4);
        assert_eq!(
            run(&storage, &store_cmd(StoreMode::Set, b"a"), b"12345").unwrap(),
            b"SERVER_ERROR object too large for cache\r\n"
        );
    }

    #[test]
    fn test_add_and_replace() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(run(&storage, &store_cmd(StoreMode::Replace, b"k"), b"1").unwrap(), b"NOT_STORED\r\n");
        assert_eq!(run(&storage, &store_cmd(StoreMode::Add, b"k"), b"1").unwrap(), b"STORED\r\n");
        assert_eq!(run(&storage, &store_cmd(StoreMode::Add, b"k"), b"2").unwrap(), b"NOT_STORED\r\n");
        assert_eq!(run(&storage, &store_cmd(StoreMode::Replace, b"k"), b"3").unwrap(), b"STORED\r\n");
        assert_eq!(storage.get(b"k").as_deref(), Some(&b"3"[..]));
    }

    #[test]
    fn test_append_prepend() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(run(&storage, &store_cmd(StoreMode::Append, b"k"), b"x").unwrap(), b"NOT_STORED\r\n");

        storage.put(b"k", b"mid");
        run(&storage, &store_cmd(StoreMode::Append, b"k"), b"-end").unwrap();
        run(&storage, &store_cmd(StoreMode::Prepend, b"k"), b"start-").unwrap();
        assert_eq!(storage.get(b"k").as_deref(), Some(&b"start-mid-end"[..]));
    }

    #[test]
    fn test_delete() {
        let storage = ThreadSafeLru::new(1024);
        let delete = Command::Delete {
            key: Bytes::from_static(b"k"),
            noreply: false,
        };
        assert_eq!(run(&storage, &delete, b"").unwrap(), b"NOT_FOUND\r\n");
        storage.put(b"k", b"v");
        assert_eq!(run(&storage, &delete, b"").unwrap(), b"DELETED\r\n");
    }

    #[test]
    fn test_incr_decr() {
        let storage = ThreadSafeLru::new(1024);
        assert_eq!(run(&storage, &arith_cmd(ArithOp::Incr, b"n", 1), b"").unwrap(), b"NOT_FOUND\r\n");

        storage.put(b"n", b"10");
        assert_eq!(run(&storage, &arith_cmd(ArithOp::Incr, b"n", 5), b"").unwrap(), b"15\r\n");
        assert_eq!(run(&storage, &arith_cmd(ArithOp::Decr, b"n", 100), b"").unwrap(), b"0\r\n");

        storage.put(b"n", b"18446744073709551615");
        assert_eq!(run(&storage, &arith_cmd(ArithOp::Incr, b"n", 2), b"").unwrap(), b"1\r\n");
        assert_eq!(storage.get(b"n").as_deref(), Some(&b"1"[..]));
    }

    #[test]
    fn test_incr_non_numeric_fails() {
        let storage = ThreadSafeLru::new(1024);
        storage.put(b"n", b"abc");
        let err = run(&storage, &arith_cmd(ArithOp::Incr, b"n", 1), b"").unwrap_err();
        assert_eq!(err, StorageError::NotNumeric);
        assert_eq!(storage.get(b"n").as_deref(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_version_and_quit() {
        let storage = ThreadSafeLru::new(16);
        let out = run(&storage, &Command::Version, b"").unwrap();
        assert!(out.starts_with(b"VERSION basalt "));
        assert!(run(&storage, &Command::Quit, b"").unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_incr_and_append_lose_nothing() {
        let storage = std::sync::Arc::new(crate::storage::StripedLru::new(
            crate::storage::MIN_STRIPE_SIZE * 2,
            2,
        )
        .unwrap());
        run(storage.as_ref(), &store_cmd(StoreMode::Set, b"n"), b"0").unwrap();
        run(storage.as_ref(), &store_cmd(StoreMode::Set, b"log"), b"").unwrap();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let storage = std::sync::Arc::clone(&storage);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        run(storage.as_ref(), &arith_cmd(ArithOp::Incr, b"n", 1), b"").unwrap();
                        run(storage.as_ref(), &store_cmd(StoreMode::Append, b"log"), b"x").unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(storage.get(b"n").as_deref(), Some(&b"2000"[..]));
        assert_eq!(storage.get(b"log").map(|v| v.len()), Some(2000));
    }
}
