//! Memcached ASCII protocol implementation

pub mod command;
pub mod parser;
pub mod response;

pub use command::{ArithOp, Command, MAX_KEY_LENGTH, StoreMode, VERSION};
pub use parser::{MAX_LINE_LENGTH, Parser};
pub use response::ResponseWriter;

/// Bytes framing every data block after its payload
pub const ARGUMENT_TERMINATOR: &[u8] = b"\r\n";

/// Length of [`ARGUMENT_TERMINATOR`], counted on top of a declared data length
pub const ARGUMENT_TERMINATOR_LEN: usize = ARGUMENT_TERMINATOR.len();
