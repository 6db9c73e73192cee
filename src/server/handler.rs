//! Command execution and error responses

use super::ServerContext;
use crate::error::{ProtocolError, StorageError};
use crate::protocol::{Command, ResponseWriter};
use std::panic::{self, AssertUnwindSafe};
use tracing::error;

/// Execute a command against storage, writing its response.
///
/// Failures never escape: a storage error or a panic becomes an error
/// response and the connection keeps serving.
pub fn execute(ctx: &ServerContext, cmd: &Command, argument: &[u8], response: &mut ResponseWriter) {
    let metrics = &ctx.metrics;
    metrics.record_command(cmd);

    let timer = metrics.cmd_latency.start_timer();
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        cmd.execute(ctx.storage.as_ref(), argument, response)
    }));
    timer.observe_duration();

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            metrics.storage_errors.inc();
            response.clear();
            match e {
                StorageError::NotNumeric => response.client_error(&e.to_string()),
                _ => response.server_error(&e.to_string()),
            }
        }
        Err(_) => {
            metrics.command_panics.inc();
            error!(command = cmd.name(), "Command panicked");
            response.clear();
            response.server_error("command failed");
        }
    }
}

/// Write the response for a malformed request
pub fn protocol_error(e: &ProtocolError, response: &mut ResponseWriter) {
    match e {
        ProtocolError::UnknownCommand(_) => response.error(),
        _ => response.client_error(&e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::test_support::context;
    use bytes::Bytes;

    #[test]
    fn test_execute_counts_command() {
        let ctx = context(ServerConfig::default());
        let mut response = ResponseWriter::new(64);
        let cmd = Command::Delete {
            key: Bytes::from_static(b"k"),
            noreply: false,
        };
        execute(&ctx, &cmd, b"", &mut response);
        assert_eq!(response.buffer(), b"NOT_FOUND\r\n");
        assert_eq!(ctx.metrics.cmd_delete.get(), 1);
    }

    #[test]
    fn test_storage_error_becomes_client_error() {
        let ctx = context(ServerConfig::default());
        ctx.storage.put(b"n", b"not a number");
        let mut response = ResponseWriter::new(64);
        let cmd = Command::Arithmetic {
            op: crate::protocol::ArithOp::Incr,
            key: Bytes::from_static(b"n"),
            delta: 1,
            noreply: false,
        };
        execute(&ctx, &cmd, b"", &mut response);
        assert_eq!(
            response.buffer(),
            b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n"
        );
        assert_eq!(ctx.metrics.storage_errors.get(), 1);
    }

    #[test]
    fn test_protocol_error_responses() {
        let mut response = ResponseWriter::new(64);
        protocol_error(&ProtocolError::UnknownCommand("bogus".into()), &mut response);
        assert_eq!(response.take().as_ref(), b"ERROR\r\n");

        protocol_error(&ProtocolError::BadDataChunk, &mut response);
        assert_eq!(response.take().as_ref(), b"CLIENT_ERROR bad data chunk\r\n");
    }
}
