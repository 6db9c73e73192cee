//! Socket-independent request codec
//!
//! A [`Session`] owns everything a connection needs to turn a byte stream into
//! responses: a fixed read buffer, the header parser and the data block of a
//! storage command still being received. Network layers only move bytes in
//! (`spare` + `commit`) and complete responses out (`process`).

use super::{ServerContext, handler};
use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::protocol::{ARGUMENT_TERMINATOR, ARGUMENT_TERMINATOR_LEN, Command, Parser, ResponseWriter};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// What the owner of a session should do after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// Client asked to close; flush queued output first
    Quit,
}

/// Storage command whose data block is still arriving
#[derive(Debug)]
struct PendingCommand {
    command: Command,
    argument: BytesMut,
    /// Data block bytes not yet received, terminator included
    remaining: usize,
}

/// Per-connection codec state
#[derive(Debug)]
pub struct Session {
    buf: Box<[u8]>,
    /// Unprocessed bytes are `buf[start..end]`
    start: usize,
    end: usize,
    parser: Parser,
    pending: Option<PendingCommand>,
    response: ResponseWriter,
}

impl Session {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            buf: vec![0; config.read_buffer_size].into_boxed_slice(),
            start: 0,
            end: 0,
            parser: Parser::new(config.max_value_size),
            pending: None,
            response: ResponseWriter::default(),
        }
    }

    /// Free space at the end of the read buffer, compacting it first
    pub fn spare(&mut self) -> &mut [u8] {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.buf[self.end..]
    }

    /// Mark `n` bytes written into [`spare`](Self::spare) as received
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.buf.len());
    }

    /// Received bytes not yet processed
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    /// True while a storage command waits for the rest of its data block
    pub fn is_awaiting_argument(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop buffered input and any partially received command.
    ///
    /// Returns true if a request was in flight.
    pub fn abort(&mut self) -> bool {
        let in_flight = self.pending.take().is_some() || self.buffered() > 0;
        self.parser.reset();
        self.start = 0;
        self.end = 0;
        in_flight
    }

    /// Execute every complete request in the buffer, queueing responses.
    ///
    /// Stops early once `output` holds more than `output_queue_limit`
    /// responses; the remaining input is processed by the next call.
    pub fn process(
        &mut self,
        ctx: &ServerContext,
        output: &mut VecDeque<Bytes>,
    ) -> Result<Flow, ProtocolError> {
        let limit = ctx.config.output_queue_limit;

        while output.len() <= limit {
            if self.pending.is_some() {
                if !self.fill_argument() {
                    break;
                }
                let Some(PendingCommand { command, mut argument, .. }) = self.pending.take() else {
                    break;
                };
                if !argument.ends_with(ARGUMENT_TERMINATOR) {
                    return Err(ProtocolError::BadDataChunk);
                }
                argument.truncate(argument.len() - ARGUMENT_TERMINATOR_LEN);
                self.run(ctx, &command, &argument, output);
                continue;
            }

            if self.start == self.end {
                break;
            }
            let Some(consumed) = self.parser.parse(&self.buf[self.start..self.end])? else {
                if self.start == 0 && self.end == self.buf.len() {
                    return Err(ProtocolError::LineTooLong);
                }
                break;
            };
            self.start += consumed;

            let Some((command, argument_len)) = self.parser.build() else {
                continue;
            };
            match argument_len {
                Some(len) => {
                    let remaining = len + ARGUMENT_TERMINATOR_LEN;
                    self.pending = Some(PendingCommand {
                        command,
                        argument: BytesMut::with_capacity(remaining),
                        remaining,
                    });
                }
                None if command == Command::Quit => return Ok(Flow::Quit),
                None => self.run(ctx, &command, &[], output),
            }
        }

        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
        Ok(Flow::Continue)
    }

    /// Queue the response for a malformed request and forget all input
    pub fn reject(&mut self, ctx: &ServerContext, e: &ProtocolError, output: &mut VecDeque<Bytes>) {
        ctx.metrics.protocol_errors.inc();
        self.abort();
        handler::protocol_error(e, &mut self.response);
        output.push_back(self.response.take());
    }

    /// Queue a `SERVER_ERROR` line
    pub fn server_error(&mut self, message: &str, output: &mut VecDeque<Bytes>) {
        self.response.server_error(message);
        output.push_back(self.response.take());
    }

    /// Move buffered bytes into the pending data block; true once it is complete
    fn fill_argument(&mut self) -> bool {
        let Some(pending) = self.pending.as_mut() else {
            return false;
        };
        let take = pending.remaining.min(self.end - self.start);
        pending
            .argument
            .extend_from_slice(&self.buf[self.start..self.start + take]);
        pending.remaining -= take;
        self.start += take;
        pending.remaining == 0
    }

    fn run(&mut self, ctx: &ServerContext, command: &Command, argument: &[u8], output: &mut VecDeque<Bytes>) {
        handler::execute(ctx, command, argument, &mut self.response);
        let response = self.response.take();
        if !command.is_noreply() && !response.is_empty() {
            output.push_back(response);
        }
    }
}
