//! Non-blocking client connection
//!
//! ```text
//!            do_read: quit / protocol error / peer EOF
//!   Open ────────────────────────────────────────────▶ Closing ──▶ (output flushed) ──▶ dropped
//!    │                                                    │
//!    └──── socket error / write failure / hangup ─────────┴──────▶ Closed ──▶ dropped
//! ```
//!
//! Readable interest is withdrawn while more than `output_queue_limit`
//! responses are queued and restored once the queue drains to
//! `backpressure_release_len`.

use super::session::{Flow, Session};
use super::{ConnectionPermit, ServerContext};
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Most queued responses handed to one vectored write
pub const MAX_IOVECS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// No more input is processed; queued output is still flushed
    Closing,
    /// Nothing more is sent
    Closed,
}

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    session: Session,
    output: VecDeque<Bytes>,
    /// Bytes of the front response already written
    written: usize,
    state: ConnState,
    /// False while reads are paused for backpressure
    reading: bool,
    registered: Interest,
    last_activity: Instant,
    _permit: ConnectionPermit,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        ctx: Arc<ServerContext>,
        permit: ConnectionPermit,
    ) -> Self {
        let session = Session::new(&ctx.config);
        Self {
            stream,
            peer,
            ctx,
            session,
            output: VecDeque::new(),
            written: 0,
            state: ConnState::Open,
            reading: true,
            registered: Interest::READABLE,
            last_activity: Instant::now(),
            _permit: permit,
        }
    }

    /// Register for reads; writable interest is only added once output is queued
    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        self.registered = Interest::READABLE;
        registry.register(&mut self.stream, token, self.registered)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Process buffered input and read until the socket would block
    pub fn do_read(&mut self) {
        let limit = self.ctx.config.output_queue_limit;

        while self.state == ConnState::Open {
            match self.session.process(&self.ctx, &mut self.output) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Quit) => {
                    debug!(peer = %self.peer, "Client quit");
                    self.state = ConnState::Closing;
                    break;
                }
                Err(e) => {
                    debug!(peer = %self.peer, "Protocol error: {}", e);
                    self.session.reject(&self.ctx, &e, &mut self.output);
                    self.state = ConnState::Closing;
                    break;
                }
            }

            if self.output.len() > limit {
                if self.reading {
                    self.reading = false;
                    self.ctx.metrics.backpressure_events.inc();
                    debug!(peer = %self.peer, queued = self.output.len(), "Pausing reads");
                }
                break;
            }

            match self.stream.read(self.session.spare()) {
                Ok(0) => {
                    if self.session.abort() {
                        debug!(peer = %self.peer, "Peer closed mid-request");
                    }
                    self.state = ConnState::Closing;
                }
                Ok(n) => {
                    self.session.commit(n);
                    self.last_activity = Instant::now();
                    self.ctx.metrics.bytes_read.inc_by(n as u64);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, "Read error: {}", e);
                    self.session.abort();
                    self.session.server_error(&e.to_string(), &mut self.output);
                    self.state = ConnState::Closing;
                }
            }
        }
    }

    /// Flush queued responses until the socket would block.
    ///
    /// Returns true when this resumed reading after backpressure, in which
    /// case buffered input may be waiting for [`do_read`](Self::do_read).
    pub fn do_write(&mut self) -> bool {
        while !self.output.is_empty() && self.state != ConnState::Closed {
            let mut slices = [IoSlice::new(&[]); MAX_IOVECS];
            let mut count = 0;
            for (slot, item) in slices.iter_mut().zip(self.output.iter()) {
                let pending: &[u8] = if count == 0 { &item[self.written..] } else { &item[..] };
                *slot = IoSlice::new(pending);
                count += 1;
            }

            match self.stream.write_vectored(&slices[..count]) {
                Ok(0) => {
                    debug!(peer = %self.peer, "Write returned zero bytes");
                    self.state = ConnState::Closed;
                }
                Ok(n) => {
                    self.advance(n);
                    self.last_activity = Instant::now();
                    self.ctx.metrics.bytes_written.inc_by(n as u64);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!(peer = %self.peer, "Write error: {}", e);
                    self.state = ConnState::Closed;
                }
            }
        }

        if !self.reading
            && self.state == ConnState::Open
            && self.output.len() <= self.ctx.config.backpressure_release_len()
        {
            self.reading = true;
            debug!(peer = %self.peer, queued = self.output.len(), "Resuming reads");
            return true;
        }
        false
    }

    /// Socket reported an error
    pub fn on_error(&mut self) {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => debug!(peer = %self.peer, "Socket error: {}", e),
            Ok(None) => debug!(peer = %self.peer, "Socket error"),
        }
        self.state = ConnState::Closed;
    }

    /// Peer hung up in both directions
    pub fn on_close(&mut self) {
        debug!(peer = %self.peer, "Peer hung up");
        self.state = ConnState::Closed;
    }

    /// Stop taking requests; queued responses are still delivered
    pub fn begin_shutdown(&mut self) {
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
            self.session.abort();
            let _ = self.stream.shutdown(Shutdown::Read);
        }
    }

    pub fn has_pending_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Interest the connection currently needs, `None` once nothing is left to do
    pub fn interest(&self) -> Option<Interest> {
        if self.state == ConnState::Closed {
            return None;
        }
        let readable = self.state == ConnState::Open && self.reading;
        let writable = !self.output.is_empty();
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Re-apply interest after an event. Returns false if the connection is done.
    pub fn refresh(&mut self, registry: &Registry, token: Token) -> io::Result<bool> {
        let Some(interest) = self.interest() else {
            return Ok(false);
        };
        if interest != self.registered {
            registry.reregister(&mut self.stream, token, interest)?;
            self.registered = interest;
        }
        Ok(true)
    }

    /// No bytes moved in either direction for `timeout`
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.output.front() else {
                break;
            };
            let left = front.len() - self.written;
            if n < left {
                self.written += n;
                return;
            }
            n -= left;
            self.output.pop_front();
            self.written = 0;
        }
    }
}
