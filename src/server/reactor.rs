//! Readiness-driven event loop owning a set of connections
//!
//! A reactor runs on one thread and is the only owner of its connections.
//! Other threads talk to it through a [`ReactorHandle`]: accepted sockets are
//! pushed into the inbox and the poll is interrupted with a [`Waker`].

use super::connection::Connection;
use super::{ConnectionPermit, ServerContext};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub(super) const WAKER: Token = Token(usize::MAX);
pub(super) const LISTENER: Token = Token(usize::MAX - 1);

/// Longest poll wait while idle connections are being tracked
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long a stopping reactor waits for clients to take their responses
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Handoff = (TcpStream, SocketAddr, ConnectionPermit);

/// Cross-thread side of a reactor
pub struct ReactorHandle {
    waker: Waker,
    inbox: Mutex<Vec<Handoff>>,
    /// Connections owned or about to be owned by the reactor
    load: AtomicUsize,
    shutdown: AtomicBool,
}

impl ReactorHandle {
    /// Hand an accepted socket over to the reactor thread
    pub fn assign(&self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        self.load.fetch_add(1, Ordering::Relaxed);
        self.inbox.lock().push((stream, peer, permit));
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake reactor: {}", e);
        }
    }

    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Ask the reactor to drain its connections and exit
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            error!("Failed to wake reactor: {}", e);
        }
    }
}

pub struct Reactor {
    name: String,
    poll: Poll,
    handle: Arc<ReactorHandle>,
    connections: Slab<Connection>,
    listener: Option<TcpListener>,
    ctx: Arc<ServerContext>,
}

impl Reactor {
    /// Create a reactor; with a listener it also accepts connections itself
    pub fn new(
        name: impl Into<String>,
        ctx: Arc<ServerContext>,
        mut listener: Option<TcpListener>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        if let Some(listener) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTENER, Interest::READABLE)?;
        }

        Ok(Self {
            name: name.into(),
            poll,
            handle: Arc::new(ReactorHandle {
                waker,
                inbox: Mutex::new(Vec::new()),
                load: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            connections: Slab::new(),
            listener,
            ctx,
        })
    }

    pub fn handle(&self) -> Arc<ReactorHandle> {
        Arc::clone(&self.handle)
    }

    /// Run until shut down and every connection is gone
    pub fn run(mut self) {
        let mut events = Events::with_capacity(self.ctx.config.max_events.max(1));
        let idle_timeout = self.ctx.config.connection_timeout();
        let mut deadline: Option<Instant> = None;

        info!(reactor = %self.name, "Reactor started");
        loop {
            let timeout = match deadline {
                Some(at) => Some(at.saturating_duration_since(Instant::now())),
                None => idle_timeout.map(|t| t.min(MAX_SWEEP_INTERVAL)),
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(reactor = %self.name, "Poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => self.accept(),
                    token => self.dispatch(token, event),
                }
            }

            self.drain_inbox(deadline.is_some());

            if deadline.is_none() && self.handle.shutdown.load(Ordering::Acquire) {
                deadline = Some(Instant::now() + SHUTDOWN_GRACE);
                self.begin_shutdown();
            }
            if let Some(timeout) = idle_timeout {
                self.close_idle(timeout);
            }

            if deadline.is_some() && self.connections.is_empty() {
                break;
            }
            if deadline.is_some_and(|at| Instant::now() >= at) {
                warn!(
                    reactor = %self.name,
                    remaining = self.connections.len(),
                    "Shutdown grace period elapsed, dropping connections"
                );
                break;
            }
        }

        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.remove(key);
        }
        info!(reactor = %self.name, "Reactor stopped");
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        let Some(conn) = self.connections.get_mut(token.0) else {
            return;
        };

        if event.is_error() {
            conn.on_error();
        } else if event.is_read_closed() && event.is_write_closed() {
            conn.on_close();
        } else {
            if event.is_readable() || event.is_read_closed() {
                conn.do_read();
            }
            // A write that lifts backpressure leaves unread input behind
            while conn.has_pending_output() && conn.do_write() {
                conn.do_read();
            }
        }

        self.refresh(token.0);
    }

    /// Re-apply interest, or drop the connection once it has nothing left to do
    fn refresh(&mut self, key: usize) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        match conn.refresh(registry, Token(key)) {
            Ok(true) => {}
            Ok(false) => self.remove(key),
            Err(e) => {
                debug!(peer = %conn.peer(), "Failed to update interest: {}", e);
                self.remove(key);
            }
        }
    }

    fn remove(&mut self, key: usize) {
        let Some(mut conn) = self.connections.try_remove(key) else {
            return;
        };
        if let Err(e) = conn.deregister(self.poll.registry()) {
            debug!(peer = %conn.peer(), "Failed to deregister: {}", e);
        }
        self.handle.load.fetch_sub(1, Ordering::Relaxed);
        debug!(reactor = %self.name, peer = %conn.peer(), "Connection closed");
    }

    fn add(&mut self, stream: TcpStream, peer: SocketAddr, permit: ConnectionPermit) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let mut conn = Connection::new(stream, peer, Arc::clone(&self.ctx), permit);
        if let Err(e) = conn.register(self.poll.registry(), token) {
            warn!(peer = %peer, "Failed to register connection: {}", e);
            self.handle.load.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        entry.insert(conn);
        debug!(reactor = %self.name, peer = %peer, "Connection registered");
    }

    fn drain_inbox(&mut self, stopping: bool) {
        let handoffs = std::mem::take(&mut *self.handle.inbox.lock());
        for (stream, peer, permit) in handoffs {
            if stopping {
                self.handle.load.fetch_sub(1, Ordering::Relaxed);
                debug!(peer = %peer, "Dropping connection handed over during shutdown");
                continue;
            }
            self.add(stream, peer, permit);
        }
    }

    /// Accept until the listener would block
    fn accept(&mut self) {
        loop {
            let result = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match result {
                Ok((stream, peer)) => match self.ctx.limiter.try_acquire() {
                    Some(permit) => {
                        self.handle.load.fetch_add(1, Ordering::Relaxed);
                        self.add(stream, peer, permit);
                    }
                    None => {
                        warn!("Connection limit reached, rejecting connection from {}", peer);
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Accept error: {}", e);
                    return;
                }
            }
        }
    }

    fn begin_shutdown(&mut self) {
        if let Some(mut listener) = self.listener.take()
            && let Err(e) = self.poll.registry().deregister(&mut listener)
        {
            debug!("Failed to deregister listener: {}", e);
        }

        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        info!(reactor = %self.name, connections = keys.len(), "Draining connections");
        for key in keys {
            if let Some(conn) = self.connections.get_mut(key) {
                conn.begin_shutdown();
                if conn.has_pending_output() {
                    conn.do_write();
                }
            }
            self.refresh(key);
        }
    }

    fn close_idle(&mut self, timeout: Duration) {
        let now = Instant::now();
        let idle: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_idle(now, timeout))
            .map(|(key, _)| key)
            .collect();
        for key in idle {
            debug!(reactor = %self.name, "Closing idle connection");
            self.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::test_support::context;
    use std::io::{Read, Write};
    use std::thread;

    fn start(config: ServerConfig) -> (SocketAddr, Arc<ReactorHandle>, Arc<ServerContext>, thread::JoinHandle<()>) {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();

        let ctx = context(config);
        let reactor = Reactor::new("test-reactor", Arc::clone(&ctx), Some(TcpListener::from_std(std_listener))).unwrap();
        let handle = reactor.handle();
        let thread = thread::spawn(move || reactor.run());
        (addr, handle, ctx, thread)
    }

    fn client(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    #[test]
    fn test_serves_and_shuts_down() {
        let (addr, handle, ctx, thread) = start(ServerConfig::default());
        let mut c = client(addr);
        c.write_all(b"set k 0 0 2\r\nhi\r\nget k\r\n").unwrap();

        let expected = b"STORED\r\nVALUE k 0 2\r\nhi\r\nEND\r\n";
        let mut reply = vec![0; expected.len()];
        c.read_exact(&mut reply).unwrap();
        assert_eq!(reply, expected);
        assert_eq!(handle.load(), 1);

        handle.shutdown();
        thread.join().unwrap();
        assert_eq!(ctx.limiter.active(), 0);

        // reads are shut down, so the socket reports EOF
        let mut rest = Vec::new();
        c.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_inbox_handoff() {
        let ctx = context(ServerConfig::default());
        let reactor = Reactor::new("test-inbox", Arc::clone(&ctx), None).unwrap();
        let handle = reactor.handle();
        let thread = thread::spawn(move || reactor.run());

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut c = client(listener.local_addr().unwrap());
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let permit = ctx.limiter.try_acquire().unwrap();
        handle.assign(TcpStream::from_std(accepted), peer, permit);

        c.write_all(b"version\r\n").unwrap();
        let mut line = String::new();
        let mut byte = [0u8; 1];
        while !line.ends_with("\r\n") {
            c.read_exact(&mut byte).unwrap();
            line.push(byte[0] as char);
        }
        assert!(line.starts_with("VERSION "));

        handle.shutdown();
        thread.join().unwrap();
        assert_eq!(handle.load(), 0);
    }

    #[test]
    fn test_rejects_over_limit() {
        let config = ServerConfig {
            max_connections: 1,
            ..Default::default()
        };
        let (addr, handle, ctx, thread) = start(config);
        let mut first = client(addr);
        first.write_all(b"version\r\n").unwrap();
        let mut buf = [0u8; 8];
        first.read_exact(&mut buf).unwrap();

        let mut second = client(addr);
        let mut rest = Vec::new();
        // the rejected socket is closed without a reply
        let _ = second.read_to_end(&mut rest);
        assert!(rest.is_empty());
        assert_eq!(ctx.metrics.rejected_connections.get(), 1);

        handle.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn test_idle_connections_are_closed() {
        let config = ServerConfig {
            connection_timeout_secs: 1,
            ..Default::default()
        };
        let (addr, handle, _ctx, thread) = start(config);
        let mut c = client(addr);
        let mut rest = Vec::new();
        c.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        handle.shutdown();
        thread.join().unwrap();
    }
}
