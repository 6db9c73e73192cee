//! Thread-per-connection network layer
//!
//! An accept thread hands every connection to an [`Executor`] whose workers
//! block on their socket until the client leaves. The pool is sized by the
//! `[executor]` section: at most `high_watermark` clients are served at once
//! and up to `max_queue_size` more wait for a worker. Live sockets are
//! tracked so `stop` can shut down their read halves and `join` can wait for
//! them.

use super::connection::MAX_IOVECS;
use super::session::{Flow, Session};
use super::{Server, ServerContext, bind_listener};
use crate::concurrency::Executor;
use crate::config::ExecutorConfig;
use crate::{BasaltError, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use socket2::SockRef;
use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pause after an accept failure such as descriptor exhaustion
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub struct BlockingServer {
    ctx: Arc<ServerContext>,
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    listener: Option<Arc<TcpListener>>,
    acceptor: Option<JoinHandle<()>>,
    workers: Option<Arc<Executor>>,
}

struct Shared {
    running: AtomicBool,
    /// Clones of every socket being served, keyed by connection id
    sockets: Mutex<HashMap<u64, TcpStream>>,
    /// Signalled when `sockets` becomes empty
    drained: Condvar,
    next_id: AtomicU64,
}

/// Removes a served socket from [`Shared::sockets`] when the task ends, even by panic
struct Registration {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut sockets = self.shared.sockets.lock();
        sockets.remove(&self.id);
        if sockets.is_empty() {
            self.shared.drained.notify_all();
        }
    }
}

impl BlockingServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                sockets: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                next_id: AtomicU64::new(0),
            }),
            local_addr: None,
            listener: None,
            acceptor: None,
            workers: None,
        }
    }

    /// Connections currently being served or queued for a worker
    pub fn connections(&self) -> usize {
        self.shared.sockets.lock().len()
    }

    /// Live threads of the connection pool, 0 when not started
    pub fn pool_threads(&self) -> usize {
        self.workers.as_ref().map_or(0, |workers| workers.threads())
    }
}

impl Server for BlockingServer {
    fn start(&mut self, addr: SocketAddr, _acceptors: usize, _workers: usize) -> Result<()> {
        if self.acceptor.is_some() {
            return Err(BasaltError::AlreadyRunning);
        }

        let listener = Arc::new(bind_listener(addr, self.ctx.config.backlog)?);
        let local_addr = listener.local_addr()?;

        // every worker is pinned to one client, so the pool never outgrows the connection cap
        let high_watermark = self
            .ctx
            .executor
            .high_watermark
            .min(self.ctx.config.max_connections)
            .max(1);
        let sizing = ExecutorConfig {
            low_watermark: self.ctx.executor.low_watermark.min(high_watermark),
            high_watermark,
            ..self.ctx.executor.clone()
        };
        let workers = Arc::new(Executor::from_config("basalt-conn", &sizing));
        workers.start()?;

        self.shared.running.store(true, Ordering::Release);
        let acceptor = {
            let listener = Arc::clone(&listener);
            let ctx = Arc::clone(&self.ctx);
            let shared = Arc::clone(&self.shared);
            let workers = Arc::clone(&workers);
            thread::Builder::new()
                .name("basalt-accept".to_string())
                .spawn(move || accept_loop(&listener, &ctx, &shared, &workers))
        };
        let acceptor = match acceptor {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                workers.stop(true);
                return Err(e.into());
            }
        };

        self.listener = Some(listener);
        self.workers = Some(workers);
        self.acceptor = Some(acceptor);
        self.local_addr = Some(local_addr);
        info!("Server listening on {} (blocking)", local_addr);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);

        if let Some(listener) = &self.listener
            && let Err(e) = SockRef::from(listener.as_ref()).shutdown(Shutdown::Both)
        {
            // Some platforms refuse to shut down a listening socket; wake accept instead
            debug!("Listener shutdown failed: {}", e);
            if let Some(addr) = self.local_addr {
                let _ = TcpStream::connect(addr);
            }
        }

        for socket in self.shared.sockets.lock().values() {
            let _ = socket.shutdown(Shutdown::Read);
        }
    }

    fn join(&mut self) {
        if let Some(acceptor) = self.acceptor.take()
            && acceptor.join().is_err()
        {
            error!("Accept thread panicked");
        }

        {
            let mut sockets = self.shared.sockets.lock();
            while !sockets.is_empty() {
                self.shared.drained.wait(&mut sockets);
            }
        }

        if let Some(workers) = self.workers.take() {
            workers.stop(true);
        }
        self.listener = None;
    }
}

impl Drop for BlockingServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn accept_loop(listener: &TcpListener, ctx: &Arc<ServerContext>, shared: &Arc<Shared>, workers: &Executor) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.running.load(Ordering::Acquire) {
                    break;
                }
                error!("Accept error: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        let Some(permit) = ctx.limiter.try_acquire() else {
            warn!("Connection limit reached, rejecting connection from {}", peer);
            continue;
        };
        let clone = match stream.try_clone() {
            Ok(clone) => clone,
            Err(e) => {
                warn!(peer = %peer, "Failed to track connection: {}", e);
                continue;
            }
        };

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sockets = shared.sockets.lock();
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            sockets.insert(id, clone);
        }
        let registration = Registration {
            shared: Arc::clone(shared),
            id,
        };

        let task_ctx = Arc::clone(ctx);
        let submitted = workers.execute(move || {
            let _registration = registration;
            let _permit = permit;
            serve(&task_ctx, stream, peer);
        });
        if let Err(e) = submitted {
            // the rejected closure already dropped its registration and permit
            ctx.metrics.rejected_connections.inc();
            warn!("Rejecting connection from {}: {}", peer, e);
        }
    }
    debug!("Accept loop stopped");
}

/// Serve one client until it leaves, times out or misbehaves
fn serve(ctx: &ServerContext, mut stream: TcpStream, peer: SocketAddr) {
    debug!(peer = %peer, "Connection accepted");
    if let Err(e) = stream.set_read_timeout(ctx.config.connection_timeout()) {
        warn!(peer = %peer, "Failed to set receive timeout: {}", e);
    }
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let limit = ctx.config.output_queue_limit;
    let mut session = Session::new(&ctx.config);
    let mut output = VecDeque::new();

    loop {
        let flow = match session.process(ctx, &mut output) {
            Ok(flow) => flow,
            Err(e) => {
                debug!(peer = %peer, "Protocol error: {}", e);
                session.reject(ctx, &e, &mut output);
                Flow::Quit
            }
        };
        let paused = output.len() > limit;
        if let Err(e) = flush(ctx, &mut stream, &mut output) {
            debug!(peer = %peer, "Write error: {}", e);
            return;
        }
        if flow == Flow::Quit {
            break;
        }
        if paused {
            continue;
        }

        match stream.read(session.spare()) {
            Ok(0) => {
                if session.abort() {
                    debug!(peer = %peer, "Peer closed mid-request");
                }
                break;
            }
            Ok(n) => {
                session.commit(n);
                ctx.metrics.bytes_read.inc_by(n as u64);
            }
            Err(ref e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                debug!(peer = %peer, "Closing idle connection");
                break;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(peer = %peer, "Read error: {}", e);
                session.abort();
                session.server_error(&e.to_string(), &mut output);
                let _ = flush(ctx, &mut stream, &mut output);
                break;
            }
        }
    }
    debug!(peer = %peer, "Connection closed");
}

/// Write every queued response, blocking as needed
fn flush(ctx: &ServerContext, stream: &mut TcpStream, output: &mut VecDeque<Bytes>) -> io::Result<()> {
    while !output.is_empty() {
        let slices: Vec<IoSlice<'_>> = output
            .iter()
            .take(MAX_IOVECS)
            .map(|b| IoSlice::new(b))
            .collect();
        let mut written = match stream.write_vectored(&slices) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        ctx.metrics.bytes_written.inc_by(written as u64);

        while written > 0 {
            let Some(front) = output.front_mut() else {
                break;
            };
            if written < front.len() {
                *front = front.slice(written..);
                break;
            }
            written -= front.len();
            output.pop_front();
        }
    }
    Ok(())
}
