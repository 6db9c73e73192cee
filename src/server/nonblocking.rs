//! Readiness-based network layers

use super::reactor::{LISTENER, Reactor, ReactorHandle, WAKER};
use super::{Server, ServerContext, bind_listener};
use crate::concurrency::Executor;
use crate::config::Placement;
use crate::{BasaltError, Result};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// One reactor thread that accepts and serves every connection
pub struct StNonblockingServer {
    ctx: Arc<ServerContext>,
    local_addr: Option<SocketAddr>,
    reactor: Option<Arc<ReactorHandle>>,
    thread: Option<JoinHandle<()>>,
}

impl StNonblockingServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            local_addr: None,
            reactor: None,
            thread: None,
        }
    }
}

impl Server for StNonblockingServer {
    fn start(&mut self, addr: SocketAddr, _acceptors: usize, _workers: usize) -> Result<()> {
        if self.thread.is_some() {
            return Err(BasaltError::AlreadyRunning);
        }

        let listener = bind_listener(addr, self.ctx.config.backlog)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let reactor = Reactor::new(
            "basalt-reactor",
            Arc::clone(&self.ctx),
            Some(TcpListener::from_std(listener)),
        )?;
        self.reactor = Some(reactor.handle());
        self.thread = Some(
            thread::Builder::new()
                .name("basalt-reactor".to_string())
                .spawn(move || reactor.run())?,
        );
        self.local_addr = Some(local_addr);

        info!("Server listening on {} (st_nonblocking)", local_addr);
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn stop(&self) {
        if let Some(reactor) = &self.reactor {
            reactor.shutdown();
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Reactor thread panicked");
        }
        self.reactor = None;
    }
}

impl Drop for StNonblockingServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Reactor threads fed by acceptor loops running on an [`Executor`]
pub struct MtNonblockingServer {
    ctx: Arc<ServerContext>,
    local_addr: Option<SocketAddr>,
    running: Arc<AtomicBool>,
    reactors: Vec<Arc<ReactorHandle>>,
    threads: Vec<JoinHandle<()>>,
    acceptors: Option<Executor>,
    acceptor_wakers: Vec<Arc<Waker>>,
}

impl MtNonblockingServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            local_addr: None,
            running: Arc::new(AtomicBool::new(false)),
            reactors: Vec::new(),
            threads: Vec::new(),
            acceptors: None,
            acceptor_wakers: Vec::new(),
        }
    }

    fn launch(&mut self, addr: SocketAddr, acceptors: usize, workers: usize) -> Result<()> {
        let listener = bind_listener(addr, self.ctx.config.backlog)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::Release);

        for id in 0..workers {
            let name = format!("basalt-reactor-{id}");
            let reactor = Reactor::new(name.clone(), Arc::clone(&self.ctx), None)?;
            self.reactors.push(reactor.handle());
            self.threads
                .push(thread::Builder::new().name(name).spawn(move || reactor.run())?);
        }

        let balancer = Arc::new(Balancer::new(self.reactors.clone(), self.ctx.config.placement));
        let pool = Executor::new(
            "basalt-acceptor",
            acceptors,
            acceptors,
            acceptors,
            self.ctx.executor.idle_time(),
        );
        pool.start()?;
        let pool = self.acceptors.insert(pool);

        for id in 0..acceptors {
            let acceptor = Acceptor::new(
                id,
                listener.try_clone()?,
                Arc::clone(&self.ctx),
                Arc::clone(&balancer),
                Arc::clone(&self.running),
            )?;
            self.acceptor_wakers.push(Arc::clone(&acceptor.waker));
            pool.execute(move || acceptor.run())?;
        }

        self.local_addr = Some(local_addr);
        info!(
            acceptors,
            workers,
            "Server listening on {} (mt_nonblocking)", local_addr
        );
        Ok(())
    }
}

impl Server for MtNonblockingServer {
    fn start(&mut self, addr: SocketAddr, acceptors: usize, workers: usize) -> Result<()> {
        if !self.threads.is_empty() || self.acceptors.is_some() {
            return Err(BasaltError::AlreadyRunning);
        }

        let result = self.launch(addr, acceptors.max(1), workers.max(1));
        if result.is_err() {
            self.stop();
            self.join();
        }
        result
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for waker in &self.acceptor_wakers {
            if let Err(e) = waker.wake() {
                error!("Failed to wake acceptor: {}", e);
            }
        }
        // acceptors are gone before reactors stop taking hand-offs
        if let Some(pool) = &self.acceptors {
            pool.stop(true);
        }
        for reactor in &self.reactors {
            reactor.shutdown();
        }
    }

    fn join(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("Reactor thread panicked");
            }
        }
        if let Some(pool) = self.acceptors.take() {
            pool.stop(true);
        }
        self.acceptor_wakers.clear();
        self.reactors.clear();
    }
}

impl Drop for MtNonblockingServer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Picks the reactor that receives an accepted socket
struct Balancer {
    reactors: Vec<Arc<ReactorHandle>>,
    placement: Placement,
    next: AtomicUsize,
}

impl Balancer {
    fn new(reactors: Vec<Arc<ReactorHandle>>, placement: Placement) -> Self {
        Self {
            reactors,
            placement,
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> &ReactorHandle {
        let index = match self.placement {
            Placement::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len(),
            Placement::LeastLoaded => (0..self.reactors.len())
                .min_by_key(|&i| self.reactors[i].load())
                .unwrap_or(0),
        };
        &self.reactors[index]
    }
}

/// Accept loop with its own poll, run as a pool task
struct Acceptor {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    ctx: Arc<ServerContext>,
    balancer: Arc<Balancer>,
    running: Arc<AtomicBool>,
}

impl Acceptor {
    fn new(
        id: usize,
        listener: std::net::TcpListener,
        ctx: Arc<ServerContext>,
        balancer: Arc<Balancer>,
        running: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            id,
            poll,
            listener,
            waker,
            ctx,
            balancer,
            running,
        })
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        debug!(acceptor = self.id, "Acceptor started");

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(acceptor = self.id, "Poll failed: {}", e);
                break;
            }
            if events.iter().any(|event| event.token() == LISTENER) {
                self.accept();
            }
        }

        debug!(acceptor = self.id, "Acceptor stopped");
    }

    fn accept(&self) {
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer)) => match self.ctx.limiter.try_acquire() {
                    Some(permit) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        self.balancer.pick().assign(stream, peer, permit);
                    }
                    None => {
                        warn!("Connection limit reached, rejecting connection from {}", peer);
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(acceptor = self.id, "Accept error: {}", e);
                    return;
                }
            }
        }
    }
}
