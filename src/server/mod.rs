//! TCP servers for the memcached protocol
//!
//! Every network layer drives the same [`Session`] codec; they differ in how
//! sockets are multiplexed onto threads:
//!
//! - [`BlockingServer`]: one pool task per connection, blocking reads
//! - [`StNonblockingServer`]: one reactor thread that also accepts
//! - [`MtNonblockingServer`]: several reactor threads fed by acceptor tasks

mod blocking;
mod connection;
mod handler;
mod limiter;
mod nonblocking;
mod reactor;
mod session;

pub use blocking::BlockingServer;
pub use limiter::{ConnectionLimiter, ConnectionPermit};
pub use nonblocking::{MtNonblockingServer, StNonblockingServer};
pub use session::{Flow, Session};

use crate::config::{Config, ExecutorConfig, NetworkKind, ServerConfig};
use crate::metrics::Metrics;
use crate::storage::Storage;
use crate::{BasaltError, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;

/// Network layer lifecycle
pub trait Server: Send {
    /// Bind `addr` and begin serving.
    ///
    /// `acceptors` and `workers` size the multi-threaded layer; other layers
    /// ignore them. The blocking layer takes its thread bounds from the
    /// `[executor]` section instead.
    fn start(&mut self, addr: SocketAddr, acceptors: usize, workers: usize) -> Result<()>;

    /// Address actually bound, once started
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting and ask live connections to finish
    fn stop(&self);

    /// Wait until every connection is drained and all threads have exited
    fn join(&mut self);
}

/// State shared by every thread of one server
pub struct ServerContext {
    pub config: ServerConfig,
    pub executor: ExecutorConfig,
    pub storage: Arc<dyn Storage>,
    pub metrics: Arc<Metrics>,
    pub limiter: ConnectionLimiter,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        executor: ExecutorConfig,
        storage: Arc<dyn Storage>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = ConnectionLimiter::new(config.max_connections, Arc::clone(&metrics));
        Self {
            config,
            executor,
            storage,
            metrics,
            limiter,
        }
    }
}

/// Create the network layer selected by `kind`
pub fn build(
    kind: NetworkKind,
    config: &Config,
    storage: Arc<dyn Storage>,
    metrics: Arc<Metrics>,
) -> Box<dyn Server> {
    let context = Arc::new(ServerContext::new(
        config.server.clone(),
        config.executor.clone(),
        storage,
        metrics,
    ));
    match kind {
        NetworkKind::Blocking => Box::new(BlockingServer::new(context)),
        NetworkKind::StNonblocking => Box::new(StNonblockingServer::new(context)),
        NetworkKind::MtNonblocking => Box::new(MtNonblockingServer::new(context)),
    }
}

/// Create a listening socket with `SO_REUSEADDR` set
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<std::net::TcpListener> {
    let listen = || -> std::io::Result<std::net::TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog)?;
        Ok(socket.into())
    };
    listen().map_err(|source| BasaltError::Bind { addr, source })
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ThreadSafeLru;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    const KINDS: [NetworkKind; 3] = [
        NetworkKind::Blocking,
        NetworkKind::StNonblocking,
        NetworkKind::MtNonblocking,
    ];

    fn launch(kind: NetworkKind, server: ServerConfig) -> (Box<dyn Server>, Arc<dyn Storage>) {
        let config = Config {
            server,
            ..Default::default()
        };
        let storage: Arc<dyn Storage> = Arc::new(ThreadSafeLru::new(4 * 1024 * 1024));
        let mut srv = build(kind, &config, Arc::clone(&storage), Arc::new(Metrics::new()));
        srv.start("127.0.0.1:0".parse().unwrap(), 2, 3).unwrap();
        (srv, storage)
    }

    fn client(srv: &dyn Server) -> TcpStream {
        let stream = TcpStream::connect(srv.local_addr().unwrap()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    fn expect(stream: &mut TcpStream, expected: &[u8]) {
        let mut reply = vec![0; expected.len()];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(String::from_utf8_lossy(&reply), String::from_utf8_lossy(expected));
    }

    #[test]
    fn test_bind_listener_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bind_listener_reports_address() {
        let taken = bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = taken.local_addr().unwrap();
        // Listening sockets cannot share a port even with SO_REUSEADDR
        match bind_listener(addr, 16) {
            Err(BasaltError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("unexpected: {:?}", other.map(|l| l.local_addr())),
        }
    }

    #[test]
    fn test_argument_split_across_writes() {
        for kind in KINDS {
            let (mut srv, _) = launch(kind, ServerConfig::default());
            let mut c = client(srv.as_ref());

            c.write_all(b"set k 0 0 10\r\n0123").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            c.write_all(b"45678").unwrap();
            std::thread::sleep(Duration::from_millis(20));
            c.write_all(b"9\r\nget k\r\n").unwrap();
            expect(&mut c, b"STORED\r\nVALUE k 0 10\r\n0123456789\r\nEND\r\n");

            srv.stop();
            srv.join();
        }
    }

    #[test]
    fn test_disconnect_mid_argument_stores_nothing() {
        for kind in KINDS {
            let (mut srv, storage) = launch(kind, ServerConfig::default());
            let mut c = client(srv.as_ref());
            c.write_all(b"set half 0 0 10\r\n01234").unwrap();
            drop(c);

            let mut probe = client(srv.as_ref());
            probe.write_all(b"version\r\n").unwrap();
            let mut line = [0u8; 8];
            probe.read_exact(&mut line).unwrap();
            assert_eq!(&line, b"VERSION ");
            assert!(storage.get(b"half").is_none(), "{kind:?}");

            srv.stop();
            srv.join();
        }
    }

    #[test]
    fn test_slow_consumer_loses_nothing() {
        const VALUE_LEN: usize = 64 * 1024;
        const GETS: usize = 200;

        for kind in KINDS {
            let config = ServerConfig {
                output_queue_limit: 8,
                ..Default::default()
            };
            let (mut srv, _) = launch(kind, config);
            let mut c = client(srv.as_ref());

            let value = vec![b'v'; VALUE_LEN];
            c.write_all(format!("set big 0 0 {VALUE_LEN}\r\n").as_bytes()).unwrap();
            c.write_all(&value).unwrap();
            c.write_all(b"\r\n").unwrap();
            expect(&mut c, b"STORED\r\n");

            c.write_all(&b"get big\r\n".repeat(GETS)).unwrap();
            std::thread::sleep(Duration::from_millis(100));

            let header = format!("VALUE big 0 {VALUE_LEN}\r\n");
            let per_reply = header.len() + VALUE_LEN + b"\r\nEND\r\n".len();
            let mut all = vec![0; per_reply * GETS];
            c.read_exact(&mut all).unwrap();
            for reply in all.chunks(per_reply) {
                assert!(reply.starts_with(header.as_bytes()), "{kind:?}");
                assert!(reply.ends_with(b"\r\nEND\r\n"), "{kind:?}");
            }

            srv.stop();
            srv.join();
        }
    }

    fn put_get_client(addr: SocketAddr, id: usize) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let mut c = TcpStream::connect(addr).unwrap();
            c.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
            for i in 0..50 {
                let key = format!("c{id}-{i}");
                c.write_all(format!("set {key} 0 0 2\r\nok\r\nget {key}\r\n").as_bytes())
                    .unwrap();
                let expected = format!("STORED\r\nVALUE {key} 0 2\r\nok\r\nEND\r\n");
                expect(&mut c, expected.as_bytes());
            }
        })
    }

    #[test]
    fn test_concurrent_clients() {
        const CLIENTS: usize = 24;

        for kind in KINDS {
            let (mut srv, storage) = launch(kind, ServerConfig::default());
            let addr = srv.local_addr().unwrap();

            let clients: Vec<_> = (0..CLIENTS).map(|id| put_get_client(addr, id)).collect();
            for client in clients {
                client.join().unwrap();
            }
            for id in 0..CLIENTS {
                let key = format!("c{id}-49");
                assert_eq!(storage.get(key.as_bytes()).as_deref(), Some(&b"ok"[..]), "{kind:?}");
            }

            srv.stop();
            srv.join();
        }
    }

    #[test]
    fn test_blocking_pool_settles_to_low_watermark() {
        const CLIENTS: usize = 24;

        let storage: Arc<dyn Storage> = Arc::new(ThreadSafeLru::new(4 * 1024 * 1024));
        let executor = ExecutorConfig {
            low_watermark: 4,
            high_watermark: 16,
            max_queue_size: 64,
            idle_time_ms: 100,
        };
        let ctx = Arc::new(ServerContext::new(
            ServerConfig::default(),
            executor,
            Arc::clone(&storage),
            Arc::new(Metrics::new()),
        ));
        let mut srv = BlockingServer::new(ctx);
        srv.start("127.0.0.1:0".parse().unwrap(), 1, 1).unwrap();
        assert_eq!(srv.pool_threads(), 4);
        let addr = srv.local_addr().unwrap();

        let clients: Vec<_> = (0..CLIENTS).map(|id| put_get_client(addr, id)).collect();
        let mut peak = 0;
        while clients.iter().any(|c| !c.is_finished()) {
            peak = peak.max(srv.pool_threads());
            std::thread::sleep(Duration::from_millis(5));
        }
        for client in clients {
            client.join().unwrap();
        }
        // grown workers linger for idle_time after their client leaves
        peak = peak.max(srv.pool_threads());
        assert!(peak > 4, "pool never grew past the low watermark");
        assert!(peak <= 16);
        for id in 0..CLIENTS {
            let key = format!("c{id}-49");
            assert_eq!(storage.get(key.as_bytes()).as_deref(), Some(&b"ok"[..]));
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while srv.pool_threads() != 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(srv.pool_threads(), 4);

        srv.stop();
        srv.join();
        assert_eq!(srv.pool_threads(), 0);
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        for kind in KINDS {
            let (mut srv, _) = launch(kind, ServerConfig::default());
            let mut c = client(srv.as_ref());

            c.write_all(b"set k 0 0 3\r\nabcdef\r\n").unwrap();
            let mut rest = Vec::new();
            c.read_to_end(&mut rest).unwrap();
            assert!(rest.starts_with(b"CLIENT_ERROR"), "{kind:?}");

            srv.stop();
            srv.join();
        }
    }

    #[test]
    fn test_start_twice_is_rejected() {
        for kind in KINDS {
            let (mut srv, _) = launch(kind, ServerConfig::default());
            assert!(srv.start("127.0.0.1:0".parse().unwrap(), 1, 1).is_err());
            srv.stop();
            srv.join();
        }
    }
}
