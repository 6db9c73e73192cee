//! # Basalt
//!
//! In-memory, memcached-compatible key-value server.
//!
//! ## Features
//!
//! - Memcached ASCII protocol subset (get/gets, set, add, replace, append,
//!   prepend, delete, incr, decr, version, quit)
//! - Byte-bounded LRU storage, optionally striped over independent locks
//! - Three network layers: thread-per-connection, single reactor, and
//!   multiple reactors fed by acceptor tasks
//! - Elastic thread pool with low/high watermarks and a bounded queue
//! - Prometheus metrics and health check endpoints
//!
//! ## Example
//!
//! ```ignore
//! use basalt::config::Config;
//! use basalt::metrics::Metrics;
//! use basalt::{server, storage};
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let storage = storage::open(&config.storage)?;
//! let mut server = server::build(config.server.network, &config, storage, Arc::new(Metrics::new()));
//! server.start("127.0.0.1:11211".parse()?, 1, 4)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  listener ──▶ acceptor tasks ──inbox+waker──▶ reactor threads ──▶ Connection
//!              (Executor)                       (mio Poll, Slab)     │ Session: parse → execute
//!                                                                    ▼
//!                                                              Storage (LRU stripes)
//! ```

// Modules
pub mod concurrency;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod prelude;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use error::{BasaltError, ExecutorError, ProtocolError, Result, StorageError, SubmitError};
