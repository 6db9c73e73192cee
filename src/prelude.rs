//! Prelude module for common imports.
//!
//! ```ignore
//! use basalt::prelude::*;
//! ```

// Error types
pub use crate::error::{BasaltError, ExecutorError, ProtocolError, Result, StorageError, SubmitError};

// Configuration
pub use crate::config::{
    Config, ExecutorConfig, MetricsConfig, NetworkKind, Placement, ServerConfig, StorageConfig,
};

// Thread pool
pub use crate::concurrency::Executor;

// Storage
pub use crate::storage::{SimpleLru, Storage, StripedLru, ThreadSafeLru};

// Protocol
pub use crate::protocol::{Command, Parser, ResponseWriter};

// Metrics
pub use crate::metrics::Metrics;

// Server
pub use crate::server::{Server, ServerContext};

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
