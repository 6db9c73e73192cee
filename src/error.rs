//! Error types for Basalt

use std::net::SocketAddr;
use thiserror::Error;

/// Main error type for Basalt
#[derive(Error, Debug)]
pub enum BasaltError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Task rejected: {0}")]
    Submit(#[from] SubmitError),

    #[error("Server is already running")]
    AlreadyRunning,
}

/// Protocol parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid flags")]
    InvalidFlags,

    #[error("Invalid exptime")]
    InvalidExptime,

    #[error("Invalid bytes length")]
    InvalidBytesLength,

    #[error("invalid numeric delta argument")]
    InvalidNumericValue,

    #[error("Key too long (max 250 bytes)")]
    KeyTooLong,

    #[error("object too large for cache")]
    ValueTooLarge,

    #[error("line too long")]
    LineTooLong,

    #[error("bad data chunk")]
    BadDataChunk,
}

/// Storage layer errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("cannot increment or decrement non-numeric value")]
    NotNumeric,

    #[error("stripe size {stripe_size} is below the minimum of {min} bytes")]
    StripeTooSmall { stripe_size: usize, min: usize },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Thread pool lifecycle errors
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("executor is already running")]
    AlreadyRunning,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Reasons a task was not accepted by the pool
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("executor is not running")]
    NotRunning,

    #[error("task queue is full")]
    QueueFull,
}

pub type Result<T> = std::result::Result<T, BasaltError>;
