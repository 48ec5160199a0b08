//! Error types for the sshpool core crate.
//!
//! [`CoreError`] is what every public operation returns. SSH transport
//! failures are grouped under [`SessionError`] and failures raised by the
//! wrapped connection pool under [`PoolError`].

use std::path::PathBuf;

use thiserror::Error;

/// Boxed error raised by an external collaborator (the connection pool).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level error type for data source operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// The `user@host` string could not be split into a credential.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// A port number was outside its accepted range.
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// Establishing or using the SSH session failed.
    #[error("SSH session error: {0}")]
    Session(#[from] SessionError),

    /// The wrapped connection pool rejected an operation.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// The caller used an operation the data source deliberately vetoes.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A database engine name did not match any supported engine.
    #[error("Unknown database engine: {0}")]
    UnknownEngine(String),

    /// No bindable local port was found within the retry budget.
    #[error("No free local port found after {attempts} attempts")]
    PortExhausted { attempts: u32 },

    /// The data source was already closed.
    #[error("Data source is closed")]
    Closed,

    /// A configuration file could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),
}

/// Errors raised while connecting, authenticating or forwarding over SSH.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The TCP connection to the SSH server could not be opened.
    #[error("Connection to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// The SSH handshake failed after the TCP connection was up.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server refused the supplied credentials.
    #[error("Authentication failed for {user}: {reason}")]
    AuthFailed { user: String, reason: String },

    /// The private key file does not exist.
    #[error("Key file not found: {}", .0.display())]
    KeyNotFound(PathBuf),

    /// The private key file exists but could not be used.
    #[error("Key rejected: {0}")]
    KeyRejected(String),

    /// The local port forward could not be set up.
    #[error("Port forward 127.0.0.1:{local_port} -> {remote} failed: {reason}")]
    ForwardFailed {
        local_port: u16,
        remote: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The pool step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStep {
    SetUrl,
    Close,
}

impl std::fmt::Display for PoolStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStep::SetUrl => f.write_str("set_url"),
            PoolStep::Close => f.write_str("close"),
        }
    }
}

/// An error raised by the wrapped connection pool.
#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct PoolError {
    pub step: PoolStep,
    #[source]
    pub source: BoxError,
}

impl PoolError {
    pub fn new(step: PoolStep, source: BoxError) -> Self {
        Self { step, source }
    }
}
