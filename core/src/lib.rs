//! Database connection pools reached through an SSH local port forward.
//!
//! [`TunnelingDataSource`] opens an SSH session to a bastion host, forwards a
//! free local port to the database behind it, and points a wrapped
//! [`ConnectionPool`] at `localhost:<port>` with an engine-specific
//! connection string.

pub mod config;
pub mod datasource;
pub mod engine;
pub mod errors;
pub mod pool;
pub mod port;
pub mod ssh;

pub use config::{Credential, DataSourceConfig, DatabaseTarget, SshAuth};
#[cfg(feature = "ssh")]
pub use datasource::SshDataSource;
pub use datasource::TunnelingDataSource;
pub use engine::EngineKind;
pub use errors::{CoreError, PoolError, SessionError};
pub use pool::ConnectionPool;
pub use ssh::{ForwardBinding, ForwardStats, PortForward, SshTransport};
