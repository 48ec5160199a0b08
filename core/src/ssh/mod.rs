//! SSH transport used as a tunnel carrier.
//!
//! The data source only needs two things from an SSH stack: open a local
//! port forward, and close the session. [`SshTransport`] and [`PortForward`]
//! capture that; [`Ssh2Transport`] implements them with libssh2 when the
//! `ssh` feature is enabled.

#[cfg(feature = "ssh")]
pub mod auth;
#[cfg(feature = "ssh")]
pub mod forward;

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;

#[cfg(feature = "ssh")]
pub use self::ssh2_transport::Ssh2Transport;

/// One local-to-remote forward: `127.0.0.1:local_port` relays to
/// `remote_host:remote_port` as resolved by the SSH server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardBinding {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl ForwardBinding {
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Traffic counters for a running forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u32,
    pub total_connections: u64,
}

/// A running port forward. Dropping it must release the local port.
pub trait PortForward: Send {
    fn local_port(&self) -> u16;

    fn stats(&self) -> ForwardStats;

    /// Stop accepting connections and release the local port.
    fn stop(&mut self);
}

/// An established, authenticated SSH session.
pub trait SshTransport: Send {
    type Forward: PortForward;

    /// Start forwarding `binding.local_port` to the binding's remote end.
    fn open_local_forward(&mut self, binding: &ForwardBinding)
        -> Result<Self::Forward, SessionError>;

    /// Terminate the session.
    fn close(&mut self) -> Result<(), SessionError>;
}

#[cfg(feature = "ssh")]
mod ssh2_transport {
    use std::io;
    use std::sync::{Arc, Mutex};

    use super::auth::connect_and_authenticate;
    use super::forward::LocalForwarder;
    use super::{ForwardBinding, SshTransport};
    use crate::config::{Credential, SshAuth};
    use crate::errors::SessionError;

    /// [`SshTransport`] over a blocking libssh2 session.
    pub struct Ssh2Transport {
        session: Arc<Mutex<ssh2::Session>>,
    }

    impl Ssh2Transport {
        /// Connect and authenticate. Blocks until the server answers or the
        /// OS connect timeout fires.
        pub fn connect(
            credential: &Credential,
            port: u16,
            auth: &SshAuth,
        ) -> Result<Self, SessionError> {
            let session = connect_and_authenticate(credential, port, auth)?;
            Ok(Self::from_session(session))
        }

        /// Wrap a session that is already authenticated.
        pub fn from_session(session: ssh2::Session) -> Self {
            Self {
                session: Arc::new(Mutex::new(session)),
            }
        }
    }

    impl SshTransport for Ssh2Transport {
        type Forward = LocalForwarder;

        fn open_local_forward(
            &mut self,
            binding: &ForwardBinding,
        ) -> Result<LocalForwarder, SessionError> {
            LocalForwarder::start(binding, Arc::clone(&self.session))
        }

        fn close(&mut self) -> Result<(), SessionError> {
            let session = self.session.lock().map_err(|e| {
                SessionError::Io(io::Error::other(format!("SSH session lock poisoned: {e}")))
            })?;
            // Relays leave the session in polling mode.
            session.set_blocking(true);
            session
                .disconnect(None, "closing data source", None)
                .map_err(|e| SessionError::Io(e.into()))
        }
    }
}
