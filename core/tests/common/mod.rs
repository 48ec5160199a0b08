//! Shared helpers for sshpool integration tests.
//!
//! The SSH tests need two OpenSSH containers on 127.0.0.1: a password-auth
//! server on port 2201 and a tunnel host on port 2207 that allows TCP
//! forwarding and serves HTTP on its internal port 8080 and a TCP echo on
//! 9090. Both accept `testuser` / `testpass`. Tests skip themselves when the
//! containers are not reachable.

// Each integration test is compiled as its own crate, so not every test file
// uses every helper from this module.
#![allow(dead_code)]

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sshpool_core::errors::BoxError;
use sshpool_core::ConnectionPool;

/// Check if a TCP port is reachable on the given host within 2 seconds.
pub fn is_port_reachable(host: &str, port: u16) -> bool {
    let addr = format!("{host}:{port}");
    if let Ok(addr) = addr.parse() {
        TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok()
    } else {
        false
    }
}

/// Skip the current test if a container is not reachable on the given port.
macro_rules! require_docker {
    ($port:expr) => {
        if !common::is_port_reachable("127.0.0.1", $port) {
            eprintln!(
                "SKIPPED: SSH test container not reachable on port {}",
                $port
            );
            return;
        }
    };
}
pub(crate) use require_docker;

/// Pool stand-in that remembers the connection string it was given.
#[derive(Clone, Default)]
pub struct UrlRecorder {
    pub url: Arc<Mutex<Option<String>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl UrlRecorder {
    pub fn url(&self) -> Option<String> {
        self.url.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl ConnectionPool for UrlRecorder {
    fn set_url(&mut self, url: &str) -> Result<(), BoxError> {
        *self.url.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<(), BoxError> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

pub const TEST_USER: &str = "testuser";
pub const TEST_PASSWORD: &str = "testpass";

/// Password-auth SSH server.
pub const PORT_SSH_PASSWORD: u16 = 2201;
/// SSH server with internal HTTP (8080) and echo (9090) services.
pub const PORT_SSH_TUNNEL: u16 = 2207;
/// Internal HTTP service on the tunnel container.
pub const TUNNEL_HTTP_PORT: u16 = 8080;
/// Internal TCP echo service on the tunnel container.
pub const TUNNEL_ECHO_PORT: u16 = 9090;
