use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ssh2::Session;

use super::{ForwardBinding, ForwardStats, PortForward};
use crate::errors::SessionError;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const RELAY_IDLE: Duration = Duration::from_millis(10);

/// A local port forward: `127.0.0.1:<local_port>` relayed through the SSH
/// session to the binding's remote host and port.
///
/// The same port is also bound on `::1` when the host has an IPv6 loopback,
/// so drivers that resolve `localhost` to `::1` first connect directly.
///
/// An accept thread hands every inbound connection to its own relay thread,
/// which owns one `direct-tcpip` channel for the connection's lifetime.
pub struct LocalForwarder {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    listener_thread: Option<thread::JoinHandle<()>>,
    counters: Arc<ForwardCounters>,
}

/// Atomic traffic counters shared with the relay threads.
#[derive(Default)]
struct ForwardCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    active_connections: AtomicU32,
    total_connections: AtomicU64,
}

impl ForwardCounters {
    fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
        }
    }

    fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}

impl LocalForwarder {
    /// Bind the local end of `binding` and start accepting connections.
    pub fn start(
        binding: &ForwardBinding,
        session: Arc<Mutex<Session>>,
    ) -> Result<Self, SessionError> {
        let forward_failed = |e: io::Error| SessionError::ForwardFailed {
            local_port: binding.local_port,
            remote: binding.remote_addr(),
            reason: e.to_string(),
        };

        let mut listeners = vec![
            TcpListener::bind((Ipv4Addr::LOCALHOST, binding.local_port)).map_err(forward_failed)?,
        ];
        match TcpListener::bind((Ipv6Addr::LOCALHOST, binding.local_port)) {
            Ok(listener) => listeners.push(listener),
            Err(e) => tracing::debug!(
                "Forward on port {} stays IPv4-only: {}",
                binding.local_port,
                e
            ),
        }
        for listener in &listeners {
            listener.set_nonblocking(true).map_err(forward_failed)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(ForwardCounters::default());

        let remote_host = binding.remote_host.clone();
        let remote_port = binding.remote_port;
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_counters = Arc::clone(&counters);

        let listener_thread = thread::Builder::new()
            .name(format!("forward-{}", binding.local_port))
            .spawn(move || {
                accept_loop(
                    listeners,
                    session,
                    &remote_host,
                    remote_port,
                    accept_shutdown,
                    accept_counters,
                );
            })
            .map_err(forward_failed)?;

        tracing::info!(
            "Forwarding 127.0.0.1:{} -> {}",
            binding.local_port,
            binding.remote_addr()
        );

        Ok(Self {
            local_port: binding.local_port,
            shutdown,
            listener_thread: Some(listener_thread),
            counters,
        })
    }
}

impl PortForward for LocalForwarder {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }

    /// Stop accepting and wait for the accept thread. Relay threads notice
    /// the shutdown flag on their next poll.
    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener_thread.take() {
            let _ = handle.join();
            tracing::debug!("Stopped forward on 127.0.0.1:{}", self.local_port);
        }
    }
}

impl Drop for LocalForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listeners: Vec<TcpListener>,
    session: Arc<Mutex<Session>>,
    remote_host: &str,
    remote_port: u16,
    shutdown: Arc<AtomicBool>,
    counters: Arc<ForwardCounters>,
) {
    'accept: while !shutdown.load(Ordering::Relaxed) {
        let mut accepted = false;
        for listener in &listeners {
            match listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted tunnel connection from {}", peer);
                    counters.connection_opened();
                    accepted = true;

                    let session = Arc::clone(&session);
                    let remote_host = remote_host.to_string();
                    let shutdown = Arc::clone(&shutdown);
                    let counters = Arc::clone(&counters);

                    thread::spawn(move || {
                        relay_connection(
                            stream,
                            &session,
                            &remote_host,
                            remote_port,
                            &shutdown,
                            &counters,
                        );
                        counters.connection_closed();
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    if !shutdown.load(Ordering::Relaxed) {
                        tracing::error!("Forward accept error: {}", e);
                    }
                    break 'accept;
                }
            }
        }
        if !accepted {
            thread::sleep(ACCEPT_POLL);
        }
    }
}

/// Shuttle bytes between one local TCP connection and one SSH channel.
///
/// Both ends run non-blocking and are polled from this thread. Every channel
/// operation happens under the session lock because libssh2 sessions are
/// not safe for concurrent use, but the lock is held for a single read or
/// write attempt only. Data a peer cannot take yet waits in a pending buffer
/// while the other direction keeps flowing.
fn relay_connection(
    mut tcp: TcpStream,
    session: &Mutex<Session>,
    remote_host: &str,
    remote_port: u16,
    shutdown: &AtomicBool,
    counters: &ForwardCounters,
) {
    if tcp.set_nonblocking(true).is_err() {
        return;
    }

    let mut channel = {
        let Ok(sess) = session.lock() else {
            return;
        };
        // Open in blocking mode, then switch the session to polling.
        sess.set_blocking(true);
        let opened = sess.channel_direct_tcpip(remote_host, remote_port, None);
        sess.set_blocking(false);
        match opened {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(
                    "Failed to open direct-tcpip channel to {}:{}: {}",
                    remote_host,
                    remote_port,
                    e
                );
                return;
            }
        }
    };

    let mut buf = [0u8; 8192];
    let mut to_remote: Vec<u8> = Vec::new();
    let mut to_local: Vec<u8> = Vec::new();
    let mut tcp_eof = false;
    let mut ssh_eof = false;
    let mut eof_sent = false;
    let mut local_closed = false;

    while !shutdown.load(Ordering::Relaxed) && !(eof_sent && local_closed) {
        let mut did_work = false;

        // local -> remote
        if to_remote.is_empty() && !tcp_eof {
            match tcp.read(&mut buf) {
                Ok(0) => tcp_eof = true,
                Ok(n) => {
                    to_remote.extend_from_slice(&buf[..n]);
                    did_work = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => tcp_eof = true,
            }
        }
        if !to_remote.is_empty() {
            match flush_pending_locked(&mut channel, &mut to_remote, session) {
                Ok(0) => {}
                Ok(n) => {
                    counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                    did_work = true;
                }
                Err(_) => break,
            }
        }
        if tcp_eof && to_remote.is_empty() && !eof_sent {
            if let Ok(_sess) = session.lock() {
                let _ = channel.send_eof();
            }
            eof_sent = true;
        }

        // remote -> local
        if to_local.is_empty() && !ssh_eof {
            let read = match session.lock() {
                Ok(_sess) => channel.read(&mut buf),
                Err(_) => break,
            };
            match read {
                Ok(0) => ssh_eof = true,
                Ok(n) => {
                    to_local.extend_from_slice(&buf[..n]);
                    did_work = true;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => ssh_eof = true,
            }
        }
        if !to_local.is_empty() {
            match flush_pending(&mut tcp, &mut to_local) {
                Ok(0) => {}
                Ok(n) => {
                    counters
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    did_work = true;
                }
                Err(_) => break,
            }
        }
        if ssh_eof && to_local.is_empty() && !local_closed {
            // Pass the remote close on so the local client sees EOF.
            let _ = tcp.shutdown(Shutdown::Write);
            local_closed = true;
        }

        if !did_work {
            thread::sleep(RELAY_IDLE);
        }
    }

    if let Ok(_sess) = session.lock() {
        let _ = channel.close();
    }
    let _ = tcp.shutdown(Shutdown::Both);
}

/// One write attempt of `pending` to a non-blocking writer. The written
/// prefix is removed from `pending`; `WouldBlock` writes nothing and
/// returns `Ok(0)`.
fn flush_pending<W: Write>(writer: &mut W, pending: &mut Vec<u8>) -> io::Result<usize> {
    match writer.write(pending) {
        Ok(0) => Err(io::ErrorKind::WriteZero.into()),
        Ok(n) => {
            pending.drain(..n);
            Ok(n)
        }
        Err(ref e)
            if matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// [`flush_pending`] while holding `lock`. The guard is released before
/// returning, so a blocked writer never keeps the lock across a retry.
fn flush_pending_locked<W: Write, G>(
    writer: &mut W,
    pending: &mut Vec<u8>,
    lock: &Mutex<G>,
) -> io::Result<usize> {
    let _guard = lock
        .lock()
        .map_err(|_| io::Error::other("SSH session lock poisoned"))?;
    flush_pending(writer, pending)
}
