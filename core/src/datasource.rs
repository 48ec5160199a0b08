//! A connection pool whose physical connections run through an SSH tunnel.
//!
//! The path of every pooled connection is
//! `caller -> pool -> 127.0.0.1:<free port> -> SSH session -> database`.
//! The data source owns the SSH session and the forward; everything about
//! borrowing and returning connections stays with the wrapped pool.

use tracing::Span;

use crate::config::{default_remote_host, Credential, DatabaseTarget};
use crate::engine::EngineKind;
use crate::errors::{CoreError, PoolError, PoolStep};
use crate::pool::ConnectionPool;
use crate::port::{acquire_free_port, DEFAULT_PORT_ATTEMPTS};
use crate::ssh::{ForwardBinding, ForwardStats, PortForward, SshTransport};

#[cfg(feature = "ssh")]
use crate::config::{default_ssh_port, validate_ssh_port, DataSourceConfig, SshAuth};
#[cfg(feature = "ssh")]
use crate::ssh::Ssh2Transport;

/// [`TunnelingDataSource`] over a libssh2 session.
#[cfg(feature = "ssh")]
pub type SshDataSource<P> = TunnelingDataSource<P, Ssh2Transport>;

/// Wraps a connection pool so that it reaches its database through an SSH
/// local port forward.
///
/// Lifecycle: the SSH session exists from construction; the forward and the
/// pool's connection string are installed by [`configure_target`]; [`close`]
/// tears down the pool, the forward and the session in that order. After
/// `close` every operation except `close` itself fails with
/// [`CoreError::Closed`].
///
/// Not synchronized: calls that reconfigure the tunnel need `&mut self`.
///
/// [`configure_target`]: TunnelingDataSource::configure_target
/// [`close`]: TunnelingDataSource::close
pub struct TunnelingDataSource<P: ConnectionPool, T: SshTransport> {
    credential: Credential,
    remote_host: String,
    port_attempts: u32,
    pool: P,
    /// `None` once closed.
    transport: Option<T>,
    forward: Option<T::Forward>,
    binding: Option<ForwardBinding>,
    connection_string: Option<String>,
    span: Span,
}

#[cfg(feature = "ssh")]
impl<P: ConnectionPool> TunnelingDataSource<P, Ssh2Transport> {
    /// Open and authenticate an SSH session to the host in `credential`
    /// (`user@host`) and wrap `pool` around it.
    ///
    /// Input is validated before any network I/O. Connection and
    /// authentication failures are returned, so a data source never exists
    /// without a live session. The session span is created as a child of
    /// the caller's current span.
    pub fn connect(
        credential: &str,
        ssh_port: u16,
        auth: SshAuth,
        pool: P,
    ) -> Result<Self, CoreError> {
        let credential = Credential::parse(credential)?;
        let ssh_port = validate_ssh_port(ssh_port)?;
        let auth = auth.resolve()?;

        let span = tracing::info_span!(
            "ssh_datasource",
            user = %credential.username,
            host = %credential.host,
            port = ssh_port,
        );
        let transport = span
            .in_scope(|| {
                tracing::info!(method = auth.method_name(), "Opening SSH session");
                Ssh2Transport::connect(&credential, ssh_port, &auth)
            })
            .map_err(|e| {
                span.in_scope(|| tracing::error!("Error establishing SSH connection: {}", e));
                e
            })?;

        Ok(Self::with_transport(credential, transport, pool).with_span(span))
    }

    /// [`connect`](Self::connect) on the standard SSH port 22.
    pub fn connect_default_port(credential: &str, auth: SshAuth, pool: P) -> Result<Self, CoreError> {
        Self::connect(credential, default_ssh_port(), auth, pool)
    }

    /// Connect and configure the target described by `config` in one step.
    pub fn from_config(config: &DataSourceConfig, pool: P) -> Result<Self, CoreError> {
        config.validate()?;
        let mut source = Self::connect(
            &config.ssh.target,
            config.ssh.port,
            config.ssh.auth.clone(),
            pool,
        )?
        .with_port_attempts(config.port_attempts);
        source.configure(&config.database)?;
        Ok(source)
    }
}

impl<P: ConnectionPool, T: SshTransport> TunnelingDataSource<P, T> {
    /// Assemble a data source around an already authenticated transport.
    pub fn with_transport(credential: Credential, transport: T, pool: P) -> Self {
        let span = tracing::info_span!(
            "ssh_datasource",
            user = %credential.username,
            host = %credential.host,
        );
        Self {
            credential,
            remote_host: default_remote_host(),
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            pool,
            transport: Some(transport),
            forward: None,
            binding: None,
            connection_string: None,
            span,
        }
    }

    /// Emit all further log events of this data source inside `span`.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Retry budget for the free local port search.
    pub fn with_port_attempts(mut self, attempts: u32) -> Self {
        self.port_attempts = attempts;
        self
    }

    /// Set the database host as seen from the SSH server. Defaults to
    /// `localhost`, i.e. the database runs on the SSH host itself.
    ///
    /// Takes effect on the next [`configure_target`](Self::configure_target).
    pub fn set_remote_host(&mut self, host: impl Into<String>) -> Result<(), CoreError> {
        self.ensure_open()?;
        self.remote_host = host.into();
        Ok(())
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Forward a free local port to `remote_host:remote_port` and point the
    /// pool at it with the engine's connection string.
    ///
    /// On a repeated call the previous forward keeps running until the new
    /// one is live and the pool has accepted the new connection string; it
    /// is stopped afterwards. On failure the previous state is untouched.
    pub fn configure_target(
        &mut self,
        engine: EngineKind,
        remote_port: u16,
        database: Option<&str>,
    ) -> Result<ForwardBinding, CoreError> {
        let span = self.span.clone();
        let _enter = span.enter();

        self.ensure_open()?;
        if remote_port == 0 {
            return Err(CoreError::InvalidPort(
                "database port must be between 1 and 65535".to_string(),
            ));
        }

        let local_port = acquire_free_port(self.port_attempts).inspect_err(|e| {
            tracing::error!("Error selecting local port: {}", e);
        })?;
        let binding = ForwardBinding {
            local_port,
            remote_host: self.remote_host.clone(),
            remote_port,
        };

        let transport = self.transport.as_mut().ok_or(CoreError::Closed)?;
        let mut forward = transport.open_local_forward(&binding).inspect_err(|e| {
            tracing::error!("Error establishing port forwarding: {}", e);
        })?;

        let url = engine.connection_string(local_port, database);
        if let Err(e) = self.pool.set_url(&url) {
            tracing::error!("Pool rejected connection string: {}", e);
            forward.stop();
            return Err(PoolError::new(PoolStep::SetUrl, e).into());
        }

        if let Some(mut previous) = self.forward.replace(forward) {
            tracing::info!("Releasing previous forward on port {}", previous.local_port());
            previous.stop();
        }
        tracing::info!(
            engine = %engine,
            "Pool connects through 127.0.0.1:{} -> {}",
            local_port,
            binding.remote_addr()
        );

        self.binding = Some(binding.clone());
        self.connection_string = Some(url);
        Ok(binding)
    }

    /// [`configure_target`](Self::configure_target) for a [`DatabaseTarget`],
    /// including its remote host.
    pub fn configure(&mut self, target: &DatabaseTarget) -> Result<ForwardBinding, CoreError> {
        self.set_remote_host(target.remote_host.clone())?;
        self.configure_target(target.engine, target.remote_port, target.database.as_deref())
    }

    /// Direct connection string assignment is not supported: the string
    /// must point at the forwarded port, which only
    /// [`configure_target`](Self::configure_target) knows.
    pub fn set_url(&mut self, _url: &str) -> Result<(), CoreError> {
        Err(CoreError::UnsupportedOperation(
            "set the connection string with configure_target(engine, remote_port, database)"
                .to_string(),
        ))
    }

    /// The connection string handed to the pool, once configured.
    pub fn connection_string(&self) -> Option<&str> {
        self.connection_string.as_deref()
    }

    pub fn forward_binding(&self) -> Option<&ForwardBinding> {
        self.binding.as_ref()
    }

    pub fn forward_stats(&self) -> Option<ForwardStats> {
        self.forward.as_ref().map(|f| f.stats())
    }

    /// The wrapped pool, for borrowing connections.
    pub fn pool(&self) -> Result<&P, CoreError> {
        self.ensure_open()?;
        Ok(&self.pool)
    }

    pub fn pool_mut(&mut self) -> Result<&mut P, CoreError> {
        self.ensure_open()?;
        Ok(&mut self.pool)
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Close the pool, stop the forward, then end the SSH session.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Closing an already closed data source does nothing.
    pub fn close(&mut self) -> Result<(), CoreError> {
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let span = self.span.clone();
        let _enter = span.enter();

        let mut first_error: Option<CoreError> = None;

        if let Err(e) = self.pool.close() {
            tracing::error!("Error closing pool: {}", e);
            first_error = Some(PoolError::new(PoolStep::Close, e).into());
        }

        if let Some(mut forward) = self.forward.take() {
            forward.stop();
        }
        self.binding = None;
        self.connection_string = None;

        if let Err(e) = transport.close() {
            tracing::error!("Error closing SSH session: {}", e);
            if first_error.is_none() {
                first_error = Some(e.into());
            }
        }

        tracing::info!("Data source closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(())
    }
}

impl<P: ConnectionPool, T: SshTransport> Drop for TunnelingDataSource<P, T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use crate::errors::{BoxError, SessionError};

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: impl Into<String>) {
        events.lock().unwrap().push(event.into());
    }

    fn events_of(events: &Events) -> Vec<String> {
        events.lock().unwrap().clone()
    }

    // --- Fakes ---

    struct FakeForward {
        local_port: u16,
        events: Events,
        stopped: bool,
    }

    impl PortForward for FakeForward {
        fn local_port(&self) -> u16 {
            self.local_port
        }

        fn stats(&self) -> ForwardStats {
            ForwardStats {
                total_connections: 3,
                ..Default::default()
            }
        }

        fn stop(&mut self) {
            if !self.stopped {
                self.stopped = true;
                record(&self.events, format!("forward.stop:{}", self.local_port));
            }
        }
    }

    impl Drop for FakeForward {
        fn drop(&mut self) {
            self.stop();
        }
    }

    #[derive(Default)]
    struct FakeTransport {
        events: Events,
        refuse_forward: bool,
        fail_close: bool,
    }

    impl SshTransport for FakeTransport {
        type Forward = FakeForward;

        fn open_local_forward(
            &mut self,
            binding: &ForwardBinding,
        ) -> Result<FakeForward, SessionError> {
            if self.refuse_forward {
                return Err(SessionError::ForwardFailed {
                    local_port: binding.local_port,
                    remote: binding.remote_addr(),
                    reason: "administratively prohibited".to_string(),
                });
            }
            record(
                &self.events,
                format!("forward.open:{}->{}", binding.local_port, binding.remote_addr()),
            );
            Ok(FakeForward {
                local_port: binding.local_port,
                events: Arc::clone(&self.events),
                stopped: false,
            })
        }

        fn close(&mut self) -> Result<(), SessionError> {
            record(&self.events, "transport.close");
            if self.fail_close {
                return Err(SessionError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "connection reset",
                )));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingPool {
        events: Events,
        url: Option<String>,
        reject_url: bool,
        fail_close: bool,
    }

    impl ConnectionPool for RecordingPool {
        fn set_url(&mut self, url: &str) -> Result<(), BoxError> {
            if self.reject_url {
                return Err("malformed url".into());
            }
            record(&self.events, format!("pool.set_url:{url}"));
            self.url = Some(url.to_string());
            Ok(())
        }

        fn close(&mut self) -> Result<(), BoxError> {
            record(&self.events, "pool.close");
            if self.fail_close {
                return Err("connections still checked out".into());
            }
            Ok(())
        }
    }

    fn data_source(
        transport: FakeTransport,
        pool: RecordingPool,
    ) -> TunnelingDataSource<RecordingPool, FakeTransport> {
        let credential = Credential::parse("deploy@bastion.example.com").unwrap();
        TunnelingDataSource::with_transport(credential, transport, pool)
    }

    fn shared_fakes() -> (Events, FakeTransport, RecordingPool) {
        let events = Events::default();
        let transport = FakeTransport {
            events: Arc::clone(&events),
            ..Default::default()
        };
        let pool = RecordingPool {
            events: Arc::clone(&events),
            ..Default::default()
        };
        (events, transport, pool)
    }

    // --- configure_target ---

    #[test]
    fn mysql_target_points_pool_at_forwarded_port() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);

        let binding = ds
            .configure_target(EngineKind::MySql, 3306, Some("app"))
            .unwrap();

        assert_eq!(binding.remote_host, "localhost");
        assert_eq!(binding.remote_port, 3306);
        assert!((1024..65535).contains(&binding.local_port));

        let expected = format!("mysql://localhost:{}/app", binding.local_port);
        assert_eq!(ds.connection_string(), Some(expected.as_str()));
        assert_eq!(ds.pool().unwrap().url.as_deref(), Some(expected.as_str()));
        assert_eq!(ds.forward_binding(), Some(&binding));
        assert_eq!(ds.forward_stats().unwrap().total_connections, 3);
    }

    #[test]
    fn missing_database_gives_empty_segment() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);

        let binding = ds
            .configure_target(EngineKind::PostgreSql, 5432, None)
            .unwrap();
        assert_eq!(
            ds.connection_string().unwrap(),
            format!("postgresql://localhost:{}/", binding.local_port)
        );
    }

    #[test]
    fn remote_host_is_used_for_forward() {
        let (events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);
        ds.set_remote_host("db.internal").unwrap();

        let binding = ds
            .configure_target(EngineKind::Oracle, 1521, Some("ORCL"))
            .unwrap();

        assert_eq!(ds.remote_host(), "db.internal");
        assert_eq!(binding.remote_addr(), "db.internal:1521");
        assert!(events_of(&events)
            .contains(&format!("forward.open:{}->db.internal:1521", binding.local_port)));
        assert_eq!(
            ds.connection_string().unwrap(),
            format!("oracle:{}:ORCL", binding.local_port)
        );
    }

    #[test]
    fn configure_applies_database_target() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);
        let target = DatabaseTarget {
            engine: EngineKind::MsSql,
            remote_host: "sql01".to_string(),
            remote_port: 1433,
            database: Some("sales".to_string()),
        };

        let binding = ds.configure(&target).unwrap();
        assert_eq!(binding.remote_addr(), "sql01:1433");
        assert_eq!(ds.connection_string(), Some("sqlserver://localhost/sales"));
    }

    #[test]
    fn forward_failure_is_returned_and_pool_untouched() {
        let (_events, mut transport, pool) = shared_fakes();
        transport.refuse_forward = true;
        let mut ds = data_source(transport, pool);

        let err = ds
            .configure_target(EngineKind::MySql, 3306, Some("app"))
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Session(SessionError::ForwardFailed { .. })
        ));
        assert!(ds.pool().unwrap().url.is_none());
        assert!(ds.connection_string().is_none());
        assert!(ds.forward_binding().is_none());
    }

    #[test]
    fn rejected_url_stops_new_forward() {
        let (events, transport, mut pool) = shared_fakes();
        pool.reject_url = true;
        let mut ds = data_source(transport, pool);

        let err = ds
            .configure_target(EngineKind::MySql, 3306, None)
            .unwrap_err();
        let pool_err = match err {
            CoreError::Pool(e) => e,
            other => panic!("Expected pool error, got {other:?}"),
        };
        assert_eq!(pool_err.step, PoolStep::SetUrl);

        let events = events_of(&events);
        assert!(events.iter().any(|e| e.starts_with("forward.open:")));
        assert!(events.iter().any(|e| e.starts_with("forward.stop:")));
        assert!(ds.forward_stats().is_none());
    }

    #[test]
    fn reconfigure_releases_previous_forward_after_switch() {
        let (events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);

        let first = ds.configure_target(EngineKind::MySql, 3306, Some("a")).unwrap();
        let second = ds.configure_target(EngineKind::MySql, 3306, Some("b")).unwrap();

        let events = events_of(&events);
        let pos = |needle: &str| events.iter().position(|e| e.starts_with(needle)).unwrap();
        let second_url = format!("pool.set_url:mysql://localhost:{}/b", second.local_port);
        let first_stop = format!("forward.stop:{}", first.local_port);
        assert!(pos(&second_url) < pos(&first_stop));
        assert!(!events.contains(&format!("forward.stop:{}", second.local_port)));
    }

    #[test]
    fn exhausted_port_search_opens_nothing() {
        let (events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool).with_port_attempts(0);

        let err = ds
            .configure_target(EngineKind::MySql, 3306, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::PortExhausted { attempts: 0 }));
        assert!(events_of(&events).is_empty());
    }

    #[test]
    fn zero_database_port_is_rejected() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);
        assert!(matches!(
            ds.configure_target(EngineKind::MySql, 0, None),
            Err(CoreError::InvalidPort(_))
        ));
    }

    // --- set_url ---

    #[test]
    fn direct_url_assignment_is_always_unsupported() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);

        assert!(matches!(
            ds.set_url("mysql://db:3306/app"),
            Err(CoreError::UnsupportedOperation(_))
        ));

        ds.configure_target(EngineKind::MySql, 3306, None).unwrap();
        assert!(matches!(
            ds.set_url("mysql://db:3306/app"),
            Err(CoreError::UnsupportedOperation(_))
        ));

        ds.close().unwrap();
        assert!(matches!(
            ds.set_url("mysql://db:3306/app"),
            Err(CoreError::UnsupportedOperation(_))
        ));
    }

    // --- close ---

    #[test]
    fn close_tears_down_pool_forward_then_session() {
        let (events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);
        let binding = ds.configure_target(EngineKind::MySql, 3306, None).unwrap();
        events.lock().unwrap().clear();

        ds.close().unwrap();

        assert_eq!(
            events_of(&events),
            vec![
                "pool.close".to_string(),
                format!("forward.stop:{}", binding.local_port),
                "transport.close".to_string(),
            ]
        );
        assert!(ds.is_closed());
        assert!(ds.connection_string().is_none());
    }

    #[test]
    fn session_is_closed_even_when_pool_close_fails() {
        let (events, mut transport, mut pool) = shared_fakes();
        pool.fail_close = true;
        transport.fail_close = true;
        let mut ds = data_source(transport, pool);

        let err = ds.close().unwrap_err();
        assert!(matches!(err, CoreError::Pool(ref e) if e.step == PoolStep::Close));
        assert_eq!(
            events_of(&events),
            vec!["pool.close".to_string(), "transport.close".to_string()]
        );
    }

    #[test]
    fn second_close_is_noop() {
        let (events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);

        ds.close().unwrap();
        ds.close().unwrap();
        assert_eq!(events_of(&events).len(), 2);
    }

    #[test]
    fn operations_after_close_fail_with_closed() {
        let (_events, transport, pool) = shared_fakes();
        let mut ds = data_source(transport, pool);
        ds.close().unwrap();

        assert!(matches!(
            ds.configure_target(EngineKind::MySql, 3306, None),
            Err(CoreError::Closed)
        ));
        assert!(matches!(ds.set_remote_host("db"), Err(CoreError::Closed)));
        assert!(matches!(ds.pool(), Err(CoreError::Closed)));
        assert!(matches!(ds.pool_mut(), Err(CoreError::Closed)));
    }

    #[test]
    fn drop_closes_everything() {
        let (events, transport, pool) = shared_fakes();
        {
            let mut ds = data_source(transport, pool);
            ds.configure_target(EngineKind::PostgreSql, 5432, None)
                .unwrap();
        }
        let events = events_of(&events);
        assert!(events.contains(&"pool.close".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("transport.close"));
    }

    // --- logging ---

    #[derive(Clone, Default)]
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureWriter;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn events_are_emitted_in_injected_span() {
        let writer = CaptureWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let (_events, mut transport, pool) = shared_fakes();
            transport.refuse_forward = true;
            let mut ds = data_source(transport, pool)
                .with_span(tracing::info_span!("tenant_db", tenant = "acme"));
            let _ = ds.configure_target(EngineKind::MySql, 3306, None);
        });

        let output = String::from_utf8(writer.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Error establishing port forwarding"), "{output}");
        assert!(output.contains("tenant_db{tenant=\"acme\"}"), "{output}");
    }

    // --- connect validation ---

    #[cfg(feature = "ssh")]
    #[test]
    fn connect_rejects_bad_input_before_connecting() {
        type Ds = SshDataSource<RecordingPool>;

        let err = Ds::connect("bastion", 22, SshAuth::password("pw"), RecordingPool::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::InvalidCredential(_)));

        let err = Ds::connect("u@bastion", 0, SshAuth::password("pw"), RecordingPool::default())
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::InvalidPort(_)));

        let dir = tempfile::tempdir().unwrap();
        let err = Ds::connect(
            "u@bastion",
            22,
            SshAuth::private_key(dir.path().join("id_missing")),
            RecordingPool::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            CoreError::Session(SessionError::KeyNotFound(_))
        ));
    }
}
