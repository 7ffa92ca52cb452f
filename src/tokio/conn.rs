//! Asynchronous PostgreSQL connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::buffer_pool::PooledBufferSet;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::backend::BackendKeyData;
use crate::protocol::frontend::write_terminate;
use crate::protocol::types::TransactionStatus;
use crate::result::QueryResult;
use crate::state::StateMachine;
use crate::state::action::Action;
use crate::state::connection::{ConnectionState, ConnectionStateMachine};
use crate::state::simple_query::SimpleQueryStateMachine;

use super::stream::Stream;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// The open transport of a connection, shared with the pool so that a pool
/// shutdown can close a checked-out connection. `None` once closed.
pub(crate) type Transport = Arc<Mutex<Option<Stream>>>;

/// Send Terminate and shut the transport down.
///
/// Waits for a query holding the transport to finish first. Returns false
/// if the transport was already closed.
pub(crate) async fn terminate(transport: &Transport, conn: u64) -> bool {
    let Some(mut stream) = transport.lock().await.take() else {
        return false;
    };
    let mut buf = Vec::with_capacity(5);
    write_terminate(&mut buf);
    if let Err(e) = stream.write_all(&buf).await {
        tracing::debug!(conn, "terminate failed: {}", e);
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
    true
}

/// Asynchronous PostgreSQL connection.
///
/// One query runs at a time; `query` takes `&mut self`.
#[derive(Debug)]
pub struct Conn {
    id: u64,
    state: ConnectionState,
    transport: Transport,
    buffer_set: PooledBufferSet,
    opts: Opts,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    is_broken: bool,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    pub async fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let mut conn = Self::disconnected(opts.try_into()?);
        conn.connect().await?;
        Ok(conn)
    }

    /// Create a handle without touching the network.
    pub fn disconnected(opts: Opts) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            state: ConnectionState::Disconnected,
            transport: Arc::new(Mutex::new(None)),
            buffer_set: opts.buffer_pool.get_buffer_set(),
            opts,
            backend_key: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            is_broken: false,
        }
    }

    /// Open the transport and run startup and authentication.
    ///
    /// Only valid on a handle that has never connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidUsage(format!(
                "connect() called on a connection in state {:?}",
                self.state
            )));
        }

        self.state = ConnectionState::Connecting;
        match self.connect_inner().await {
            Ok(stream) => {
                *self.transport.lock().await = Some(stream);
                self.state = ConnectionState::Ready;
                tracing::debug!(conn = self.id, host = %self.opts.host, "connected");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(conn = self.id, "connect failed: {}", e);
                self.state = ConnectionState::Closed;
                self.is_broken = true;
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<Stream> {
        if self.opts.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }
        let tcp = TcpStream::connect((self.opts.host.as_str(), self.opts.port)).await?;
        tcp.set_nodelay(true)?;
        let mut stream = Stream::tcp(tcp);

        let mut state_machine = ConnectionStateMachine::new(self.opts.clone());
        loop {
            let action = state_machine.step(&mut self.buffer_set)?;
            self.state = state_machine.phase();
            match action {
                Action::WriteAndReadByte => {
                    stream.write_all(&self.buffer_set.write_buffer).await?;
                    stream.flush().await?;
                    self.buffer_set.write_buffer.clear();
                    let byte = stream.read_u8().await?;
                    state_machine.set_ssl_response(byte);
                }
                Action::Write => {
                    stream.write_all(&self.buffer_set.write_buffer).await?;
                    stream.flush().await?;
                    self.buffer_set.write_buffer.clear();
                }
                Action::ReadMessage => {
                    stream.read_into(&mut self.buffer_set.reader).await?;
                }
                Action::TlsHandshake => {
                    #[cfg(feature = "tokio-tls")]
                    {
                        let root_cert = self.opts.ssl_root_cert.as_deref().ok_or_else(|| {
                            Error::InvalidUsage("TLS requested without a root certificate".into())
                        })?;
                        stream = stream.upgrade_to_tls(&self.opts.host, root_cert).await?;
                    }
                    #[cfg(not(feature = "tokio-tls"))]
                    {
                        return Err(Error::Unsupported(
                            "TLS requested but tokio-tls feature not enabled".into(),
                        ));
                    }
                }
                Action::Finished => break,
            }
        }

        self.backend_key = state_machine.backend_key().copied();
        self.server_params = state_machine.take_server_params();
        self.transaction_status = state_machine.transaction_status();
        Ok(stream)
    }

    /// Process-unique identity of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current lifecycle phase.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the backend key data for query cancellation.
    pub fn backend_key(&self) -> Option<&BackendKeyData> {
        self.backend_key.as_ref()
    }

    /// Get the connection ID (backend process ID).
    ///
    /// Returns 0 if the backend key data is not available.
    pub fn connection_id(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Get server parameters.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Get one server parameter by name.
    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn set_server_param(&mut self, name: String, value: String) {
        match self.server_params.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.server_params.push((name, value)),
        }
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Check if currently in a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    /// Check if the connection is broken.
    pub fn is_broken(&self) -> bool {
        self.is_broken
    }

    pub(crate) fn transport(&self) -> Transport {
        Arc::clone(&self.transport)
    }

    /// Drive a state machine to completion.
    ///
    /// Fails with [`Error::PoolClosed`] if a pool shutdown closed the
    /// transport underneath this handle.
    async fn drive<S: StateMachine>(&mut self, state_machine: &mut S) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        let mut guard = transport.lock().await;
        let Some(stream) = guard.as_mut() else {
            tracing::debug!(conn = self.id, "transport closed by pool shutdown");
            self.state = ConnectionState::Closed;
            return Err(Error::PoolClosed);
        };
        loop {
            match state_machine.step(&mut self.buffer_set)? {
                Action::Write => {
                    stream.write_all(&self.buffer_set.write_buffer).await?;
                    stream.flush().await?;
                    self.buffer_set.write_buffer.clear();
                }
                Action::ReadMessage => {
                    stream.read_into(&mut self.buffer_set.reader).await?;
                }
                Action::WriteAndReadByte | Action::TlsHandshake => {
                    return Err(Error::Protocol(
                        "Unexpected startup action in query state machine".into(),
                    ));
                }
                Action::Finished => return Ok(()),
            }
        }
    }

    /// Run a query string and return the result of its last statement.
    ///
    /// An empty query string yields an empty result.
    pub async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        let mut results = self.query_all(sql).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run a query string and return one result per statement.
    pub async fn query_all(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        match self.state {
            ConnectionState::Ready => {}
            ConnectionState::QueryInFlight => {
                self.is_broken = true;
                return Err(Error::InvalidUsage(
                    "a previous query did not run to completion".into(),
                ));
            }
            ConnectionState::Closed => {
                return Err(Error::InvalidUsage("connection is closed".into()));
            }
            other => {
                return Err(Error::InvalidUsage(format!(
                    "connection is not ready (state {:?})",
                    other
                )));
            }
        }

        self.state = ConnectionState::QueryInFlight;
        tracing::debug!(conn = self.id, sql, "query");

        let registry = Arc::clone(&self.opts.registry);
        let mut state_machine = SimpleQueryStateMachine::new(sql, &registry);
        let result = self.drive(&mut state_machine).await;

        for (name, value) in state_machine.take_parameter_changes() {
            self.set_server_param(name, value);
        }
        if state_machine.is_finished() {
            self.state = ConnectionState::Ready;
            self.transaction_status = state_machine.transaction_status();
        }

        match result {
            Ok(()) => Ok(state_machine.into_results()),
            Err(e) => {
                if e.is_connection_broken() || !state_machine.is_finished() {
                    self.is_broken = true;
                }
                Err(e)
            }
        }
    }

    /// Close the connection.
    ///
    /// Sends Terminate and shuts the transport down. Write errors are
    /// ignored and calling it again is a no-op.
    pub async fn close(&mut self) {
        if terminate(&self.transport, self.id).await {
            tracing::debug!(conn = self.id, "closed");
        }
        self.state = ConnectionState::Closed;
    }
}
