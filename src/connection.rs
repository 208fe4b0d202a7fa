use crate::dispatcher::{Delivery, RequestDispatcher, WaiterId};
use crate::error::{LdapError, Result};
use crate::filter::Filter;
use crate::ldap_protocol::{
    BindRequest, Control, DerefAliases, ExtendedRequest, LdapMessage, ProtocolOp, SearchRequest,
    SearchScope, DEFAULT_MAX_FRAME_BYTES, START_TLS_OID,
};
use crate::metrics::Metrics;
use crate::search::SearchResultStream;
use crate::tls::{TlsMode, TlsOptions};
use crate::transport::TransportSession;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const LDAP_VERSION: i32 = 3;
const UNBIND_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle. Bound requires a prior Connected; transport failure returns to Disconnected from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Bound = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Bound,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Bound => "Bound",
        };
        f.write_str(name)
    }
}

/// Per-connection settings, passed explicitly to [`Connection::new`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub tls_mode: TlsMode,
    pub tls: TlsOptions,
    /// Bound on waiting for single responses (bind, StartTLS). `None` waits indefinitely.
    pub operation_timeout: Option<Duration>,
    /// Entries buffered per search before the decode loop waits for the consumer.
    pub channel_capacity: usize,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            tls_mode: TlsMode::None,
            tls: TlsOptions::default(),
            operation_timeout: Some(Duration::from_secs(30)),
            channel_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Per-search parameters besides base, scope, filter, and attributes.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// 0 means no client-requested limit.
    pub size_limit: i32,
    /// Seconds; 0 means no client-requested limit.
    pub time_limit: i32,
    pub deref_aliases: DerefAliases,
    pub types_only: bool,
    pub controls: Option<Vec<Control>>,
}

impl SearchOptions {
    pub fn size_limit(mut self, limit: i32) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn time_limit(mut self, seconds: i32) -> Self {
        self.time_limit = seconds;
        self
    }
}

/// Client connection to one directory server.
pub struct Connection {
    options: ConnectionOptions,
    state: Arc<AtomicU8>,
    dispatcher: Mutex<Option<Arc<RequestDispatcher>>>,
    metrics: Arc<Metrics>,
}

impl Connection {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            options,
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            dispatcher: Mutex::new(None),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Bound
        )
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn require(&self, expected: &'static str, allowed: &[ConnectionState]) -> Result<()> {
        let actual = self.state();
        if allowed.contains(&actual) {
            Ok(())
        } else {
            Err(LdapError::InvalidState { expected, actual })
        }
    }

    fn current_dispatcher(&self) -> Result<Arc<RequestDispatcher>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(LdapError::InvalidState {
                expected: "Connected",
                actual: ConnectionState::Disconnected,
            })
    }

    fn set_dispatcher(&self, dispatcher: Option<Arc<RequestDispatcher>>) -> Option<Arc<RequestDispatcher>> {
        std::mem::replace(
            &mut *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner),
            dispatcher,
        )
    }

    /// Open the transport and start the decode loop. Only valid while Disconnected.
    pub async fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        if let Err(actual) = self.state.compare_exchange(
            ConnectionState::Disconnected as u8,
            ConnectionState::Connecting as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(LdapError::InvalidState {
                expected: "Disconnected",
                actual: ConnectionState::from_u8(actual),
            });
        }

        let tls = match self.options.tls_mode {
            TlsMode::Ldaps => Some(&self.options.tls),
            TlsMode::None | TlsMode::StartTls => None,
        };
        let session = match TransportSession::connect(host, port, timeout, tls).await {
            Ok(session) => session,
            Err(e) => {
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                warn!("Connect to {}:{} failed: {}", host, port, e);
                return Err(e);
            }
        };

        self.metrics.inc_connections();
        // Connected before the loop runs, so an immediate failure can move it back.
        self.state
            .store(ConnectionState::Connected as u8, Ordering::SeqCst);
        let dispatcher = RequestDispatcher::start(
            session,
            Arc::clone(&self.state),
            Arc::clone(&self.metrics),
            self.options.channel_capacity,
            self.options.max_frame_bytes,
        );
        if let Some(stale) = self.set_dispatcher(Some(dispatcher)) {
            stale.signal_shutdown("replaced by a new connection");
        }

        if self.options.tls_mode == TlsMode::StartTls {
            if let Err(e) = self.start_tls().await {
                self.disconnect().await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn await_single(
        &self,
        dispatcher: &RequestDispatcher,
        waiter: WaiterId,
        rx: &mut mpsc::Receiver<Delivery>,
    ) -> Result<LdapMessage> {
        let received = match self.options.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    dispatcher.unregister(waiter);
                    return Err(LdapError::Timeout(limit));
                }
            },
            None => rx.recv().await,
        };
        received.unwrap_or_else(|| Err(LdapError::connection_lost("response channel closed")))
    }

    /// Simple bind. Success moves to Bound; a rejected bind leaves the connection Connected.
    pub async fn bind(&self, dn: &str, password: impl AsRef<[u8]>) -> Result<()> {
        self.require(
            "Connected or Bound",
            &[ConnectionState::Connected, ConnectionState::Bound],
        )?;
        let dispatcher = self.current_dispatcher()?;
        let (waiter, mut rx) = dispatcher.register(false)?;
        dispatcher
            .send(
                waiter,
                ProtocolOp::BindRequest(BindRequest {
                    version: LDAP_VERSION,
                    name: dn.to_string(),
                    password: password.as_ref().to_vec(),
                }),
            )
            .await?;

        let response = self.await_single(&dispatcher, waiter, &mut rx).await?;
        let result = match response.protocol_op {
            ProtocolOp::BindResponse(result) => result,
            other => {
                return Err(LdapError::protocol(format!(
                    "Expected BindResponse, got {}",
                    other.name()
                )))
            }
        };

        if result.is_success() {
            if !self.transition(ConnectionState::Connected, ConnectionState::Bound)
                && self.state() != ConnectionState::Bound
            {
                return Err(LdapError::connection_lost("connection closed during bind"));
            }
            info!("Bound as {:?}", dn);
            Ok(())
        } else {
            // A failed bind leaves the session anonymous.
            self.transition(ConnectionState::Bound, ConnectionState::Connected);
            debug!("Bind as {:?} rejected: {}", dn, result.result_code);
            Err(LdapError::AuthenticationFailed {
                code: result.result_code,
                diagnostic: result.diagnostic_message,
            })
        }
    }

    /// Start a search and return its stream immediately. The filter is validated before anything is sent.
    pub async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[&str],
        options: &SearchOptions,
    ) -> Result<SearchResultStream> {
        self.require(
            "Connected or Bound",
            &[ConnectionState::Connected, ConnectionState::Bound],
        )?;
        let filter = Filter::parse(filter)?;
        let dispatcher = self.current_dispatcher()?;
        let (waiter, rx) = dispatcher.register(true)?;
        let request = SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: options.deref_aliases,
            size_limit: options.size_limit,
            time_limit: options.time_limit,
            types_only: options.types_only,
            filter,
            attributes: attributes.iter().map(|a| a.to_string()).collect(),
        };
        debug!(
            "Search {} base={:?} scope={:?} filter={}",
            waiter.message_id, base, scope, request.filter
        );
        dispatcher
            .send_with_controls(waiter, ProtocolOp::SearchRequest(request), options.controls.clone())
            .await?;
        Ok(SearchResultStream::new(waiter, rx, dispatcher))
    }

    /// Upgrade the plain connection to TLS with the StartTLS extended operation.
    pub async fn start_tls(&self) -> Result<()> {
        self.require("Connected", &[ConnectionState::Connected])?;
        let dispatcher = self.current_dispatcher()?;
        let outstanding = dispatcher.outstanding();
        if outstanding > 0 {
            return Err(LdapError::OutstandingRequests(outstanding));
        }

        let (waiter, mut rx) = dispatcher.register(false)?;
        dispatcher
            .send(
                waiter,
                ProtocolOp::ExtendedRequest(ExtendedRequest {
                    request_name: START_TLS_OID.to_string(),
                    request_value: None,
                }),
            )
            .await?;
        let response = self.await_single(&dispatcher, waiter, &mut rx).await?;
        match response.protocol_op {
            ProtocolOp::ExtendedResponse(resp) => {
                resp.result.success()?;
            }
            other => {
                return Err(LdapError::protocol(format!(
                    "Expected ExtendedResponse to StartTLS, got {}",
                    other.name()
                )))
            }
        }

        let upgraded = async {
            let (session, buffered) = dispatcher.release().await?;
            if !buffered.is_empty() {
                return Err(LdapError::protocol(format!(
                    "{} bytes received before the TLS handshake",
                    buffered.len()
                )));
            }
            session.start_tls(&self.options.tls).await
        }
        .await;

        match upgraded {
            Ok(session) => {
                let tls_dispatcher = RequestDispatcher::start(
                    session,
                    Arc::clone(&self.state),
                    Arc::clone(&self.metrics),
                    self.options.channel_capacity,
                    self.options.max_frame_bytes,
                );
                self.set_dispatcher(Some(tls_dispatcher));
                Ok(())
            }
            Err(e) => {
                warn!("StartTLS failed: {}", e);
                self.set_dispatcher(None);
                dispatcher.shutdown("StartTLS failed").await;
                self.state
                    .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Best-effort Unbind, then close. Outstanding waiters receive ConnectionLost. Never fails.
    pub async fn disconnect(&self) {
        if let Some(dispatcher) = self.set_dispatcher(None) {
            if !dispatcher.is_closed() {
                match tokio::time::timeout(
                    UNBIND_TIMEOUT,
                    dispatcher.send_oneway(ProtocolOp::UnbindRequest),
                )
                .await
                {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => debug!("Unbind not sent: {}", e),
                    Err(_) => debug!("Unbind timed out"),
                }
            }
            dispatcher.shutdown("client disconnected").await;
        }
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.set_dispatcher(None) {
            dispatcher.signal_shutdown("connection dropped");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("options", &self.options)
            .finish()
    }
}
