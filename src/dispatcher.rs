//! Request/response correlation over one transport: message-ID allocation,
//! the waiter table, and the background decode loop that routes frames.

use crate::connection::ConnectionState;
use crate::error::{LdapError, Result};
use crate::ldap_protocol::{
    encode_ldap_message, try_parse_message, Control, ExtendedResponse, LdapMessage, ProtocolOp,
    TryParseResult, NOTICE_OF_DISCONNECTION_OID,
};
use crate::metrics::Metrics;
use crate::transport::{TransportSession, TransportStream};
use bytes::{Buf, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What a waiter receives: a routed message, or the error that ended the connection.
pub type Delivery = std::result::Result<LdapMessage, LdapError>;

const READ_CHUNK: usize = 8 * 1024;
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle for one registered waiter. The serial tells apart requests that reused a message ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId {
    pub message_id: i32,
    serial: u64,
}

struct Waiter {
    tx: mpsc::Sender<Delivery>,
    expects_stream: bool,
    serial: u64,
}

struct WaiterTable {
    waiters: HashMap<i32, Waiter>,
    next_id: i32,
    next_serial: u64,
    /// Set once the dispatcher stops accepting requests.
    closed: Option<String>,
}

impl WaiterTable {
    fn new() -> Self {
        Self {
            waiters: HashMap::new(),
            next_id: 1,
            next_serial: 0,
            closed: None,
        }
    }

    /// Next ID in 1..=i32::MAX, wrapping, skipping IDs still registered.
    fn allocate_id(&mut self) -> Result<i32> {
        if self.waiters.len() >= i32::MAX as usize {
            return Err(LdapError::IdsExhausted);
        }
        loop {
            let id = self.next_id;
            self.next_id = if id == i32::MAX { 1 } else { id + 1 };
            if !self.waiters.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        match &self.closed {
            Some(reason) => Err(LdapError::connection_lost(reason.clone())),
            None => Ok(()),
        }
    }

    fn insert(&mut self, id: i32, tx: mpsc::Sender<Delivery>, expects_stream: bool) -> WaiterId {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.waiters.insert(
            id,
            Waiter {
                tx,
                expects_stream,
                serial,
            },
        );
        WaiterId {
            message_id: id,
            serial,
        }
    }

    fn remove(&mut self, waiter: WaiterId) -> bool {
        if self
            .waiters
            .get(&waiter.message_id)
            .is_some_and(|w| w.serial == waiter.serial)
        {
            self.waiters.remove(&waiter.message_id);
            true
        } else {
            false
        }
    }
}

/// Streams end at SearchResultDone; every other waiter takes exactly one response.
fn is_terminal(op: &ProtocolOp, expects_stream: bool) -> bool {
    !expects_stream || matches!(op, ProtocolOp::SearchResultDone(_))
}

/// State shared between the dispatcher handle and its decode loop.
struct Shared {
    table: Mutex<WaiterTable>,
    writer: AsyncMutex<Option<WriteHalf<TransportStream>>>,
    state: Arc<AtomicU8>,
    metrics: Arc<Metrics>,
    channel_capacity: usize,
    /// Wakes a stalled decode loop when a waiter is added or removed.
    table_changed: Notify,
}

impl Shared {
    fn lock_table(&self) -> MutexGuard<'_, WaiterTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sender for the waiter registered under the message's ID. Terminal messages retire the waiter here.
    fn route(&self, message: &LdapMessage) -> Option<mpsc::Sender<Delivery>> {
        let mut table = self.lock_table();
        let waiter = table.waiters.get(&message.message_id)?;
        let tx = waiter.tx.clone();
        if is_terminal(&message.protocol_op, waiter.expects_stream) {
            table.waiters.remove(&message.message_id);
        }
        Some(tx)
    }

    /// Remove `id` only if it still belongs to the channel `tx` feeds.
    fn retire_if_same(&self, id: i32, tx: &mpsc::Sender<Delivery>) {
        let mut table = self.lock_table();
        if table
            .waiters
            .get(&id)
            .is_some_and(|w| w.tx.same_channel(tx))
        {
            table.waiters.remove(&id);
        }
    }

    /// Idempotent: close the table, fail every waiter, mark the connection down, close the writer.
    /// Deliveries still queued in `backlog` go out ahead of the failure.
    async fn teardown(&self, reason: &str, mut backlog: Backlog) {
        let waiters = {
            let mut table = self.lock_table();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            std::mem::take(&mut table.waiters)
        };
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::SeqCst);

        if !waiters.is_empty() {
            debug!("Failing {} outstanding requests: {}", waiters.len(), reason);
        }
        for (_, waiter) in waiters {
            let lost = Err(LdapError::connection_lost(reason));
            match backlog.find_mut(&waiter.tx) {
                Some(overflow) => overflow.queue.push_back(lost),
                // A full channel is closed instead once the sender drops.
                None => {
                    let _ = waiter.tx.try_send(lost);
                }
            }
        }
        backlog.drain_in_background();

        let close = async {
            let mut guard = self.writer.lock().await;
            if let Some(mut writer) = guard.take() {
                let _ = writer.shutdown().await;
            }
        };
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, close).await.is_err() {
            warn!("Timed out closing transport writer");
        }
    }
}

struct Overflow {
    id: i32,
    tx: mpsc::Sender<Delivery>,
    queue: VecDeque<Delivery>,
}

/// Deliveries for stream waiters whose channel is full, kept in arrival order.
/// A slow consumer only holds back its own stream.
#[derive(Default)]
struct Backlog {
    streams: Vec<Overflow>,
}

impl Backlog {
    fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    fn find_mut(&mut self, tx: &mpsc::Sender<Delivery>) -> Option<&mut Overflow> {
        self.streams.iter_mut().find(|o| o.tx.same_channel(tx))
    }

    /// Hand `delivery` to `tx`, behind anything already queued for the same channel.
    fn deliver(&mut self, shared: &Shared, id: i32, tx: mpsc::Sender<Delivery>, delivery: Delivery) {
        if let Some(overflow) = self.find_mut(&tx) {
            overflow.queue.push_back(delivery);
            return;
        }
        match tx.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(delivery)) => {
                debug!("Stream for message ID {} is full, queueing", id);
                self.streams.push(Overflow {
                    id,
                    tx,
                    queue: VecDeque::from([delivery]),
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Waiter for message ID {} went away", id);
                shared.retire_if_same(id, &tx);
            }
        }
    }

    /// Move queued deliveries into channels that have room again.
    fn flush(&mut self, shared: &Shared) {
        self.streams.retain_mut(|overflow| {
            while let Some(delivery) = overflow.queue.pop_front() {
                match overflow.tx.try_send(delivery) {
                    Ok(()) => {}
                    Err(TrySendError::Full(delivery)) => {
                        overflow.queue.push_front(delivery);
                        return true;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Waiter for message ID {} went away", overflow.id);
                        shared.retire_if_same(overflow.id, &overflow.tx);
                        return false;
                    }
                }
            }
            false
        });
    }

    /// Resolves once some queued channel has room or has closed.
    async fn room(&self) {
        let mut waits: Vec<_> = self
            .streams
            .iter()
            .map(|o| Box::pin(o.tx.reserve()))
            .collect();
        poll_fn(|cx| {
            for wait in waits.iter_mut() {
                // The permit is dropped right away; `flush` takes the slot.
                if wait.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(());
                }
            }
            Poll::Pending
        })
        .await
    }

    /// True when every registered waiter is a stream with queued deliveries, so reading more helps no one.
    fn saturated(&self, shared: &Shared) -> bool {
        if self.streams.is_empty() {
            return false;
        }
        let table = shared.lock_table();
        !table.waiters.is_empty()
            && table
                .waiters
                .values()
                .all(|w| self.streams.iter().any(|o| o.tx.same_channel(&w.tx)))
    }

    fn drain_in_background(self) {
        for overflow in self.streams {
            tokio::spawn(async move {
                for delivery in overflow.queue {
                    if overflow.tx.send(delivery).await.is_err() {
                        break;
                    }
                }
            });
        }
    }
}

enum LoopCommand {
    Shutdown(String),
    Release,
}

enum LoopExit {
    Closed,
    Released {
        reader: ReadHalf<TransportStream>,
        buffered: BytesMut,
    },
}

enum Flow {
    Release,
    Shutdown(String),
    Lost(String),
}

fn on_command(cmd: std::result::Result<LoopCommand, oneshot::error::RecvError>) -> Flow {
    match cmd {
        Ok(LoopCommand::Release) => Flow::Release,
        Ok(LoopCommand::Shutdown(reason)) => Flow::Shutdown(reason),
        Err(_) => Flow::Shutdown("dispatcher dropped".to_string()),
    }
}

fn unsolicited_reason(resp: &ExtendedResponse) -> String {
    match resp.response_name.as_deref() {
        Some(NOTICE_OF_DISCONNECTION_OID) => format!(
            "notice of disconnection: {} ({})",
            resp.result.result_code, resp.result.diagnostic_message
        ),
        other => format!(
            "unsolicited notification {}: {}",
            other.unwrap_or("(unnamed)"),
            resp.result.result_code
        ),
    }
}

async fn read_more(reader: &mut ReadHalf<TransportStream>, buffer: &mut BytesMut) -> std::io::Result<usize> {
    buffer.reserve(READ_CHUNK);
    reader.read_buf(buffer).await
}

async fn decode_loop(
    shared: Arc<Shared>,
    mut reader: ReadHalf<TransportStream>,
    mut buffer: BytesMut,
    mut control: oneshot::Receiver<LoopCommand>,
    max_frame_bytes: usize,
) -> LoopExit {
    let mut backlog = Backlog::default();
    let flow = 'outer: loop {
        // Route buffered frames while some waiter can still take them.
        while !backlog.saturated(&shared) {
            let message = match try_parse_message(&buffer, max_frame_bytes) {
                Ok(TryParseResult::Incomplete) => break,
                Ok(TryParseResult::Message { message, consumed }) => {
                    buffer.advance(consumed);
                    message
                }
                Err(e) => {
                    shared.metrics.inc_protocol_error();
                    warn!("Failed to decode frame from server: {}", e);
                    break 'outer Flow::Lost(e.to_string());
                }
            };

            if message.message_id == 0 {
                if let ProtocolOp::ExtendedResponse(resp) = &message.protocol_op {
                    let reason = unsolicited_reason(resp);
                    warn!("Server sent {}", reason);
                    break 'outer Flow::Lost(reason);
                }
                debug!("Discarding {} with message ID 0", message.protocol_op.name());
                shared.metrics.inc_discarded();
                continue;
            }

            let id = message.message_id;
            let Some(tx) = shared.route(&message) else {
                debug!(
                    "Discarding {} for unknown message ID {}",
                    message.protocol_op.name(),
                    id
                );
                shared.metrics.inc_discarded();
                continue;
            };
            if matches!(message.protocol_op, ProtocolOp::SearchResultEntry(_)) {
                shared.metrics.inc_entries();
            }
            shared.metrics.inc_routed();
            backlog.deliver(&shared, id, tx, Ok(message));
        }

        let stalled = backlog.saturated(&shared);
        tokio::select! {
            cmd = &mut control => break on_command(cmd),
            _ = backlog.room(), if !backlog.is_empty() => backlog.flush(&shared),
            _ = shared.table_changed.notified(), if stalled => {}
            read = read_more(&mut reader, &mut buffer), if !stalled => match read {
                Ok(0) => break Flow::Lost("connection closed by server".to_string()),
                Ok(_) => {}
                Err(e) => break Flow::Lost(format!("read error: {}", e)),
            }
        }
    };

    match flow {
        Flow::Release => {
            debug!("Decode loop released the transport ({} bytes buffered)", buffer.len());
            backlog.drain_in_background();
            LoopExit::Released {
                reader,
                buffered: buffer,
            }
        }
        Flow::Shutdown(reason) => {
            debug!("Decode loop stopping: {}", reason);
            shared.teardown(&reason, backlog).await;
            LoopExit::Closed
        }
        Flow::Lost(reason) => {
            warn!("Connection lost: {}", reason);
            shared.metrics.inc_connections_lost();
            shared.teardown(&reason, backlog).await;
            LoopExit::Closed
        }
    }
}

/// Correlates requests with responses on one transport session.
pub struct RequestDispatcher {
    shared: Arc<Shared>,
    control: Mutex<Option<oneshot::Sender<LoopCommand>>>,
    task: Mutex<Option<JoinHandle<LoopExit>>>,
    host: String,
    peer: String,
}

impl RequestDispatcher {
    /// Split `session` and spawn the decode loop.
    pub fn start(
        session: TransportSession,
        state: Arc<AtomicU8>,
        metrics: Arc<Metrics>,
        channel_capacity: usize,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        Self::start_with_buffer(
            session,
            BytesMut::new(),
            state,
            metrics,
            channel_capacity,
            max_frame_bytes,
        )
    }

    /// Like `start`, with bytes already read from the session.
    pub(crate) fn start_with_buffer(
        session: TransportSession,
        buffered: BytesMut,
        state: Arc<AtomicU8>,
        metrics: Arc<Metrics>,
        channel_capacity: usize,
        max_frame_bytes: usize,
    ) -> Arc<Self> {
        let host = session.host().to_string();
        let peer = session.peer().to_string();
        let (reader, writer) = session.into_split();
        let shared = Arc::new(Shared {
            table: Mutex::new(WaiterTable::new()),
            writer: AsyncMutex::new(Some(writer)),
            state,
            metrics,
            channel_capacity: channel_capacity.max(1),
            table_changed: Notify::new(),
        });
        let (control_tx, control_rx) = oneshot::channel();
        let task = tokio::spawn(decode_loop(
            Arc::clone(&shared),
            reader,
            buffered,
            control_rx,
            max_frame_bytes,
        ));
        debug!("Decode loop started for {}", peer);
        Arc::new(Self {
            shared,
            control: Mutex::new(Some(control_tx)),
            task: Mutex::new(Some(task)),
            host,
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Allocate an ID and a waiter for it. Streams get a bounded channel; single responses a one-slot channel.
    pub fn register(&self, expects_stream: bool) -> Result<(WaiterId, mpsc::Receiver<Delivery>)> {
        let mut table = self.shared.lock_table();
        table.check_open()?;
        let id = table.allocate_id()?;
        let capacity = if expects_stream {
            self.shared.channel_capacity
        } else {
            1
        };
        let (tx, rx) = mpsc::channel(capacity);
        let waiter = table.insert(id, tx, expects_stream);
        drop(table);
        self.shared.table_changed.notify_one();
        Ok((waiter, rx))
    }

    /// Retire a waiter. Later frames for its ID are discarded. A newer request that reused the ID is left alone.
    pub fn unregister(&self, waiter: WaiterId) -> bool {
        let removed = self.shared.lock_table().remove(waiter);
        if removed {
            self.shared.table_changed.notify_one();
        }
        removed
    }

    pub fn outstanding(&self) -> usize {
        self.shared.lock_table().waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_table().closed.is_some()
    }

    pub async fn send(&self, waiter: WaiterId, op: ProtocolOp) -> Result<()> {
        self.send_with_controls(waiter, op, None).await
    }

    /// Encode and write one request. Failure retires `waiter`.
    pub async fn send_with_controls(
        &self,
        waiter: WaiterId,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Result<()> {
        let message = LdapMessage {
            message_id: waiter.message_id,
            protocol_op: op,
            controls,
        };
        let written = match encode_ldap_message(&message) {
            Ok(bytes) => self.write_frame(&bytes).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.unregister(waiter);
            return Err(e);
        }
        self.shared.metrics.inc_request(&message.protocol_op);
        debug!(
            "Sent {} (message ID {}) to {}",
            message.protocol_op.name(),
            waiter.message_id,
            self.peer
        );
        Ok(())
    }

    /// Send an operation that gets no response (Unbind, Abandon) under a fresh ID.
    pub async fn send_oneway(&self, op: ProtocolOp) -> Result<i32> {
        let id = {
            let mut table = self.shared.lock_table();
            table.check_open()?;
            table.allocate_id()?
        };
        let message = LdapMessage::new(id, op);
        let bytes = encode_ldap_message(&message)?;
        self.write_frame(&bytes).await?;
        self.shared.metrics.inc_request(&message.protocol_op);
        debug!(
            "Sent {} (message ID {}) to {}",
            message.protocol_op.name(),
            id,
            self.peer
        );
        Ok(id)
    }

    /// Frames are written whole under the writer lock.
    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.shared.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LdapError::connection_lost(self.closed_reason()));
        };
        let written = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        drop(guard);
        if let Err(e) = written {
            let reason = format!("write failed: {}", e);
            self.signal(LoopCommand::Shutdown(reason.clone()));
            return Err(LdapError::connection_lost(reason));
        }
        Ok(())
    }

    fn closed_reason(&self) -> String {
        self.shared
            .lock_table()
            .closed
            .clone()
            .unwrap_or_else(|| "transport closed".to_string())
    }

    fn signal(&self, cmd: LoopCommand) -> bool {
        let control = self
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match control {
            Some(control) => control.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Ask the loop to stop without waiting for it.
    pub fn signal_shutdown(&self, reason: &str) {
        self.signal(LoopCommand::Shutdown(reason.to_string()));
    }

    /// Stop the loop and wait for it. Waiters still registered receive ConnectionLost.
    pub async fn shutdown(&self, reason: &str) {
        self.signal_shutdown(reason);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        // The loop may have exited on its own before the command arrived.
        self.shared.teardown(reason, Backlog::default()).await;
        info!("Disconnected from {}: {}", self.peer, reason);
    }

    /// Pause the loop and take the transport back, together with any bytes read past the last frame.
    /// Requires that no request is outstanding.
    pub(crate) async fn release(&self) -> Result<(TransportSession, BytesMut)> {
        {
            let mut table = self.shared.lock_table();
            table.check_open()?;
            if !table.waiters.is_empty() {
                return Err(LdapError::OutstandingRequests(table.waiters.len()));
            }
            table.closed = Some("transport released".to_string());
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Err(LdapError::connection_lost(self.closed_reason()));
        };
        self.signal(LoopCommand::Release);
        let exit = task
            .await
            .map_err(|e| LdapError::connection_lost(format!("decode loop failed: {}", e)))?;
        match exit {
            LoopExit::Released { reader, buffered } => {
                let writer = self
                    .shared
                    .writer
                    .lock()
                    .await
                    .take()
                    .ok_or_else(|| LdapError::connection_lost("transport closed"))?;
                let stream = reader.unsplit(writer);
                Ok((
                    TransportSession::from_parts(stream, self.host.clone(), self.peer.clone()),
                    buffered,
                ))
            }
            LoopExit::Closed => Err(LdapError::connection_lost(self.closed_reason())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap_protocol::{
        parse_ldap_message, LdapResult, PartialAttribute, ResultCode, SearchResultEntry,
        DEFAULT_MAX_FRAME_BYTES,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Arc<RequestDispatcher>, TcpStream, Arc<AtomicU8>, Arc<Metrics>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let session = TransportSession::connect("127.0.0.1", port, Duration::from_secs(2), None)
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let state = Arc::new(AtomicU8::new(ConnectionState::Connected as u8));
        let metrics = Arc::new(Metrics::new());
        let dispatcher = RequestDispatcher::start(
            session,
            Arc::clone(&state),
            Arc::clone(&metrics),
            16,
            DEFAULT_MAX_FRAME_BYTES,
        );
        (dispatcher, server, state, metrics)
    }

    async fn write(server: &mut TcpStream, id: i32, op: ProtocolOp) {
        let bytes = encode_ldap_message(&LdapMessage::new(id, op)).unwrap();
        server.write_all(&bytes).await.unwrap();
    }

    fn entry(dn: &str) -> ProtocolOp {
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: vec![PartialAttribute {
                attr_type: "cn".to_string(),
                attr_values: vec![b"x".to_vec()],
            }],
        })
    }

    fn done() -> ProtocolOp {
        ProtocolOp::SearchResultDone(LdapResult::new(ResultCode::Success, ""))
    }

    #[test]
    fn test_allocate_ids_sequential() {
        let mut table = WaiterTable::new();
        assert_eq!(table.allocate_id().unwrap(), 1);
        assert_eq!(table.allocate_id().unwrap(), 2);
        assert_eq!(table.allocate_id().unwrap(), 3);
    }

    #[test]
    fn test_allocate_ids_wrap_and_skip_registered() {
        let mut table = WaiterTable::new();
        table.next_id = i32::MAX;
        for id in [1, 2] {
            let (tx, _rx) = mpsc::channel(1);
            table.insert(id, tx, false);
        }
        assert_eq!(table.allocate_id().unwrap(), i32::MAX);
        assert_eq!(table.allocate_id().unwrap(), 3);
    }

    #[test]
    fn test_closed_table_rejects() {
        let mut table = WaiterTable::new();
        table.closed = Some("gone".to_string());
        assert!(matches!(
            table.check_open(),
            Err(LdapError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn test_is_terminal() {
        assert!(is_terminal(&done(), true));
        assert!(!is_terminal(&entry("cn=x"), true));
        assert!(!is_terminal(&ProtocolOp::SearchResultReference(vec!["ldap://x/".into()]), true));
        assert!(is_terminal(
            &ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
            false
        ));
    }

    #[tokio::test]
    async fn test_routes_by_message_id() {
        let (dispatcher, mut server, _state, metrics) = pair().await;
        let (search_id, mut search_rx) = dispatcher.register(true).unwrap();
        let (bind_id, mut bind_rx) = dispatcher.register(false).unwrap();
        assert_ne!(search_id, bind_id);
        assert_eq!(dispatcher.outstanding(), 2);

        write(&mut server, search_id.message_id, entry("cn=a")).await;
        write(
            &mut server,
            bind_id.message_id,
            ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
        )
        .await;
        write(&mut server, search_id.message_id, entry("cn=b")).await;
        write(&mut server, search_id.message_id, done()).await;

        let bind = bind_rx.recv().await.unwrap().unwrap();
        assert!(matches!(bind.protocol_op, ProtocolOp::BindResponse(_)));

        let mut dns = Vec::new();
        loop {
            let msg = search_rx.recv().await.unwrap().unwrap();
            match msg.protocol_op {
                ProtocolOp::SearchResultEntry(e) => dns.push(e.object_name),
                ProtocolOp::SearchResultDone(_) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(dns, vec!["cn=a", "cn=b"]);
        assert_eq!(dispatcher.outstanding(), 0);
        assert_eq!(metrics.snapshot().entries_received, 2);
    }

    #[tokio::test]
    async fn test_unknown_id_discarded() {
        let (dispatcher, mut server, _state, metrics) = pair().await;
        let (id, mut rx) = dispatcher.register(false).unwrap();

        write(&mut server, 999, done()).await;
        write(
            &mut server,
            id.message_id,
            ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
        )
        .await;

        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.message_id, id.message_id);
        assert_eq!(metrics.snapshot().frames_discarded, 1);
        assert!(!dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_receiver_retires_waiter() {
        let (dispatcher, mut server, _state, _metrics) = pair().await;
        let (stream_id, stream_rx) = dispatcher.register(true).unwrap();
        drop(stream_rx);
        let (bind_id, mut bind_rx) = dispatcher.register(false).unwrap();

        write(&mut server, stream_id.message_id, entry("cn=late")).await;
        write(
            &mut server,
            bind_id.message_id,
            ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
        )
        .await;

        bind_rx.recv().await.unwrap().unwrap();
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_server_close_fails_waiters() {
        let (dispatcher, server, state, metrics) = pair().await;
        let (_id, mut rx) = dispatcher.register(true).unwrap();
        drop(server);

        match rx.recv().await {
            Some(Err(LdapError::ConnectionLost { .. })) | None => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(
            state.load(Ordering::SeqCst),
            ConnectionState::Disconnected as u8
        );
        assert!(matches!(
            dispatcher.register(false),
            Err(LdapError::ConnectionLost { .. })
        ));
        assert_eq!(metrics.snapshot().connections_lost, 1);
    }

    #[tokio::test]
    async fn test_garbage_is_fatal() {
        let (dispatcher, mut server, state, metrics) = pair().await;
        let (_id, mut rx) = dispatcher.register(false).unwrap();
        server.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Err(LdapError::ConnectionLost { .. }))
        ));
        assert_eq!(
            state.load(Ordering::SeqCst),
            ConnectionState::Disconnected as u8
        );
        assert_eq!(metrics.snapshot().protocol_errors, 1);
    }

    #[tokio::test]
    async fn test_notice_of_disconnection_is_fatal() {
        let (dispatcher, mut server, _state, _metrics) = pair().await;
        let (_id, mut rx) = dispatcher.register(false).unwrap();
        write(
            &mut server,
            0,
            ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: LdapResult::new(ResultCode::Unavailable, "shutting down"),
                response_name: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
                response_value: None,
            }),
        )
        .await;

        match rx.recv().await {
            Some(Err(LdapError::ConnectionLost { reason })) => {
                assert!(reason.contains("notice of disconnection"), "{}", reason)
            }
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert!(dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_send_writes_frame() {
        let (dispatcher, mut server, _state, metrics) = pair().await;
        let (id, _rx) = dispatcher.register(false).unwrap();
        dispatcher
            .send(id, ProtocolOp::AbandonRequest(42))
            .await
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        let msg = parse_ldap_message(&buf[..n]).unwrap();
        assert_eq!(msg.message_id, id.message_id);
        assert_eq!(msg.protocol_op, ProtocolOp::AbandonRequest(42));
        assert_eq!(metrics.snapshot().requests_other, 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_closes() {
        let (dispatcher, mut server, state, _metrics) = pair().await;
        let (_id, mut rx) = dispatcher.register(true).unwrap();

        dispatcher.shutdown("client disconnect").await;

        assert!(matches!(
            rx.recv().await,
            Some(Err(LdapError::ConnectionLost { .. }))
        ));
        assert_eq!(
            state.load(Ordering::SeqCst),
            ConnectionState::Disconnected as u8
        );
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        // Second shutdown is a no-op.
        dispatcher.shutdown("again").await;
    }

    #[tokio::test]
    async fn test_release_returns_transport() {
        let (dispatcher, _server, _state, _metrics) = pair().await;
        let (session, buffered) = dispatcher.release().await.unwrap();
        assert!(!session.is_tls());
        assert!(buffered.is_empty());
        assert!(dispatcher.is_closed());
    }

    #[tokio::test]
    async fn test_release_refused_with_outstanding() {
        let (dispatcher, _server, _state, _metrics) = pair().await;
        let (_id, _rx) = dispatcher.register(false).unwrap();
        assert!(matches!(
            dispatcher.release().await,
            Err(LdapError::OutstandingRequests(1))
        ));
    }

    #[tokio::test]
    async fn test_full_stream_does_not_block_other_waiters() {
        let (dispatcher, mut server, _state, _metrics) = pair().await;
        let (search_id, mut search_rx) = dispatcher.register(true).unwrap();
        let (bind_id, mut bind_rx) = dispatcher.register(false).unwrap();

        for i in 0..40 {
            write(&mut server, search_id.message_id, entry(&format!("cn={}", i))).await;
        }
        write(&mut server, search_id.message_id, done()).await;
        write(
            &mut server,
            bind_id.message_id,
            ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
        )
        .await;

        let bind = tokio::time::timeout(Duration::from_secs(2), bind_rx.recv())
            .await
            .expect("bind response held behind a full stream")
            .unwrap()
            .unwrap();
        assert_eq!(bind.message_id, bind_id.message_id);

        for i in 0..40 {
            match search_rx.recv().await.unwrap().unwrap().protocol_op {
                ProtocolOp::SearchResultEntry(e) => assert_eq!(e.object_name, format!("cn={}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            search_rx.recv().await.unwrap().unwrap().protocol_op,
            ProtocolOp::SearchResultDone(_)
        ));
        assert_eq!(dispatcher.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_stalled_loop_resumes_for_new_waiter() {
        let (dispatcher, mut server, _state, _metrics) = pair().await;
        let (search_id, mut search_rx) = dispatcher.register(true).unwrap();
        for i in 0..40 {
            write(&mut server, search_id.message_id, entry(&format!("cn={}", i))).await;
        }
        // Only the undrained stream is registered, so reading pauses.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (bind_id, mut bind_rx) = dispatcher.register(false).unwrap();
        write(
            &mut server,
            bind_id.message_id,
            ProtocolOp::BindResponse(LdapResult::new(ResultCode::Success, "")),
        )
        .await;
        let bind = tokio::time::timeout(Duration::from_secs(2), bind_rx.recv())
            .await
            .expect("stalled loop did not resume for the new waiter")
            .unwrap()
            .unwrap();
        assert_eq!(bind.message_id, bind_id.message_id);

        write(&mut server, search_id.message_id, done()).await;
        let mut entries = 0;
        loop {
            match search_rx.recv().await.unwrap().unwrap().protocol_op {
                ProtocolOp::SearchResultEntry(_) => entries += 1,
                ProtocolOp::SearchResultDone(_) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(entries, 40);
    }

    #[tokio::test]
    async fn test_queued_entries_delivered_before_connection_lost() {
        let (dispatcher, mut server, state, _metrics) = pair().await;
        let (search_id, mut search_rx) = dispatcher.register(true).unwrap();
        for i in 0..20 {
            write(&mut server, search_id.message_id, entry(&format!("cn={}", i))).await;
        }
        drop(server);
        // Let the loop fill the channel and queue the rest.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..20 {
            match search_rx.recv().await.unwrap().unwrap().protocol_op {
                ProtocolOp::SearchResultEntry(e) => assert_eq!(e.object_name, format!("cn={}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
        match search_rx.recv().await {
            Some(Err(LdapError::ConnectionLost { .. })) | None => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(
            state.load(Ordering::SeqCst),
            ConnectionState::Disconnected as u8
        );
    }

    #[tokio::test]
    async fn test_unregister_ignores_reused_id() {
        let (dispatcher, _server, _state, _metrics) = pair().await;
        let (first, _first_rx) = dispatcher.register(false).unwrap();
        assert!(dispatcher.unregister(first));

        dispatcher.shared.lock_table().next_id = first.message_id;
        let (second, _second_rx) = dispatcher.register(true).unwrap();
        assert_eq!(second.message_id, first.message_id);
        assert_ne!(second, first);

        assert!(!dispatcher.unregister(first));
        assert_eq!(dispatcher.outstanding(), 1);
        assert!(dispatcher.unregister(second));
        assert_eq!(dispatcher.outstanding(), 0);
    }
}
