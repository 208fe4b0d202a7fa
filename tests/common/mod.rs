//! Scripted directory server on loopback TCP (plain, LDAPS or StartTLS), speaking the crate's own codec.

#![allow(dead_code)]

use bytes::{Buf, BytesMut};
use ldap_session::ldap_protocol::{
    encode_ldap_message, try_parse_message, LdapMessage, LdapResult, PartialAttribute, ProtocolOp,
    ResultCode, SearchResultEntry, DEFAULT_MAX_FRAME_BYTES,
};
use ldap_session::{Connection, ConnectionOptions, TlsMode, TlsOptions};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

pub const RIEMANN_DN: &str = "uid=riemann,dc=example,dc=com";
pub const RIEMANN_PASSWORD: &str = "password";
pub const SCIENTISTS_DN: &str = "ou=scientists,dc=example,dc=com";

const SERVER_CERT_PEM: &[u8] = include_bytes!("../fixtures/server-cert.pem");
const SERVER_KEY_PEM: &[u8] = include_bytes!("../fixtures/server-key.pem");

/// Acceptor for the self-signed localhost certificate in `tests/fixtures`.
pub fn tls_acceptor() -> TlsAcceptor {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::Cursor::new(SERVER_CERT_PEM))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
    let key = rustls_pemfile::pkcs8_private_keys(&mut std::io::Cursor::new(SERVER_KEY_PEM))
        .next()
        .expect("fixture key")
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::from(key))
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Client options that accept the self-signed fixture certificate.
pub fn tls_options(mode: TlsMode) -> ConnectionOptions {
    ConnectionOptions {
        tls_mode: mode,
        tls: TlsOptions {
            skip_verify: true,
            ..TlsOptions::default()
        },
        ..ConnectionOptions::default()
    }
}

/// Server side of one accepted connection.
pub struct ServerConn<S = TcpStream> {
    stream: S,
    buffer: BytesMut,
}

impl ServerConn<TcpStream> {
    /// Server half of StartTLS: call after the success response has been sent.
    pub async fn start_tls(self, acceptor: &TlsAcceptor) -> ServerConn<TlsStream<TcpStream>> {
        assert!(self.buffer.is_empty(), "client sent data before the handshake");
        let stream = acceptor.accept(self.stream).await.unwrap();
        ServerConn {
            stream,
            buffer: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerConn<S> {
    /// Next request, or `None` once the client closed the socket.
    pub async fn recv(&mut self) -> Option<LdapMessage> {
        loop {
            match try_parse_message(&self.buffer, DEFAULT_MAX_FRAME_BYTES).ok()? {
                ldap_session::ldap_protocol::TryParseResult::Message { message, consumed } => {
                    self.buffer.advance(consumed);
                    return Some(message);
                }
                ldap_session::ldap_protocol::TryParseResult::Incomplete => {}
            }
            let n = self.stream.read_buf(&mut self.buffer).await.ok()?;
            if n == 0 {
                return None;
            }
        }
    }

    pub async fn send(&mut self, message_id: i32, op: ProtocolOp) {
        let bytes = encode_ldap_message(&LdapMessage::new(message_id, op)).unwrap();
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        // The client may already be gone.
        let _ = self.stream.write_all(bytes).await;
    }
}

pub struct MockServer {
    pub port: u16,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Accept one connection and run `script` on it.
    pub async fn spawn<F, Fut>(script: F) -> Self
    where
        F: FnOnce(ServerConn) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(ServerConn {
                stream,
                buffer: BytesMut::new(),
            })
            .await;
        });
        Self { port, handle }
    }

    /// Accept one connection, complete a TLS handshake at once (LDAPS) and run `script`.
    pub async fn spawn_ldaps<F, Fut>(script: F) -> Self
    where
        F: FnOnce(ServerConn<TlsStream<TcpStream>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let acceptor = tls_acceptor();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let stream = acceptor.accept(tcp).await.unwrap();
            script(ServerConn {
                stream,
                buffer: BytesMut::new(),
            })
            .await;
        });
        Self { port, handle }
    }

    /// Wait for the script to finish.
    pub async fn join(self) {
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("mock server did not finish")
            .unwrap();
    }
}

pub async fn connect(port: u16) -> Connection {
    connect_with(port, ConnectionOptions::default()).await
}

pub async fn connect_with(port: u16, options: ConnectionOptions) -> Connection {
    let conn = Connection::new(options);
    conn.connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .unwrap();
    conn
}

pub fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> ProtocolOp {
    ProtocolOp::SearchResultEntry(SearchResultEntry {
        object_name: dn.to_string(),
        attributes: attrs
            .iter()
            .map(|(name, values)| PartialAttribute {
                attr_type: name.to_string(),
                attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            })
            .collect(),
    })
}

pub fn done(code: ResultCode, diagnostic: &str) -> ProtocolOp {
    ProtocolOp::SearchResultDone(LdapResult::new(code, diagnostic))
}

pub fn bind_response(code: ResultCode) -> ProtocolOp {
    ProtocolOp::BindResponse(LdapResult::new(code, ""))
}

fn scientists() -> Vec<ProtocolOp> {
    vec![
        entry(
            "ou=mathematicians,dc=example,dc=com",
            &[
                ("ou", &["mathematicians"]),
                ("objectClass", &["groupOfUniqueNames", "top"]),
                (
                    "uniqueMember",
                    &[
                        "uid=euclid,dc=example,dc=com",
                        "uid=riemann,dc=example,dc=com",
                        "uid=euler,dc=example,dc=com",
                    ],
                ),
            ],
        ),
        entry(
            SCIENTISTS_DN,
            &[
                ("ou", &["scientists"]),
                ("objectClass", &["groupOfUniqueNames", "top"]),
                (
                    "uniqueMember",
                    &[
                        "uid=einstein,dc=example,dc=com",
                        "uid=galieleo,dc=example,dc=com",
                        "uid=tesla,dc=example,dc=com",
                    ],
                ),
            ],
        ),
    ]
}

/// Small read-only directory: riemann can bind, searches return the scientists groups.
/// Every received request is forwarded to `seen`.
pub async fn directory<S>(mut conn: ServerConn<S>, seen: mpsc::UnboundedSender<LdapMessage>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = conn.recv().await {
        let id = message.message_id;
        let _ = seen.send(message.clone());
        match message.protocol_op {
            ProtocolOp::BindRequest(bind) => {
                let ok = (bind.name == RIEMANN_DN
                    && bind.password == RIEMANN_PASSWORD.as_bytes())
                    || (bind.name.is_empty() && bind.password.is_empty());
                let code = if ok {
                    ResultCode::Success
                } else {
                    ResultCode::InvalidCredentials
                };
                conn.send(id, bind_response(code)).await;
            }
            ProtocolOp::SearchRequest(_) => {
                for op in scientists() {
                    conn.send(id, op).await;
                }
                conn.send(id, done(ResultCode::Success, "")).await;
            }
            ProtocolOp::UnbindRequest => return,
            _ => {}
        }
    }
}

/// Spawn [`directory`] and return the stream of requests it saw.
pub async fn spawn_directory() -> (MockServer, mpsc::UnboundedReceiver<LdapMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = MockServer::spawn(move |conn| directory(conn, tx)).await;
    (server, rx)
}
