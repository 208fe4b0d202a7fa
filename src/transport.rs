use crate::error::{LdapError, Result};
use crate::tls::{self, TlsOptions};
use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Stream to the directory server: plain TCP or TLS over TCP.
pub enum TransportStream {
    Tcp(TcpStream),
    Tls(Box<ClientTlsStream<TcpStream>>),
}

impl TransportStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportStream::Tls(_))
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            TransportStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            TransportStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            TransportStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            TransportStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// One open duplex byte stream to a server.
pub struct TransportSession {
    stream: TransportStream,
    host: String,
    peer: String,
}

impl TransportSession {
    /// Resolve `host`, open TCP, and with `tls` set run the TLS handshake, all within `timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout: Duration,
        tls: Option<&TlsOptions>,
    ) -> Result<Self> {
        let peer = format!("{}:{}", host, port);
        let connecting = async {
            let tcp = open_tcp(host, port, &peer).await?;
            let stream = match tls {
                Some(options) => upgrade_tls(TransportStream::Tcp(tcp), host, options).await?,
                None => TransportStream::Tcp(tcp),
            };
            Ok::<_, LdapError>(stream)
        };
        let stream = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| LdapError::ConnectTimeout {
                addr: peer.clone(),
                timeout,
            })??;
        info!("Connected to {} (tls={})", peer, stream.is_tls());
        Ok(Self {
            stream,
            host: host.to_string(),
            peer,
        })
    }

    /// Rebuild a session around a stream taken back from a running dispatcher.
    pub(crate) fn from_parts(stream: TransportStream, host: String, peer: String) -> Self {
        Self { stream, host, peer }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    /// Run the TLS handshake over the existing TCP stream (StartTLS).
    pub async fn start_tls(self, options: &TlsOptions) -> Result<Self> {
        let stream = upgrade_tls(self.stream, &self.host, options).await?;
        info!("TLS established with {}", self.peer);
        Ok(Self { stream, ..self })
    }

    pub fn into_split(self) -> (ReadHalf<TransportStream>, WriteHalf<TransportStream>) {
        tokio::io::split(self.stream)
    }
}

async fn open_tcp(host: &str, port: u16, peer: &str) -> Result<TcpStream> {
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| {
            debug!("Resolve {} failed: {}", host, e);
            LdapError::UnresolvedHost {
                host: host.to_string(),
            }
        })?
        .collect();
    if addrs.is_empty() {
        return Err(LdapError::UnresolvedHost {
            host: host.to_string(),
        });
    }

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(tcp) => {
                let _ = tcp.set_nodelay(true);
                return Ok(tcp);
            }
            Err(e) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(match last_error {
        Some(e) if e.kind() == ErrorKind::ConnectionRefused => LdapError::ConnectionRefused {
            addr: peer.to_string(),
        },
        Some(e) => LdapError::Connect {
            addr: peer.to_string(),
            source: e,
        },
        None => LdapError::UnresolvedHost {
            host: host.to_string(),
        },
    })
}

async fn upgrade_tls(stream: TransportStream, host: &str, options: &TlsOptions) -> Result<TransportStream> {
    let tcp = match stream {
        TransportStream::Tcp(tcp) => tcp,
        TransportStream::Tls(_) => return Err(LdapError::Tls("TLS already active".to_string())),
    };
    let config = tls::client_config(options)?;
    let connector = TlsConnector::from(config);
    let server_name = tls::server_name(host)?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| LdapError::Tls(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(TransportStream::Tls(Box::new(tls_stream)))
}
