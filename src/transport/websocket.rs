//! WebSocket transport (`ws://` or `wss://`) to the echo endpoint.

use super::{
    Connection, Connector, MessageSink, MessageSource, TransportError, CLOSE_NORMAL,
    CLOSE_NO_STATUS,
};
use crate::socket::{RawFd, RawSocketAccessor, SocketHandle};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector as TlsConnector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Path served by the echo endpoint.
pub const ECHO_PATH: &str = "/echo";

/// Dials the echo endpoint and performs the response-size handshake.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// `host:port` part of the address
    host: String,
    /// Optional path prefix in front of `/echo`
    path_prefix: String,
    tls: bool,
    response_size: u64,
    source_port: Option<u16>,
    handshake_timeout: Duration,
}

impl WsConnector {
    /// `address` is `host:port` optionally followed by a path prefix.
    pub fn new(address: &str, tls: bool, response_size: u64) -> Self {
        let (host, path_prefix) = match address.find('/') {
            Some(pos) => (&address[..pos], address[pos..].trim_end_matches('/')),
            None => (address, ""),
        };

        Self {
            host: host.to_string(),
            path_prefix: path_prefix.to_string(),
            tls,
            response_size,
            source_port: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Bind every connection to a fixed local port.
    pub fn with_source_port(mut self, port: Option<u16>) -> Self {
        self.source_port = port;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}{}{ECHO_PATH}", self.host, self.path_prefix)
    }

    fn tls_connector(&self) -> Result<TlsConnector, TransportError> {
        if !self.tls {
            return Ok(TlsConnector::Plain);
        }
        // Measurement endpoints commonly use self-signed certificates.
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| TransportError::Transport(e.to_string()))?;
        Ok(TlsConnector::NativeTls(connector))
    }

    async fn dial(&self) -> Result<TcpStream, TransportError> {
        let mut last_error = None;
        for addr in lookup_host(&self.host).await? {
            match dial_addr(addr, self.source_port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Dial attempt failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))
            .into())
    }

    async fn establish(&self) -> Result<Connection, TransportError> {
        let stream = self.dial().await?;
        let (ws, _response) = tokio_tungstenite::client_async_tls_with_config(
            self.url(),
            stream,
            None,
            Some(self.tls_connector()?),
        )
        .await?;

        let socket = SocketHandle::of(ws.get_ref());
        debug!(fd = ?socket.map(|s| s.fd()), "WebSocket handshake complete");
        let (mut sink, stream) = ws.split();

        sink.send(Message::Text(self.response_size.to_string()))
            .await?;

        Ok(Connection {
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: stream }),
            socket,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        debug!(url = %self.url(), "Connecting");
        tokio::time::timeout(self.handshake_timeout, self.establish())
            .await
            .map_err(|_| TransportError::Timeout)?
    }
}

/// Create a non-blocking client socket with Nagle disabled.
fn client_socket(addr: SocketAddr, source_port: Option<u16>) -> io::Result<TcpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nodelay(true)?;
    if let Some(port) = source_port {
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, port).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, port).into(),
        };
        socket.set_reuse_address(true)?;
        socket.bind(&local.into())?;
    }
    socket.set_nonblocking(true)?;

    Ok(TcpSocket::from_std_stream(socket.into()))
}

async fn dial_addr(addr: SocketAddr, source_port: Option<u16>) -> io::Result<TcpStream> {
    client_socket(addr, source_port)?.connect(addr).await
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(&frame).into_owned();
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        self.inner.send(Message::Close(Some(frame))).await?;
        Ok(())
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Bytes::from(text)),
                Some(Ok(Message::Binary(data))) => return Ok(Bytes::from(data)),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
                    return Err(TransportError::Closed(code));
                }
                // ping/pong are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(TransportError::Transport(
                        "stream ended without close frame".to_string(),
                    ))
                }
            }
        }
    }
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                TransportError::Closed(CLOSE_NORMAL)
            }
            WsError::Io(e) => TransportError::Io(e),
            other => TransportError::Transport(other.to_string()),
        }
    }
}

impl RawSocketAccessor for TcpStream {
    #[cfg(unix)]
    fn raw_socket(&self) -> Option<RawFd> {
        use std::os::unix::io::AsRawFd;
        Some(self.as_raw_fd())
    }

    #[cfg(not(unix))]
    fn raw_socket(&self) -> Option<RawFd> {
        None
    }
}

impl RawSocketAccessor for tokio_native_tls::TlsStream<TcpStream> {
    fn raw_socket(&self) -> Option<RawFd> {
        // TlsStream -> native_tls::TlsStream -> AllowStd -> TcpStream
        self.get_ref().get_ref().get_ref().raw_socket()
    }
}

impl RawSocketAccessor for MaybeTlsStream<TcpStream> {
    fn raw_socket(&self) -> Option<RawFd> {
        match self {
            MaybeTlsStream::Plain(stream) => stream.raw_socket(),
            MaybeTlsStream::NativeTls(stream) => stream.raw_socket(),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }
}
