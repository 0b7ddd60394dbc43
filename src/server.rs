//! WebSocket echo server for measurement runs.
//!
//! Accepts connections on `/echo`, reads the desired response size from the
//! first text frame, then stamps every measurement message with the server
//! time and echoes it back with a payload of the requested size.

use crate::config::ServerConfig;
use crate::message::{self, payload_len_for, random_payload, ENVELOPE_OVERHEAD};
use crate::transport::ECHO_PATH;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{AcquireError, Semaphore};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, trace, warn};

/// Pending connections the kernel queues for us
const LISTEN_BACKLOG: i32 = 1024;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address '{addr}': {source}")]
    Address {
        addr: String,
        source: AddrParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connection limiter closed")]
    LimiterClosed(#[from] AcquireError),
}

/// Server instance
pub struct Server {
    config: ServerConfig,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));
        Server {
            config,
            connection_limit,
        }
    }

    /// Bind the configured listen address
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr: SocketAddr =
            self.config
                .listen
                .parse()
                .map_err(|source| ServerError::Address {
                    addr: self.config.listen.clone(),
                    source,
                })?;
        Ok(TcpListener::from_std(create_listener(addr)?)?)
    }

    /// Bind and serve until the process exits
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(
            address = %listener.local_addr()?,
            max_connections = self.config.max_connections,
            "Echo server listening"
        );
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Upgrade requests for any path other than the echo endpoint are refused.
fn check_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path().ends_with(ECHO_PATH) {
        return Ok(response);
    }
    let mut refusal = ErrorResponse::new(Some("not found".to_string()));
    *refusal.status_mut() = StatusCode::NOT_FOUND;
    Err(refusal)
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream) -> Result<(), WsError> {
    stream.set_nodelay(true)?;
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, check_path).await?;
    let mut response_size = None;

    while let Some(frame) = ws.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(WsError::ConnectionClosed) => break,
            Err(e) => return Err(e),
        };

        match frame {
            Message::Text(text) => match response_size {
                None => {
                    let size = parse_response_size(&text);
                    debug!(response_size = size, "Response size negotiated");
                    response_size = Some(size);
                }
                Some(size) => {
                    let reply = stamp(text.as_bytes(), size);
                    ws.send(Message::Text(String::from_utf8_lossy(&reply).into_owned()))
                        .await?;
                }
            },
            Message::Binary(data) => {
                let reply = stamp(&data, response_size.unwrap_or(ENVELOPE_OVERHEAD));
                ws.send(Message::Binary(reply.to_vec())).await?;
            }
            // tungstenite queues the close reply, flushed on the next poll
            Message::Close(frame) => trace!(?frame, "Close received"),
            _ => {}
        }
    }

    trace!("Connection closed by client");
    Ok(())
}

fn parse_response_size(text: &str) -> u64 {
    match text.trim().parse() {
        Ok(size) => size,
        Err(_) => {
            warn!(frame = text, "First frame is not a response size, using empty payloads");
            ENVELOPE_OVERHEAD
        }
    }
}

/// Stamp a measurement message with the server time and resize its payload.
///
/// Frames that do not decode are returned unchanged.
pub fn stamp(frame: &[u8], response_size: u64) -> Bytes {
    let mut msg = match message::decode(frame) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "Echoing undecodable frame");
            return Bytes::copy_from_slice(frame);
        }
    };

    msg.server_timestamp = Some(Utc::now());
    let size = msg.response_size.unwrap_or(response_size);
    msg.payload = random_payload(payload_len_for(size));

    match message::encode(&msg) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(id = msg.id, error = %e, "Failed to encode reply");
            Bytes::copy_from_slice(frame)
        }
    }
}
