//! In-memory transport and helpers for unit tests.

use crate::message::{decode, encode, MeasurementMessage};
use crate::socket::SocketHandle;
use crate::transport::{
    Connection, Connector, MessageSink, MessageSource, TransportError, CLOSE_NORMAL,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Cloneable in-memory writer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Source replaying a fixed script, then pending forever.
pub struct ScriptedSource {
    script: VecDeque<Result<Bytes, TransportError>>,
    pause: Duration,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Bytes, TransportError>>) -> Self {
        Self {
            script: script.into(),
            pause: Duration::ZERO,
        }
    }

    /// Wait this long before yielding each item.
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        match self.script.pop_front() {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }
}

/// Behaviour of one loopback connection.
#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    /// Break the link on the n-th send (1-based) on this connection
    pub fail_on_send: Option<u64>,
    /// Delay before each send completes
    pub send_delay: Duration,
    /// Delay before the peer echoes a message
    pub echo_delay: Duration,
}

enum Frame {
    Data(Bytes),
    Close,
}

#[derive(Default)]
struct PeerLog {
    received: Mutex<Vec<MeasurementMessage>>,
    close_frames: AtomicUsize,
}

/// Connector whose peer is an in-process echo task.
#[derive(Default)]
pub struct LoopbackConnector {
    plans: Mutex<VecDeque<LinkPlan>>,
    refuse_after: Option<usize>,
    socket: Option<SocketHandle>,
    connects: AtomicUsize,
    log: Arc<PeerLog>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan for the next connection without one; later ones use the default.
    pub fn with_plan(self, plan: LinkPlan) -> Self {
        self.plans.lock().unwrap().push_back(plan);
        self
    }

    /// Refuse every connection attempt after the first `n`.
    pub fn refuse_after(mut self, n: usize) -> Self {
        self.refuse_after = Some(n);
        self
    }

    pub fn with_socket(mut self, socket: SocketHandle) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Connection attempts, including refused ones.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every decodable message seen by any peer, in arrival order.
    pub fn received(&self) -> Vec<MeasurementMessage> {
        self.log.received.lock().unwrap().clone()
    }

    pub fn close_frames(&self) -> usize {
        self.log.close_frames.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(self.refuse_after, Some(limit) if attempt > limit) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into());
        }

        let plan = self.plans.lock().unwrap().pop_front().unwrap_or_default();
        let (to_peer, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, from_peer) = mpsc::unbounded_channel();
        tokio::spawn(echo_peer(
            peer_rx,
            peer_tx,
            plan.echo_delay,
            Arc::clone(&self.log),
        ));

        Ok(Connection {
            sink: Box::new(LoopbackSink {
                tx: Some(to_peer),
                sent: 0,
                plan,
            }),
            source: Box::new(LoopbackSource { rx: from_peer }),
            socket: self.socket,
        })
    }
}

async fn echo_peer(
    mut rx: mpsc::UnboundedReceiver<Frame>,
    tx: mpsc::UnboundedSender<Frame>,
    echo_delay: Duration,
    log: Arc<PeerLog>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Data(bytes) => {
                let reply = match decode(&bytes) {
                    Ok(mut message) => {
                        log.received.lock().unwrap().push(message.clone());
                        message.server_timestamp = Some(Utc::now());
                        encode(&message).unwrap_or(bytes)
                    }
                    Err(_) => bytes,
                };
                if !echo_delay.is_zero() {
                    tokio::time::sleep(echo_delay).await;
                }
                if tx.send(Frame::Data(reply)).is_err() {
                    break;
                }
            }
            Frame::Close => {
                log.close_frames.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(Frame::Close);
                break;
            }
        }
    }
}

struct LoopbackSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
    sent: u64,
    plan: LinkPlan,
}

#[async_trait]
impl MessageSink for LoopbackSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if !self.plan.send_delay.is_zero() {
            tokio::time::sleep(self.plan.send_delay).await;
        }
        self.sent += 1;
        if self.plan.fail_on_send == Some(self.sent) {
            // dropping the sender tears the whole link down
            self.tx = None;
            return Err(TransportError::Transport("injected write failure".into()));
        }
        self.forward(Frame::Data(frame))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.forward(Frame::Close)
    }
}

impl LoopbackSink {
    fn forward(&self, frame: Frame) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::Transport("peer gone".into())),
            None => Err(TransportError::Transport("link broken".into())),
        }
    }
}

struct LoopbackSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl MessageSource for LoopbackSource {
    async fn recv(&mut self) -> Result<Bytes, TransportError> {
        match self.rx.recv().await {
            Some(Frame::Data(bytes)) => Ok(bytes),
            Some(Frame::Close) => Err(TransportError::Closed(CLOSE_NORMAL)),
            None => Err(TransportError::Transport("link broken".into())),
        }
    }
}
