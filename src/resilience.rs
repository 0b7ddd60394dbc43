//! Connection resilience manager.
//!
//! The only component allowed to decide which connection is current. After a
//! successful re-establishment it publishes the new read half to the
//! correlator and the new socket to the sampler, one channel per subscriber,
//! exactly once per reconnect. The write half goes back to the caller.
//!
//! ```text
//! Connected --(error)--> Reconnecting --(ok)--> Connected
//!                             |
//!                             +--(budget exhausted)--> Failed
//! ```

use crate::socket::SocketHandle;
use crate::transport::{Connector, MessageSink, MessageSource, TransportError};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Link state as seen by the resilience manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    /// Terminal: no further connection will be published.
    Failed,
}

/// Publishing side of the handoff channels.
pub struct Handoff {
    reader: Option<mpsc::UnboundedSender<Box<dyn MessageSource>>>,
    socket: Option<crossbeam_channel::Sender<SocketHandle>>,
}

/// Subscriber side of the handoff channels.
pub struct HandoffReceivers {
    pub reader: mpsc::UnboundedReceiver<Box<dyn MessageSource>>,
    pub socket: crossbeam_channel::Receiver<SocketHandle>,
}

/// Create one handoff channel per dependent component.
pub fn handoff_channels() -> (Handoff, HandoffReceivers) {
    // The correlator only switches once its current reader fails, so readers
    // queue up in connection order.
    let (reader_tx, reader_rx) = mpsc::unbounded_channel();
    // The sampler only drains between windows, keeping the newest socket.
    let (socket_tx, socket_rx) = crossbeam_channel::unbounded();

    (
        Handoff {
            reader: Some(reader_tx),
            socket: Some(socket_tx),
        },
        HandoffReceivers {
            reader: reader_rx,
            socket: socket_rx,
        },
    )
}

impl Handoff {
    fn publish(&self, source: Box<dyn MessageSource>, socket: Option<SocketHandle>) {
        if let Some(reader) = &self.reader {
            if reader.send(source).is_err() {
                debug!("Correlator gone, dropping handed off reader");
            }
        }
        if let (Some(tx), Some(socket)) = (&self.socket, socket) {
            if tx.send(socket).is_err() {
                debug!("Sampler gone, dropping handed off socket");
            }
        }
    }

    fn close(&mut self) {
        self.reader = None;
        self.socket = None;
    }
}

pub struct ResilienceManager {
    connector: Arc<dyn Connector>,
    handoff: Handoff,
    state: LinkState,
    reconnects: u64,
}

impl ResilienceManager {
    /// Manage a link that was just established with `connector`.
    pub fn new(connector: Arc<dyn Connector>, handoff: Handoff) -> Self {
        Self {
            connector,
            handoff,
            state: LinkState::Connected,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Successful reconnects so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// Re-run the establishment procedure and publish the new connection.
    ///
    /// Establishment failures are returned as-is and leave the link in
    /// `Reconnecting`; retry budgeting belongs to the caller.
    pub async fn reconnect(&mut self) -> Result<Box<dyn MessageSink>, TransportError> {
        if self.state == LinkState::Failed {
            return Err(TransportError::Transport("link already failed".to_string()));
        }

        self.state = LinkState::Reconnecting;
        info!(attempt = self.reconnects + 1, "Reconnecting");

        let connection = match self.connector.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(error = %e, "Connection establishment failed");
                return Err(e);
            }
        };

        self.handoff.publish(connection.source, connection.socket);
        self.state = LinkState::Connected;
        self.reconnects += 1;
        info!(reconnects = self.reconnects, "Connection re-established");

        Ok(connection.sink)
    }

    /// Give up on the link. Dependents waiting on a handoff are released.
    pub fn fail(&mut self) {
        self.state = LinkState::Failed;
        self.handoff.close();
    }
}
