//! Socket statistics sampler.
//!
//! Runs on its own OS thread. While the pacer has a request armed, the
//! sampler busy-polls the socket for `TcpCounters`; on disarm it writes
//! only the transitions of the captured sequence, tagged with the message id.
//!
//! Busy-polling trades CPU for resolution: counters can change within
//! sub-millisecond windows, and a window lasts for one outstanding write.

use crate::message::{unix_nanos, RESET_ID};
use crate::socket::{SocketStats, TcpCounters};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, TryRecvError};
use std::io::{self, Write};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Events sent by the pacer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerCommand {
    /// A request with this id is being written. `Arm(0)` stops the sampler.
    Arm(u64),
    /// The write completed.
    Disarm,
    /// The run is over.
    Stop,
}

/// One captured sample.
#[derive(Debug, Clone, PartialEq)]
pub struct TcpSnapshot {
    pub timestamp: DateTime<Utc>,
    pub message_id: u64,
    pub counters: TcpCounters,
}

/// Keep snapshot `i` only if `i == 0` or its counters differ from `i - 1`.
pub fn transitions(mut snapshots: Vec<TcpSnapshot>) -> Vec<TcpSnapshot> {
    snapshots.dedup_by(|current, previous| current.counters == previous.counters);
    snapshots
}

enum WindowEnd {
    Continue,
    Stop,
}

/// Sampler state owned by the sampler thread.
pub struct Sampler<S, W> {
    socket: Option<S>,
    commands: Receiver<SamplerCommand>,
    handoff: Receiver<S>,
    output: W,
    buffer: Vec<TcpSnapshot>,
    windows: u64,
}

impl<S, W> Sampler<S, W>
where
    S: SocketStats,
    W: Write,
{
    pub fn new(
        socket: Option<S>,
        commands: Receiver<SamplerCommand>,
        handoff: Receiver<S>,
        output: W,
    ) -> Self {
        Self {
            socket,
            commands,
            handoff,
            output,
            buffer: Vec::new(),
            windows: 0,
        }
    }

    /// Run the sampler on a dedicated thread.
    pub fn spawn(self) -> io::Result<JoinHandle<io::Result<u64>>>
    where
        S: Send + 'static,
        W: Send + 'static,
    {
        thread::Builder::new()
            .name("tcp-sampler".to_string())
            .spawn(move || self.run())
    }

    /// Sample until told to stop. Returns the number of windows sampled.
    pub fn run(mut self) -> io::Result<u64> {
        writeln!(self.output, "{}", TcpCounters::csv_header())?;

        loop {
            let command = match self.commands.recv() {
                Ok(command) => command,
                // pacer gone
                Err(_) => break,
            };

            match command {
                SamplerCommand::Arm(RESET_ID) | SamplerCommand::Stop => break,
                SamplerCommand::Arm(id) => {
                    self.take_handoff()?;
                    if let WindowEnd::Stop = self.sample_window(id)? {
                        break;
                    }
                }
                SamplerCommand::Disarm => {}
            }
        }

        self.output.flush()?;
        info!(windows = self.windows, "Sampler stopped");
        Ok(self.windows)
    }

    /// Swap to the newest socket published by the resilience manager.
    fn take_handoff(&mut self) -> io::Result<()> {
        let mut replaced = false;
        while let Ok(socket) = self.handoff.try_recv() {
            self.socket = Some(socket);
            replaced = true;
        }
        if replaced {
            debug!("Sampler switched to the new connection");
            writeln!(
                self.output,
                "{},-1,Connection Reset",
                unix_nanos(Utc::now())
            )?;
        }
        Ok(())
    }

    fn sample_window(&mut self, mut id: u64) -> io::Result<WindowEnd> {
        let mut warned = false;

        loop {
            let next = match &self.socket {
                Some(socket) => {
                    match socket.snapshot() {
                        Ok(counters) => self.buffer.push(TcpSnapshot {
                            timestamp: Utc::now(),
                            message_id: id,
                            counters,
                        }),
                        Err(e) if !warned => {
                            warn!(id, error = %e, "Failed to read TCP statistics");
                            warned = true;
                        }
                        Err(_) => {}
                    }
                    match self.commands.try_recv() {
                        Ok(command) => Some(command),
                        Err(TryRecvError::Empty) => None,
                        Err(TryRecvError::Disconnected) => Some(SamplerCommand::Stop),
                    }
                }
                // nothing to poll, just wait for the window to end
                None => Some(self.commands.recv().unwrap_or(SamplerCommand::Stop)),
            };

            match next {
                None => continue,
                Some(SamplerCommand::Disarm) => {
                    self.flush_window()?;
                    return Ok(WindowEnd::Continue);
                }
                Some(SamplerCommand::Arm(RESET_ID)) | Some(SamplerCommand::Stop) => {
                    self.flush_window()?;
                    return Ok(WindowEnd::Stop);
                }
                Some(SamplerCommand::Arm(next_id)) => {
                    self.flush_window()?;
                    id = next_id;
                }
            }
        }
    }

    fn flush_window(&mut self) -> io::Result<()> {
        self.windows += 1;
        for snapshot in transitions(std::mem::take(&mut self.buffer)) {
            write!(
                self.output,
                "{},{},",
                unix_nanos(snapshot.timestamp),
                snapshot.message_id
            )?;
            snapshot.counters.write_csv(&mut self.output)?;
            writeln!(self.output)?;
        }
        Ok(())
    }
}
