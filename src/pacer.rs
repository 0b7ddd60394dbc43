//! Request pacer: the top-level driver of a measurement run.
//!
//! Sends one request per tick with drift compensation: the time spent
//! encoding, writing and reconnecting is subtracted from the next sleep.
//! The pacer is the only component that mints request ids.

use crate::message::{self, CodecError, MeasurementMessage};
use crate::resilience::ResilienceManager;
use crate::sampler::SamplerCommand;
use crate::transport::{MessageSink, TransportError};
use bytes::Bytes;
use chrono::Utc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pacer errors. Both abort the run.
#[derive(Debug, Error)]
pub enum PacerError {
    #[error("reconnection budget of {attempts} attempts exhausted: {source}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("failed to encode message {id}: {source}")]
    Encode {
        id: u64,
        #[source]
        source: CodecError,
    },
}

/// Pacing parameters.
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub interval: Duration,
    /// 0 = run until cancelled
    pub repetitions: u64,
    pub payload: String,
    pub response_size: u64,
    /// Reconnect attempts allowed for a single message
    pub max_reconnect_attempts: u32,
    /// Pause after a failed establishment attempt
    pub reconnect_backoff: Duration,
}

/// Summary of a finished send loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacerReport {
    pub sent: u64,
    pub missed_deadlines: u64,
    pub reconnects: u64,
    pub cancelled: bool,
}

pub struct Pacer {
    settings: PacerSettings,
    sink: Box<dyn MessageSink>,
    resilience: ResilienceManager,
    sampler: Option<crossbeam_channel::Sender<SamplerCommand>>,
    cancel: CancellationToken,
    last_id: u64,
    report: PacerReport,
}

impl Pacer {
    pub fn new(
        settings: PacerSettings,
        sink: Box<dyn MessageSink>,
        resilience: ResilienceManager,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            settings,
            sink,
            resilience,
            sampler: None,
            cancel,
            last_id: 0,
            report: PacerReport::default(),
        }
    }

    /// Drive the sampler's arming windows from this pacer.
    pub fn with_sampler(mut self, sampler: crossbeam_channel::Sender<SamplerCommand>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Send until the repetition count is reached or the run is cancelled,
    /// then send the close frame and stop the sampler.
    ///
    /// On an exhausted reconnect budget the link is marked failed, which
    /// releases the correlator, and the error is returned.
    pub async fn run(mut self) -> Result<PacerReport, PacerError> {
        let outcome = self.send_loop().await;
        self.notify_sampler(SamplerCommand::Stop);
        self.report.reconnects = self.resilience.reconnects();

        match outcome {
            Ok(cancelled) => {
                self.report.cancelled = cancelled;
                if let Err(e) = self.sink.close().await {
                    warn!(error = %e, "Failed to send close frame");
                }
                info!(
                    sent = self.report.sent,
                    missed_deadlines = self.report.missed_deadlines,
                    reconnects = self.report.reconnects,
                    "Send loop finished"
                );
                Ok(self.report)
            }
            Err(e) => {
                error!(error = %e, "Aborting run");
                self.resilience.fail();
                Err(e)
            }
        }
    }

    /// Returns whether the loop ended because of cancellation.
    async fn send_loop(&mut self) -> Result<bool, PacerError> {
        loop {
            if self.cancel.is_cancelled() {
                info!("interrupt");
                return Ok(true);
            }

            let start = Instant::now();
            let id = self.next_id();
            let request = MeasurementMessage::request(
                id,
                Utc::now(),
                self.settings.payload.clone(),
                self.settings.response_size,
            );
            let frame = message::encode(&request)
                .map_err(|source| PacerError::Encode { id, source })?;

            self.send_with_retry(id, frame).await?;
            self.report.sent += 1;

            if self.settings.repetitions != 0 && self.report.sent >= self.settings.repetitions {
                return Ok(false);
            }

            let remaining = match self.settings.interval.checked_sub(start.elapsed()) {
                Some(remaining) => remaining,
                None => {
                    self.report.missed_deadlines += 1;
                    warn!(
                        id = id + 1,
                        "It was not possible to send message after the desired interval"
                    );
                    Duration::ZERO
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("interrupt");
                    return Ok(true);
                }
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Write one request, reconnecting inline when the write fails.
    ///
    /// Each successful reconnect is followed by a reset marker so the
    /// correlator records the discontinuity, then the same request is re-sent.
    async fn send_with_retry(&mut self, id: u64, frame: Bytes) -> Result<(), PacerError> {
        let mut attempts = 0;

        loop {
            self.notify_sampler(SamplerCommand::Arm(id));
            let written = self.sink.send(frame.clone()).await;
            self.notify_sampler(SamplerCommand::Disarm);

            let mut failure = match written {
                Ok(()) => {
                    debug!(id, "Request sent");
                    return Ok(());
                }
                Err(e) => e,
            };
            warn!(id, error = %failure, "Write failed");

            loop {
                if attempts >= self.settings.max_reconnect_attempts {
                    return Err(PacerError::ReconnectExhausted {
                        attempts,
                        source: failure,
                    });
                }
                attempts += 1;

                match self.reconnect_and_mark().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            attempt = attempts,
                            state = ?self.resilience.state(),
                            error = %e,
                            "Reconnect attempt failed"
                        );
                        failure = e;
                        tokio::time::sleep(self.settings.reconnect_backoff).await;
                    }
                }
            }
        }
    }

    async fn reconnect_and_mark(&mut self) -> Result<(), TransportError> {
        self.sink = self.resilience.reconnect().await?;

        let marker = MeasurementMessage::reset_marker(Utc::now(), self.settings.response_size);
        let frame =
            message::encode(&marker).map_err(|e| TransportError::Transport(e.to_string()))?;
        self.sink.send(frame).await
    }

    fn notify_sampler(&self, command: SamplerCommand) {
        if let Some(sampler) = &self.sampler {
            // a stopped sampler is not an error for the send path
            let _ = sampler.send(command);
        }
    }
}
