//! Measurement client: wires the pacer, correlator, sampler and resilience
//! manager around one connection and runs them to completion.

use crate::config::ClientConfig;
use crate::correlator::{Correlator, CorrelatorError};
use crate::message::{payload_len_for, random_payload, RECORD_HEADER};
use crate::pacer::{Pacer, PacerError, PacerSettings};
use crate::resilience::{handoff_channels, ResilienceManager};
use crate::sampler::Sampler;
use crate::transport::{Connector, TransportError, WsConnector};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long to wait for the peer to acknowledge the close frame.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Run-level errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no echo server address configured")]
    MissingAddress,

    #[error("failed to create output file '{}': {source}", path.display())]
    Output { path: PathBuf, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to connect: {0}")]
    Connect(#[source] TransportError),

    #[error(transparent)]
    Pacer(#[from] PacerError),

    #[error(transparent)]
    Correlator(#[from] CorrelatorError),

    #[error("correlator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("sampler thread panicked")]
    SamplerPanicked,
}

/// Outcome of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub sent: u64,
    pub reconnects: u64,
    /// Round-trip records written, when the correlator saw the close
    pub recorded: Option<u64>,
    pub resets: Option<u64>,
    /// Sampling windows, when statistics were enabled
    pub windows: Option<u64>,
    pub cancelled: bool,
}

/// Run a measurement against the configured echo server.
///
/// Writes `<log>.csv` and, unless disabled, `<log>_tcpstats.csv`. Ctrl-C ends
/// the run gracefully.
pub async fn run(config: &ClientConfig) -> Result<RunSummary, ClientError> {
    let address = config
        .address
        .as_deref()
        .ok_or(ClientError::MissingAddress)?;

    let records = create_output(format!("{}.csv", config.log))?;
    let stats = if config.tcp_stats && cfg!(target_os = "linux") {
        Some(create_output(format!("{}_tcpstats.csv", config.log))?)
    } else {
        None
    };

    let connector = WsConnector::new(address, config.tls, config.response_payload)
        .with_source_port(config.source_port)
        .with_handshake_timeout(config.handshake_timeout());
    info!(url = %connector.url(), "Measuring");

    let settings = PacerSettings {
        interval: config.interval(),
        repetitions: config.reps,
        payload: random_payload(payload_len_for(config.request_payload)),
        response_size: config.response_payload,
        max_reconnect_attempts: config.max_reconnect_attempts,
        reconnect_backoff: config.reconnect_backoff(),
    };

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, finishing run");
                cancel.cancel();
            }
        }
    });

    let result = run_with(Arc::new(connector), settings, records, stats, cancel).await;
    interrupt.abort();
    result
}

/// Run a measurement over any connector.
pub async fn run_with<R, T>(
    connector: Arc<dyn Connector>,
    settings: PacerSettings,
    mut records: R,
    stats: Option<T>,
    cancel: CancellationToken,
) -> Result<RunSummary, ClientError>
where
    R: Write + Send + 'static,
    T: Write + Send + 'static,
{
    writeln!(records, "{RECORD_HEADER}")?;

    let connection = connector.connect().await.map_err(ClientError::Connect)?;
    info!(
        interval_ms = settings.interval.as_millis() as u64,
        repetitions = settings.repetitions,
        payload = settings.payload.len(),
        response_size = settings.response_size,
        tcp_stats = stats.is_some(),
        "Connected"
    );

    let (handoff, receivers) = handoff_channels();

    let (sampler_tx, sampler_thread) = match stats {
        Some(output) => {
            let (tx, rx) = crossbeam_channel::unbounded();
            let thread = Sampler::new(connection.socket, rx, receivers.socket, output).spawn()?;
            (Some(tx), Some(thread))
        }
        None => (None, None),
    };

    let mut correlator =
        tokio::spawn(Correlator::new(connection.source, receivers.reader, records).run());

    let resilience = ResilienceManager::new(Arc::clone(&connector), handoff);
    let mut pacer = Pacer::new(settings, connection.sink, resilience, cancel);
    if let Some(tx) = sampler_tx {
        pacer = pacer.with_sampler(tx);
    }
    let pacer_result = pacer.run().await;

    let correlated = match tokio::time::timeout(CLOSE_ACK_TIMEOUT, &mut correlator).await {
        Ok(joined) => Some(joined?),
        Err(_) => {
            warn!("Timed out waiting for the peer to acknowledge close");
            correlator.abort();
            None
        }
    };

    let windows = match sampler_thread {
        Some(thread) => match tokio::task::spawn_blocking(move || thread.join()).await? {
            Ok(windows) => Some(windows?),
            Err(_) => return Err(ClientError::SamplerPanicked),
        },
        None => None,
    };

    // a pacer failure explains whatever the correlator reports
    let pacer_report = pacer_result?;
    let correlator_report = correlated.transpose()?;

    let summary = RunSummary {
        sent: pacer_report.sent,
        reconnects: pacer_report.reconnects,
        recorded: correlator_report.map(|r| r.recorded),
        resets: correlator_report.map(|r| r.resets),
        windows,
        cancelled: pacer_report.cancelled,
    };
    info!(
        sent = summary.sent,
        reconnects = summary.reconnects,
        recorded = ?summary.recorded,
        cancelled = summary.cancelled,
        "Run finished"
    );
    Ok(summary)
}

fn create_output(path: String) -> Result<BufWriter<File>, ClientError> {
    let path = PathBuf::from(path);
    match File::create(&path) {
        Ok(file) => Ok(BufWriter::new(file)),
        Err(source) => Err(ClientError::Output { path, source }),
    }
}
