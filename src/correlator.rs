//! Response correlator (read dispatcher).
//!
//! Owns the read half of the connection. Each received frame is handed to
//! its own task which decodes it and appends an `OutputRecord`; the only
//! serialization point is the lock around the append, so records land in
//! completion order rather than id order.

use crate::message::{self, OutputRecord};
use crate::transport::MessageSource;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

/// Correlator errors.
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("connection lost and no replacement will be handed off")]
    HandoffClosed,

    #[error("failed to flush records: {0}")]
    Flush(#[from] std::io::Error),
}

/// What happened to a single received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Recorded,
    Reset,
    Dropped,
}

/// Counters reported when the correlator finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelatorReport {
    /// Round-trip records written
    pub recorded: u64,
    /// Reset markers observed
    pub resets: u64,
    /// Frames that failed to decode or could not be written
    pub dropped: u64,
}

impl CorrelatorReport {
    fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Recorded => self.recorded += 1,
            Outcome::Reset => self.resets += 1,
            Outcome::Dropped => self.dropped += 1,
        }
    }
}

pub struct Correlator<W> {
    source: Box<dyn MessageSource>,
    handoff: mpsc::UnboundedReceiver<Box<dyn MessageSource>>,
    output: Arc<Mutex<W>>,
    in_flight: JoinSet<Outcome>,
    report: CorrelatorReport,
}

impl<W> Correlator<W>
where
    W: Write + Send + 'static,
{
    pub fn new(
        source: Box<dyn MessageSource>,
        handoff: mpsc::UnboundedReceiver<Box<dyn MessageSource>>,
        output: W,
    ) -> Self {
        Self {
            source,
            handoff,
            output: Arc::new(Mutex::new(output)),
            in_flight: JoinSet::new(),
            report: CorrelatorReport::default(),
        }
    }

    /// Read until the peer closes with the expected status.
    ///
    /// Transport failures park the loop until the resilience manager hands
    /// off a new reader. Outstanding record tasks are always drained and the
    /// output flushed before returning.
    pub async fn run(mut self) -> Result<CorrelatorReport, CorrelatorError> {
        let result = self.read_loop().await;

        while let Some(joined) = self.in_flight.join_next().await {
            self.reap(joined);
        }

        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;

        info!(
            recorded = self.report.recorded,
            resets = self.report.resets,
            dropped = self.report.dropped,
            "Correlator finished"
        );
        result.map(|()| self.report)
    }

    async fn read_loop(&mut self) -> Result<(), CorrelatorError> {
        loop {
            match self.source.recv().await {
                Ok(frame) => {
                    let received_at = Utc::now();
                    self.dispatch(frame, received_at);
                }
                Err(e) if e.is_expected_close() => {
                    info!("Connection closed by peer");
                    return Ok(());
                }
                // the old reader is kept until it fails so in-flight responses still land
                Err(e) => {
                    warn!(error = %e, "Read failed, waiting for connection to reset");
                    match self.handoff.recv().await {
                        Some(source) => {
                            info!("Connection reset signaled");
                            self.source = source;
                        }
                        None => return Err(CorrelatorError::HandoffClosed),
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Bytes, received_at: DateTime<Utc>) {
        // reap what already completed so the set stays small on long runs
        while let Some(joined) = self.in_flight.try_join_next() {
            self.reap(joined);
        }

        let output = Arc::clone(&self.output);
        self.in_flight
            .spawn(async move { record_response(&frame, received_at, &output) });
    }

    fn reap(&mut self, joined: Result<Outcome, JoinError>) {
        match joined {
            Ok(outcome) => self.report.tally(outcome),
            Err(e) => {
                warn!(error = %e, "Record task failed");
                self.report.tally(Outcome::Dropped);
            }
        }
    }
}

/// Decode one response and append its record.
fn record_response<W: Write>(
    frame: &[u8],
    received_at: DateTime<Utc>,
    output: &Mutex<W>,
) -> Outcome {
    let response = match message::decode(frame) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, len = frame.len(), "Dropping undecodable response");
            return Outcome::Dropped;
        }
    };

    let record = OutputRecord::from_response(&response, received_at);
    let outcome = match record {
        OutputRecord::Reset { .. } => {
            warn!("Connection Reset");
            Outcome::Reset
        }
        OutputRecord::RoundTrip { .. } => {
            info!(
                id = response.id,
                latency_ms = record.latency_ms(),
                "Response received"
            );
            Outcome::Recorded
        }
    };

    let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = record.write_line(&mut *out) {
        warn!(id = response.id, error = %e, "Failed to write record");
        return Outcome::Dropped;
    }
    debug!(id = response.id, "Record appended");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{encode, unix_nanos, MeasurementMessage};
    use crate::testing::{ScriptedSource, SharedBuf};
    use crate::transport::{TransportError, CLOSE_NORMAL};
    use chrono::Duration;

    fn response(id: u64) -> Bytes {
        let sent = Utc::now() - Duration::milliseconds(3);
        let mut msg = MeasurementMessage::request(id, sent, "p".to_string(), 64);
        msg.server_timestamp = Some(sent + Duration::milliseconds(1));
        encode(&msg).unwrap()
    }

    fn reset_marker() -> Bytes {
        encode(&MeasurementMessage::reset_marker(Utc::now(), 64)).unwrap()
    }

    fn record_lines(out: &SharedBuf) -> Vec<String> {
        out.contents().lines().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_records_until_expected_close() {
        let source = ScriptedSource::new(vec![
            Ok(response(1)),
            Ok(response(2)),
            Err(TransportError::Closed(CLOSE_NORMAL)),
        ]);
        let (_tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();
        let out = SharedBuf::default();

        let report = Correlator::new(Box::new(source), rx, out.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(report.recorded, 2);
        assert_eq!(report.resets, 0);
        let lines = record_lines(&out);
        assert_eq!(lines.len(), 2);
        for line in lines {
            let latency: f64 = line.rsplit(',').next().unwrap().parse().unwrap();
            assert!(latency >= 3.0);
        }
    }

    #[tokio::test]
    async fn test_poison_pill_does_not_stop_reader() {
        let source = ScriptedSource::new(vec![
            Ok(Bytes::from_static(b"{garbage")),
            Ok(reset_marker()),
            Ok(response(3)),
            Err(TransportError::Closed(CLOSE_NORMAL)),
        ]);
        let (_tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();
        let out = SharedBuf::default();

        let report = Correlator::new(Box::new(source), rx, out.clone())
            .run()
            .await
            .unwrap();

        assert_eq!(
            report,
            CorrelatorReport {
                recorded: 1,
                resets: 1,
                dropped: 1
            }
        );
        let lines = record_lines(&out);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines.iter().filter(|l| l.ends_with(",-1")).count(), 1);
    }

    #[tokio::test]
    async fn test_resumes_on_handed_off_reader() {
        let broken = ScriptedSource::new(vec![
            Ok(response(1)),
            Err(TransportError::Transport("connection reset".into())),
        ]);
        let replacement = ScriptedSource::new(vec![
            Ok(reset_marker()),
            Ok(response(2)),
            Err(TransportError::Closed(CLOSE_NORMAL)),
        ]);
        let (tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();
        let out = SharedBuf::default();

        let task = tokio::spawn(Correlator::new(Box::new(broken), rx, out.clone()).run());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(Box::new(replacement)).ok();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.recorded, 2);
        assert_eq!(report.resets, 1);
        assert_eq!(record_lines(&out).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_keep_lines_whole() {
        const FRAMES: u64 = 200;
        let base = Utc::now() - Duration::seconds(1);
        let response_at = |id: u64| {
            let sent = base + Duration::milliseconds(id as i64);
            let mut msg = MeasurementMessage::request(id, sent, "p".repeat(256), 320);
            msg.server_timestamp = Some(sent);
            encode(&msg).unwrap()
        };

        // the peer answers newest first
        let mut script: Vec<_> = (1..=FRAMES).rev().map(|id| Ok(response_at(id))).collect();
        script.push(Err(TransportError::Closed(CLOSE_NORMAL)));
        let (_tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();
        let out = SharedBuf::default();

        let report = Correlator::new(Box::new(ScriptedSource::new(script)), rx, out.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.recorded, FRAMES);

        let mut sent = Vec::new();
        for line in record_lines(&out) {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 3, "broken line {line:?}");
            sent.push(fields[0].parse::<i64>().unwrap());
            fields[1].parse::<i64>().unwrap();
            fields[2].parse::<f64>().unwrap();
        }

        let mut by_id = sent.clone();
        by_id.sort_unstable();
        let expected: Vec<i64> = (1..=FRAMES)
            .map(|id| unix_nanos(base + Duration::milliseconds(id as i64)))
            .collect();
        assert_eq!(by_id, expected);
        assert_ne!(sent, by_id, "records should follow completion order");
    }

    /// Writer that panics on every write.
    struct PanickingWriter;

    impl Write for PanickingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            panic!("disk on fire");
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicked_record_tasks_count_as_dropped() {
        let source = ScriptedSource::new(vec![
            Ok(response(1)),
            Ok(response(2)),
            Ok(response(3)),
            Err(TransportError::Closed(CLOSE_NORMAL)),
        ])
        .with_pause(std::time::Duration::from_millis(10));
        let (_tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();

        let report = Correlator::new(Box::new(source), rx, PanickingWriter)
            .run()
            .await
            .unwrap();
        assert_eq!(
            report,
            CorrelatorReport {
                recorded: 0,
                resets: 0,
                dropped: 3
            }
        );
    }

    #[tokio::test]
    async fn test_unexpected_close_status_waits_for_handoff() {
        let source = ScriptedSource::new(vec![Err(TransportError::Closed(1001))]);
        let (tx, rx) = mpsc::unbounded_channel::<Box<dyn MessageSource>>();
        drop(tx);

        let result = Correlator::new(Box::new(source), rx, SharedBuf::default())
            .run()
            .await;
        assert!(matches!(result, Err(CorrelatorError::HandoffClosed)));
    }
}
