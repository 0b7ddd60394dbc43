//! Measurement message model, JSON wire codec and output records.
//!
//! A measurement message carries its own client and server timestamps, so a
//! response can be turned into a latency record without any side table.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use thiserror::Error;

/// Reserved id: connection reset marker (and graceful close on the wire).
pub const RESET_ID: u64 = 0;

/// Bytes taken by the JSON envelope around the payload.
///
/// A payload of `size - ENVELOPE_OVERHEAD` characters yields a message of
/// roughly `size` bytes on the wire.
pub const ENVELOPE_OVERHEAD: u64 = 62;

/// Header of the round-trip records file.
pub const RECORD_HEADER: &str = "#client-send-timestamp,server-timestamp,e2e-rtt";

/// The unit exchanged with the echo peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MeasurementMessage {
    pub id: u64,
    pub client_timestamp: DateTime<Utc>,
    /// Unset until the peer stamps the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<DateTime<Utc>>,
    pub payload: String,
    /// Hint to the peer for reply payload sizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
}

impl MeasurementMessage {
    /// Build a request leaving the client at `sent_at`.
    pub fn request(id: u64, sent_at: DateTime<Utc>, payload: String, response_size: u64) -> Self {
        Self {
            id,
            client_timestamp: sent_at,
            server_timestamp: None,
            payload,
            response_size: Some(response_size),
        }
    }

    /// Build the marker sent right after a connection has been replaced.
    pub fn reset_marker(sent_at: DateTime<Utc>, response_size: u64) -> Self {
        Self::request(RESET_ID, sent_at, String::new(), response_size)
    }

    pub fn is_reset_marker(&self) -> bool {
        self.id == RESET_ID
    }
}

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed measurement message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message for the wire.
pub fn encode(message: &MeasurementMessage) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode a message received from the wire.
pub fn decode(frame: &[u8]) -> Result<MeasurementMessage, CodecError> {
    Ok(serde_json::from_slice(frame)?)
}

/// Random alphanumeric payload of exactly `len` characters.
pub fn random_payload(len: u64) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len as usize)
        .map(char::from)
        .collect()
}

/// Payload length that brings a message to `message_size` bytes.
pub fn payload_len_for(message_size: u64) -> u64 {
    message_size.saturating_sub(ENVELOPE_OVERHEAD)
}

/// One line of the round-trip records file.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputRecord {
    /// A completed round trip.
    RoundTrip {
        client_ns: i64,
        server_ns: i64,
        latency_ms: f64,
    },
    /// The peer echoed a reset marker: the connection was replaced.
    Reset { client_ns: i64, server_ns: i64 },
}

impl OutputRecord {
    /// Turn a response received at `received_at` into a record.
    pub fn from_response(message: &MeasurementMessage, received_at: DateTime<Utc>) -> Self {
        let client_ns = unix_nanos(message.client_timestamp);
        let server_ns = message.server_timestamp.map(unix_nanos).unwrap_or(0);

        if message.is_reset_marker() {
            return OutputRecord::Reset {
                client_ns,
                server_ns,
            };
        }

        let elapsed = received_at - message.client_timestamp;
        let latency_ms = match elapsed.num_nanoseconds() {
            Some(ns) => ns as f64 / 1_000_000.0,
            None => elapsed.num_milliseconds() as f64,
        };

        OutputRecord::RoundTrip {
            client_ns,
            server_ns,
            latency_ms,
        }
    }

    /// Latency in milliseconds, `-1` for reset records.
    pub fn latency_ms(&self) -> f64 {
        match self {
            OutputRecord::RoundTrip { latency_ms, .. } => *latency_ms,
            OutputRecord::Reset { .. } => -1.0,
        }
    }

    /// Append this record as one CSV line.
    pub fn write_line<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        match self {
            OutputRecord::RoundTrip {
                client_ns,
                server_ns,
                latency_ms,
            } => writeln!(out, "{client_ns},{server_ns},{latency_ms}"),
            OutputRecord::Reset {
                client_ns,
                server_ns,
            } => writeln!(out, "{client_ns},{server_ns},-1"),
        }
    }
}

/// Nanoseconds since the Unix epoch, saturating outside chrono's range.
pub fn unix_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or(i64::MAX)
}
