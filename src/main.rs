//! latency-probe: WebSocket end-to-end latency tester
//!
//! Client mode paces measurement messages to an echo endpoint and records:
//! - the round-trip latency of every response (`<log>.csv`)
//! - kernel TCP counters sampled while each request is written (`<log>_tcpstats.csv`)
//!
//! Lost connections are re-established inline and marked in both files.
//! Server mode runs the matching echo endpoint.

mod client;
mod config;
mod correlator;
mod message;
mod pacer;
mod resilience;
mod sampler;
mod server;
mod socket;
mod transport;

#[cfg(test)]
mod testing;

use config::{Config, Mode};
use server::Server;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    match config.mode {
        Mode::Client => run_client(&runtime, config),
        Mode::Server => run_server(&runtime, config),
    }
}

fn run_client(runtime: &Runtime, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = &config.client;
    info!(
        address = client.address.as_deref().unwrap_or_default(),
        tls = client.tls,
        reps = client.reps,
        interval_ms = client.interval_ms,
        request_payload = client.request_payload,
        response_payload = client.response_payload,
        log = %client.log,
        tcp_stats = client.tcp_stats,
        max_reconnect_attempts = client.max_reconnect_attempts,
        "Starting latency-probe client"
    );

    let summary = runtime.block_on(client::run(client))?;
    info!(
        sent = summary.sent,
        reconnects = summary.reconnects,
        "Measurement complete"
    );
    Ok(())
}

fn run_server(runtime: &Runtime, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.server.listen,
        max_connections = config.server.max_connections,
        workers = ?config.workers,
        "Starting latency-probe echo server"
    );

    let server = Server::new(config.server);
    runtime.block_on(server.run())?;
    Ok(())
}
