use std::{fmt, path::Path, time::Duration};

use anyhow::{Context, Result};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use tracing::{error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt as tfmt, prelude::*};

use crate::{
    envelope::FlowKind,
    error::SupervisorError,
    flow::supervisor::FinalResult,
};

/// Install file-based logging.
///
/// - `log_level` is an `EnvFilter` directive (e.g. `"info"`).
/// - `log_file` is the daily-rolling text log under `root`.
/// - `event_file` is the daily-rolling JSON log that only receives
///   `target: "request"` events, one line per finished request.
///
/// Calling it twice is harmless; the second subscriber is not installed.
pub fn init_tracing(root: &Path, log_file: &str, event_file: &str, log_level: &str) -> Result<()> {
    std::fs::create_dir_all(root).with_context(|| format!("creating log directory {}", root.display()))?;
    let env_filter = EnvFilter::try_new(log_level).with_context(|| format!("invalid log level `{log_level}`"))?;

    let txt_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(log_file)
        .build(root)
        .context("creating text log appender")?;
    let txt_layer = tfmt::layer().with_writer(txt_appender).with_ansi(false).with_filter(env_filter);

    let json_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(event_file)
        .build(root)
        .context("creating event log appender")?;
    let json_layer = tfmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    if Registry::default().with(txt_layer).with(json_layer).try_init().is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Request counters and latency, recorded on the global meter.
#[derive(Clone)]
pub struct RequestMetrics {
    requests_started: Counter<u64>,
    requests_succeeded: Counter<u64>,
    requests_failed: Counter<u64>,
    request_latency_ms: Histogram<f64>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        let meter = global::meter("ruleflow");
        Self {
            requests_started: meter.u64_counter("requests_started").with_description("Total requests started").build(),
            requests_succeeded: meter
                .u64_counter("requests_succeeded")
                .with_description("Requests that reached the success terminal")
                .build(),
            requests_failed: meter
                .u64_counter("requests_failed")
                .with_description("Requests that ended in review or with an error")
                .build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_description("Latency per request in ms")
                .with_unit("ms")
                .build(),
        }
    }

    pub fn started(&self, flow_kind: FlowKind) {
        self.requests_started.add(1, &[KeyValue::new("flow_kind", flow_kind.as_str())]);
    }

    /// Record the outcome and emit the per-request JSON event.
    pub fn finish(&self, request_id: &str, flow_kind: FlowKind, result: &Result<FinalResult, SupervisorError>, elapsed: Duration) {
        let attrs = [KeyValue::new("flow_kind", flow_kind.as_str())];
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        self.request_latency_ms.record(latency_ms, &attrs);

        let (status, terminal, hops) = match result {
            Ok(done) if done.is_success() => ("ok", done.terminal.as_str(), done.hops),
            Ok(done) => ("review", done.terminal.as_str(), done.hops),
            Err(_) => ("error", "", 0),
        };
        match result {
            Ok(done) if done.is_success() => {
                self.requests_succeeded.add(1, &attrs);
                info!(%request_id, %flow_kind, "request succeeded in {latency_ms:.1} ms");
            }
            Ok(done) => {
                self.requests_failed.add(1, &attrs);
                info!(%request_id, %flow_kind, reason = %done.envelope.reason(), "request sent to {} in {latency_ms:.1} ms", done.terminal);
            }
            Err(err) => {
                self.requests_failed.add(1, &attrs);
                error!(%request_id, %flow_kind, error = %err, "request failed in {latency_ms:.1} ms");
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request_id,
            flow_kind = flow_kind.as_str(),
            terminal,
            hops,
            latency_ms,
            status,
        );
    }
}

impl Default for RequestMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestMetrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, MessageBody};

    #[test]
    fn test_init_tracing_creates_log_dir_and_tolerates_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("logs");
        init_tracing(&root, "ruleflow.log", "requests.json", "info").unwrap();
        init_tracing(&root, "ruleflow.log", "requests.json", "info").unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_bad_log_level_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(init_tracing(dir.path(), "a.log", "b.json", "ruleflow=loud").is_err());
    }

    #[test]
    fn test_finish_accepts_every_outcome() {
        let metrics = RequestMetrics::new();
        metrics.started(FlowKind::Rule);
        let done = FinalResult {
            request_id: "r1".into(),
            envelope: Envelope::new(FlowKind::Rule, "compile", "done", MessageBody::new()),
            terminal: "done".into(),
            hops: 5,
            records: vec![],
            total_ms: 3,
            success: true,
        };
        metrics.finish("r1", FlowKind::Rule, &Ok(done), Duration::from_millis(3));
        metrics.finish("r2", FlowKind::Content, &Err(SupervisorError::Timeout { millis: 10 }), Duration::from_millis(10));
    }
}
