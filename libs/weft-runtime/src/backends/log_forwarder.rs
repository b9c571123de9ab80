//! Worker output forwarding.
//!
//! Worker stderr and non-frame stdout lines, as well as `log-entry` messages, are
//! re-emitted through the host's tracing with the worker's service id attached.

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::descriptor::ServiceId;
use crate::protocol::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
    Channel,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Channel => "channel",
        })
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Level of a worker output line; INFO when nothing is recognized.
///
/// Understands `tracing-subscriber` text lines (`<timestamp> LEVEL target: msg`),
/// JSON lines with a textual `level`, and pino-style numeric levels.
fn detect_level(line: &str) -> Level {
    parse_json_line(line)
        .and_then(|v| json_level(&v))
        .or_else(|| plain_level(line))
        .unwrap_or(Level::INFO)
}

fn level_from_name(name: &str) -> Option<Level> {
    match name.to_ascii_lowercase().as_str() {
        "fatal" | "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn plain_level(line: &str) -> Option<Level> {
    let mut parts = line.split_whitespace();
    parts.next()?;
    level_from_name(parts.next()?)
}

fn parse_json_line(line: &str) -> Option<Value> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') || !trimmed.contains("\"level\"") {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn json_level(value: &Value) -> Option<Level> {
    match value.get("level")? {
        Value::String(name) => level_from_name(name),
        Value::Number(n) => match n.as_u64()? {
            50.. => Some(Level::ERROR),
            40..=49 => Some(Level::WARN),
            30..=39 => Some(Level::INFO),
            20..=29 => Some(Level::DEBUG),
            _ => Some(Level::TRACE),
        },
        _ => None,
    }
}

macro_rules! emit {
    ($level:expr, $($field:tt)+) => {
        match $level {
            Level::ERROR => tracing::error!($($field)+),
            Level::WARN => tracing::warn!($($field)+),
            Level::INFO => tracing::info!($($field)+),
            Level::DEBUG => tracing::debug!($($field)+),
            _ => tracing::trace!($($field)+),
        }
    };
}

/// Forward one raw output line.
pub fn forward_line(service: &ServiceId, worker_id: Uuid, stream: StreamKind, line: &str) {
    let level = detect_level(line);
    emit!(
        level,
        service = %service,
        worker_id = %worker_id,
        stream = %stream,
        "{line}"
    );
}

/// Re-emit a structured `log-entry` message.
pub fn emit_log_entry(
    service: &ServiceId,
    worker_id: Uuid,
    level: LogLevel,
    message: &str,
    fields: &BTreeMap<String, Value>,
) {
    if fields.is_empty() {
        emit!(
            Level::from(level),
            service = %service,
            worker_id = %worker_id,
            stream = %StreamKind::Channel,
            "{message}"
        );
    } else {
        let fields = Value::Object(fields.clone().into_iter().collect());
        emit!(
            Level::from(level),
            service = %service,
            worker_id = %worker_id,
            stream = %StreamKind::Channel,
            fields = %fields,
            "{message}"
        );
    }
}

/// Forward every line of `stream` until it closes or `cancel` fires.
pub fn spawn_stream_forwarder<S>(
    stream: S,
    service: ServiceId,
    worker_id: Uuid,
    cancel: CancellationToken,
    kind: StreamKind,
) -> JoinHandle<()>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,

                result = lines.next_line() => match result {
                    Ok(Some(line)) => forward_line(&service, worker_id, kind, &line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            service = %service,
                            worker_id = %worker_id,
                            stream = %kind,
                            error = %e,
                            "Worker output read error"
                        );
                        break;
                    }
                },
            }
        }
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn text_lines_from_tracing_subscriber() {
        assert_eq!(
            detect_level("2025-12-08T00:10:18.2852399Z  WARN api::routes: slow handler"),
            Level::WARN
        );
        assert_eq!(
            detect_level("2025-12-08T00:10:18.2852399Z DEBUG stop:stop: api: drained"),
            Level::DEBUG
        );
    }

    #[test]
    fn json_lines_with_named_levels() {
        assert_eq!(
            detect_level(r#"{"timestamp":"2025-12-09T21:09:40Z","level":"ERROR","fields":{"message":"x"}}"#),
            Level::ERROR
        );
        assert_eq!(detect_level(r#"{"level":"warning","msg":"x"}"#), Level::WARN);
    }

    #[test]
    fn pino_numeric_levels() {
        assert_eq!(detect_level(r#"{"level":30,"msg":"listening"}"#), Level::INFO);
        assert_eq!(detect_level(r#"{"level":40,"msg":"slow"}"#), Level::WARN);
        assert_eq!(detect_level(r#"{"level":60,"msg":"fatal"}"#), Level::ERROR);
        assert_eq!(detect_level(r#"{"level":20,"msg":"dbg"}"#), Level::DEBUG);
        assert_eq!(detect_level(r#"{"level":10,"msg":"trc"}"#), Level::TRACE);
    }

    #[test]
    fn unrecognized_lines_default_to_info() {
        assert_eq!(detect_level("Server listening at http://127.0.0.1:3000"), Level::INFO);
        assert_eq!(detect_level(""), Level::INFO);
        assert_eq!(detect_level(r#"{"level":true}"#), Level::INFO);
    }

    #[tokio::test]
    async fn forwarder_stops_at_end_of_stream() {
        let (reader, writer) = tokio::io::duplex(64);
        let handle = spawn_stream_forwarder(
            reader,
            "api".into(),
            Uuid::now_v7(),
            CancellationToken::new(),
            StreamKind::Stderr,
        );
        drop(writer);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn forwarder_stops_on_cancel() {
        let (reader, _writer) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = spawn_stream_forwarder(
            reader,
            "api".into(),
            Uuid::now_v7(),
            cancel.clone(),
            StreamKind::Stdout,
        );
        cancel.cancel();
        handle.await.unwrap();
    }
}
