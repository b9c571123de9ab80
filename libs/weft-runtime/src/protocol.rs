//! Capability channel wire protocol.
//!
//! Every frame is an [`Envelope`] serialized as a single JSON line. The body is
//! tagged by `kind`; replies reference the request through `reply_to`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Version both sides must agree on during the `hello` handshake.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    pub body: Message,
}

impl Envelope {
    #[must_use]
    pub fn new(seq: u64, body: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            seq,
            reply_to: None,
            body,
        }
    }

    #[must_use]
    pub fn reply(seq: u64, reply_to: u64, body: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            seq,
            reply_to: Some(reply_to),
            body,
        }
    }

    /// Serialize to a single JSON line (without the trailing newline).
    ///
    /// # Errors
    /// Returns the serializer error; only non-finite metric values can trigger it.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse one line. Lines that are not envelopes (plain log output) fail here.
    ///
    /// # Errors
    /// Returns the parse error when `line` is not a protocol frame.
    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

/// Notification topics a worker can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Subscription {
    VersionChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// One route a worker exposes, relative to its mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncedRoute {
    #[serde(default = "root_path")]
    pub path: String,
    /// Empty means every method.
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
}

impl AnnouncedRoute {
    /// Everything under the mount, any method.
    #[must_use]
    pub fn catch_all() -> Self {
        Self {
            path: root_path(),
            methods: Vec::new(),
            fallback: false,
        }
    }
}

fn root_path() -> String {
    "/".to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Message {
    /// First frame from a worker.
    Hello {
        protocol_version: u32,
        service_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        subscriptions: Vec<Subscription>,
    },
    /// The worker can accept traffic. Process workers report the address they bound.
    Ready {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        listen: Option<SocketAddr>,
    },
    RoutesAnnounce {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mount: Option<String>,
        #[serde(default)]
        routes: Vec<AnnouncedRoute>,
        #[serde(default = "default_true")]
        complete: bool,
    },
    HealthPing {
        nonce: u64,
    },
    HealthPong {
        nonce: u64,
    },
    ReloadRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LogEntry {
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, serde_json::Value>,
    },
    MetricSample {
        name: String,
        value: f64,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        labels: BTreeMap<String, String>,
    },
    ShutdownRequest {
        grace_ms: u64,
    },
    VersionChanged {
        service_id: String,
        version: u64,
    },
    Ack,
    StartupFailed {
        reason: String,
    },
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Ready { .. } => "ready",
            Message::RoutesAnnounce { .. } => "routes-announce",
            Message::HealthPing { .. } => "health-ping",
            Message::HealthPong { .. } => "health-pong",
            Message::ReloadRequest { .. } => "reload-request",
            Message::LogEntry { .. } => "log-entry",
            Message::MetricSample { .. } => "metric-sample",
            Message::ShutdownRequest { .. } => "shutdown-request",
            Message::VersionChanged { .. } => "version-changed",
            Message::Ack => "ack",
            Message::StartupFailed { .. } => "startup-failed",
        }
    }

    /// Whether the receiver answers this message with an `ack`.
    ///
    /// Pings are answered with a pong instead; high-volume telemetry and replies
    /// are never acknowledged.
    #[must_use]
    pub fn wants_ack(&self) -> bool {
        matches!(
            self,
            Message::RoutesAnnounce { .. }
                | Message::ReloadRequest { .. }
                | Message::ShutdownRequest { .. }
                | Message::VersionChanged { .. }
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(
            7,
            Message::HealthPing { nonce: 3 },
        );
        let line = env.encode().unwrap();
        assert_eq!(
            line,
            r#"{"v":1,"seq":7,"body":{"kind":"health-ping","nonce":3}}"#
        );
    }

    #[test]
    fn reply_carries_reply_to() {
        let env = Envelope::reply(2, 7, Message::Ack);
        let line = env.encode().unwrap();
        assert!(line.contains(r#""reply_to":7"#));
        assert!(line.contains(r#""kind":"ack""#));
    }

    #[test]
    fn routes_announce_defaults() {
        let env = Envelope::decode(
            r#"{"v":1,"seq":1,"body":{"kind":"routes-announce","routes":[{"methods":["GET"]}]}}"#,
        )
        .unwrap();
        match env.body {
            Message::RoutesAnnounce {
                mount,
                routes,
                complete,
            } => {
                assert!(mount.is_none());
                assert!(complete);
                assert_eq!(routes[0].path, "/");
                assert_eq!(routes[0].methods, vec!["GET".to_owned()]);
                assert!(!routes[0].fallback);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn hello_with_subscriptions() {
        let env = Envelope::decode(
            r#"{"v":1,"seq":1,"body":{"kind":"hello","protocol_version":1,"service_id":"api","subscriptions":["version-changed"]}}"#,
        )
        .unwrap();
        assert_eq!(
            env.body,
            Message::Hello {
                protocol_version: 1,
                service_id: "api".into(),
                pid: None,
                subscriptions: vec![Subscription::VersionChanged],
            }
        );
    }

    #[test]
    fn plain_log_lines_are_not_frames() {
        assert!(Envelope::decode("2024-01-01T00:00:00Z INFO listening on 3000").is_err());
        assert!(Envelope::decode(r#"{"level":"info","msg":"hi"}"#).is_err());
    }

    #[test]
    fn ack_policy() {
        assert!(Message::ShutdownRequest { grace_ms: 1 }.wants_ack());
        assert!(!Message::HealthPing { nonce: 1 }.wants_ack());
        assert!(!Message::Ack.wants_ack());
        assert!(
            !Message::MetricSample {
                name: "x".into(),
                value: 1.0,
                labels: BTreeMap::new()
            }
            .wants_ack()
        );
    }
}
