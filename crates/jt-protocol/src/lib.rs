//! jt-protocol: wire envelope types and LDJSON codec for the job-telemetry
//! pipeline.
//!
//! Every message crossing the wire is one JSON object per line, LF
//! terminated. The `type` field selects which payload variant is present;
//! unrecognized `type` values decode into [`Payload::Unknown`] so that a
//! single poisoned line never has to kill the connection.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Only protocol version accepted on the wire.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum serialized frame size, including the terminating newline.
pub const MAX_FRAME_BYTES: usize = 65_536;

/// How far into the past a sender's clock may lag ours.
pub const MAX_SKEW_PAST_MS: i64 = 24 * 60 * 60 * 1000;

/// How far into the future a sender's clock may lead ours.
pub const MAX_SKEW_FUTURE_MS: i64 = 60_000;

/// Current wall-clock time in unix millis.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {actual} bytes exceeds the {max} byte limit")]
    FrameTooLarge { max: usize, actual: usize },
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("unsupported protocol version {0} (only {PROTOCOL_VERSION} is accepted)")]
    UnsupportedVersion(i64),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`src` must be non-empty and at most 64 characters, got {0} chars")]
    SourceLength(usize),
    #[error("timestamp {ts} outside allowed window [{min}, {max}]")]
    TimestampOutOfRange { ts: i64, min: i64, max: i64 },
    #[error("invalid payload for type `{type_name}`: {reason}")]
    InvalidPayload { type_name: String, reason: String },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The common header surrounding a type-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub src: String,
    pub ts: i64,
    pub tid: Option<String>,
    pub sid: Option<String>,
    pub pid: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(src: impl Into<String>, ts: i64, payload: Payload) -> Self {
        Envelope {
            src: src.into(),
            ts,
            tid: None,
            sid: None,
            pid: None,
            payload,
        }
    }

    pub fn with_trace(mut self, tid: impl Into<String>, sid: impl Into<String>) -> Self {
        self.tid = Some(tid.into());
        self.sid = Some(sid.into());
        self
    }

    /// The wire `type` tag for this envelope's payload.
    pub fn type_name(&self) -> &str {
        self.payload.type_name()
    }
}

// ---------------------------------------------------------------------------
// Type-specific payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventPayload {
    pub level: Level,
    pub msg: String,
    pub ctx: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPayload {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub tags: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressPayload {
    pub job_id: String,
    pub percent: i32,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePayload {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpanPayload {
    pub name: String,
    pub start: i64,
    pub end: Option<i64>,
    pub status: String,
    pub tags: Option<BTreeMap<String, Value>>,
}

/// Discriminated union over the wire `type` enum.
///
/// `Unknown` is a catch-all for any `type` value this build doesn't
/// recognize; the listener logs and drops it rather than tearing down the
/// connection (see the "Dynamic message payloads" design note).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(EventPayload),
    Metric(MetricPayload),
    Progress(ProgressPayload),
    Resource(ResourcePayload),
    Span(SpanPayload),
    Heartbeat,
    Goodbye,
    Unknown { type_name: String, data: Option<Value> },
}

impl Payload {
    pub fn type_name(&self) -> &str {
        match self {
            Payload::Event(_) => "event",
            Payload::Metric(_) => "metric",
            Payload::Progress(_) => "progress",
            Payload::Resource(_) => "resource",
            Payload::Span(_) => "span",
            Payload::Heartbeat => "heartbeat",
            Payload::Goodbye => "goodbye",
            Payload::Unknown { type_name, .. } => type_name.as_str(),
        }
    }

    fn requires_tid_sid(&self) -> bool {
        matches!(self, Payload::Span(_))
    }
}

// ---------------------------------------------------------------------------
// Wire (de)serialization
// ---------------------------------------------------------------------------

/// The literal JSON shape on the wire: header fields plus a `type` tag and
/// an optional, type-specific `data` object.
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    v: i64,
    src: String,
    ts: i64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Serialize `env` to a single LDJSON line, including the trailing newline.
pub fn encode(env: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let (kind, data) = payload_to_wire(&env.payload);
    let wire = WireEnvelope {
        v: PROTOCOL_VERSION as i64,
        src: env.src.clone(),
        ts: env.ts,
        kind,
        tid: env.tid.clone(),
        sid: env.sid.clone(),
        pid: env.pid.clone(),
        data,
    };
    let mut bytes =
        serde_json::to_vec(&wire).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    bytes.push(b'\n');
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Decode a single line (including its trailing newline, if present) using
/// the current wall clock for the skew check.
pub fn decode(line: &[u8]) -> Result<Envelope, ProtocolError> {
    decode_with_clock(line, now_millis())
}

/// Decode a single line against an explicit "now", for deterministic tests.
pub fn decode_with_clock(line: &[u8], now_ms: i64) -> Result<Envelope, ProtocolError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            actual: line.len(),
        });
    }

    let wire: WireEnvelope = serde_json::from_slice(line.trim_ascii_end_compat())
        .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    if wire.v != PROTOCOL_VERSION as i64 {
        return Err(ProtocolError::UnsupportedVersion(wire.v));
    }
    if wire.src.is_empty() || wire.src.chars().count() > 64 {
        return Err(ProtocolError::SourceLength(wire.src.chars().count()));
    }

    let min_ts = now_ms - MAX_SKEW_PAST_MS;
    let max_ts = now_ms + MAX_SKEW_FUTURE_MS;
    if wire.ts < min_ts || wire.ts > max_ts {
        return Err(ProtocolError::TimestampOutOfRange {
            ts: wire.ts,
            min: min_ts,
            max: max_ts,
        });
    }

    let payload = payload_from_wire(&wire.kind, wire.data)?;

    if payload.requires_tid_sid() && (wire.tid.is_none() || wire.sid.is_none()) {
        return Err(ProtocolError::InvalidPayload {
            type_name: wire.kind.clone(),
            reason: "span messages require both `tid` and `sid`".to_owned(),
        });
    }

    Ok(Envelope {
        src: wire.src,
        ts: wire.ts,
        tid: wire.tid,
        sid: wire.sid,
        pid: wire.pid,
        payload,
    })
}

/// Small helper trait so we can trim a trailing `\n`/`\r\n` without pulling
/// in a string-processing dependency for one call site.
trait TrimAsciiEndCompat {
    fn trim_ascii_end_compat(&self) -> &[u8];
}

impl TrimAsciiEndCompat for [u8] {
    fn trim_ascii_end_compat(&self) -> &[u8] {
        let mut end = self.len();
        while end > 0 && (self[end - 1] == b'\n' || self[end - 1] == b'\r') {
            end -= 1;
        }
        &self[..end]
    }
}

fn payload_to_wire(payload: &Payload) -> (String, Option<Value>) {
    let kind = payload.type_name().to_owned();
    let data = match payload {
        Payload::Event(p) => Some(serde_json::json!({
            "level": p.level,
            "msg": p.msg,
            "ctx": p.ctx,
        })),
        Payload::Metric(p) => Some(serde_json::json!({
            "name": p.name,
            "value": p.value,
            "unit": p.unit,
            "tags": p.tags,
        })),
        Payload::Progress(p) => Some(serde_json::json!({
            "job_id": p.job_id,
            "percent": p.percent,
            "status": p.status,
        })),
        Payload::Resource(p) => Some(serde_json::json!({
            "cpu": p.cpu,
            "mem": p.mem,
            "disk": p.disk,
            "net": p.net,
        })),
        Payload::Span(p) => Some(serde_json::json!({
            "name": p.name,
            "start": p.start,
            "end": p.end,
            "status": p.status,
            "tags": p.tags,
        })),
        Payload::Heartbeat | Payload::Goodbye => None,
        Payload::Unknown { data, .. } => data.clone(),
    };
    (kind, data)
}

fn payload_from_wire(kind: &str, data: Option<Value>) -> Result<Payload, ProtocolError> {
    let field = |obj: &Value, name: &'static str| -> Result<Value, ProtocolError> {
        obj.get(name)
            .cloned()
            .ok_or(ProtocolError::MissingField(name))
    };
    let invalid = |reason: String| ProtocolError::InvalidPayload {
        type_name: kind.to_owned(),
        reason,
    };

    match kind {
        "event" => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            let level: Level = serde_json::from_value(field(&data, "level")?)
                .map_err(|e| invalid(format!("bad `level`: {e}")))?;
            let msg = field(&data, "msg")?
                .as_str()
                .ok_or_else(|| invalid("`msg` must be a string".to_owned()))?
                .to_owned();
            let ctx = data
                .get("ctx")
                .filter(|v| !v.is_null())
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| invalid(format!("bad `ctx`: {e}")))?;
            Ok(Payload::Event(EventPayload { level, msg, ctx }))
        }
        "metric" => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            let name = field(&data, "name")?
                .as_str()
                .ok_or_else(|| invalid("`name` must be a string".to_owned()))?
                .to_owned();
            let value = field(&data, "value")?
                .as_f64()
                .ok_or_else(|| invalid("`value` must be a number".to_owned()))?;
            let unit = field(&data, "unit")?
                .as_str()
                .ok_or_else(|| invalid("`unit` must be a string".to_owned()))?
                .to_owned();
            let tags = data
                .get("tags")
                .filter(|v| !v.is_null())
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| invalid(format!("bad `tags`: {e}")))?;
            Ok(Payload::Metric(MetricPayload {
                name,
                value,
                unit,
                tags,
            }))
        }
        "progress" => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            let job_id = field(&data, "job_id")?
                .as_str()
                .ok_or_else(|| invalid("`job_id` must be a string".to_owned()))?
                .to_owned();
            let percent = field(&data, "percent")?
                .as_i64()
                .ok_or_else(|| invalid("`percent` must be an integer".to_owned()))?;
            if !(0..=100).contains(&percent) {
                return Err(invalid(format!("`percent` {percent} outside 0..=100")));
            }
            let status = field(&data, "status")?
                .as_str()
                .ok_or_else(|| invalid("`status` must be a string".to_owned()))?
                .to_owned();
            Ok(Payload::Progress(ProgressPayload {
                job_id,
                percent: percent as i32,
                status,
            }))
        }
        "resource" => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            let as_f64 = |name: &'static str| -> Result<f64, ProtocolError> {
                field(&data, name)?
                    .as_f64()
                    .ok_or_else(|| invalid(format!("`{name}` must be a number")))
            };
            Ok(Payload::Resource(ResourcePayload {
                cpu: as_f64("cpu")?,
                mem: as_f64("mem")?,
                disk: as_f64("disk")?,
                net: as_f64("net")?,
            }))
        }
        "span" => {
            let data = data.ok_or(ProtocolError::MissingField("data"))?;
            let name = field(&data, "name")?
                .as_str()
                .ok_or_else(|| invalid("`name` must be a string".to_owned()))?
                .to_owned();
            let start = field(&data, "start")?
                .as_i64()
                .ok_or_else(|| invalid("`start` must be an integer".to_owned()))?;
            let end = data.get("end").and_then(|v| v.as_i64());
            let status = field(&data, "status")?
                .as_str()
                .ok_or_else(|| invalid("`status` must be a string".to_owned()))?
                .to_owned();
            let tags = data
                .get("tags")
                .filter(|v| !v.is_null())
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| invalid(format!("bad `tags`: {e}")))?;
            Ok(Payload::Span(SpanPayload {
                name,
                start,
                end,
                status,
                tags,
            }))
        }
        "heartbeat" => Ok(Payload::Heartbeat),
        "goodbye" => Ok(Payload::Goodbye),
        other => Ok(Payload::Unknown {
            type_name: other.to_owned(),
            data,
        }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(src: &str, ts: i64) -> Envelope {
        Envelope::new(
            src,
            ts,
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: "hi".to_owned(),
                ctx: None,
            }),
        )
    }

    #[test]
    fn round_trips_an_event_envelope() {
        let now = now_millis();
        let env = event("hello", now);
        let bytes = encode(&env).unwrap();
        let decoded = decode_with_clock(&bytes, now).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn encode_terminates_with_newline() {
        let env = event("svc", now_millis());
        let bytes = encode(&env).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn rejects_unsupported_version() {
        let now = now_millis();
        let line = format!(
            r#"{{"v":2,"src":"svc","ts":{now},"type":"heartbeat"}}"#
        );
        let err = decode_with_clock(line.as_bytes(), now).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion(2)));
    }

    #[test]
    fn unknown_type_becomes_catch_all_without_closing_connection() {
        let now = now_millis();
        let line = format!(
            r#"{{"v":1,"src":"svc","ts":{now},"type":"mystery","data":{{"x":1}}}}"#
        );
        let env = decode_with_clock(line.as_bytes(), now).unwrap();
        match env.payload {
            Payload::Unknown { type_name, data } => {
                assert_eq!(type_name, "mystery");
                assert_eq!(data.unwrap()["x"], 1);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn frame_of_exactly_max_size_is_accepted_and_one_byte_more_is_rejected() {
        let now = now_millis();
        // Build a payload whose msg padding brings the total line to exactly
        // MAX_FRAME_BYTES (including the trailing newline).
        let mut env = event("pad", now);
        if let Payload::Event(p) = &mut env.payload {
            p.msg = String::new();
        }
        let base = encode(&env).unwrap();
        let pad_len = MAX_FRAME_BYTES - base.len();
        if let Payload::Event(p) = &mut env.payload {
            p.msg = "a".repeat(pad_len);
        }
        let exact = encode(&env).unwrap();
        assert_eq!(exact.len(), MAX_FRAME_BYTES);
        decode_with_clock(&exact, now).expect("exact max size must be accepted");

        if let Payload::Event(p) = &mut env.payload {
            p.msg = "a".repeat(pad_len + 1);
        }
        let over = encode(&env).unwrap_err();
        assert!(matches!(over, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn skew_window_boundaries() {
        let now = now_millis();
        let at_past_bound = event("svc", now - MAX_SKEW_PAST_MS);
        let bytes = encode(&at_past_bound).unwrap();
        decode_with_clock(&bytes, now).expect("exactly now-24h must be accepted");

        let mut too_old = at_past_bound.clone();
        too_old.ts -= 1;
        let bytes = encode(&too_old).unwrap();
        let err = decode_with_clock(&bytes, now).unwrap_err();
        assert!(matches!(err, ProtocolError::TimestampOutOfRange { .. }));

        let at_future_bound = event("svc", now + MAX_SKEW_FUTURE_MS);
        let bytes = encode(&at_future_bound).unwrap();
        decode_with_clock(&bytes, now).expect("exactly now+60s must be accepted");

        let mut too_new = at_future_bound.clone();
        too_new.ts += 1;
        let bytes = encode(&too_new).unwrap();
        let err = decode_with_clock(&bytes, now).unwrap_err();
        assert!(matches!(err, ProtocolError::TimestampOutOfRange { .. }));
    }

    #[test]
    fn progress_percent_boundaries() {
        let now = now_millis();
        let make = |percent: i64| {
            format!(
                r#"{{"v":1,"src":"svc","ts":{now},"type":"progress","data":{{"job_id":"j1","percent":{percent},"status":"running"}}}}"#
            )
        };
        decode_with_clock(make(0).as_bytes(), now).expect("0 accepted");
        decode_with_clock(make(100).as_bytes(), now).expect("100 accepted");
        assert!(decode_with_clock(make(-1).as_bytes(), now).is_err());
        assert!(decode_with_clock(make(101).as_bytes(), now).is_err());
    }

    #[test]
    fn span_requires_tid_and_sid() {
        let now = now_millis();
        let line = format!(
            r#"{{"v":1,"src":"svc","ts":{now},"type":"span","data":{{"name":"work","start":{now},"status":"open"}}}}"#
        );
        let err = decode_with_clock(line.as_bytes(), now).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));

        let with_ids = format!(
            r#"{{"v":1,"src":"svc","ts":{now},"type":"span","tid":"t1","sid":"s1","data":{{"name":"work","start":{now},"status":"open"}}}}"#
        );
        decode_with_clock(with_ids.as_bytes(), now).expect("tid+sid present must decode");
    }

    #[test]
    fn src_length_is_enforced() {
        let now = now_millis();
        let long_src = "x".repeat(65);
        let line = format!(
            r#"{{"v":1,"src":"{long_src}","ts":{now},"type":"heartbeat"}}"#
        );
        let err = decode_with_clock(line.as_bytes(), now).unwrap_err();
        assert!(matches!(err, ProtocolError::SourceLength(65)));
    }

    #[test]
    fn heartbeat_and_goodbye_round_trip_without_data() {
        let now = now_millis();
        for payload in [Payload::Heartbeat, Payload::Goodbye] {
            let env = Envelope::new("svc", now, payload);
            let bytes = encode(&env).unwrap();
            let decoded = decode_with_clock(&bytes, now).unwrap();
            assert_eq!(decoded, env);
        }
    }
}
