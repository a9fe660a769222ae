//! Managed write-path backend: batch-inserts into the time-series database
//! by calling into `ingest` in-process, with no network hop.
//!
//! Only `event` envelopes whose `ctx` carries an `entity` object (an
//! application-level job-event) are eligible; anything else routed here is
//! counted as a failure so a misrouted rule is visible in the batch result
//! rather than silently dropped.

use std::time::Instant;

use async_trait::async_trait;
use ingest::{EntityRecord, EntityType, EventRecord, IngestOutcome, IngestWriter};
use jt_protocol::{Envelope, Payload};
use serde_json::Value;
use uuid::Uuid;

use super::{BackendAdapter, SendResult};
use crate::error::BackendError;

pub struct ManagedBackend {
    writer: IngestWriter,
}

impl ManagedBackend {
    pub fn new(writer: IngestWriter) -> Self {
        ManagedBackend { writer }
    }
}

#[async_trait]
impl BackendAdapter for ManagedBackend {
    async fn init(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn send_batch(&self, messages: &[Envelope]) -> SendResult {
        let start = Instant::now();
        let mut count_sent = 0;
        let mut count_failed = 0;
        let mut last_error = None;
        let mut records = Vec::new();
        for envelope in messages {
            match build_event_record(envelope) {
                Some(record) => records.push(record),
                None => {
                    count_failed += 1;
                    last_error = Some(format!(
                        "envelope type `{}` from `{}` has no entity/idempotency_key for the managed path",
                        envelope.type_name(),
                        envelope.src
                    ));
                }
            }
        }

        for outcome in self.writer.ingest_batch(&records).await {
            match outcome {
                Ok(IngestOutcome::Inserted | IngestOutcome::DuplicateIgnored) => count_sent += 1,
                Err(e) => {
                    count_failed += 1;
                    last_error = Some(e.to_string());
                }
            }
        }

        SendResult {
            ok: count_failed == 0,
            count_sent,
            count_failed,
            error: last_error,
            latency: start.elapsed(),
        }
    }

    async fn health(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

fn build_event_record(envelope: &Envelope) -> Option<EventRecord> {
    let Payload::Event(event) = &envelope.payload else {
        return None;
    };
    let ctx = event.ctx.as_ref()?;
    let idempotency_key = ctx
        .get("idempotency_key")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())?;
    let app = ctx.get("app");
    let app_id = app
        .and_then(|a| a.get("id"))
        .and_then(Value::as_str)
        .unwrap_or(&envelope.src)
        .to_owned();
    let app_name = app
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .unwrap_or(&envelope.src)
        .to_owned();
    let app_version = app
        .and_then(|a| a.get("version"))
        .and_then(Value::as_str)
        .unwrap_or("0.0.0")
        .to_owned();
    let site_id = ctx
        .get("site_id")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_owned();

    let entity = ctx.get("entity").and_then(|e| {
        let entity_type = match e.get("type").and_then(Value::as_str)? {
            "job" => EntityType::Job,
            "subjob" => EntityType::Subjob,
            _ => return None,
        };
        let entity_id = e.get("id").and_then(Value::as_str)?.to_owned();
        let parent_id = e
            .get("parent_id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let metrics = ctx.get("metrics");
        Some(EntityRecord {
            entity_type,
            entity_id,
            parent_id,
            key: ctx
                .get("job_key")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_owned(),
            status: ctx
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or(&event.msg)
                .to_owned(),
            started_at: ctx.get("started_at").and_then(Value::as_i64),
            ended_at: ctx.get("ended_at").and_then(Value::as_i64),
            duration_s: metrics.and_then(|m| m.get("duration_s")).and_then(Value::as_f64),
            cpu_user_s: metrics.and_then(|m| m.get("cpu_user_s")).and_then(Value::as_f64),
            cpu_system_s: metrics
                .and_then(|m| m.get("cpu_system_s"))
                .and_then(Value::as_f64),
            mem_max_mb: metrics.and_then(|m| m.get("mem_max_mb")).and_then(Value::as_f64),
            metadata: ctx.get("metadata").cloned(),
        })
    });

    Some(EventRecord {
        at: envelope.ts,
        app_id,
        app_name,
        app_version,
        site_id,
        kind: envelope.type_name().to_owned(),
        payload: serde_json::json!({"level": event.level, "msg": event.msg, "ctx": ctx}),
        idempotency_key,
        entity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt_protocol::{EventPayload, Level};
    use std::collections::BTreeMap;

    #[test]
    fn builds_a_job_record_from_an_event_with_entity_context() {
        let mut ctx = BTreeMap::new();
        ctx.insert(
            "idempotency_key".to_owned(),
            Value::String(Uuid::new_v4().to_string()),
        );
        ctx.insert(
            "entity".to_owned(),
            serde_json::json!({"type": "job", "id": "job-1"}),
        );
        ctx.insert("job_key".to_owned(), Value::String("nightly".to_owned()));
        ctx.insert("status".to_owned(), Value::String("finished".to_owned()));

        let env = Envelope::new(
            "batch-runner",
            jt_protocol::now_millis(),
            Payload::Event(EventPayload {
                level: Level::Info,
                msg: "job finished".to_owned(),
                ctx: Some(ctx),
            }),
        );

        let record = build_event_record(&env).expect("should build a record");
        assert_eq!(record.app_id, "batch-runner");
        let entity = record.entity.expect("should have an entity");
        assert_eq!(entity.entity_id, "job-1");
        assert_eq!(entity.key, "nightly");
    }

    #[test]
    fn heartbeat_is_not_eligible_for_the_managed_path() {
        let env = Envelope::new("svc", jt_protocol::now_millis(), Payload::Heartbeat);
        assert!(build_event_record(&env).is_none());
    }
}
