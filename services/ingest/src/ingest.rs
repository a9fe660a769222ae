//! Ingest write path: validates clock skew, then inserts the event row
//! plus its job/subjob/app projections, one DB transaction per record.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::IngestError;
use crate::repo;
use crate::repo::event::EventInsertOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Job,
    Subjob,
}

/// The `entity.*` fields of an application-level job-event.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Required when `entity_type == Subjob`.
    pub parent_id: Option<String>,
    pub key: String,
    pub status: String,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_s: Option<f64>,
    pub cpu_user_s: Option<f64>,
    pub cpu_system_s: Option<f64>,
    pub mem_max_mb: Option<f64>,
    pub metadata: Option<serde_json::Value>,
}

/// A single application-level event submitted to the managed write path.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Sender's wall clock, unix-millis.
    pub at: i64,
    pub app_id: String,
    pub app_name: String,
    pub app_version: String,
    pub site_id: String,
    /// Envelope `type` (event/metric/progress/...), stored verbatim.
    pub kind: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Uuid,
    pub entity: Option<EntityRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    DuplicateIgnored,
}

pub struct IngestWriter {
    pool: PgPool,
    max_skew_s: i64,
}

impl IngestWriter {
    pub fn new(pool: PgPool, max_skew_s: i64) -> Self {
        IngestWriter { pool, max_skew_s }
    }

    pub async fn ingest_batch(
        &self,
        records: &[EventRecord],
    ) -> Vec<Result<IngestOutcome, IngestError>> {
        let now = jt_protocol::now_millis();
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            results.push(self.ingest_record(record, now).await);
        }
        results
    }

    /// Exposed separately so tests can supply a deterministic clock.
    pub async fn ingest_record(
        &self,
        record: &EventRecord,
        now_ms: i64,
    ) -> Result<IngestOutcome, IngestError> {
        let skew_ms = (now_ms - record.at).abs();
        if skew_ms > self.max_skew_s * 1000 {
            return Err(IngestError::Skew {
                at: record.at,
                now: now_ms,
                max_skew_s: self.max_skew_s,
            });
        }

        let mut tx = self.pool.begin().await?;

        let (entity_type, entity_id) = match &record.entity {
            Some(e) => (Some(entity_type_str(e.entity_type)), Some(e.entity_id.as_str())),
            None => (None, None),
        };

        let outcome = repo::event::insert_event(
            &mut tx,
            millis_to_datetime(record.at),
            entity_type,
            entity_id,
            &record.app_id,
            &record.site_id,
            &record.kind,
            &record.payload,
            record.idempotency_key,
        )
        .await?;

        repo::app::upsert_app(
            &mut tx,
            &record.app_id,
            &record.app_name,
            &record.app_version,
            &record.site_id,
        )
        .await?;

        if let Some(entity) = &record.entity {
            match entity.entity_type {
                EntityType::Job => {
                    repo::job::insert_job(
                        &mut tx,
                        &entity.entity_id,
                        &record.app_id,
                        &record.site_id,
                        &entity.key,
                        &entity.status,
                        entity.started_at.map(millis_to_datetime),
                        entity.ended_at.map(millis_to_datetime),
                        entity.duration_s,
                        entity.cpu_user_s,
                        entity.cpu_system_s,
                        entity.mem_max_mb,
                        entity.metadata.as_ref(),
                    )
                    .await?;
                }
                EntityType::Subjob => {
                    let parent_id = entity.parent_id.clone().unwrap_or_default();
                    repo::subjob::insert_subjob(
                        &mut tx,
                        &entity.entity_id,
                        &parent_id,
                        &parent_id,
                        &record.app_id,
                        &record.site_id,
                        &entity.key,
                        &entity.status,
                        entity.started_at.map(millis_to_datetime),
                        entity.ended_at.map(millis_to_datetime),
                        entity.duration_s,
                        entity.cpu_user_s,
                        entity.cpu_system_s,
                        entity.mem_max_mb,
                        entity.metadata.as_ref(),
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(match outcome {
            EventInsertOutcome::Inserted => IngestOutcome::Inserted,
            EventInsertOutcome::DuplicateIgnored => IngestOutcome::DuplicateIgnored,
        })
    }
}

fn entity_type_str(t: EntityType) -> &'static str {
    match t {
        EntityType::Job => "job",
        EntityType::Subjob => "subjob",
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
